use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db::models::{Fixture, HistoricalMatch};

use super::{FeedError, FixtureFeed, ResultFeed, ResultState, teams_match};

pub const DEFAULT_FOTMOB_URL: &str = "https://www.fotmob.com/api";

/// League name → FotMob league ID for the tracked competitions.
const LEAGUE_IDS: &[(&str, u32)] = &[
    ("Serie A", 55),
    ("Premier League", 47),
    ("La Liga", 87),
    ("Bundesliga", 54),
    ("Ligue 1", 53),
];

fn league_id(league: &str) -> Option<u32> {
    LEAGUE_IDS
        .iter()
        .find(|(name, _)| *name == league)
        .map(|(_, id)| *id)
}

fn league_name(id: u32) -> Option<&'static str> {
    LEAGUE_IDS
        .iter()
        .find(|(_, lid)| *lid == id)
        .map(|(name, _)| *name)
}

/// Client for the FotMob public API: season results for history seeding,
/// day schedules, and per-fixture result resolution.
pub struct FotMobClient {
    http: Client,
    base_url: String,
    /// Per-date schedule cache so resolving N wagers on the same day costs
    /// one request.
    day_cache: Mutex<HashMap<NaiveDate, Vec<DayMatch>>>,
}

#[derive(Debug, Clone)]
struct DayMatch {
    league: String,
    home: String,
    away: String,
    finished: bool,
    started: bool,
    home_goals: u32,
    away_goals: u32,
    kickoff: Option<String>,
}

impl FotMobClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()?;
        Ok(FotMobClient {
            http,
            base_url: base_url.to_string(),
            day_cache: Mutex::new(HashMap::new()),
        })
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, FeedError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FeedError::Unavailable(format!("fotmob request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(FeedError::Unavailable(format!(
                "fotmob returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| FeedError::Malformed(format!("fotmob body: {e}")))
    }

    async fn day_matches(&self, date: NaiveDate) -> Result<Vec<DayMatch>, FeedError> {
        {
            let cache = self.day_cache.lock().await;
            if let Some(cached) = cache.get(&date) {
                return Ok(cached.clone());
            }
        }
        let url = format!(
            "{}/data/matches?date={}",
            self.base_url,
            date.format("%Y%m%d")
        );
        let raw = self.get_json(&url).await?;
        let parsed = parse_day_matches(&raw);
        self.day_cache.lock().await.insert(date, parsed.clone());
        Ok(parsed)
    }
}

#[async_trait]
impl ResultFeed for FotMobClient {
    async fn fetch_result(&self, fixture: &Fixture) -> Result<ResultState, FeedError> {
        let day = self.day_matches(fixture.date).await?;
        for m in &day {
            if m.league == fixture.league
                && teams_match(&m.home, &fixture.home)
                && teams_match(&m.away, &fixture.away)
            {
                return Ok(if m.finished {
                    ResultState::Final {
                        home_goals: m.home_goals,
                        away_goals: m.away_goals,
                    }
                } else {
                    ResultState::NotYetPlayed
                });
            }
        }
        Ok(ResultState::NotYetPlayed)
    }

    async fn fetch_league_results(&self, league: &str) -> Result<Vec<HistoricalMatch>, FeedError> {
        let Some(id) = league_id(league) else {
            return Err(FeedError::Malformed(format!("unknown league '{league}'")));
        };
        let url = format!("{}/leagues?id={}", self.base_url, id);
        let raw = self.get_json(&url).await?;

        let all_matches = raw["fixtures"]["allMatches"]
            .as_array()
            .cloned()
            .or_else(|| raw["matches"]["allMatches"].as_array().cloned())
            .unwrap_or_default();

        let mut results = Vec::new();
        for item in &all_matches {
            match parse_finished_match(item, league) {
                Ok(Some(m)) => results.push(m),
                Ok(None) => {}
                Err(reason) => {
                    // One bad record never aborts the refresh.
                    debug!("skipping malformed fotmob record: {reason}");
                }
            }
        }
        if results.is_empty() {
            warn!("fotmob returned no finished matches for {league}");
        }
        Ok(results)
    }

    fn name(&self) -> &str {
        "fotmob"
    }
}

#[async_trait]
impl FixtureFeed for FotMobClient {
    async fn fetch_fixtures(&self, date: NaiveDate) -> Result<Vec<Fixture>, FeedError> {
        let day = self.day_matches(date).await?;
        Ok(day
            .into_iter()
            .filter(|m| !m.started && !m.finished)
            .map(|m| Fixture {
                league: m.league,
                home: m.home,
                away: m.away,
                date,
                kickoff: m.kickoff,
            })
            .collect())
    }
}

// ── Parsing helpers ────────────────────────────────────────────────────────────

fn parse_day_matches(raw: &serde_json::Value) -> Vec<DayMatch> {
    let mut out = Vec::new();
    let Some(leagues) = raw["leagues"].as_array() else {
        return out;
    };
    for league_obj in leagues {
        let id = league_obj["primaryId"]
            .as_u64()
            .or_else(|| league_obj["id"].as_u64())
            .unwrap_or(0) as u32;
        let Some(league) = league_name(id) else {
            continue;
        };
        let Some(matches) = league_obj["matches"].as_array() else {
            continue;
        };
        for m in matches {
            let home = team_name(&m["home"]);
            let away = team_name(&m["away"]);
            if home.is_empty() || away.is_empty() {
                continue;
            }
            let status = &m["status"];
            let (home_goals, away_goals) =
                parse_score_str(status["scoreStr"].as_str().unwrap_or("")).unwrap_or((0, 0));
            let kickoff = status["utcTime"]
                .as_str()
                .filter(|t| t.len() >= 16)
                .map(|t| t[11..16].to_string());
            out.push(DayMatch {
                league: league.to_string(),
                home,
                away,
                finished: status["finished"].as_bool().unwrap_or(false),
                started: status["started"].as_bool().unwrap_or(false),
                home_goals,
                away_goals,
                kickoff,
            });
        }
    }
    out
}

/// Parse one entry of a league's season fixture list. `Ok(None)` for a
/// fixture that has not finished; `Err` for a record that should exist but
/// cannot be read.
fn parse_finished_match(
    item: &serde_json::Value,
    league: &str,
) -> Result<Option<HistoricalMatch>, String> {
    let status = &item["status"];
    if !status["finished"].as_bool().unwrap_or(false) {
        return Ok(None);
    }
    let score = status["scoreStr"]
        .as_str()
        .ok_or_else(|| "missing scoreStr".to_string())?;
    let (home_goals, away_goals) =
        parse_score_str(score).ok_or_else(|| format!("unparseable score '{score}'"))?;

    let home = team_name(&item["home"]);
    let away = team_name(&item["away"]);
    if home.is_empty() || away.is_empty() {
        return Err("missing team names".to_string());
    }

    let utc_time = status["utcTime"].as_str().unwrap_or("");
    if utc_time.len() < 10 {
        return Err(format!("bad utcTime '{utc_time}'"));
    }
    let date: NaiveDate = utc_time[..10]
        .parse()
        .map_err(|_| format!("bad date '{}'", &utc_time[..10]))?;

    Ok(Some(HistoricalMatch {
        id: None,
        league: league.to_string(),
        home,
        away,
        home_goals,
        away_goals,
        date,
    }))
}

fn team_name(value: &serde_json::Value) -> String {
    value["shortName"]
        .as_str()
        .or_else(|| value["name"].as_str())
        .unwrap_or("")
        .to_string()
}

fn parse_score_str(score: &str) -> Option<(u32, u32)> {
    let (home, away) = score.split_once('-')?;
    Some((home.trim().parse().ok()?, away.trim().parse().ok()?))
}
