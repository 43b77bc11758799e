use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db::models::{Fixture, Market, PriceQuote};

use super::{FeedError, PriceFeed, teams_match};

pub const DEFAULT_ODDS_API_URL: &str = "https://api.the-odds-api.com/v4";

/// League name → The Odds API sport key.
const SPORT_KEYS: &[(&str, &str)] = &[
    ("Serie A", "soccer_italy_serie_a"),
    ("Premier League", "soccer_epl"),
    ("La Liga", "soccer_spain_la_liga"),
    ("Bundesliga", "soccer_germany_bundesliga"),
    ("Ligue 1", "soccer_france_ligue_one"),
];

fn sport_key(league: &str) -> Option<&'static str> {
    SPORT_KEYS
        .iter()
        .find(|(name, _)| *name == league)
        .map(|(_, key)| *key)
}

/// Client for The Odds API v4 (h2h + totals, decimal prices, EU region).
///
/// The free tier is credit-metered, so responses are cached per league for
/// the lifetime of the client (one daily run) and the remaining quota from
/// the response headers is logged.
pub struct OddsApiClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    league_cache: Mutex<HashMap<String, Vec<serde_json::Value>>>,
}

impl OddsApiClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(OddsApiClient {
            http,
            base_url: base_url.to_string(),
            api_key,
            league_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().map(|k| !k.is_empty()).unwrap_or(false)
    }

    async fn league_events(&self, league: &str) -> Result<Vec<serde_json::Value>, FeedError> {
        {
            let cache = self.league_cache.lock().await;
            if let Some(cached) = cache.get(league) {
                return Ok(cached.clone());
            }
        }
        let Some(key) = sport_key(league) else {
            return Err(FeedError::Malformed(format!("unknown league '{league}'")));
        };
        let api_key = self
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| FeedError::Unavailable("no ODDS_API_KEY configured".to_string()))?;

        let url = format!(
            "{}/sports/{}/odds?regions=eu&markets=h2h,totals&oddsFormat=decimal&apiKey={}",
            self.base_url, key, api_key
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| FeedError::Unavailable(format!("odds api request failed: {e}")))?;

        if let Some(remaining) = resp
            .headers()
            .get("x-requests-remaining")
            .and_then(|v| v.to_str().ok())
        {
            info!("odds api credits remaining: {remaining}");
        }
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FeedError::Unavailable("odds api quota exceeded".to_string()));
        }
        if !resp.status().is_success() {
            return Err(FeedError::Unavailable(format!(
                "odds api returned {}",
                resp.status()
            )));
        }
        let events: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| FeedError::Malformed(format!("odds api body: {e}")))?;
        self.league_cache
            .lock()
            .await
            .insert(league.to_string(), events.clone());
        Ok(events)
    }
}

#[async_trait]
impl PriceFeed for OddsApiClient {
    async fn fetch_quotes(&self, fixture: &Fixture) -> Result<Vec<PriceQuote>, FeedError> {
        let events = self.league_events(&fixture.league).await?;
        let event = events.iter().find(|e| {
            let home = e["home_team"].as_str().unwrap_or("");
            let away = e["away_team"].as_str().unwrap_or("");
            teams_match(home, &fixture.home) && teams_match(away, &fixture.away)
        });
        let Some(event) = event else {
            debug!("no odds event for {} vs {}", fixture.home, fixture.away);
            return Ok(Vec::new());
        };
        Ok(parse_event_quotes(event, fixture))
    }
}

// ── Parsing helpers ────────────────────────────────────────────────────────────

/// Extract quotes from one Odds API event, using the first bookmaker that
/// carries each market. A quote that cannot be read is skipped, never fatal.
fn parse_event_quotes(event: &serde_json::Value, fixture: &Fixture) -> Vec<PriceQuote> {
    let mut quotes: HashMap<Market, f64> = HashMap::new();
    let home_team = event["home_team"].as_str().unwrap_or("");
    let away_team = event["away_team"].as_str().unwrap_or("");

    let bookmakers = event["bookmakers"].as_array().cloned().unwrap_or_default();
    for bookmaker in &bookmakers {
        let Some(markets) = bookmaker["markets"].as_array() else {
            continue;
        };
        for market in markets {
            let outcomes = market["outcomes"].as_array().cloned().unwrap_or_default();
            match market["key"].as_str() {
                Some("h2h") => {
                    for outcome in &outcomes {
                        let name = outcome["name"].as_str().unwrap_or("");
                        let Some(price) = outcome["price"].as_f64() else {
                            continue;
                        };
                        let market = if name.eq_ignore_ascii_case("draw") {
                            Market::Draw
                        } else if teams_match(name, home_team) {
                            Market::HomeWin
                        } else if teams_match(name, away_team) {
                            Market::AwayWin
                        } else {
                            continue;
                        };
                        quotes.entry(market).or_insert(price);
                    }
                }
                Some("totals") => {
                    for outcome in &outcomes {
                        if outcome["point"].as_f64() != Some(2.5) {
                            continue;
                        }
                        let Some(price) = outcome["price"].as_f64() else {
                            continue;
                        };
                        match outcome["name"].as_str() {
                            Some("Over") => {
                                quotes.entry(Market::Over25).or_insert(price);
                            }
                            Some("Under") => {
                                quotes.entry(Market::Under25).or_insert(price);
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let fetched_at = Utc::now();
    quotes
        .into_iter()
        .map(|(market, price)| PriceQuote {
            league: fixture.league.clone(),
            home: fixture.home.clone(),
            away: fixture.away.clone(),
            market,
            price,
            fetched_at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> Fixture {
        Fixture {
            league: "Premier League".into(),
            home: "Arsenal".into(),
            away: "Chelsea".into(),
            date: "2026-02-01".parse().unwrap(),
            kickoff: None,
        }
    }

    #[test]
    fn parses_h2h_and_totals_quotes() {
        let event = json!({
            "home_team": "Arsenal",
            "away_team": "Chelsea",
            "bookmakers": [{
                "key": "bookie",
                "markets": [
                    {"key": "h2h", "outcomes": [
                        {"name": "Arsenal", "price": 2.10},
                        {"name": "Chelsea", "price": 3.60},
                        {"name": "Draw", "price": 3.40},
                    ]},
                    {"key": "totals", "outcomes": [
                        {"name": "Over", "point": 2.5, "price": 1.95},
                        {"name": "Under", "point": 2.5, "price": 1.85},
                        {"name": "Over", "point": 3.5, "price": 3.10},
                    ]},
                ]
            }]
        });
        let quotes = parse_event_quotes(&event, &fixture());
        let price = |m: Market| quotes.iter().find(|q| q.market == m).map(|q| q.price);
        assert_eq!(price(Market::HomeWin), Some(2.10));
        assert_eq!(price(Market::Draw), Some(3.40));
        assert_eq!(price(Market::AwayWin), Some(3.60));
        assert_eq!(price(Market::Over25), Some(1.95));
        assert_eq!(price(Market::Under25), Some(1.85));
        // The 3.5 line is not our market.
        assert_eq!(quotes.len(), 5);
    }

    #[test]
    fn first_bookmaker_with_a_market_wins() {
        let event = json!({
            "home_team": "Arsenal",
            "away_team": "Chelsea",
            "bookmakers": [
                {"markets": [{"key": "h2h", "outcomes": [
                    {"name": "Arsenal", "price": 2.00},
                ]}]},
                {"markets": [{"key": "h2h", "outcomes": [
                    {"name": "Arsenal", "price": 2.50},
                ]}]},
            ]
        });
        let quotes = parse_event_quotes(&event, &fixture());
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].price, 2.00);
    }

    #[test]
    fn missing_price_fields_are_skipped() {
        let event = json!({
            "home_team": "Arsenal",
            "away_team": "Chelsea",
            "bookmakers": [{"markets": [{"key": "h2h", "outcomes": [
                {"name": "Arsenal"},
                {"name": "Draw", "price": 3.2},
            ]}]}]
        });
        let quotes = parse_event_quotes(&event, &fixture());
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].market, Market::Draw);
    }
}
