//! Scoreline distribution and market probabilities.
//!
//! Turns fitted (or fallback) scoring rates into a normalized joint
//! scoreline matrix and aggregates it into the three supported markets:
//! 1X2, Over/Under 2.5 and both-teams-to-score.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use super::fitter::{dc_tau, expected_rates, FittedParameterSet};
use crate::db::models::{HistoricalMatch, Market, RateSource};

/// Maximum goals per side in the scoreline grid (grid covers 0..=MAX_GOALS).
pub const MAX_GOALS: u32 = 10;
const GRID: usize = MAX_GOALS as usize + 1;

/// Expected-goal clamp for prediction inputs. Tighter than the fitting
/// clamp: a single fixture prediction outside this range says more about a
/// data problem than about the teams.
const PRED_RATE_FLOOR: f64 = 0.3;
const PRED_RATE_CEIL: f64 = 4.0;

/// Home advantage and rho used when only fallback rates are available.
const FALLBACK_HOME_ADV: f64 = 1.12;
const FALLBACK_RHO: f64 = -0.05;

/// Joint scoreline probability matrix, normalized to sum to 1.
#[derive(Debug, Clone)]
pub struct ScoreGrid {
    cells: [[f64; GRID]; GRID],
}

impl ScoreGrid {
    /// Build the grid from expected rates: independent Poisson joint mass,
    /// Dixon-Coles tau on the four low-score cells, then full-matrix
    /// renormalization (tau perturbs total mass).
    pub fn from_rates(lambda: f64, mu: f64, rho: f64) -> ScoreGrid {
        let home_pmf = poisson_pmf_row(lambda);
        let away_pmf = poisson_pmf_row(mu);

        let mut cells = [[0.0; GRID]; GRID];
        let mut total = 0.0;
        for (x, row) in cells.iter_mut().enumerate() {
            for (y, cell) in row.iter_mut().enumerate() {
                let tau = dc_tau(x as u32, y as u32, lambda, mu, rho).max(0.0);
                *cell = home_pmf[x] * away_pmf[y] * tau;
                total += *cell;
            }
        }
        for row in cells.iter_mut() {
            for cell in row.iter_mut() {
                *cell /= total;
            }
        }
        ScoreGrid { cells }
    }

    pub fn prob(&self, home_goals: u32, away_goals: u32) -> f64 {
        self.cells[home_goals as usize][away_goals as usize]
    }

    pub fn sum(&self) -> f64 {
        self.cells.iter().flatten().sum()
    }

    /// Aggregate the grid into per-market outcome probabilities.
    pub fn markets(&self) -> MarketProbs {
        let mut home_win = 0.0;
        let mut draw = 0.0;
        let mut away_win = 0.0;
        let mut under_25 = 0.0;
        let mut btts_yes = 0.0;
        for x in 0..GRID {
            for y in 0..GRID {
                let p = self.cells[x][y];
                match x.cmp(&y) {
                    std::cmp::Ordering::Greater => home_win += p,
                    std::cmp::Ordering::Equal => draw += p,
                    std::cmp::Ordering::Less => away_win += p,
                }
                if x + y <= 2 {
                    under_25 += p;
                }
                if x >= 1 && y >= 1 {
                    btts_yes += p;
                }
            }
        }
        MarketProbs {
            home_win,
            draw,
            away_win,
            over_25: 1.0 - under_25,
            under_25,
            btts_yes,
            btts_no: 1.0 - btts_yes,
        }
    }

    /// The single most probable scoreline.
    pub fn most_likely_score(&self) -> (u32, u32, f64) {
        let mut best = (0, 0, self.cells[0][0]);
        for x in 0..GRID {
            for y in 0..GRID {
                if self.cells[x][y] > best.2 {
                    best = (x as u32, y as u32, self.cells[x][y]);
                }
            }
        }
        best
    }
}

/// Poisson pmf over 0..=MAX_GOALS via the multiplicative recurrence.
fn poisson_pmf_row(rate: f64) -> [f64; GRID] {
    let mut row = [0.0; GRID];
    row[0] = (-rate).exp();
    for k in 1..GRID {
        row[k] = row[k - 1] * rate / k as f64;
    }
    row
}

/// Outcome probabilities for every supported market. Each market's
/// outcomes sum to 1 by construction.
#[derive(Debug, Clone, Copy)]
pub struct MarketProbs {
    pub home_win: f64,
    pub draw: f64,
    pub away_win: f64,
    pub over_25: f64,
    pub under_25: f64,
    pub btts_yes: f64,
    pub btts_no: f64,
}

impl MarketProbs {
    pub fn for_market(&self, market: Market) -> f64 {
        match market {
            Market::HomeWin => self.home_win,
            Market::Draw => self.draw,
            Market::AwayWin => self.away_win,
            Market::Over25 => self.over_25,
            Market::Under25 => self.under_25,
            Market::BttsYes => self.btts_yes,
            Market::BttsNo => self.btts_no,
        }
    }
}

/// A complete model output for one fixture.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub source: RateSource,
    pub model_version: i64,
    pub home_lambda: f64,
    pub away_lambda: f64,
    pub grid: ScoreGrid,
    pub markets: MarketProbs,
}

// ── Fallback rates ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct FallbackTeam {
    goals_for: f64,
    goals_against: f64,
    matches: u32,
}

#[derive(Debug, Clone, Default)]
struct FallbackLeague {
    avg_goals: f64,
    teams: HashMap<String, FallbackTeam>,
}

/// Ratio-based rate estimates from recent raw scoring, used when no fresh
/// fitted parameter set is available. No optimization involved.
#[derive(Debug, Clone, Default)]
pub struct FallbackRates {
    leagues: HashMap<String, FallbackLeague>,
}

impl FallbackRates {
    /// Build per-team attack/defense ratios from each team's most recent
    /// `window` completed matches. `matches` must be date-ordered.
    pub fn from_history(matches: &[HistoricalMatch], window: usize) -> FallbackRates {
        let mut leagues: HashMap<String, FallbackLeague> = HashMap::new();

        // Walk newest-first so each team accumulates only its latest window.
        for m in matches.iter().rev() {
            let league = leagues.entry(m.league.clone()).or_default();
            let home = league.teams.entry(m.home.clone()).or_default();
            if (home.matches as usize) < window {
                home.goals_for += m.home_goals as f64;
                home.goals_against += m.away_goals as f64;
                home.matches += 1;
            }
            let away = league.teams.entry(m.away.clone()).or_default();
            if (away.matches as usize) < window {
                away.goals_for += m.away_goals as f64;
                away.goals_against += m.home_goals as f64;
                away.matches += 1;
            }
        }

        for league in leagues.values_mut() {
            let (mut goals, mut n) = (0.0, 0u32);
            for t in league.teams.values() {
                goals += t.goals_for;
                n += t.matches;
            }
            league.avg_goals = if n > 0 { goals / n as f64 } else { 0.0 };
        }
        FallbackRates { leagues }
    }

    /// Expected rates for a fixture, or None when either team has no recent
    /// scoring data.
    pub fn rates(&self, league: &str, home: &str, away: &str) -> Option<(f64, f64)> {
        let league = self.leagues.get(league)?;
        if league.avg_goals <= 0.0 {
            return None;
        }
        let h = league.teams.get(home).filter(|t| t.matches > 0)?;
        let a = league.teams.get(away).filter(|t| t.matches > 0)?;

        let avg = league.avg_goals;
        let h_att = h.goals_for / h.matches as f64 / avg;
        let h_def = h.goals_against / h.matches as f64 / avg;
        let a_att = a.goals_for / a.matches as f64 / avg;
        let a_def = a.goals_against / a.matches as f64 / avg;

        let lambda = (avg * h_att * a_def * FALLBACK_HOME_ADV).clamp(PRED_RATE_FLOOR, PRED_RATE_CEIL);
        let mu = (avg * a_att * h_def).clamp(PRED_RATE_FLOOR, PRED_RATE_CEIL);
        Some((lambda, mu))
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Produces predictions from the active parameter set, degrading to
/// ratio-based fallback rates when the set is missing, stale or lacks the
/// fixture's teams. Every output carries its [`RateSource`] tag.
pub struct PredictionEngine {
    params: Option<FittedParameterSet>,
    fallback: FallbackRates,
    now: DateTime<Utc>,
    staleness_hours: i64,
    /// When a refit was explicitly requested this run, a stale retained set
    /// is still preferred over the degraded estimator.
    allow_stale: bool,
}

impl PredictionEngine {
    pub fn new(
        params: Option<FittedParameterSet>,
        fallback: FallbackRates,
        now: DateTime<Utc>,
        staleness_hours: i64,
        allow_stale: bool,
    ) -> PredictionEngine {
        PredictionEngine {
            params,
            fallback,
            now,
            staleness_hours,
            allow_stale,
        }
    }

    /// Predict one fixture. Returns None when neither the fitted set nor
    /// the fallback data covers both teams.
    pub fn predict(&self, league: &str, home: &str, away: &str) -> Option<Prediction> {
        if let Some(p) = self.predict_fitted(league, home, away) {
            return Some(p);
        }
        let (lambda, mu) = self.fallback.rates(league, home, away)?;
        debug!("fallback rates for {home} vs {away}: {lambda:.2}-{mu:.2}");
        let grid = ScoreGrid::from_rates(lambda, mu, FALLBACK_RHO);
        Some(Prediction {
            source: RateSource::Fallback,
            model_version: 0,
            home_lambda: lambda,
            away_lambda: mu,
            markets: grid.markets(),
            grid,
        })
    }

    fn predict_fitted(&self, league: &str, home: &str, away: &str) -> Option<Prediction> {
        let set = self.params.as_ref()?;
        if set.age_hours(self.now) > self.staleness_hours && !self.allow_stale {
            return None;
        }
        let rating = set.leagues.get(league)?;
        let home_rating = rating.teams.get(home)?;
        let away_rating = rating.teams.get(away)?;

        let (lambda, mu) = expected_rates(rating, home_rating, away_rating);
        let lambda = lambda.clamp(PRED_RATE_FLOOR, PRED_RATE_CEIL);
        let mu = mu.clamp(PRED_RATE_FLOOR, PRED_RATE_CEIL);
        let grid = ScoreGrid::from_rates(lambda, mu, rating.rho);
        Some(Prediction {
            source: RateSource::Fitted,
            model_version: set.version,
            home_lambda: lambda,
            away_lambda: mu,
            markets: grid.markets(),
            grid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fitter::{LeagueRating, TeamRating};
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    #[test]
    fn grid_is_normalized_across_rate_and_rho_range() {
        for &(lambda, mu, rho) in &[
            (1.5, 1.1, -0.08),
            (0.3, 0.3, 0.0),
            (4.0, 0.5, 0.3),
            (2.2, 2.2, -0.5),
        ] {
            let grid = ScoreGrid::from_rates(lambda, mu, rho);
            assert_relative_eq!(grid.sum(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn every_market_sums_to_one() {
        let grid = ScoreGrid::from_rates(1.7, 1.2, -0.06);
        let m = grid.markets();
        assert_relative_eq!(m.home_win + m.draw + m.away_win, 1.0, epsilon = 1e-6);
        assert_relative_eq!(m.over_25 + m.under_25, 1.0, epsilon = 1e-6);
        assert_relative_eq!(m.btts_yes + m.btts_no, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn zero_rho_reduces_to_independent_poisson() {
        let (lambda, mu) = (1.4, 0.9);
        let grid = ScoreGrid::from_rates(lambda, mu, 0.0);
        // tau == 1 everywhere, so after renormalization the (0,0) cell is the
        // plain product of the two pmfs divided by the truncated-grid mass.
        let expected = (-lambda).exp() * (-mu).exp() / grid.sum_unscaled_check(lambda, mu);
        assert_relative_eq!(grid.prob(0, 0), expected, epsilon = 1e-9);
    }

    impl ScoreGrid {
        /// Total truncated independent-Poisson mass, for the test above.
        fn sum_unscaled_check(&self, lambda: f64, mu: f64) -> f64 {
            let h = poisson_pmf_row(lambda);
            let a = poisson_pmf_row(mu);
            let mut s = 0.0;
            for x in 0..GRID {
                for y in 0..GRID {
                    s += h[x] * a[y];
                }
            }
            s
        }
    }

    #[test]
    fn negative_rho_inflates_goalless_draws() {
        let independent = ScoreGrid::from_rates(1.3, 1.0, 0.0);
        let corrected = ScoreGrid::from_rates(1.3, 1.0, -0.1);
        assert!(corrected.prob(0, 0) > independent.prob(0, 0));
        assert!(corrected.prob(1, 1) > independent.prob(1, 1));
    }

    #[test]
    fn stronger_home_rate_lifts_home_win() {
        let weak = ScoreGrid::from_rates(1.0, 1.0, -0.05).markets();
        let strong = ScoreGrid::from_rates(2.2, 1.0, -0.05).markets();
        assert!(strong.home_win > weak.home_win + 0.15);
        assert!(strong.over_25 > weak.over_25);
    }

    #[test]
    fn most_likely_score_tracks_rates() {
        let grid = ScoreGrid::from_rates(0.4, 0.4, 0.0);
        let (h, a, p) = grid.most_likely_score();
        assert_eq!((h, a), (0, 0));
        assert!(p > 0.3);
    }

    // ── Engine mode selection ────────────────────────────────────────────────

    fn fitted_set(fitted_at: DateTime<Utc>) -> FittedParameterSet {
        let mut teams = BTreeMap::new();
        teams.insert("Arsenal".to_string(), TeamRating {
            home_attack: 0.2,
            home_defense: -0.1,
            away_attack: 0.1,
            away_defense: -0.05,
            matches: 20,
        });
        teams.insert("Chelsea".to_string(), TeamRating {
            home_attack: -0.2,
            home_defense: 0.1,
            away_attack: -0.1,
            away_defense: 0.05,
            matches: 20,
        });
        let mut leagues = BTreeMap::new();
        leagues.insert("Premier League".to_string(), LeagueRating {
            rho: -0.06,
            home_advantage: 0.12,
            baseline_rate: 1.35,
            teams,
            matches: 40,
            converged: true,
        });
        FittedParameterSet {
            version: 7,
            fitted_at,
            leagues,
            log_likelihood: -100.0,
            mean_log_likelihood: -2.5,
            converged: true,
        }
    }

    fn history() -> Vec<HistoricalMatch> {
        let mut out = Vec::new();
        for (i, (hg, ag)) in [(2, 1), (1, 1), (3, 0), (0, 2), (2, 2), (1, 0)]
            .iter()
            .enumerate()
        {
            out.push(HistoricalMatch {
                id: None,
                league: "Premier League".into(),
                home: if i % 2 == 0 { "Arsenal" } else { "Chelsea" }.into(),
                away: if i % 2 == 0 { "Chelsea" } else { "Arsenal" }.into(),
                home_goals: *hg,
                away_goals: *ag,
                date: format!("2026-01-{:02}", i + 1).parse().unwrap(),
            });
        }
        out
    }

    #[test]
    fn fresh_params_produce_fitted_predictions() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        let engine = PredictionEngine::new(
            Some(fitted_set(now - chrono::Duration::hours(3))),
            FallbackRates::from_history(&history(), 10),
            now,
            24,
            false,
        );
        let pred = engine.predict("Premier League", "Arsenal", "Chelsea").unwrap();
        assert_eq!(pred.source, RateSource::Fitted);
        assert_eq!(pred.model_version, 7);
        assert!(pred.home_lambda > pred.away_lambda);
    }

    #[test]
    fn stale_params_degrade_to_fallback() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        let engine = PredictionEngine::new(
            Some(fitted_set(now - chrono::Duration::hours(48))),
            FallbackRates::from_history(&history(), 10),
            now,
            24,
            false,
        );
        let pred = engine.predict("Premier League", "Arsenal", "Chelsea").unwrap();
        assert_eq!(pred.source, RateSource::Fallback);
        assert_eq!(pred.model_version, 0);
    }

    #[test]
    fn forced_refit_keeps_stale_params_usable() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        let engine = PredictionEngine::new(
            Some(fitted_set(now - chrono::Duration::hours(48))),
            FallbackRates::default(),
            now,
            24,
            true,
        );
        let pred = engine.predict("Premier League", "Arsenal", "Chelsea").unwrap();
        assert_eq!(pred.source, RateSource::Fitted);
    }

    #[test]
    fn unknown_team_without_fallback_yields_none() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        let engine = PredictionEngine::new(
            Some(fitted_set(now)),
            FallbackRates::default(),
            now,
            24,
            false,
        );
        assert!(engine.predict("Premier League", "Arsenal", "Leeds").is_none());
    }

    #[test]
    fn fallback_prediction_markets_are_normalized() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        let engine =
            PredictionEngine::new(None, FallbackRates::from_history(&history(), 10), now, 24, false);
        let pred = engine.predict("Premier League", "Arsenal", "Chelsea").unwrap();
        assert_eq!(pred.source, RateSource::Fallback);
        let m = pred.markets;
        assert_relative_eq!(m.home_win + m.draw + m.away_win, 1.0, epsilon = 1e-6);
    }
}
