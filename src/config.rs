use clap::Parser;

use crate::feeds::fotmob::DEFAULT_FOTMOB_URL;
use crate::feeds::odds_api::DEFAULT_ODDS_API_URL;
use crate::model::fitter::FitOptions;
use crate::model::value::Strategy;

/// Daily Dixon-Coles value betting experiment runner
#[derive(Parser, Debug, Clone)]
#[command(name = "valuebets-bot", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "valuebets.db")]
    pub database_path: String,

    /// Initial experiment bankroll (EUR)
    #[arg(long, env = "INITIAL_BANKROLL", default_value = "100.0")]
    pub initial_bankroll: f64,

    /// Comma-separated leagues to track
    #[arg(
        long,
        env = "TRACKED_LEAGUES",
        default_value = "Serie A,Premier League,La Liga,Bundesliga,Ligue 1"
    )]
    pub leagues: String,

    /// FotMob API base URL (results and fixtures)
    #[arg(long, env = "FOTMOB_API_URL", default_value = DEFAULT_FOTMOB_URL)]
    pub fotmob_api_url: String,

    /// The Odds API base URL (prices)
    #[arg(long, env = "ODDS_API_URL", default_value = DEFAULT_ODDS_API_URL)]
    pub odds_api_url: String,

    /// The Odds API key; without it the run predicts but places no wagers
    #[arg(long, env = "ODDS_API_KEY")]
    pub odds_api_key: Option<String>,

    // ── Model ────────────────────────────────────────────────────────────────
    /// Time-decay half-life for historical matches, in days
    #[arg(long, env = "HALF_LIFE_DAYS", default_value = "180.0")]
    pub half_life_days: f64,

    /// Cold-start constant k in the n/(n+k) rating shrinkage
    #[arg(long, env = "SHRINKAGE_K", default_value = "5.0")]
    pub shrinkage_k: f64,

    /// Minimum completed matches required to fit a league
    #[arg(long, env = "MIN_MATCHES", default_value = "50")]
    pub min_matches: usize,

    /// Hours after which fitted parameters are considered stale
    #[arg(long, env = "STALENESS_HOURS", default_value = "24")]
    pub staleness_hours: i64,

    /// Recent matches per team feeding the fallback rate estimate
    #[arg(long, env = "FALLBACK_WINDOW", default_value = "10")]
    pub fallback_window: usize,

    // ── Strategy ─────────────────────────────────────────────────────────────
    /// Minimum expected value to admit a wager (e.g. 0.05 = 5%)
    #[arg(long, env = "MIN_EV", default_value = "0.05")]
    pub min_ev: f64,

    /// Minimum edge over the implied probability (e.g. 0.03 = 3%)
    #[arg(long, env = "MIN_EDGE", default_value = "0.03")]
    pub min_edge: f64,

    /// Price ceiling; longer prices are excluded regardless of edge
    #[arg(long, env = "MAX_PRICE", default_value = "6.0")]
    pub max_price: f64,

    /// Fractional Kelly multiplier (0.25 = quarter Kelly)
    #[arg(long, env = "KELLY_FRACTION", default_value = "0.25")]
    pub kelly_fraction: f64,

    /// Per-wager ceiling as a fraction of bankroll
    #[arg(long, env = "MAX_SINGLE_STAKE_PCT", default_value = "0.10")]
    pub max_single_stake_pct: f64,

    /// Aggregate daily ceiling as a fraction of bankroll
    #[arg(long, env = "MAX_DAILY_STAKE_PCT", default_value = "0.25")]
    pub max_daily_stake_pct: f64,

    /// Minimum stake worth recording (EUR)
    #[arg(long, env = "MIN_STAKE", default_value = "1.0")]
    pub min_stake: f64,

    /// Days after which an unresolved wager is voided and refunded
    #[arg(long, env = "VOID_AFTER_DAYS", default_value = "3")]
    pub void_after_days: i64,

    // ── Run modes ────────────────────────────────────────────────────────────
    /// Re-run even if the pipeline already ran today
    #[arg(long)]
    pub force: bool,

    /// Preview only: no wagers placed, no state changes
    #[arg(long)]
    pub dry_run: bool,

    /// Only resolve pending wagers, then exit
    #[arg(long)]
    pub resolve: bool,

    /// Force a parameter refit even if the active set is fresh
    #[arg(long)]
    pub fit: bool,

    /// Print the model calibration report and exit
    #[arg(long)]
    pub calibrate: bool,

    /// Seed the history store from the results feed and exit
    #[arg(long)]
    pub seed: bool,

    /// Reset the experiment to the initial bankroll (requires --yes)
    #[arg(long)]
    pub reset: bool,

    /// Confirm destructive operations
    #[arg(long)]
    pub yes: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_bankroll <= 0.0 {
            anyhow::bail!("initial_bankroll must be positive");
        }
        if self.half_life_days <= 0.0 {
            anyhow::bail!("half_life_days must be positive");
        }
        if self.shrinkage_k < 0.0 {
            anyhow::bail!("shrinkage_k must be non-negative");
        }
        if !(0.0..=1.0).contains(&self.kelly_fraction) {
            anyhow::bail!("kelly_fraction must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.max_single_stake_pct) {
            anyhow::bail!("max_single_stake_pct must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.max_daily_stake_pct) {
            anyhow::bail!("max_daily_stake_pct must be between 0.0 and 1.0");
        }
        if self.max_price <= 1.0 {
            anyhow::bail!("max_price must exceed 1.0");
        }
        if self.min_ev < 0.0 || self.min_edge < 0.0 {
            anyhow::bail!("min_ev and min_edge must be non-negative");
        }
        if self.reset && !self.yes {
            anyhow::bail!("--reset discards the experiment state; confirm with --yes");
        }
        Ok(())
    }

    pub fn tracked_leagues(&self) -> Vec<String> {
        self.leagues
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            half_life_days: self.half_life_days,
            shrinkage_k: self.shrinkage_k,
            min_matches: self.min_matches,
        }
    }

    pub fn strategy(&self) -> Strategy {
        Strategy {
            min_ev: self.min_ev,
            min_edge: self.min_edge,
            max_price: self.max_price,
            kelly_fraction: self.kelly_fraction,
            max_single_stake_pct: self.max_single_stake_pct,
            max_daily_stake_pct: self.max_daily_stake_pct,
            min_stake: self.min_stake,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Config {
        Config::parse_from(["valuebets-bot"])
    }

    #[test]
    fn defaults_are_valid() {
        let config = defaults();
        config.validate().unwrap();
        assert_eq!(config.tracked_leagues().len(), 5);
        assert_eq!(config.strategy().kelly_fraction, 0.25);
    }

    #[test]
    fn reset_requires_confirmation() {
        let config = Config::parse_from(["valuebets-bot", "--reset"]);
        assert!(config.validate().is_err());
        let confirmed = Config::parse_from(["valuebets-bot", "--reset", "--yes"]);
        confirmed.validate().unwrap();
    }

    #[test]
    fn out_of_range_fractions_are_rejected() {
        let config = Config::parse_from(["valuebets-bot", "--kelly-fraction", "1.5"]);
        assert!(config.validate().is_err());
        let config = Config::parse_from(["valuebets-bot", "--max-price", "0.9"]);
        assert!(config.validate().is_err());
    }
}
