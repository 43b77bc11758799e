pub mod fotmob;
pub mod odds_api;

pub use fotmob::FotMobClient;
pub use odds_api::OddsApiClient;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::db::models::{Fixture, HistoricalMatch, PriceQuote};

/// Feed-level failures. `Unavailable` means the upstream errored or
/// rate-limited; the pipeline skips only the affected work and continues.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Final state of a fixture as reported by a result feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    Final { home_goals: u32, away_goals: u32 },
    NotYetPlayed,
}

/// Pull contract for completed results: used to resolve pending wagers and
/// to keep the history store current.
#[async_trait]
pub trait ResultFeed: Send + Sync {
    /// Final score of one fixture, or `NotYetPlayed` when it has not
    /// finished (or the feed does not know it yet).
    async fn fetch_result(&self, fixture: &Fixture) -> Result<ResultState, FeedError>;

    /// All finished matches of a league's current season, for seeding and
    /// refreshing the history store.
    async fn fetch_league_results(&self, league: &str) -> Result<Vec<HistoricalMatch>, FeedError>;

    fn name(&self) -> &str;
}

/// Pull contract for the day's schedule.
#[async_trait]
pub trait FixtureFeed: Send + Sync {
    async fn fetch_fixtures(&self, date: NaiveDate) -> Result<Vec<Fixture>, FeedError>;
}

/// Pull contract for bookmaker prices.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn fetch_quotes(&self, fixture: &Fixture) -> Result<Vec<PriceQuote>, FeedError>;
}

/// Loose team-name equality across feeds that disagree on naming
/// ("Man Utd" / "Manchester United"). Exact match, containment, or any
/// shared word longer than three characters.
pub fn teams_match(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a == b {
        return true;
    }
    if a.len() > 3 && b.len() > 3 && (a.contains(&b) || b.contains(&a)) {
        return true;
    }
    a.split_whitespace()
        .filter(|w| w.len() > 3)
        .any(|w| b.split_whitespace().any(|v| v == w))
}
