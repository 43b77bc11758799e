use thiserror::Error;

/// Failure taxonomy for the daily pipeline.
///
/// Only `StateConflict` aborts a run before any state mutation; every other
/// variant is handled where it arises by degrading or skipping.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Too few matches to fit a league; its teams degrade to fallback rates.
    #[error("insufficient history for {league}: {have} matches (need {need})")]
    DataInsufficient {
        league: String,
        have: usize,
        need: usize,
    },

    /// The optimizer failed to converge or the likelihood went non-finite.
    #[error("optimization diverged for {league}: {reason}")]
    OptimizationDivergence { league: String, reason: String },

    /// A single historical record or quote failed validation; it is skipped
    /// and the rest of the batch continues.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// A price or result feed errored or rate-limited; only the affected
    /// match is skipped.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Another pipeline invocation holds the run lock. Bankroll integrity
    /// cannot be guaranteed under concurrent writers.
    #[error("concurrent run detected: lock held since {since}")]
    StateConflict { since: String },
}
