use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A completed match as recorded in the history store.
///
/// Immutable once inserted: the fitter derives per-run time-decay weights
/// from `date` but never writes them back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalMatch {
    pub id: Option<i64>,
    pub league: String,
    pub home: String,
    pub away: String,
    pub home_goals: u32,
    pub away_goals: u32,
    pub date: NaiveDate,
}

/// An upcoming match eligible for prediction and pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    pub league: String,
    pub home: String,
    pub away: String,
    pub date: NaiveDate,
    /// Kickoff time "HH:MM" when the feed provides one.
    pub kickoff: Option<String>,
}

/// Result of appending to the history store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Duplicate,
}

/// A bettable outcome across the three supported markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Market {
    HomeWin,
    Draw,
    AwayWin,
    Over25,
    Under25,
    BttsYes,
    BttsNo,
}

/// Market family a selection belongs to; the 1X2 family is subject to
/// one-recommendation-per-match deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketGroup {
    OneXTwo,
    Totals,
    Btts,
}

impl Market {
    pub fn group(&self) -> MarketGroup {
        match self {
            Market::HomeWin | Market::Draw | Market::AwayWin => MarketGroup::OneXTwo,
            Market::Over25 | Market::Under25 => MarketGroup::Totals,
            Market::BttsYes | Market::BttsNo => MarketGroup::Btts,
        }
    }

    /// Did this selection win given the final score?
    pub fn is_winner(&self, home_goals: u32, away_goals: u32) -> bool {
        let total = home_goals + away_goals;
        match self {
            Market::HomeWin => home_goals > away_goals,
            Market::Draw => home_goals == away_goals,
            Market::AwayWin => away_goals > home_goals,
            Market::Over25 => total > 2,
            Market::Under25 => total <= 2,
            Market::BttsYes => home_goals > 0 && away_goals > 0,
            Market::BttsNo => home_goals == 0 || away_goals == 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Market::HomeWin => "1",
            Market::Draw => "X",
            Market::AwayWin => "2",
            Market::Over25 => "over_25",
            Market::Under25 => "under_25",
            Market::BttsYes => "btts_yes",
            Market::BttsNo => "btts_no",
        }
    }

    pub fn parse(s: &str) -> Option<Market> {
        match s {
            "1" => Some(Market::HomeWin),
            "X" => Some(Market::Draw),
            "2" => Some(Market::AwayWin),
            "over_25" => Some(Market::Over25),
            "under_25" => Some(Market::Under25),
            "btts_yes" => Some(Market::BttsYes),
            "btts_no" => Some(Market::BttsNo),
            _ => None,
        }
    }

    /// Human-readable tip label, e.g. "1 (Arsenal)".
    pub fn label(&self, home: &str, away: &str) -> String {
        match self {
            Market::HomeWin => format!("1 ({})", home),
            Market::Draw => "X (Draw)".to_string(),
            Market::AwayWin => format!("2 ({})", away),
            Market::Over25 => "Over 2.5 Goals".to_string(),
            Market::Under25 => "Under 2.5 Goals".to_string(),
            Market::BttsYes => "Both Teams To Score".to_string(),
            Market::BttsNo => "No BTTS".to_string(),
        }
    }
}

/// Which estimator produced a prediction's scoring rates.
///
/// Carried on every prediction so staking and calibration can separate
/// MLE-quality output from degraded output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    Fitted,
    Fallback,
}

impl RateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateSource::Fitted => "fitted",
            RateSource::Fallback => "fallback",
        }
    }

    pub fn parse(s: &str) -> Option<RateSource> {
        match s {
            "fitted" => Some(RateSource::Fitted),
            "fallback" => Some(RateSource::Fallback),
            _ => None,
        }
    }
}

/// A logged model prediction for one match.
///
/// Immutable until the match resolves, at which point `home_goals` /
/// `away_goals` are annotated for calibration; the predicted fields are
/// never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: Option<i64>,
    pub date: NaiveDate,
    pub league: String,
    pub home: String,
    pub away: String,
    pub model_version: i64,
    pub source: RateSource,
    pub home_lambda: f64,
    pub away_lambda: f64,
    pub home_win: f64,
    pub draw: f64,
    pub away_win: f64,
    pub over_25: f64,
    pub btts: f64,
    pub created_at: DateTime<Utc>,
    pub home_goals: Option<u32>,
    pub away_goals: Option<u32>,
}

/// A bookmaker price observed for one selection. Latest-known only.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub league: String,
    pub home: String,
    pub away: String,
    pub market: Market,
    /// Decimal price, e.g. 2.45.
    pub price: f64,
    pub fetched_at: DateTime<Utc>,
}

/// Lifecycle of a placed wager. Transitions exactly once from `Pending`
/// to one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WagerStatus {
    Pending,
    Won,
    Lost,
    Void,
}

impl WagerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WagerStatus::Pending => "pending",
            WagerStatus::Won => "won",
            WagerStatus::Lost => "lost",
            WagerStatus::Void => "void",
        }
    }

    pub fn parse(s: &str) -> Option<WagerStatus> {
        match s {
            "pending" => Some(WagerStatus::Pending),
            "won" => Some(WagerStatus::Won),
            "lost" => Some(WagerStatus::Lost),
            "void" => Some(WagerStatus::Void),
            _ => None,
        }
    }
}

/// A recommended (and recorded) wager. Monetary fields are rounded to two
/// decimals before they reach this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wager {
    pub id: Option<i64>,
    pub placed_on: NaiveDate,
    pub league: String,
    pub home: String,
    pub away: String,
    pub market: Market,
    pub model_prob: f64,
    pub price: f64,
    pub implied_prob: f64,
    pub expected_value: f64,
    pub edge: f64,
    pub stake: f64,
    pub status: WagerStatus,
    pub profit: Option<f64>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_winner_rules() {
        assert!(Market::HomeWin.is_winner(2, 1));
        assert!(!Market::HomeWin.is_winner(1, 1));
        assert!(Market::Draw.is_winner(0, 0));
        assert!(Market::AwayWin.is_winner(0, 3));
        assert!(Market::Over25.is_winner(2, 1));
        assert!(!Market::Over25.is_winner(1, 1));
        assert!(Market::Under25.is_winner(1, 1));
        assert!(Market::BttsYes.is_winner(1, 1));
        assert!(Market::BttsNo.is_winner(2, 0));
    }

    #[test]
    fn market_roundtrip() {
        for m in [
            Market::HomeWin,
            Market::Draw,
            Market::AwayWin,
            Market::Over25,
            Market::Under25,
            Market::BttsYes,
            Market::BttsNo,
        ] {
            assert_eq!(Market::parse(m.as_str()), Some(m));
        }
        assert_eq!(Market::parse("garbage"), None);
    }

    #[test]
    fn only_1x2_is_deduplicated_as_a_group() {
        assert_eq!(Market::Draw.group(), MarketGroup::OneXTwo);
        assert_eq!(Market::Over25.group(), MarketGroup::Totals);
        assert_eq!(Market::BttsNo.group(), MarketGroup::Btts);
    }
}
