use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

pub mod models;
use models::*;

use crate::error::PipelineError;
use crate::model::fitter::FittedParameterSet;

/// A run lock older than this is assumed to be left over from a crashed run
/// and may be reclaimed.
const LOCK_STALE_HOURS: i64 = 6;

/// Thread-safe SQLite store (single connection with mutex).
///
/// Holds the append-only match history, the prediction log, the wager book
/// and the key-value experiment state (bankroll, last-run marker, active
/// parameter set, run lock).
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path.
    /// Pass `":memory:"` for an ephemeral store.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent).
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Match history ─────────────────────────────────────────────────────────

    /// Append a completed match. Returns `Duplicate` when the same
    /// (date, league, home, away) tuple is already recorded; the existing
    /// row is never mutated.
    pub fn append_match(&self, m: &HistoricalMatch) -> Result<AppendOutcome> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO matches (date, league, home, away, home_goals, away_goals, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![m.date, m.league, m.home, m.away, m.home_goals, m.away_goals, Utc::now()],
        )?;
        Ok(if changed > 0 {
            AppendOutcome::Inserted
        } else {
            AppendOutcome::Duplicate
        })
    }

    /// Completed matches up to (and including) `as_of`, ordered by date.
    /// Restricts to one league when `league` is given.
    pub fn query_matches(
        &self,
        league: Option<&str>,
        as_of: NaiveDate,
    ) -> Result<Vec<HistoricalMatch>> {
        let conn = self.conn.lock().unwrap();
        let base = "SELECT id, date, league, home, away, home_goals, away_goals
             FROM matches WHERE date <= ?1";
        let matches = match league {
            Some(l) => {
                let mut stmt = conn.prepare(&format!("{base} AND league = ?2 ORDER BY date ASC"))?;
                let rows = stmt.query_map(params![as_of, l], map_match)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!("{base} ORDER BY date ASC"))?;
                let rows = stmt.query_map(params![as_of], map_match)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(matches)
    }

    // ── Prediction log ────────────────────────────────────────────────────────

    /// Log a model prediction. The record stays immutable until
    /// `annotate_prediction_result` attaches the observed score.
    pub fn log_prediction(&self, p: &PredictionRecord) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO predictions (
                date, league, home, away, model_version, source,
                home_lambda, away_lambda, home_win, draw, away_win, over_25, btts,
                created_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                p.date,
                p.league,
                p.home,
                p.away,
                p.model_version,
                p.source.as_str(),
                p.home_lambda,
                p.away_lambda,
                p.home_win,
                p.draw,
                p.away_win,
                p.over_25,
                p.btts,
                p.created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Annotate logged predictions for a match with its final score.
    /// Only un-annotated rows are touched; predicted fields are never
    /// rewritten. Returns the number of rows annotated.
    pub fn annotate_prediction_result(
        &self,
        date: NaiveDate,
        league: &str,
        home: &str,
        away: &str,
        home_goals: u32,
        away_goals: u32,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE predictions SET home_goals = ?1, away_goals = ?2
             WHERE date = ?3 AND league = ?4 AND home = ?5 AND away = ?6
               AND home_goals IS NULL",
            params![home_goals, away_goals, date, league, home, away],
        )?;
        Ok(changed)
    }

    /// Predictions from before `before` still waiting for a result.
    pub fn unresolved_predictions(&self, before: NaiveDate) -> Result<Vec<PredictionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, date, league, home, away, model_version, source,
                    home_lambda, away_lambda, home_win, draw, away_win, over_25, btts,
                    created_at, home_goals, away_goals
             FROM predictions WHERE home_goals IS NULL AND date < ?1 ORDER BY date ASC",
        )?;
        let records = stmt
            .query_map(params![before], map_prediction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Predictions joined with their resolved outcomes, for calibration.
    pub fn predictions_with_results(&self) -> Result<Vec<PredictionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, date, league, home, away, model_version, source,
                    home_lambda, away_lambda, home_win, draw, away_win, over_25, btts,
                    created_at, home_goals, away_goals
             FROM predictions WHERE home_goals IS NOT NULL ORDER BY date ASC",
        )?;
        let records = stmt
            .query_map([], map_prediction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    // ── Wagers ────────────────────────────────────────────────────────────────

    pub fn insert_wager(&self, w: &Wager) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO wagers (
                placed_on, league, home, away, market, model_prob, price,
                implied_prob, expected_value, edge, stake, status, profit, settled_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                w.placed_on,
                w.league,
                w.home,
                w.away,
                w.market.as_str(),
                w.model_prob,
                w.price,
                w.implied_prob,
                w.expected_value,
                w.edge,
                w.stake,
                w.status.as_str(),
                w.profit,
                w.settled_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn pending_wagers(&self) -> Result<Vec<Wager>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{WAGER_SELECT} WHERE status = 'pending' ORDER BY placed_on ASC"
        ))?;
        let wagers = stmt
            .query_map([], map_wager)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(wagers)
    }

    pub fn wagers_placed_on(&self, date: NaiveDate) -> Result<Vec<Wager>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{WAGER_SELECT} WHERE placed_on = ?1 ORDER BY id ASC"
        ))?;
        let wagers = stmt
            .query_map(params![date], map_wager)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(wagers)
    }

    /// Move a pending wager to a terminal status. The `status = 'pending'`
    /// guard makes the transition happen exactly once; a second settlement
    /// attempt is a no-op and returns `false`.
    pub fn settle_wager(
        &self,
        id: i64,
        status: WagerStatus,
        profit: f64,
        settled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE wagers SET status = ?1, profit = ?2, settled_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            params![status.as_str(), profit, settled_at, id],
        )?;
        Ok(changed > 0)
    }

    // ── Experiment state ──────────────────────────────────────────────────────

    pub fn load_state(&self) -> Result<Option<ExperimentState>> {
        match self.get_kv("experiment")? {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("corrupt experiment state")?,
            )),
            None => Ok(None),
        }
    }

    pub fn save_state(&self, state: &ExperimentState) -> Result<()> {
        self.put_kv("experiment", &serde_json::to_string(state)?)
    }

    pub fn load_active_params(&self) -> Result<Option<FittedParameterSet>> {
        match self.get_kv("active_params")? {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("corrupt parameter set")?,
            )),
            None => Ok(None),
        }
    }

    pub fn save_active_params(&self, params: &FittedParameterSet) -> Result<()> {
        self.put_kv("active_params", &serde_json::to_string(params)?)
    }

    // ── Run lock ──────────────────────────────────────────────────────────────

    /// Take the single-writer run lock. Fails with `StateConflict` when
    /// another run holds a fresh lock; a lock older than `LOCK_STALE_HOURS`
    /// is treated as a crashed run and reclaimed.
    pub fn acquire_run_lock(&self, now: DateTime<Utc>) -> Result<(), PipelineError> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<String> = conn
            .query_row(
                "SELECT value FROM state WHERE key = 'run_lock'",
                [],
                |row| row.get(0),
            )
            .ok();
        if let Some(since) = existing {
            let fresh = DateTime::parse_from_rfc3339(&since)
                .map(|t| now.signed_duration_since(t.with_timezone(&Utc)).num_hours() < LOCK_STALE_HOURS)
                .unwrap_or(false);
            if fresh {
                return Err(PipelineError::StateConflict { since });
            }
        }
        conn.execute(
            "INSERT OR REPLACE INTO state (key, value) VALUES ('run_lock', ?1)",
            params![now.to_rfc3339()],
        )
        .map_err(|e| PipelineError::StateConflict {
            since: format!("lock write failed: {e}"),
        })?;
        Ok(())
    }

    pub fn release_run_lock(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM state WHERE key = 'run_lock'", [])?;
        Ok(())
    }

    // ── Key-value helpers ─────────────────────────────────────────────────────

    fn get_kv(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .ok();
        Ok(value)
    }

    fn put_kv(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn map_match(row: &rusqlite::Row) -> rusqlite::Result<HistoricalMatch> {
    Ok(HistoricalMatch {
        id: row.get(0)?,
        date: row.get(1)?,
        league: row.get(2)?,
        home: row.get(3)?,
        away: row.get(4)?,
        home_goals: row.get(5)?,
        away_goals: row.get(6)?,
    })
}

fn map_prediction(row: &rusqlite::Row) -> rusqlite::Result<PredictionRecord> {
    let source: String = row.get(6)?;
    Ok(PredictionRecord {
        id: row.get(0)?,
        date: row.get(1)?,
        league: row.get(2)?,
        home: row.get(3)?,
        away: row.get(4)?,
        model_version: row.get(5)?,
        source: RateSource::parse(&source).ok_or_else(|| bad_text(6, &source))?,
        home_lambda: row.get(7)?,
        away_lambda: row.get(8)?,
        home_win: row.get(9)?,
        draw: row.get(10)?,
        away_win: row.get(11)?,
        over_25: row.get(12)?,
        btts: row.get(13)?,
        created_at: row.get(14)?,
        home_goals: row.get(15)?,
        away_goals: row.get(16)?,
    })
}

const WAGER_SELECT: &str = "SELECT id, placed_on, league, home, away, market, model_prob, price,
            implied_prob, expected_value, edge, stake, status, profit, settled_at
     FROM wagers";

fn map_wager(row: &rusqlite::Row) -> rusqlite::Result<Wager> {
    let market: String = row.get(5)?;
    let status: String = row.get(12)?;
    Ok(Wager {
        id: row.get(0)?,
        placed_on: row.get(1)?,
        league: row.get(2)?,
        home: row.get(3)?,
        away: row.get(4)?,
        market: Market::parse(&market).ok_or_else(|| bad_text(5, &market))?,
        model_prob: row.get(6)?,
        price: row.get(7)?,
        implied_prob: row.get(8)?,
        expected_value: row.get(9)?,
        edge: row.get(10)?,
        stake: row.get(11)?,
        status: WagerStatus::parse(&status).ok_or_else(|| bad_text(12, &status))?,
        profit: row.get(13)?,
        settled_at: row.get(14)?,
    })
}

fn bad_text(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unrecognized value '{value}'").into(),
    )
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS matches (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    date        TEXT    NOT NULL,
    league      TEXT    NOT NULL,
    home        TEXT    NOT NULL,
    away        TEXT    NOT NULL,
    home_goals  INTEGER NOT NULL,
    away_goals  INTEGER NOT NULL,
    created_at  TEXT    NOT NULL,
    UNIQUE(date, league, home, away)
);

CREATE TABLE IF NOT EXISTS predictions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    date          TEXT    NOT NULL,
    league        TEXT    NOT NULL,
    home          TEXT    NOT NULL,
    away          TEXT    NOT NULL,
    model_version INTEGER NOT NULL,
    source        TEXT    NOT NULL,
    home_lambda   REAL    NOT NULL,
    away_lambda   REAL    NOT NULL,
    home_win      REAL    NOT NULL,
    draw          REAL    NOT NULL,
    away_win      REAL    NOT NULL,
    over_25       REAL    NOT NULL,
    btts          REAL    NOT NULL,
    created_at    TEXT    NOT NULL,
    home_goals    INTEGER,
    away_goals    INTEGER
);

CREATE TABLE IF NOT EXISTS wagers (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    placed_on      TEXT    NOT NULL,
    league         TEXT    NOT NULL,
    home           TEXT    NOT NULL,
    away           TEXT    NOT NULL,
    market         TEXT    NOT NULL,
    model_prob     REAL    NOT NULL,
    price          REAL    NOT NULL,
    implied_prob   REAL    NOT NULL,
    expected_value REAL    NOT NULL,
    edge           REAL    NOT NULL,
    stake          REAL    NOT NULL,
    status         TEXT    NOT NULL DEFAULT 'pending',
    profit         REAL,
    settled_at     TEXT
);

CREATE TABLE IF NOT EXISTS state (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_matches_league ON matches(league);
CREATE INDEX IF NOT EXISTS idx_matches_date ON matches(date);
CREATE INDEX IF NOT EXISTS idx_predictions_date ON predictions(date);
CREATE INDEX IF NOT EXISTS idx_wagers_status ON wagers(status);
"#;

// ── Experiment state document ─────────────────────────────────────────────────

/// Aggregate betting record, updated at each settlement and placement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentStats {
    pub total_wagers: u32,
    pub wins: u32,
    pub losses: u32,
    pub voids: u32,
    pub total_staked: f64,
    pub total_returned: f64,
    pub total_profit: f64,
}

/// The single persisted experiment-state document. Mutated only by the
/// pipeline under the run lock (single-writer discipline).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentState {
    pub bankroll: f64,
    pub initial_bankroll: f64,
    pub day: u32,
    pub last_run: Option<NaiveDate>,
    pub stats: ExperimentStats,
}

impl ExperimentState {
    pub fn new(initial_bankroll: f64) -> Self {
        ExperimentState {
            bankroll: initial_bankroll,
            initial_bankroll,
            day: 1,
            last_run: None,
            stats: ExperimentStats::default(),
        }
    }

    /// Profit per unit staked, as a percentage.
    pub fn roi(&self) -> f64 {
        if self.stats.total_staked <= 0.0 {
            return 0.0;
        }
        self.stats.total_profit / self.stats.total_staked * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mem_db() -> Database {
        Database::open(":memory:").unwrap()
    }

    fn sample_match(date: &str, home: &str, away: &str, hg: u32, ag: u32) -> HistoricalMatch {
        HistoricalMatch {
            id: None,
            league: "Premier League".into(),
            home: home.into(),
            away: away.into(),
            home_goals: hg,
            away_goals: ag,
            date: date.parse().unwrap(),
        }
    }

    #[test]
    fn append_detects_duplicates() {
        let db = mem_db();
        let m = sample_match("2026-01-10", "Arsenal", "Chelsea", 2, 1);
        assert_eq!(db.append_match(&m).unwrap(), AppendOutcome::Inserted);
        assert_eq!(db.append_match(&m).unwrap(), AppendOutcome::Duplicate);
        let stored = db
            .query_matches(Some("Premier League"), "2026-02-01".parse().unwrap())
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].home_goals, 2);
    }

    #[test]
    fn query_orders_by_date_and_respects_as_of() {
        let db = mem_db();
        db.append_match(&sample_match("2026-01-20", "Leeds", "Everton", 0, 0))
            .unwrap();
        db.append_match(&sample_match("2026-01-05", "Arsenal", "Chelsea", 3, 1))
            .unwrap();
        db.append_match(&sample_match("2026-03-01", "Chelsea", "Arsenal", 1, 1))
            .unwrap();

        let stored = db
            .query_matches(Some("Premier League"), "2026-02-01".parse().unwrap())
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored[0].date < stored[1].date);
    }

    #[test]
    fn wager_settles_exactly_once() {
        let db = mem_db();
        let id = db
            .insert_wager(&Wager {
                id: None,
                placed_on: "2026-01-10".parse().unwrap(),
                league: "Premier League".into(),
                home: "Arsenal".into(),
                away: "Chelsea".into(),
                market: Market::HomeWin,
                model_prob: 0.5,
                price: 2.4,
                implied_prob: 1.0 / 2.4,
                expected_value: 0.2,
                edge: 0.08,
                stake: 5.0,
                status: WagerStatus::Pending,
                profit: None,
                settled_at: None,
            })
            .unwrap();

        let now = Utc.with_ymd_and_hms(2026, 1, 11, 12, 0, 0).unwrap();
        assert!(db.settle_wager(id, WagerStatus::Won, 7.0, now).unwrap());
        // Second attempt is a no-op.
        assert!(!db.settle_wager(id, WagerStatus::Lost, -5.0, now).unwrap());

        let all = db.wagers_placed_on("2026-01-10".parse().unwrap()).unwrap();
        assert_eq!(all[0].status, WagerStatus::Won);
        assert_eq!(all[0].profit, Some(7.0));
    }

    #[test]
    fn state_roundtrip() {
        let db = mem_db();
        assert!(db.load_state().unwrap().is_none());
        let mut state = ExperimentState::new(100.0);
        state.bankroll = 87.5;
        state.last_run = Some("2026-01-10".parse().unwrap());
        db.save_state(&state).unwrap();
        let loaded = db.load_state().unwrap().unwrap();
        assert_eq!(loaded.bankroll, 87.5);
        assert_eq!(loaded.last_run, state.last_run);
    }

    #[test]
    fn run_lock_rejects_concurrent_acquisition() {
        let db = mem_db();
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 9, 0, 0).unwrap();
        db.acquire_run_lock(now).unwrap();
        let err = db.acquire_run_lock(now + chrono::Duration::minutes(5));
        assert!(matches!(err, Err(PipelineError::StateConflict { .. })));
        db.release_run_lock().unwrap();
        db.acquire_run_lock(now + chrono::Duration::minutes(10)).unwrap();
    }

    #[test]
    fn stale_run_lock_is_reclaimed() {
        let db = mem_db();
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 9, 0, 0).unwrap();
        db.acquire_run_lock(now).unwrap();
        // A crashed run's lock from yesterday must not wedge the pipeline.
        db.acquire_run_lock(now + chrono::Duration::hours(12)).unwrap();
    }

    #[test]
    fn prediction_annotation_is_one_shot() {
        let db = mem_db();
        let date: NaiveDate = "2026-01-10".parse().unwrap();
        db.log_prediction(&PredictionRecord {
            id: None,
            date,
            league: "Premier League".into(),
            home: "Arsenal".into(),
            away: "Chelsea".into(),
            model_version: 1,
            source: RateSource::Fitted,
            home_lambda: 1.6,
            away_lambda: 1.1,
            home_win: 0.45,
            draw: 0.27,
            away_win: 0.28,
            over_25: 0.52,
            btts: 0.55,
            created_at: Utc::now(),
            home_goals: None,
            away_goals: None,
        })
        .unwrap();

        assert_eq!(
            db.annotate_prediction_result(date, "Premier League", "Arsenal", "Chelsea", 2, 0)
                .unwrap(),
            1
        );
        // Already annotated: no rewrite.
        assert_eq!(
            db.annotate_prediction_result(date, "Premier League", "Arsenal", "Chelsea", 9, 9)
                .unwrap(),
            0
        );

        let scored = db.predictions_with_results().unwrap();
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].home_goals, Some(2));
    }
}
