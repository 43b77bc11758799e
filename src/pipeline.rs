//! The daily batch pipeline.
//!
//! One sequential pass per logical day: resolve pending wagers → refresh
//! history → conditionally refit parameters → predict today's fixtures →
//! fetch prices → place value wagers → persist state. Re-running within the
//! same day is a no-op unless forced, and a persisted run lock rejects
//! concurrent invocations before any state is touched.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::models::{
    AppendOutcome, Fixture, HistoricalMatch, PredictionRecord, Wager, WagerStatus,
};
use crate::db::{Database, ExperimentState};
use crate::feeds::{FixtureFeed, PriceFeed, ResultFeed, ResultState};
use crate::model::calibration::{self, CalibrationReport};
use crate::model::fitter::{self, ParameterFitter};
use crate::model::predict::{FallbackRates, PredictionEngine};
use crate::model::value::{round_money, ValueEngine};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub today: NaiveDate,
    pub now: DateTime<Utc>,
    /// Re-run even if the pipeline already ran today.
    pub force: bool,
    /// Preview only: nothing is persisted.
    pub dry_run: bool,
    /// Resolve pending wagers and stop.
    pub resolve_only: bool,
    /// Refit parameters regardless of staleness.
    pub force_fit: bool,
}

impl RunOptions {
    pub fn from_config(config: &Config, now: DateTime<Utc>) -> RunOptions {
        RunOptions {
            today: now.date_naive(),
            now,
            force: config.force,
            dry_run: config.dry_run,
            resolve_only: config.resolve,
            force_fit: config.fit,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// True when the idempotency guard short-circuited the run.
    pub skipped: bool,
    pub resolved: usize,
    pub predictions: usize,
    pub wagers_placed: usize,
    pub total_staked: f64,
    pub bankroll: f64,
}

pub struct Pipeline {
    config: Config,
    db: Database,
    results: Arc<dyn ResultFeed>,
    fixtures: Arc<dyn FixtureFeed>,
    prices: Arc<dyn PriceFeed>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        db: Database,
        results: Arc<dyn ResultFeed>,
        fixtures: Arc<dyn FixtureFeed>,
        prices: Arc<dyn PriceFeed>,
    ) -> Pipeline {
        Pipeline {
            config,
            db,
            results,
            fixtures,
            prices,
        }
    }

    /// Run one logical day end to end.
    pub async fn run_day(&self, opts: &RunOptions) -> Result<RunSummary> {
        let mut state = self
            .db
            .load_state()?
            .unwrap_or_else(|| ExperimentState::new(self.config.initial_bankroll));

        // Idempotency: a second invocation on the same logical day is a
        // no-op unless explicitly overridden.
        if state.last_run == Some(opts.today) && !opts.force && !opts.resolve_only {
            info!("already ran on {}; use --force to re-run", opts.today);
            return Ok(RunSummary {
                skipped: true,
                bankroll: state.bankroll,
                ..RunSummary::default()
            });
        }

        if !opts.dry_run {
            self.db.acquire_run_lock(opts.now)?;
        }
        let result = self.run_locked(&mut state, opts).await;
        if !opts.dry_run {
            if let Err(e) = self.db.release_run_lock() {
                warn!("failed to release run lock: {e}");
            }
        }
        result
    }

    async fn run_locked(&self, state: &mut ExperimentState, opts: &RunOptions) -> Result<RunSummary> {
        info!(
            "day {} | bankroll EUR {:.2} | record {}W-{}L ({:+.1}% ROI)",
            state.day,
            state.bankroll,
            state.stats.wins,
            state.stats.losses,
            state.roi()
        );

        // Step 1: resolve pending wagers and annotate their predictions.
        let resolved = self.resolve_pending(state, opts).await?;
        if resolved > 0 {
            info!("resolved {resolved} wagers; bankroll EUR {:.2}", state.bankroll);
        }

        if opts.resolve_only {
            if !opts.dry_run {
                self.db.save_state(state)?;
            }
            return Ok(RunSummary {
                resolved,
                bankroll: state.bankroll,
                ..RunSummary::default()
            });
        }

        // Step 2: refresh the history store from the results feed.
        if !opts.dry_run {
            self.refresh_history().await;
        }

        // Step 3: refit when stale (or forced); keep the prior set when the
        // new fit is rejected.
        let history = self.db.query_matches(None, opts.today)?;
        let active = self.refit_if_needed(&history, opts)?;

        // Step 4-5: predict today's fixtures and fetch prices.
        let engine = PredictionEngine::new(
            active,
            FallbackRates::from_history(&history, self.config.fallback_window),
            opts.now,
            self.config.staleness_hours,
            opts.force_fit,
        );
        let value_engine = ValueEngine::new(self.config.strategy());

        let fixtures = match self.fixtures.fetch_fixtures(opts.today).await {
            Ok(fixtures) => fixtures,
            Err(e) => {
                warn!("fixture feed unavailable ({e}); no wagers today");
                Vec::new()
            }
        };

        let mut predictions = 0usize;
        let mut candidates = Vec::new();
        for fixture in &fixtures {
            let Some(pred) = engine.predict(&fixture.league, &fixture.home, &fixture.away) else {
                continue;
            };
            predictions += 1;
            let (h, a, p) = pred.grid.most_likely_score();
            info!(
                "[{}] {} vs {}: {:.2}-{:.2} ({}) 1X2 {:.0}%/{:.0}%/{:.0}% | most likely {h}-{a} ({:.0}%)",
                fixture.league,
                fixture.home,
                fixture.away,
                pred.home_lambda,
                pred.away_lambda,
                pred.source.as_str(),
                pred.markets.home_win * 100.0,
                pred.markets.draw * 100.0,
                pred.markets.away_win * 100.0,
                p * 100.0,
            );

            if !opts.dry_run {
                self.db.log_prediction(&PredictionRecord {
                    id: None,
                    date: fixture.date,
                    league: fixture.league.clone(),
                    home: fixture.home.clone(),
                    away: fixture.away.clone(),
                    model_version: pred.model_version,
                    source: pred.source,
                    home_lambda: pred.home_lambda,
                    away_lambda: pred.away_lambda,
                    home_win: pred.markets.home_win,
                    draw: pred.markets.draw,
                    away_win: pred.markets.away_win,
                    over_25: pred.markets.over_25,
                    btts: pred.markets.btts_yes,
                    created_at: opts.now,
                    home_goals: None,
                    away_goals: None,
                })?;
            }

            // A feed failure prices out this match only; the run continues.
            match self.prices.fetch_quotes(fixture).await {
                Ok(quotes) if !quotes.is_empty() => {
                    candidates.extend(value_engine.evaluate_fixture(fixture, &pred.markets, &quotes));
                }
                Ok(_) => {}
                Err(e) => warn!("prices unavailable for {} vs {}: {e}", fixture.home, fixture.away),
            }
        }

        // Step 6: stake sizing under the daily ceiling, then record.
        let placed = value_engine.allocate(candidates, state.bankroll);
        let mut total_staked = 0.0;
        for bet in &placed {
            info!(
                "wager: {} [{}] @ {:.2} | p={:.1}% vs implied {:.1}% | EV {:+.1}% | stake EUR {:.2}",
                bet.market.label(&bet.home, &bet.away),
                bet.league,
                bet.price,
                bet.model_prob * 100.0,
                bet.implied_prob * 100.0,
                bet.expected_value * 100.0,
                bet.stake,
            );
            if opts.dry_run {
                continue;
            }
            // Monetary invariants enforced at the point of mutation.
            if bet.stake > state.bankroll {
                warn!("stake EUR {:.2} exceeds bankroll; skipping", bet.stake);
                continue;
            }
            self.db.insert_wager(&Wager {
                id: None,
                placed_on: opts.today,
                league: bet.league.clone(),
                home: bet.home.clone(),
                away: bet.away.clone(),
                market: bet.market,
                model_prob: bet.model_prob,
                price: bet.price,
                implied_prob: bet.implied_prob,
                expected_value: bet.expected_value,
                edge: bet.edge,
                stake: bet.stake,
                status: WagerStatus::Pending,
                profit: None,
                settled_at: None,
            })?;
            state.bankroll = round_money(state.bankroll - bet.stake);
            state.stats.total_wagers += 1;
            state.stats.total_staked = round_money(state.stats.total_staked + bet.stake);
            total_staked = round_money(total_staked + bet.stake);
        }

        if placed.is_empty() {
            info!("no value wagers today");
        }

        if opts.dry_run {
            info!("dry run: no wagers recorded, no state changes");
        } else {
            state.last_run = Some(opts.today);
            state.day += 1;
            state.bankroll = round_money(state.bankroll);
            self.db.save_state(state)?;
        }

        Ok(RunSummary {
            skipped: false,
            resolved,
            predictions,
            wagers_placed: placed.len(),
            total_staked,
            bankroll: state.bankroll,
        })
    }

    /// Settle every pending wager whose result is known, voiding wagers that
    /// stayed unresolved past the void window. Feed failures skip only the
    /// affected wager.
    async fn resolve_pending(&self, state: &mut ExperimentState, opts: &RunOptions) -> Result<usize> {
        let mut resolved = 0usize;
        for wager in self.db.pending_wagers()? {
            let fixture = Fixture {
                league: wager.league.clone(),
                home: wager.home.clone(),
                away: wager.away.clone(),
                date: wager.placed_on,
                kickoff: None,
            };
            let result = match self.results.fetch_result(&fixture).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("result feed unavailable for {} vs {}: {e}", wager.home, wager.away);
                    continue;
                }
            };
            match result {
                ResultState::Final {
                    home_goals,
                    away_goals,
                } => {
                    self.settle(state, &wager, home_goals, away_goals, opts)?;
                    resolved += 1;
                }
                ResultState::NotYetPlayed => {
                    let age = (opts.today - wager.placed_on).num_days();
                    if age > self.config.void_after_days {
                        self.void(state, &wager, opts)?;
                        resolved += 1;
                    }
                }
            }
        }

        // Annotate any other logged predictions whose matches have finished,
        // so calibration covers more than just the wagered fixtures.
        for pred in self.db.unresolved_predictions(opts.today)? {
            let fixture = Fixture {
                league: pred.league.clone(),
                home: pred.home.clone(),
                away: pred.away.clone(),
                date: pred.date,
                kickoff: None,
            };
            if let Ok(ResultState::Final {
                home_goals,
                away_goals,
            }) = self.results.fetch_result(&fixture).await
            {
                if !opts.dry_run {
                    self.db.annotate_prediction_result(
                        pred.date,
                        &pred.league,
                        &pred.home,
                        &pred.away,
                        home_goals,
                        away_goals,
                    )?;
                }
            }
        }
        Ok(resolved)
    }

    fn settle(
        &self,
        state: &mut ExperimentState,
        wager: &Wager,
        home_goals: u32,
        away_goals: u32,
        opts: &RunOptions,
    ) -> Result<()> {
        let won = wager.market.is_winner(home_goals, away_goals);
        let (status, profit) = if won {
            (WagerStatus::Won, round_money(wager.stake * (wager.price - 1.0)))
        } else {
            (WagerStatus::Lost, -wager.stake)
        };
        info!(
            "{}: {} ({}-{}) -> EUR {:+.2}",
            status.as_str(),
            wager.market.label(&wager.home, &wager.away),
            home_goals,
            away_goals,
            profit
        );
        if opts.dry_run {
            return Ok(());
        }

        let id = wager.id.expect("pending wager loaded without id");
        if !self.db.settle_wager(id, status, profit, opts.now)? {
            // Already settled by an earlier run; leave state untouched.
            return Ok(());
        }
        if won {
            let returned = round_money(wager.stake * wager.price);
            state.bankroll = round_money(state.bankroll + returned);
            state.stats.wins += 1;
            state.stats.total_returned = round_money(state.stats.total_returned + returned);
        } else {
            state.stats.losses += 1;
        }
        state.stats.total_profit = round_money(state.stats.total_profit + profit);

        self.db.annotate_prediction_result(
            wager.placed_on,
            &wager.league,
            &wager.home,
            &wager.away,
            home_goals,
            away_goals,
        )?;
        // Feed the result straight back into the history store.
        self.db.append_match(&HistoricalMatch {
            id: None,
            league: wager.league.clone(),
            home: wager.home.clone(),
            away: wager.away.clone(),
            home_goals,
            away_goals,
            date: wager.placed_on,
        })?;
        Ok(())
    }

    /// Refund a wager whose match never produced a result (postponed or
    /// abandoned).
    fn void(&self, state: &mut ExperimentState, wager: &Wager, opts: &RunOptions) -> Result<()> {
        info!(
            "void: {} (no result after {} days) -> stake EUR {:.2} returned",
            wager.market.label(&wager.home, &wager.away),
            self.config.void_after_days,
            wager.stake
        );
        if opts.dry_run {
            return Ok(());
        }
        let id = wager.id.expect("pending wager loaded without id");
        if self.db.settle_wager(id, WagerStatus::Void, 0.0, opts.now)? {
            state.bankroll = round_money(state.bankroll + wager.stake);
            state.stats.voids += 1;
            state.stats.total_returned = round_money(state.stats.total_returned + wager.stake);
        }
        Ok(())
    }

    /// Pull each tracked league's finished matches into the history store.
    async fn refresh_history(&self) {
        for league in self.config.tracked_leagues() {
            match self.results.fetch_league_results(&league).await {
                Ok(results) => {
                    let mut inserted = 0usize;
                    for m in &results {
                        if let Ok(AppendOutcome::Inserted) = self.db.append_match(m) {
                            inserted += 1;
                        }
                    }
                    if inserted > 0 {
                        info!("{league}: {inserted} new results");
                    }
                }
                Err(e) => warn!("history refresh unavailable for {league}: {e}"),
            }
        }
    }

    /// Refit when the active set is stale, missing, or a refit was forced.
    /// A rejected fit (divergence or worse likelihood) retains the previous
    /// set and surfaces a staleness warning.
    fn refit_if_needed(
        &self,
        history: &[HistoricalMatch],
        opts: &RunOptions,
    ) -> Result<Option<crate::model::fitter::FittedParameterSet>> {
        let previous = self.db.load_active_params()?;
        let stale = previous
            .as_ref()
            .map(|p| p.age_hours(opts.now) > self.config.staleness_hours)
            .unwrap_or(true);
        if !opts.force_fit && !stale {
            return Ok(previous);
        }

        let version = previous.as_ref().map(|p| p.version + 1).unwrap_or(1);
        info!(
            "refitting parameters (v{version}, {} matches, reason: {})",
            history.len(),
            if opts.force_fit { "forced" } else { "stale" }
        );
        let fitter = ParameterFitter::new(self.config.fit_options());
        let new_set = fitter.fit(history, opts.today, version);

        if fitter::accept(&new_set, previous.as_ref()) {
            if !opts.dry_run {
                self.db.save_active_params(&new_set)?;
            }
            info!(
                "parameter set v{version} active ({} leagues, ll/w {:.4})",
                new_set.leagues.len(),
                new_set.mean_log_likelihood
            );
            Ok(Some(new_set))
        } else {
            warn!(
                "fit v{version} rejected; retaining previous parameters (predictions may be stale)"
            );
            Ok(previous)
        }
    }

    /// Standalone forced refit: refresh history, fit, persist if accepted.
    pub async fn refit(&self, today: NaiveDate, now: DateTime<Utc>) -> Result<()> {
        self.refresh_history().await;
        let history = self.db.query_matches(None, today)?;
        let opts = RunOptions {
            today,
            now,
            force: false,
            dry_run: false,
            resolve_only: false,
            force_fit: true,
        };
        self.refit_if_needed(&history, &opts)?;
        Ok(())
    }

    /// Bulk-load history from the results feed.
    pub async fn seed(&self) -> Result<(usize, usize)> {
        let mut inserted = 0usize;
        let mut duplicates = 0usize;
        for league in self.config.tracked_leagues() {
            let results = match self.results.fetch_league_results(&league).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("seed skipped for {league}: {e}");
                    continue;
                }
            };
            for m in &results {
                match self.db.append_match(m)? {
                    AppendOutcome::Inserted => inserted += 1,
                    AppendOutcome::Duplicate => duplicates += 1,
                }
            }
            info!("{league}: seeded");
        }
        Ok((inserted, duplicates))
    }

    /// Score all annotated predictions.
    pub fn calibration_report(&self) -> Result<Option<CalibrationReport>> {
        let records = self.db.predictions_with_results()?;
        Ok(calibration::evaluate(&records))
    }

    /// Reset the experiment document to the initial bankroll. History and
    /// settled wagers stay in place for calibration.
    pub fn reset(&self) -> Result<()> {
        self.db
            .save_state(&ExperimentState::new(self.config.initial_bankroll))
    }
}
