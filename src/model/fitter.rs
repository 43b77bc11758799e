//! Dixon-Coles maximum-likelihood parameter fitting.
//!
//! Jointly fits venue-split attack/defense deviations for every team in a
//! league, plus the league-level home advantage and low-score correlation
//! (rho), by maximizing a time-decay-weighted Poisson log-likelihood with
//! the Dixon-Coles tau correction on the four low-score cells.
//!
//! Identifiability: the multiplicative model is invariant under a common
//! shift of all deviations compensated in the baseline rate. Every fit ends
//! with a renormalization pass that pins each deviation family to zero mean
//! and folds the compensating shift into the baseline and home advantage.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use tracing::{info, warn};

use super::optimizer::{CoordinateDescent, Minimizer};
use crate::db::models::HistoricalMatch;
use crate::error::PipelineError;

/// Exponential decay half-life for match weights, in days.
pub const DEFAULT_HALF_LIFE_DAYS: f64 = 180.0;
/// Cold-start constant k in the n/(n+k) shrinkage factor.
pub const DEFAULT_SHRINKAGE_K: f64 = 5.0;
/// Minimum completed matches required to fit a league.
pub const DEFAULT_MIN_MATCHES: usize = 50;

/// A replacement fit is accepted unless its likelihood per unit of decay
/// weight is worse than the active set's by more than this slack. The slack
/// absorbs day-to-day corpus drift while still rejecting degenerate runs.
pub const ACCEPT_SLACK: f64 = 0.25;

const RHO_BOUNDS: RangeInclusive<f64> = -0.5..=0.5;
const HOME_ADV_BOUNDS: RangeInclusive<f64> = -0.5..=1.0;
const DEVIATION_BOUNDS: RangeInclusive<f64> = -1.5..=1.5;

/// Expected-goal clamp applied inside the likelihood, preventing the search
/// from wandering into numerically hostile territory.
const RATE_FLOOR: f64 = 0.1;
const RATE_CEIL: f64 = 10.0;
const TAU_FLOOR: f64 = 1e-10;

const INIT_HOME_ADV: f64 = 0.139_761_942_375_158_56; // ln(1.15)
const INIT_RHO: f64 = -0.05;

/// Venue-split strength deviations for one team, log scale relative to the
/// league baseline. `matches` is the raw number of completed matches behind
/// the fit; it only grows as history accrues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamRating {
    pub home_attack: f64,
    pub home_defense: f64,
    pub away_attack: f64,
    pub away_defense: f64,
    pub matches: u32,
}

/// Fitted league-level parameters plus the team deviation map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeagueRating {
    /// Dixon-Coles low-score correlation, typically slightly negative.
    pub rho: f64,
    /// Log-scale boost applied to the home side's expected score.
    pub home_advantage: f64,
    /// Weighted average goals per side; anchors the multiplicative model.
    pub baseline_rate: f64,
    pub teams: BTreeMap<String, TeamRating>,
    /// Matches that contributed to this league's fit.
    pub matches: usize,
    pub converged: bool,
}

/// A versioned snapshot of every fitted league.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedParameterSet {
    pub version: i64,
    pub fitted_at: DateTime<Utc>,
    pub leagues: BTreeMap<String, LeagueRating>,
    /// Total weighted log-likelihood across fitted leagues.
    pub log_likelihood: f64,
    /// Log-likelihood per unit of decay weight; comparable across runs even
    /// as the corpus grows.
    pub mean_log_likelihood: f64,
    pub converged: bool,
}

impl FittedParameterSet {
    pub fn age_hours(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.fitted_at).num_hours()
    }
}

/// Accept a replacement set only when it is not worse than the active one
/// (per-weight likelihood, with [`ACCEPT_SLACK`] for corpus drift). An empty
/// or non-finite set never replaces anything.
pub fn accept(new: &FittedParameterSet, previous: Option<&FittedParameterSet>) -> bool {
    if new.leagues.is_empty() || !new.log_likelihood.is_finite() {
        return false;
    }
    match previous {
        None => true,
        Some(prev) if prev.leagues.is_empty() => true,
        Some(prev) => new.mean_log_likelihood >= prev.mean_log_likelihood - ACCEPT_SLACK,
    }
}

// ── Model primitives ──────────────────────────────────────────────────────────

/// Dixon-Coles correction factor for the four low-score cells.
pub fn dc_tau(x: u32, y: u32, lambda: f64, mu: f64, rho: f64) -> f64 {
    match (x, y) {
        (0, 0) => 1.0 - lambda * mu * rho,
        (1, 0) => 1.0 + mu * rho,
        (0, 1) => 1.0 + lambda * rho,
        (1, 1) => 1.0 - rho,
        _ => 1.0,
    }
}

/// Exponential time-decay weight: 1.0 today, 0.5 one half-life ago.
/// Matches dated after `as_of` get full weight rather than a boost.
pub fn time_weight(date: NaiveDate, as_of: NaiveDate, half_life_days: f64) -> f64 {
    let days = (as_of - date).num_days().max(0) as f64;
    (-std::f64::consts::LN_2 * days / half_life_days).exp()
}

/// Expected scoring rates for a fixture under fitted parameters.
pub fn expected_rates(league: &LeagueRating, home: &TeamRating, away: &TeamRating) -> (f64, f64) {
    let ln_base = league.baseline_rate.ln();
    let lambda = (ln_base + home.home_attack + away.away_defense + league.home_advantage).exp();
    let mu = (ln_base + away.away_attack + home.home_defense).exp();
    (lambda, mu)
}

/// Shrinkage multiplier toward the league baseline: n/(n+k). Monotonically
/// increasing in n, so sparsely observed teams are pulled harder to zero.
pub fn shrinkage_factor(matches: u32, k: f64) -> f64 {
    let n = matches as f64;
    n / (n + k)
}

fn ln_factorial(n: u32) -> f64 {
    (2..=n).map(|k| (k as f64).ln()).sum()
}

fn poisson_log_pmf(k: u32, rate: f64) -> f64 {
    k as f64 * rate.ln() - rate - ln_factorial(k)
}

/// Weighted Dixon-Coles log-likelihood of `matches` under `rating`.
/// Used both to record the achieved likelihood of a finished fit and to
/// validate the renormalization invariance in tests.
pub fn weighted_log_likelihood(
    rating: &LeagueRating,
    matches: &[HistoricalMatch],
    as_of: NaiveDate,
    half_life_days: f64,
) -> f64 {
    let mut total = 0.0;
    for m in matches {
        let (Some(home), Some(away)) = (rating.teams.get(&m.home), rating.teams.get(&m.away))
        else {
            continue;
        };
        let (lambda, mu) = expected_rates(rating, home, away);
        let lambda = lambda.clamp(RATE_FLOOR, RATE_CEIL);
        let mu = mu.clamp(RATE_FLOOR, RATE_CEIL);
        let tau = dc_tau(m.home_goals, m.away_goals, lambda, mu, rating.rho).max(TAU_FLOOR);
        let w = time_weight(m.date, as_of, half_life_days);
        total += w
            * (poisson_log_pmf(m.home_goals, lambda)
                + poisson_log_pmf(m.away_goals, mu)
                + tau.ln());
    }
    total
}

// ── Fitter ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FitOptions {
    pub half_life_days: f64,
    pub shrinkage_k: f64,
    pub min_matches: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            half_life_days: DEFAULT_HALF_LIFE_DAYS,
            shrinkage_k: DEFAULT_SHRINKAGE_K,
            min_matches: DEFAULT_MIN_MATCHES,
        }
    }
}

pub struct ParameterFitter {
    opts: FitOptions,
    minimizer: Box<dyn Minimizer>,
}

impl ParameterFitter {
    pub fn new(opts: FitOptions) -> Self {
        ParameterFitter {
            opts,
            minimizer: Box::new(CoordinateDescent::default()),
        }
    }

    pub fn with_minimizer(opts: FitOptions, minimizer: Box<dyn Minimizer>) -> Self {
        ParameterFitter { opts, minimizer }
    }

    /// Fit every league present in `matches` as of the reference date.
    ///
    /// Leagues with too little history are skipped (their teams degrade to
    /// the fallback estimator); leagues whose optimization diverges are
    /// omitted with a warning. The caller decides whether the resulting set
    /// replaces the active one via [`accept`].
    pub fn fit(&self, matches: &[HistoricalMatch], as_of: NaiveDate, version: i64) -> FittedParameterSet {
        let mut by_league: BTreeMap<&str, Vec<&HistoricalMatch>> = BTreeMap::new();
        for m in matches {
            by_league.entry(m.league.as_str()).or_default().push(m);
        }

        let mut leagues = BTreeMap::new();
        let mut total_ll = 0.0;
        let mut total_weight = 0.0;
        let mut all_converged = true;

        for (league, league_matches) in by_league {
            if league_matches.len() < self.opts.min_matches {
                let err = PipelineError::DataInsufficient {
                    league: league.to_string(),
                    have: league_matches.len(),
                    need: self.opts.min_matches,
                };
                warn!("{err}; teams fall back to ratio-based rates");
                continue;
            }
            match self.fit_league(league, &league_matches, as_of) {
                Ok((rating, ll, weight)) => {
                    info!(
                        "fitted {league}: {} matches, HA={:.3}, rho={:.4}, ll/w={:.4}",
                        rating.matches,
                        rating.home_advantage.exp(),
                        rating.rho,
                        ll / weight.max(f64::MIN_POSITIVE),
                    );
                    all_converged &= rating.converged;
                    total_ll += ll;
                    total_weight += weight;
                    leagues.insert(league.to_string(), rating);
                }
                Err(err) => {
                    warn!("{err}; league omitted from this set");
                    all_converged = false;
                }
            }
        }

        let mean_ll = if total_weight > 0.0 {
            total_ll / total_weight
        } else {
            f64::NEG_INFINITY
        };
        FittedParameterSet {
            version,
            fitted_at: Utc::now(),
            converged: !leagues.is_empty() && all_converged,
            leagues,
            log_likelihood: total_ll,
            mean_log_likelihood: mean_ll,
        }
    }

    /// Fit one league. Returns the rating plus its achieved weighted
    /// log-likelihood and total decay weight.
    fn fit_league(
        &self,
        league: &str,
        matches: &[&HistoricalMatch],
        as_of: NaiveDate,
    ) -> Result<(LeagueRating, f64, f64), PipelineError> {
        // Deterministic team indexing.
        let mut team_index: BTreeMap<&str, usize> = BTreeMap::new();
        for m in matches {
            let next = team_index.len();
            team_index.entry(m.home.as_str()).or_insert(next);
            let next = team_index.len();
            team_index.entry(m.away.as_str()).or_insert(next);
        }
        let n = team_index.len();

        // Weighted average goals per side anchors the log-domain baseline.
        let mut weight_sum = 0.0;
        let mut goal_sum = 0.0;
        let mut rows = Vec::with_capacity(matches.len());
        let mut counts = vec![0u32; n];
        for m in matches {
            let w = time_weight(m.date, as_of, self.opts.half_life_days);
            let hi = team_index[m.home.as_str()];
            let ai = team_index[m.away.as_str()];
            counts[hi] += 1;
            counts[ai] += 1;
            weight_sum += w;
            goal_sum += w * (m.home_goals + m.away_goals) as f64;
            rows.push((hi, ai, m.home_goals, m.away_goals, w));
        }
        let baseline = (goal_sum / (2.0 * weight_sum)).max(0.2);
        let ln_base = baseline.ln();

        // Parameter layout: [home_attack; n][home_defense; n][away_attack; n]
        // [away_defense; n][home_adv][rho].
        let dim = 4 * n + 2;
        let mut init = vec![0.0; dim];
        init[4 * n] = INIT_HOME_ADV;
        init[4 * n + 1] = INIT_RHO;
        let mut bounds = vec![DEVIATION_BOUNDS; dim];
        bounds[4 * n] = HOME_ADV_BOUNDS;
        bounds[4 * n + 1] = RHO_BOUNDS;

        let mut loss = |p: &[f64]| -> f64 {
            let home_adv = p[4 * n];
            let rho = p[4 * n + 1];
            let mut neg_ll = 0.0;
            for &(hi, ai, hg, ag, w) in &rows {
                let lambda =
                    (ln_base + p[hi] + p[3 * n + ai] + home_adv).exp().clamp(RATE_FLOOR, RATE_CEIL);
                let mu = (ln_base + p[2 * n + ai] + p[n + hi]).exp().clamp(RATE_FLOOR, RATE_CEIL);
                let tau = dc_tau(hg, ag, lambda, mu, rho).max(TAU_FLOOR);
                neg_ll -=
                    w * (poisson_log_pmf(hg, lambda) + poisson_log_pmf(ag, mu) + tau.ln());
            }
            neg_ll
        };

        let outcome = self.minimizer.minimize(&init, &bounds, &mut loss);
        if !outcome.loss.is_finite() {
            return Err(PipelineError::OptimizationDivergence {
                league: league.to_string(),
                reason: format!("non-finite likelihood after {} sweeps", outcome.sweeps),
            });
        }

        let p = &outcome.values;
        let mut teams: BTreeMap<String, TeamRating> = BTreeMap::new();
        for (name, &i) in &team_index {
            // Shrink under-sampled teams toward the league baseline before
            // the zero-mean renormalization.
            let s = shrinkage_factor(counts[i], self.opts.shrinkage_k);
            teams.insert(
                name.to_string(),
                TeamRating {
                    home_attack: s * p[i],
                    home_defense: s * p[n + i],
                    away_attack: s * p[2 * n + i],
                    away_defense: s * p[3 * n + i],
                    matches: counts[i],
                },
            );
        }

        let mut rating = LeagueRating {
            rho: p[4 * n + 1],
            home_advantage: p[4 * n],
            baseline_rate: baseline,
            teams,
            matches: matches.len(),
            converged: outcome.converged,
        };
        renormalize(&mut rating);

        // Record the likelihood actually achieved by the stored parameters
        // (shrinkage moves it off the optimizer's raw optimum).
        let owned: Vec<HistoricalMatch> = matches.iter().map(|m| (*m).clone()).collect();
        let ll = weighted_log_likelihood(&rating, &owned, as_of, self.opts.half_life_days);
        if !ll.is_finite() {
            return Err(PipelineError::OptimizationDivergence {
                league: league.to_string(),
                reason: "non-finite likelihood at final parameters".to_string(),
            });
        }
        Ok((rating, ll, weight_sum))
    }
}

/// Pin each of the four deviation families to zero mean, folding the
/// compensating shifts into the baseline rate and home advantage so every
/// (lambda, mu) pair is unchanged.
fn renormalize(rating: &mut LeagueRating) {
    let n = rating.teams.len();
    if n == 0 {
        return;
    }
    let nf = n as f64;
    let mean_ha = rating.teams.values().map(|t| t.home_attack).sum::<f64>() / nf;
    let mean_hd = rating.teams.values().map(|t| t.home_defense).sum::<f64>() / nf;
    let mean_aa = rating.teams.values().map(|t| t.away_attack).sum::<f64>() / nf;
    let mean_ad = rating.teams.values().map(|t| t.away_defense).sum::<f64>() / nf;

    for t in rating.teams.values_mut() {
        t.home_attack -= mean_ha;
        t.home_defense -= mean_hd;
        t.away_attack -= mean_aa;
        t.away_defense -= mean_ad;
    }
    // mu gains mean_aa + mean_hd through the baseline; lambda additionally
    // needs (mean_ha + mean_ad) - (mean_aa + mean_hd) via the home edge.
    rating.baseline_rate = (rating.baseline_rate.ln() + mean_aa + mean_hd).exp();
    rating.home_advantage += (mean_ha + mean_ad) - (mean_aa + mean_hd);
}
