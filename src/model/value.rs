//! Value identification and stake sizing.
//!
//! Compares model probabilities to observed bookmaker prices, admits
//! candidates over the EV/edge thresholds and below the price ceiling,
//! deduplicates the 1X2 market, and sizes stakes with fractional Kelly
//! under per-wager and daily bankroll caps.

use crate::db::models::{Fixture, Market, MarketGroup, PriceQuote};

use super::predict::MarketProbs;

/// Wagering thresholds and risk caps. Defaults follow the experiment's
/// quarter-Kelly strategy.
#[derive(Debug, Clone)]
pub struct Strategy {
    /// Minimum expected value per unit staked.
    pub min_ev: f64,
    /// Minimum gap between model and implied probability.
    pub min_edge: f64,
    /// Prices at or above this are excluded outright: model error dominates
    /// at longshot prices regardless of apparent edge.
    pub max_price: f64,
    /// Fractional Kelly multiplier.
    pub kelly_fraction: f64,
    /// Per-wager ceiling as a fraction of bankroll.
    pub max_single_stake_pct: f64,
    /// Aggregate daily ceiling as a fraction of bankroll.
    pub max_daily_stake_pct: f64,
    /// Stakes below this are not worth recording.
    pub min_stake: f64,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy {
            min_ev: 0.05,
            min_edge: 0.03,
            max_price: 6.0,
            kelly_fraction: 0.25,
            max_single_stake_pct: 0.10,
            max_daily_stake_pct: 0.25,
            min_stake: 1.00,
        }
    }
}

/// Round a monetary amount to two decimals. Applied at every mutation point
/// so repeated bankroll arithmetic cannot accumulate drift.
pub fn round_money(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

pub fn implied_probability(price: f64) -> f64 {
    1.0 / price
}

/// Expected value per unit staked: p·(price−1) − (1−p).
pub fn expected_value(prob: f64, price: f64) -> f64 {
    prob * (price - 1.0) - (1.0 - prob)
}

/// Model probability minus the price's implied probability.
pub fn edge(prob: f64, price: f64) -> f64 {
    prob - implied_probability(price)
}

/// Raw Kelly fraction: ((price−1)·p − (1−p)) / (price−1).
pub fn kelly_raw(prob: f64, price: f64) -> f64 {
    let b = price - 1.0;
    if b <= 0.0 {
        return 0.0;
    }
    (b * prob - (1.0 - prob)) / b
}

/// An admitted wager candidate. `stake` is zero until allocation.
#[derive(Debug, Clone)]
pub struct ValueBet {
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
}

pub struct ValueEngine {
    strategy: Strategy,
}

impl ValueEngine {
    pub fn new(strategy: Strategy) -> ValueEngine {
        ValueEngine { strategy }
    }

    /// Evaluate one fixture's quotes against its market probabilities.
    ///
    /// Returns admitted candidates sorted by descending EV, with at most one
    /// 1X2 selection per fixture (the highest-EV one).
    pub fn evaluate_fixture(
        &self,
        fixture: &Fixture,
        markets: &MarketProbs,
        quotes: &[PriceQuote],
    ) -> Vec<ValueBet> {
        let mut admitted: Vec<ValueBet> = Vec::new();
        for quote in quotes {
            if quote.price <= 1.0 || quote.price >= self.strategy.max_price {
                continue;
            }
            let prob = markets.for_market(quote.market);
            let ev = expected_value(prob, quote.price);
            let edge = edge(prob, quote.price);
            if ev < self.strategy.min_ev || edge < self.strategy.min_edge {
                continue;
            }
            admitted.push(ValueBet {
                league: fixture.league.clone(),
                home: fixture.home.clone(),
                away: fixture.away.clone(),
                market: quote.market,
                model_prob: prob,
                price: quote.price,
                implied_prob: implied_probability(quote.price),
                expected_value: ev,
                edge,
                stake: 0.0,
            });
        }

        admitted.sort_by(|a, b| b.expected_value.total_cmp(&a.expected_value));

        // At most one 1X2 selection per fixture; the sort makes the first
        // encountered the highest-EV one.
        let mut seen_1x2 = false;
        admitted.retain(|bet| {
            if bet.market.group() != MarketGroup::OneXTwo {
                return true;
            }
            if seen_1x2 {
                false
            } else {
                seen_1x2 = true;
                true
            }
        });
        admitted
    }

    /// Size stakes across all admitted candidates under the daily ceiling.
    ///
    /// Greedy EV-priority allocation: candidates are taken in descending-EV
    /// order, each accepted only if the running daily total stays within the
    /// ceiling; an over-budget candidate is skipped and allocation continues
    /// with the next one.
    pub fn allocate(&self, mut candidates: Vec<ValueBet>, bankroll: f64) -> Vec<ValueBet> {
        candidates.sort_by(|a, b| b.expected_value.total_cmp(&a.expected_value));

        let per_wager_cap = self.strategy.max_single_stake_pct * bankroll;
        let daily_cap = self.strategy.max_daily_stake_pct * bankroll;
        let mut total = 0.0;
        let mut selected = Vec::new();

        for mut bet in candidates {
            let kelly = kelly_raw(bet.model_prob, bet.price).max(0.0) * self.strategy.kelly_fraction;
            let stake = round_money((kelly * bankroll).min(per_wager_cap));
            if stake < self.strategy.min_stake {
                continue;
            }
            if total + stake > daily_cap + 1e-9 {
                continue;
            }
            total = round_money(total + stake);
            bet.stake = stake;
            selected.push(bet);
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn fixture(home: &str, away: &str) -> Fixture {
        Fixture {
            league: "Premier League".into(),
            home: home.into(),
            away: away.into(),
            date: "2026-02-01".parse().unwrap(),
            kickoff: None,
        }
    }

    fn quote(f: &Fixture, market: Market, price: f64) -> PriceQuote {
        PriceQuote {
            league: f.league.clone(),
            home: f.home.clone(),
            away: f.away.clone(),
            market,
            price,
            fetched_at: Utc::now(),
        }
    }

    fn probs(home_win: f64, draw: f64, away_win: f64) -> MarketProbs {
        MarketProbs {
            home_win,
            draw,
            away_win,
            over_25: 0.5,
            under_25: 0.5,
            btts_yes: 0.5,
            btts_no: 0.5,
        }
    }

    #[test]
    fn ev_and_edge_are_deterministic() {
        // p=0.30 at 4.0: EV = 0.30×3.0 − 0.70 = −0.10
        assert_relative_eq!(expected_value(0.30, 4.0), -0.10, epsilon = 1e-12);
        assert_relative_eq!(edge(0.30, 4.0), 0.30 - 0.25, epsilon = 1e-12);
    }

    #[test]
    fn negative_ev_candidate_is_not_admitted() {
        let engine = ValueEngine::new(Strategy::default());
        let f = fixture("Arsenal", "Chelsea");
        let bets = engine.evaluate_fixture(
            &f,
            &probs(0.30, 0.35, 0.35),
            &[quote(&f, Market::HomeWin, 4.0)],
        );
        assert!(bets.is_empty());
    }

    #[test]
    fn price_ceiling_excludes_regardless_of_ev() {
        let engine = ValueEngine::new(Strategy::default());
        let f = fixture("Arsenal", "Chelsea");
        // p=0.30 at 6.0 would have EV +0.80, but the ceiling wins.
        let bets = engine.evaluate_fixture(
            &f,
            &probs(0.30, 0.35, 0.35),
            &[quote(&f, Market::HomeWin, 6.0)],
        );
        assert!(bets.is_empty());
    }

    #[test]
    fn kelly_worked_example() {
        // bankroll=100, p=0.40, price=3.0, quarter Kelly:
        // kelly_raw = (2×0.40 − 0.60)/2 = 0.10 → stake = 0.10×0.25×100 = 2.50
        assert_relative_eq!(kelly_raw(0.40, 3.0), 0.10, epsilon = 1e-12);

        let engine = ValueEngine::new(Strategy::default());
        let f = fixture("Arsenal", "Chelsea");
        let candidates = engine.evaluate_fixture(
            &f,
            &probs(0.40, 0.30, 0.30),
            &[quote(&f, Market::HomeWin, 3.0)],
        );
        let placed = engine.allocate(candidates, 100.0);
        assert_eq!(placed.len(), 1);
        assert_relative_eq!(placed[0].stake, 2.50, epsilon = 1e-9);
    }

    #[test]
    fn one_x_two_deduplication_keeps_highest_ev() {
        let engine = ValueEngine::new(Strategy::default());
        let f = fixture("Arsenal", "Chelsea");
        // EVs: home +12%, draw +6%, away far negative.
        let m = probs(0.32, 0.64, 0.04);
        let bets = engine.evaluate_fixture(
            &f,
            &m,
            &[
                quote(&f, Market::HomeWin, 3.5),  // EV = 0.12
                quote(&f, Market::Draw, 1.66),    // EV ≈ 0.06
                quote(&f, Market::AwayWin, 2.0),  // EV < 0
            ],
        );
        assert_eq!(bets.len(), 1);
        assert_eq!(bets[0].market, Market::HomeWin);
        assert_relative_eq!(bets[0].expected_value, 0.12, epsilon = 1e-9);
    }

    #[test]
    fn dedup_does_not_touch_other_markets() {
        let engine = ValueEngine::new(Strategy::default());
        let f = fixture("Arsenal", "Chelsea");
        let m = MarketProbs {
            home_win: 0.32,
            draw: 0.34,
            away_win: 0.34,
            over_25: 0.65,
            under_25: 0.35,
            btts_yes: 0.62,
            btts_no: 0.38,
        };
        let bets = engine.evaluate_fixture(
            &f,
            &m,
            &[
                quote(&f, Market::HomeWin, 3.5),  // EV 0.12
                quote(&f, Market::Over25, 1.75),  // EV ≈ 0.1375
                quote(&f, Market::BttsYes, 1.80), // EV ≈ 0.116
            ],
        );
        // One 1X2 plus both auxiliary markets.
        assert_eq!(bets.len(), 3);
    }

    #[test]
    fn daily_cap_is_greedy_skip_and_continue() {
        let engine = ValueEngine::new(Strategy::default());
        // Four fixtures; the first three each size to the 10% per-wager cap,
        // the fourth to 5%. Cap is 25%: take 10+10, skip the third (would be
        // 30), then fill with the 5.
        let mut candidates = Vec::new();
        for (i, p) in [0.72, 0.71, 0.70, 0.60].iter().enumerate() {
            let f = fixture(&format!("Home{i}"), &format!("Away{i}"));
            candidates.extend(engine.evaluate_fixture(
                &f,
                &probs(*p, (1.0 - p) / 2.0, (1.0 - p) / 2.0),
                &[quote(&f, Market::HomeWin, 2.0)],
            ));
        }
        let placed = engine.allocate(candidates, 100.0);
        let stakes: Vec<f64> = placed.iter().map(|b| b.stake).collect();
        assert_eq!(stakes, vec![10.0, 10.0, 5.0]);
        assert!(placed.iter().all(|b| b.home != "Home2"));
    }

    #[test]
    fn stakes_are_rounded_to_cents() {
        let engine = ValueEngine::new(Strategy::default());
        let f = fixture("Arsenal", "Chelsea");
        let candidates = engine.evaluate_fixture(
            &f,
            &probs(0.413, 0.30, 0.287),
            &[quote(&f, Market::HomeWin, 3.0)],
        );
        let placed = engine.allocate(candidates, 123.45);
        assert_eq!(placed.len(), 1);
        let stake = placed[0].stake;
        assert_relative_eq!(stake, round_money(stake), epsilon = 1e-12);
    }

    #[test]
    fn dust_stakes_are_dropped() {
        let engine = ValueEngine::new(Strategy::default());
        let f = fixture("Arsenal", "Chelsea");
        let candidates = engine.evaluate_fixture(
            &f,
            &probs(0.40, 0.30, 0.30),
            &[quote(&f, Market::HomeWin, 3.0)],
        );
        // Tiny bankroll: quarter-Kelly stake would be €0.25.
        let placed = engine.allocate(candidates, 10.0);
        assert!(placed.is_empty());
    }

    #[test]
    fn round_money_is_idempotent_at_two_decimals() {
        assert_relative_eq!(round_money(10.006), 10.01, epsilon = 1e-12);
        assert_relative_eq!(round_money(10.004), 10.0, epsilon = 1e-12);
        assert_relative_eq!(round_money(round_money(87.654321)), round_money(87.654321));
    }
}
