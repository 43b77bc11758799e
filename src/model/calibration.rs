//! Model calibration metrics.
//!
//! Scores logged predictions against resolved outcomes with proper scoring
//! rules (Brier, log-loss) and fixed-width confidence bins that surface
//! systematic over- or under-confidence.

use std::fmt;

use crate::db::models::PredictionRecord;

/// Predicted probabilities are clipped this far away from 0 and 1 before
/// taking logs, keeping a confidently wrong prediction's loss finite.
const PROB_CLIP: f64 = 1e-10;

/// Fixed-width confidence deciles.
const N_BINS: usize = 10;

#[derive(Debug, Clone)]
pub struct CalibrationBin {
    pub lo: f64,
    pub hi: f64,
    pub count: usize,
    pub mean_predicted: f64,
    pub observed_rate: f64,
}

#[derive(Debug, Clone)]
pub struct CalibrationReport {
    /// Resolved matches scored.
    pub matches: usize,
    /// Market instances scored (three per match: 1X2, totals, BTTS).
    pub samples: usize,
    pub brier: f64,
    pub log_loss: f64,
    pub bins: Vec<CalibrationBin>,
}

fn clip(p: f64) -> f64 {
    p.clamp(PROB_CLIP, 1.0 - PROB_CLIP)
}

/// Score all annotated predictions. Returns None when nothing has resolved
/// yet.
pub fn evaluate(records: &[PredictionRecord]) -> Option<CalibrationReport> {
    let mut matches = 0usize;
    let mut samples = 0usize;
    let mut brier_sum = 0.0;
    let mut log_loss_sum = 0.0;
    let mut bin_count = [0usize; N_BINS];
    let mut bin_pred = [0.0f64; N_BINS];
    let mut bin_hits = [0.0f64; N_BINS];

    for record in records {
        let (Some(hg), Some(ag)) = (record.home_goals, record.away_goals) else {
            continue;
        };
        matches += 1;

        // Per-market probability vectors against one-hot outcomes.
        let one_x_two = [record.home_win, record.draw, record.away_win];
        let outcome_1x2 = match hg.cmp(&ag) {
            std::cmp::Ordering::Greater => 0,
            std::cmp::Ordering::Equal => 1,
            std::cmp::Ordering::Less => 2,
        };
        let totals = [record.over_25, 1.0 - record.over_25];
        let outcome_totals = usize::from(hg + ag <= 2);
        let btts = [record.btts, 1.0 - record.btts];
        let outcome_btts = usize::from(!(hg > 0 && ag > 0));

        for (vector, outcome) in [
            (&one_x_two[..], outcome_1x2),
            (&totals[..], outcome_totals),
            (&btts[..], outcome_btts),
        ] {
            samples += 1;
            let mut instance_brier = 0.0;
            for (i, &p) in vector.iter().enumerate() {
                let y = if i == outcome { 1.0 } else { 0.0 };
                instance_brier += (p - y) * (p - y);
            }
            brier_sum += instance_brier;
            log_loss_sum += -clip(vector[outcome]).ln();
        }

        // Confidence bins over the primary outcome probabilities.
        let pairs = [
            (record.home_win, outcome_1x2 == 0),
            (record.draw, outcome_1x2 == 1),
            (record.away_win, outcome_1x2 == 2),
            (record.over_25, outcome_totals == 0),
            (record.btts, outcome_btts == 0),
        ];
        for (p, hit) in pairs {
            let idx = ((p * N_BINS as f64) as usize).min(N_BINS - 1);
            bin_count[idx] += 1;
            bin_pred[idx] += p;
            bin_hits[idx] += if hit { 1.0 } else { 0.0 };
        }
    }

    if samples == 0 {
        return None;
    }

    let bins = (0..N_BINS)
        .filter(|&i| bin_count[i] > 0)
        .map(|i| CalibrationBin {
            lo: i as f64 / N_BINS as f64,
            hi: (i + 1) as f64 / N_BINS as f64,
            count: bin_count[i],
            mean_predicted: bin_pred[i] / bin_count[i] as f64,
            observed_rate: bin_hits[i] / bin_count[i] as f64,
        })
        .collect();

    Some(CalibrationReport {
        matches,
        samples,
        brier: brier_sum / samples as f64,
        log_loss: log_loss_sum / samples as f64,
        bins,
    })
}

impl fmt::Display for CalibrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Calibration over {} matches ({} market instances)", self.matches, self.samples)?;
        writeln!(f, "  Brier score: {:.4}", self.brier)?;
        writeln!(f, "  Log-loss:    {:.4}", self.log_loss)?;
        writeln!(f, "  {:<12} {:>10} {:>10} {:>8} {:>6}", "bin", "predicted", "observed", "gap", "n")?;
        for b in &self.bins {
            writeln!(
                f,
                "  {:>4.0}%-{:<4.0}% {:>9.1}% {:>9.1}% {:>+7.1}% {:>6}",
                b.lo * 100.0,
                b.hi * 100.0,
                b.mean_predicted * 100.0,
                b.observed_rate * 100.0,
                (b.mean_predicted - b.observed_rate) * 100.0,
                b.count
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::RateSource;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn record(
        probs: (f64, f64, f64),
        over: f64,
        btts: f64,
        score: (u32, u32),
    ) -> PredictionRecord {
        PredictionRecord {
            id: None,
            date: "2026-01-10".parse().unwrap(),
            league: "Premier League".into(),
            home: "Home".into(),
            away: "Away".into(),
            model_version: 1,
            source: RateSource::Fitted,
            home_lambda: 1.5,
            away_lambda: 1.1,
            home_win: probs.0,
            draw: probs.1,
            away_win: probs.2,
            over_25: over,
            btts,
            created_at: Utc::now(),
            home_goals: Some(score.0),
            away_goals: Some(score.1),
        }
    }

    #[test]
    fn unresolved_predictions_are_ignored() {
        let mut r = record((0.5, 0.25, 0.25), 0.5, 0.5, (1, 0));
        r.home_goals = None;
        r.away_goals = None;
        assert!(evaluate(&[r]).is_none());
    }

    #[test]
    fn perfect_confident_predictions_score_zero() {
        let records = vec![
            record((1.0, 0.0, 0.0), 1.0, 1.0, (2, 1)), // home win, over, btts
            record((0.0, 1.0, 0.0), 0.0, 0.0, (0, 0)), // draw, under, no btts
        ];
        let report = evaluate(&records).unwrap();
        assert_relative_eq!(report.brier, 0.0, epsilon = 1e-12);
        // Clipping makes the loss tiny rather than exactly zero.
        assert!(report.log_loss < 1e-9);
    }

    #[test]
    fn confidently_wrong_prediction_has_finite_loss() {
        let report = evaluate(&[record((1.0, 0.0, 0.0), 1.0, 1.0, (0, 2))]).unwrap();
        assert!(report.log_loss.is_finite());
        assert!(report.log_loss > 10.0);
    }

    /// Probabilities that exactly match long-run frequencies: Brier equals
    /// the outcome-distribution variance and log-loss equals its entropy.
    #[test]
    fn calibrated_predictions_converge_to_entropy() {
        // Four matches; stated probabilities (0.5, 0.25, 0.25) / 0.5 / 0.5
        // match realized frequencies exactly.
        let records = vec![
            record((0.5, 0.25, 0.25), 0.5, 0.5, (3, 1)), // home, over, btts
            record((0.5, 0.25, 0.25), 0.5, 0.5, (1, 0)), // home, under, no
            record((0.5, 0.25, 0.25), 0.5, 0.5, (2, 2)), // draw, over, btts
            record((0.5, 0.25, 0.25), 0.5, 0.5, (0, 1)), // away, under, no
        ];
        let report = evaluate(&records).unwrap();
        assert_eq!(report.matches, 4);
        assert_eq!(report.samples, 12);

        let ln2 = std::f64::consts::LN_2;
        let entropy_1x2 = 0.5 * ln2 + 2.0 * 0.25 * (4.0f64).ln(); // H(0.5,0.25,0.25)
        let entropy_binary = ln2;
        let expected_log_loss = (entropy_1x2 + 2.0 * entropy_binary) / 3.0;
        assert_relative_eq!(report.log_loss, expected_log_loss, epsilon = 1e-9);

        // Brier for a calibrated vector is Σ pᵢ(1−pᵢ).
        let brier_1x2 = 0.5 * 0.5 + 2.0 * 0.25 * 0.75;
        let brier_binary = 2.0 * 0.5 * 0.5;
        let expected_brier = (brier_1x2 + 2.0 * brier_binary) / 3.0;
        assert_relative_eq!(report.brier, expected_brier, epsilon = 1e-9);
    }

    #[test]
    fn bins_report_predicted_versus_observed() {
        let records = vec![
            record((0.5, 0.25, 0.25), 0.5, 0.5, (3, 1)),
            record((0.5, 0.25, 0.25), 0.5, 0.5, (1, 0)),
            record((0.5, 0.25, 0.25), 0.5, 0.5, (2, 2)),
            record((0.5, 0.25, 0.25), 0.5, 0.5, (0, 1)),
        ];
        let report = evaluate(&records).unwrap();
        // The 50-60% bin holds home_win/over/btts probabilities: 12 samples,
        // half of which materialized.
        let bin = report
            .bins
            .iter()
            .find(|b| (b.lo - 0.5).abs() < 1e-9)
            .expect("50% bin populated");
        assert_eq!(bin.count, 12);
        assert_relative_eq!(bin.mean_predicted, 0.5, epsilon = 1e-9);
        assert_relative_eq!(bin.observed_rate, 0.5, epsilon = 1e-9);
    }
}
