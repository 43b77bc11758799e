//! Derivative-free continuous minimization.
//!
//! The fitter talks to a [`Minimizer`] trait rather than a concrete search
//! strategy, so the optimization routine can be swapped without touching the
//! model code. The default implementation is a cyclic coordinate descent
//! with per-coordinate adaptive steps.

use std::ops::RangeInclusive;

/// Result of a minimization run.
#[derive(Debug, Clone)]
pub struct MinimizeOutcome {
    pub values: Vec<f64>,
    pub loss: f64,
    pub sweeps: u64,
    /// True when the loss improvement fell below tolerance before the sweep
    /// cap was reached; false on cap exhaustion or a non-finite objective.
    pub converged: bool,
}

/// Continuous minimization over a box-bounded parameter vector.
pub trait Minimizer {
    fn minimize(
        &self,
        init: &[f64],
        bounds: &[RangeInclusive<f64>],
        loss_f: &mut dyn FnMut(&[f64]) -> f64,
    ) -> MinimizeOutcome;
}

/// Cyclic coordinate descent with adaptive per-coordinate steps.
///
/// Each sweep probes every coordinate in both directions; an improving move
/// is accepted and grows that coordinate's step, a failed probe halves it.
/// Terminates when a full sweep improves the loss by less than `tolerance`,
/// or after `max_sweeps`.
#[derive(Debug, Clone)]
pub struct CoordinateDescent {
    pub init_step: f64,
    pub min_step: f64,
    pub tolerance: f64,
    pub max_sweeps: u64,
}

impl Default for CoordinateDescent {
    fn default() -> Self {
        CoordinateDescent {
            init_step: 0.1,
            min_step: 1e-6,
            tolerance: 1e-6,
            max_sweeps: 200,
        }
    }
}

const STEP_GROWTH: f64 = 1.5;
const STEP_SHRINK: f64 = 0.5;

impl Minimizer for CoordinateDescent {
    fn minimize(
        &self,
        init: &[f64],
        bounds: &[RangeInclusive<f64>],
        loss_f: &mut dyn FnMut(&[f64]) -> f64,
    ) -> MinimizeOutcome {
        debug_assert_eq!(init.len(), bounds.len(), "bounds/init dimension mismatch");

        let mut values: Vec<f64> = init
            .iter()
            .zip(bounds)
            .map(|(v, b)| v.clamp(*b.start(), *b.end()))
            .collect();
        let mut loss = loss_f(&values);
        if !loss.is_finite() {
            return MinimizeOutcome {
                values,
                loss,
                sweeps: 0,
                converged: false,
            };
        }

        let mut steps = vec![self.init_step; values.len()];
        let mut scratch = values.clone();
        let mut sweeps = 0;
        let mut converged = false;

        while sweeps < self.max_sweeps {
            sweeps += 1;
            let loss_before_sweep = loss;

            for i in 0..values.len() {
                if steps[i] < self.min_step {
                    continue;
                }
                let mut accepted = false;
                for dir in [1.0, -1.0] {
                    let candidate =
                        (values[i] + dir * steps[i]).clamp(*bounds[i].start(), *bounds[i].end());
                    if candidate == values[i] {
                        continue;
                    }
                    scratch[i] = candidate;
                    let candidate_loss = loss_f(&scratch);
                    if candidate_loss.is_finite() && candidate_loss < loss {
                        values[i] = candidate;
                        loss = candidate_loss;
                        accepted = true;
                        break;
                    }
                    scratch[i] = values[i];
                }
                if accepted {
                    steps[i] *= STEP_GROWTH;
                } else {
                    steps[i] *= STEP_SHRINK;
                }
            }

            if loss_before_sweep - loss < self.tolerance {
                converged = true;
                break;
            }
        }

        MinimizeOutcome {
            values,
            loss,
            sweeps,
            converged,
        }
    }
}
