//! Value-of-information scoring: `voi = expected_gain - (cost_weight *
//! expected_cost + risk_weight * expected_risk)`, plus an adaptive variant
//! that nudges its weights from the gap between predicted and observed
//! outcomes. Ported from `brainmods/voi.py`.

use std::collections::VecDeque;

use aic_protocol::Alternative;

const HISTORY_WINDOW: usize = 10;
const ADAPTATION_THRESHOLD: f64 = 0.05;

/// One recorded outcome used to drive `AdaptiveVoi`'s weight updates.
#[derive(Debug, Clone, Copy)]
pub struct VoiOutcome {
    pub expected_cost: f64,
    pub actual_cost: f64,
    pub expected_risk: f64,
    pub actual_risk: f64,
}

/// `voi = expected_gain - (cost_weight * expected_cost + risk_weight * expected_risk)`.
#[derive(Debug, Clone, Copy)]
pub struct VoiEstimator {
    pub cost_weight: f64,
    pub risk_weight: f64,
}

impl Default for VoiEstimator {
    fn default() -> Self {
        Self { cost_weight: 1.0, risk_weight: 0.5 }
    }
}

impl VoiEstimator {
    pub fn new(cost_weight: f64, risk_weight: f64) -> Self {
        Self { cost_weight, risk_weight }
    }

    pub fn estimate(&self, expected_gain: f64, expected_cost: f64, expected_risk: f64) -> f64 {
        expected_gain - (self.cost_weight * expected_cost + self.risk_weight * expected_risk)
    }

    /// Fills in `voi` on every alternative and sorts the slice descending.
    pub fn rank(&self, alternatives: &mut [Alternative]) {
        for alt in alternatives.iter_mut() {
            alt.voi = Some(self.estimate(alt.expected_gain, alt.expected_cost, alt.expected_risk));
        }
        alternatives.sort_by(|a, b| {
            b.voi.unwrap_or(f64::MIN).partial_cmp(&a.voi.unwrap_or(f64::MIN)).unwrap_or(std::cmp::Ordering::Equal)
        });
    }
}

/// Wraps a `VoiEstimator` with a bounded outcome history. Every 10 recorded
/// outcomes, the average cost/risk estimation error over the last 10 is
/// checked against a +-0.05 threshold: an average error above it nudges the
/// corresponding weight up 10%, below it nudges down 10%, clipped to
/// `cost_weight >= 0.5` and `risk_weight >= 0.2`, both capped at 2.0.
pub struct AdaptiveVoi {
    estimator: VoiEstimator,
    history: VecDeque<VoiOutcome>,
}

impl AdaptiveVoi {
    pub fn new(estimator: VoiEstimator) -> Self {
        Self { estimator, history: VecDeque::with_capacity(HISTORY_WINDOW) }
    }

    pub fn estimator(&self) -> VoiEstimator {
        self.estimator
    }

    pub fn estimate(&self, expected_gain: f64, expected_cost: f64, expected_risk: f64) -> f64 {
        self.estimator.estimate(expected_gain, expected_cost, expected_risk)
    }

    /// Records an outcome and, every `HISTORY_WINDOW` recordings, adapts the
    /// weights from the trailing window's average signed error.
    pub fn update(&mut self, outcome: VoiOutcome) {
        self.history.push_back(outcome);
        if self.history.len() > HISTORY_WINDOW {
            self.history.pop_front();
        }
        if self.history.len() < HISTORY_WINDOW {
            return;
        }

        let avg_cost_error: f64 =
            self.history.iter().map(|o| o.actual_cost - o.expected_cost).sum::<f64>() / HISTORY_WINDOW as f64;
        let avg_risk_error: f64 =
            self.history.iter().map(|o| o.actual_risk - o.expected_risk).sum::<f64>() / HISTORY_WINDOW as f64;

        self.estimator.cost_weight = adapt_weight(self.estimator.cost_weight, avg_cost_error, 0.5);
        self.estimator.risk_weight = adapt_weight(self.estimator.risk_weight, avg_risk_error, 0.2);
    }
}

fn adapt_weight(weight: f64, avg_error: f64, floor: f64) -> f64 {
    let adjusted = if avg_error > ADAPTATION_THRESHOLD {
        weight * 1.1
    } else if avg_error < -ADAPTATION_THRESHOLD {
        weight * 0.9
    } else {
        weight
    };
    adjusted.clamp(floor, 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_matches_formula() {
        let estimator = VoiEstimator::new(1.0, 0.5);
        assert!((estimator.estimate(10.0, 2.0, 4.0) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn rank_sorts_descending_by_voi() {
        let estimator = VoiEstimator::new(1.0, 0.5);
        let mut alts =
            vec![Alternative::new("low", 1.0, 0.5, 0.2), Alternative::new("high", 10.0, 1.0, 1.0)];
        estimator.rank(&mut alts);
        assert_eq!(alts[0].name, "high");
    }

    #[test]
    fn adaptive_weights_increase_when_costs_are_underestimated() {
        let mut adaptive = AdaptiveVoi::new(VoiEstimator::new(1.0, 0.5));
        for _ in 0..HISTORY_WINDOW {
            adaptive.update(VoiOutcome { expected_cost: 1.0, actual_cost: 2.0, expected_risk: 0.5, actual_risk: 0.5 });
        }
        assert!(adaptive.estimator().cost_weight > 1.0);
        assert!((adaptive.estimator().risk_weight - 0.5).abs() < 1e-9);
    }

    #[test]
    fn adaptive_weights_respect_floor_and_cap() {
        let mut adaptive = AdaptiveVoi::new(VoiEstimator::new(0.5, 0.2));
        for _ in 0..(HISTORY_WINDOW * 20) {
            adaptive.update(VoiOutcome { expected_cost: 2.0, actual_cost: 1.0, expected_risk: 1.0, actual_risk: 0.5 });
        }
        assert!((adaptive.estimator().cost_weight - 0.5).abs() < 1e-9);
        assert!((adaptive.estimator().risk_weight - 0.2).abs() < 1e-9);
    }
}
