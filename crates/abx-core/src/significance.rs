//! Significance evaluation
//!
//! The control arm's observed success rate is the null-hypothesis success
//! probability; the variant's successes are tested against it with an exact
//! two-sided binomial test.

use crate::config::EngineConfig;
use crate::experiment::Arms;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Binomial, Discrete};

/// p-value assigned to the control arm, which is never tested against itself
pub const CONTROL_P_VALUE: f64 = 0.5;

/// Confidence level assigned to the control arm
pub const CONTROL_CONFIDENCE: f64 = 50.0;

/// Relative tolerance when comparing point probabilities
const RELATIVE_TOLERANCE: f64 = 1.0 + 1e-7;

/// Exact two-sided binomial test
///
/// Sums the probability of every outcome no more likely than the observed
/// one. Returns `None` when `successes > trials` or `p` is outside (0, 1).
#[must_use]
pub fn binomial_test_two_sided(trials: u64, successes: u64, p: f64) -> Option<f64> {
    if successes > trials || !(p > 0.0 && p < 1.0) {
        return None;
    }
    let distribution = Binomial::new(p, trials).ok()?;
    let observed = distribution.pmf(successes);
    let cutoff = observed * RELATIVE_TOLERANCE;

    let total: f64 = (0..=trials)
        .map(|k| distribution.pmf(k))
        .filter(|&pk| pk <= cutoff)
        .sum();
    Some(total.min(1.0))
}

/// Result of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Significance {
    /// Variant p-value
    pub p_value: f64,
    /// `(1 - p) * 100`
    pub confidence_level: f64,
}

/// Computes p-values and the significance verdict
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignificanceEvaluator {
    floor: f64,
    ceiling: f64,
    min_samples: u64,
}

impl SignificanceEvaluator {
    /// Create evaluator
    #[inline]
    #[must_use]
    pub fn new(floor: f64, ceiling: f64, min_samples: u64) -> Self {
        Self {
            floor,
            ceiling,
            min_samples,
        }
    }

    /// Create evaluator from engine configuration
    #[inline]
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.null_probability_floor,
            config.null_probability_ceiling,
            config.min_samples_for_significance,
        )
    }

    /// Minimum samples per arm before significance counts
    #[inline]
    #[must_use]
    pub fn min_samples(&self) -> u64 {
        self.min_samples
    }

    /// Null-hypothesis probability derived from the control arm
    #[inline]
    #[must_use]
    pub fn null_probability(&self, arms: &Arms) -> f64 {
        (arms.control.success_rate() / 100.0).clamp(self.floor, self.ceiling)
    }

    /// Set p-values and confidence levels on both arms
    ///
    /// No-op while either arm has no samples.
    pub fn evaluate(&self, arms: &mut Arms) -> Option<Significance> {
        if arms.control.sample_count() == 0 || arms.variant.sample_count() == 0 {
            return None;
        }

        let p0 = self.null_probability(arms);
        let Some(p_value) = binomial_test_two_sided(
            arms.variant.sample_count(),
            arms.variant.success_count(),
            p0,
        ) else {
            tracing::error!(
                trials = arms.variant.sample_count(),
                successes = arms.variant.success_count(),
                p0,
                "binomial test rejected its inputs"
            );
            return None;
        };

        let significance = Significance {
            p_value,
            confidence_level: (1.0 - p_value) * 100.0,
        };
        arms.variant.p_value = Some(significance.p_value);
        arms.variant.confidence_level = Some(significance.confidence_level);
        arms.control.p_value = Some(CONTROL_P_VALUE);
        arms.control.confidence_level = Some(CONTROL_CONFIDENCE);
        Some(significance)
    }

    /// Both arms have reached the sample floor
    #[inline]
    #[must_use]
    pub fn floor_reached(&self, arms: &Arms) -> bool {
        arms.control.sample_count() >= self.min_samples
            && arms.variant.sample_count() >= self.min_samples
    }

    /// Variant is significantly better than control
    ///
    /// Never true below the per-arm sample floor, whatever the p-value.
    #[must_use]
    pub fn is_significant(&self, arms: &Arms, confidence_threshold: f64) -> bool {
        if !self.floor_reached(arms) {
            return false;
        }
        let Some(p_value) = arms.variant.p_value else {
            return false;
        };
        p_value < alpha(confidence_threshold)
            && arms.variant.success_rate() > arms.control.success_rate()
    }

    /// Variant is significantly worse than control
    #[must_use]
    pub fn is_significantly_worse(&self, arms: &Arms, confidence_threshold: f64) -> bool {
        if !self.floor_reached(arms) {
            return false;
        }
        arms.variant.p_value.is_some_and(|p| {
            p < alpha(confidence_threshold)
                && arms.variant.success_rate() < arms.control.success_rate()
        })
    }
}

impl Default for SignificanceEvaluator {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[inline]
fn alpha(confidence_threshold: f64) -> f64 {
    1.0 - confidence_threshold / 100.0
}
