//! Experiment reports
//!
//! Read model combining an experiment with its progress and, once it is
//! terminal, the outcome of the comparison.

use crate::experiment::Experiment;
use crate::significance::{SignificanceEvaluator, CONTROL_CONFIDENCE};
use crate::types::{Arm, ConfigId};
use serde::{Deserialize, Serialize};

/// Verdict of a finished experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Winning arm; control when there is no clear winner
    pub winner: Arm,
    /// Configuration of the winning arm
    pub winner_config_id: ConfigId,
    /// Relative success-rate gain of the variant over control, in percent
    ///
    /// `None` when the control success rate is zero.
    pub improvement_percentage: Option<f64>,
    /// The difference is statistically significant
    pub significant_difference: bool,
    /// Confidence backing the verdict
    pub confidence_level: f64,
    /// Arm whose confidence level is reported
    pub confidence_arm: Arm,
    /// Suggested next step
    pub recommendation: String,
}

impl Outcome {
    /// Derive the outcome of a terminal experiment
    ///
    /// Returns `None` while the experiment is still active.
    #[must_use]
    pub fn evaluate(experiment: &Experiment, evaluator: &SignificanceEvaluator) -> Option<Self> {
        if !experiment.status.is_terminal() {
            return None;
        }
        let arms = &experiment.arms;
        let threshold = experiment.confidence_threshold;

        let outcome = if evaluator.is_significant(arms, threshold) {
            let control_rate = arms.control.success_rate();
            let improvement = (control_rate > 0.0).then(|| {
                round2((arms.variant.success_rate() - control_rate) / control_rate * 100.0)
            });
            Self {
                winner: Arm::Variant,
                winner_config_id: experiment.variant_config_id.clone(),
                improvement_percentage: improvement,
                significant_difference: true,
                confidence_level: arms.variant.confidence_level.unwrap_or(CONTROL_CONFIDENCE),
                confidence_arm: Arm::Variant,
                recommendation: "Apply variant configuration".to_string(),
            }
        } else if evaluator.is_significantly_worse(arms, threshold) {
            Self {
                winner: Arm::Control,
                winner_config_id: experiment.control_config_id.clone(),
                improvement_percentage: Some(0.0),
                significant_difference: true,
                // the variant's test is what shows control ahead
                confidence_level: arms.variant.confidence_level.unwrap_or(CONTROL_CONFIDENCE),
                confidence_arm: Arm::Variant,
                recommendation: "Keep control configuration".to_string(),
            }
        } else {
            Self {
                winner: Arm::Control,
                winner_config_id: experiment.control_config_id.clone(),
                improvement_percentage: Some(0.0),
                significant_difference: false,
                confidence_level: CONTROL_CONFIDENCE,
                confidence_arm: Arm::Control,
                recommendation: "More testing needed or keep control configuration".to_string(),
            }
        };
        Some(outcome)
    }
}

/// Experiment with progress and outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    /// The experiment as stored
    pub experiment: Experiment,
    /// Percentage of the total target collected (0-100)
    pub progress: f64,
    /// Set once the experiment is terminal
    pub outcome: Option<Outcome>,
}

impl ExperimentReport {
    /// Build report
    #[must_use]
    pub fn new(experiment: Experiment, evaluator: &SignificanceEvaluator) -> Self {
        let progress = experiment.progress();
        let outcome = Outcome::evaluate(&experiment, evaluator);
        Self {
            experiment,
            progress,
            outcome,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
