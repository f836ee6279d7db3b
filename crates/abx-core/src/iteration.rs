//! Iteration Controller
//!
//! One tick of one experiment: size the batch, collect samples for every arm
//! that still needs them, re-evaluate significance and apply the completion
//! policy. Persistence is left to the caller so that the whole tick is saved
//! as one unit.

use crate::batch::BatchRunner;
use crate::config::EngineConfig;
use crate::error::ExperimentError;
use crate::experiment::Experiment;
use crate::lifecycle::{apply_transition, Transition};
use crate::significance::SignificanceEvaluator;
use crate::types::{Arm, ExperimentStatus};
use chrono::Utc;

/// What a tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Experiment was not RUNNING; nothing changed
    Skipped,
    /// Both arms had reached their target; experiment completed
    TargetReached,
    /// A batch was collected
    Advanced {
        /// Variant became significant and the experiment completed
        significance_reached: bool,
    },
}

/// Experiment after a tick, with what happened
#[derive(Debug, Clone)]
pub struct IterationResult {
    /// Updated, unsaved experiment
    pub experiment: Experiment,
    /// Tick outcome
    pub outcome: IterationOutcome,
}

impl IterationResult {
    /// Check if the tick changed anything worth saving
    #[inline]
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        self.outcome != IterationOutcome::Skipped
    }
}

/// Runs single iterations
#[derive(Debug, Clone)]
pub struct IterationController {
    runner: BatchRunner,
    evaluator: SignificanceEvaluator,
    max_batch_size: u32,
}

impl IterationController {
    /// Create controller
    #[must_use]
    pub fn new(runner: BatchRunner, evaluator: SignificanceEvaluator, max_batch_size: u32) -> Self {
        Self {
            runner,
            evaluator,
            max_batch_size,
        }
    }

    /// Create controller from engine configuration
    #[must_use]
    pub fn from_config(runner: BatchRunner, config: &EngineConfig) -> Self {
        Self::new(
            runner,
            SignificanceEvaluator::from_config(config),
            config.max_batch_size,
        )
    }

    /// Significance evaluator used by this controller
    #[inline]
    #[must_use]
    pub fn evaluator(&self) -> &SignificanceEvaluator {
        &self.evaluator
    }

    /// Samples to collect this tick for each arm that still needs any
    ///
    /// The smallest outstanding need among those arms, capped at the max
    /// batch size. Arms already at target do not hold the others back.
    #[must_use]
    pub fn batch_size(&self, experiment: &Experiment) -> u32 {
        Arm::BOTH
            .iter()
            .map(|&arm| experiment.remaining(arm))
            .filter(|&remaining| remaining > 0)
            .min()
            .map_or(0, |need| {
                u32::try_from(need)
                    .unwrap_or(u32::MAX)
                    .min(self.max_batch_size)
            })
    }

    /// Run one iteration
    ///
    /// # Errors
    /// `InvariantViolation` when the stored arms are corrupt. Harness
    /// failures never surface here.
    pub async fn run_iteration(
        &self,
        mut experiment: Experiment,
    ) -> Result<IterationResult, ExperimentError> {
        if experiment.status != ExperimentStatus::Running {
            tracing::debug!(
                experiment = %experiment.id,
                status = %experiment.status,
                "iteration skipped"
            );
            return Ok(IterationResult {
                experiment,
                outcome: IterationOutcome::Skipped,
            });
        }
        experiment.check_arms()?;

        let batch = self.batch_size(&experiment);
        if batch == 0 {
            apply_transition(&mut experiment, Transition::Complete, Utc::now())?;
            tracing::info!(
                experiment = %experiment.id,
                samples = experiment.arms.total_samples(),
                "target sample size reached, experiment completed"
            );
            return Ok(IterationResult {
                experiment,
                outcome: IterationOutcome::TargetReached,
            });
        }

        for arm in Arm::BOTH {
            if experiment.remaining(arm) > 0 {
                let updated = self.runner.run_batch(&experiment, arm, batch).await;
                *experiment.arms.get_mut(arm) = updated;
            }
        }

        let significance = self.evaluator.evaluate(&mut experiment.arms);
        let significant = self
            .evaluator
            .is_significant(&experiment.arms, experiment.confidence_threshold);

        tracing::debug!(
            experiment = %experiment.id,
            batch,
            control_samples = experiment.arms.control.sample_count(),
            variant_samples = experiment.arms.variant.sample_count(),
            p_value = significance.map(|s| s.p_value),
            "iteration advanced"
        );

        if significant {
            apply_transition(&mut experiment, Transition::Complete, Utc::now())?;
            tracing::info!(
                experiment = %experiment.id,
                p_value = experiment.arms.variant.p_value,
                "variant significantly better, experiment completed"
            );
        } else {
            experiment.updated_at = Utc::now();
        }

        Ok(IterationResult {
            experiment,
            outcome: IterationOutcome::Advanced {
                significance_reached: significant,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;
    use crate::experiment::ExperimentDefinition;
    use crate::ports::{ExecutionHarness, ExecutionRequest, SampleOutcome};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Control always succeeds, variant never does
    struct Split;

    #[async_trait::async_trait]
    impl ExecutionHarness for Split {
        async fn execute(&self, request: &ExecutionRequest) -> Result<SampleOutcome, HarnessError> {
            Ok(SampleOutcome::new(request.config_id.as_str() == "ctl"))
        }
    }

    /// Every call fails for the variant
    struct VariantDown(AtomicU32);

    #[async_trait::async_trait]
    impl ExecutionHarness for VariantDown {
        async fn execute(&self, request: &ExecutionRequest) -> Result<SampleOutcome, HarnessError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if request.config_id.as_str() == "var" {
                Err(HarnessError::Unavailable("variant backend".into()))
            } else {
                Ok(SampleOutcome::new(true))
            }
        }
    }

    fn controller(harness: Arc<dyn ExecutionHarness>) -> IterationController {
        IterationController::from_config(BatchRunner::new(harness), &EngineConfig::default())
    }

    fn running(target: u32) -> Experiment {
        let def = ExperimentDefinition::new("it", "ctl", "var")
            .with_backend("p", "m")
            .with_target_sample_size(target);
        let mut exp = Experiment::from_definition(def, Utc::now()).unwrap();
        apply_transition(&mut exp, Transition::Start, Utc::now()).unwrap();
        exp
    }

    #[tokio::test]
    async fn first_iteration_fills_small_target() {
        let result = controller(Arc::new(Split)).run_iteration(running(5)).await.unwrap();
        let arms = &result.experiment.arms;
        assert_eq!(arms.control.sample_count(), 5);
        assert_eq!(arms.variant.sample_count(), 5);
        assert!((arms.control.success_rate() - 100.0).abs() < f64::EPSILON);
        assert!(arms.variant.success_rate().abs() < f64::EPSILON);
        assert_eq!(result.experiment.status, ExperimentStatus::Running);
    }

    #[tokio::test]
    async fn next_iteration_after_target_completes() {
        let controller = controller(Arc::new(Split));
        let first = controller.run_iteration(running(5)).await.unwrap();
        let second = controller.run_iteration(first.experiment).await.unwrap();
        assert_eq!(second.outcome, IterationOutcome::TargetReached);
        assert_eq!(second.experiment.status, ExperimentStatus::Completed);
        assert!(second.experiment.completed_at.is_some());
        assert_eq!(second.experiment.arms.total_samples(), 10);
    }

    #[tokio::test]
    async fn batch_is_capped() {
        let result = controller(Arc::new(Split)).run_iteration(running(100)).await.unwrap();
        assert_eq!(result.experiment.arms.control.sample_count(), 10);
    }

    #[tokio::test]
    async fn paused_experiment_is_untouched() {
        let mut exp = running(5);
        apply_transition(&mut exp, Transition::Pause, Utc::now()).unwrap();
        let before = exp.clone();
        let result = controller(Arc::new(Split)).run_iteration(exp).await.unwrap();
        assert_eq!(result.outcome, IterationOutcome::Skipped);
        assert!(!result.is_mutation());
        assert_eq!(result.experiment, before);
    }

    #[tokio::test]
    async fn corrupt_arms_are_fatal() {
        let mut exp = running(5);
        exp.arms.control.is_control = false;
        let err = controller(Arc::new(Split)).run_iteration(exp).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn arm_at_target_does_not_stall_the_other() {
        let harness = Arc::new(VariantDown(AtomicU32::new(0)));
        let controller = controller(harness.clone());
        let mut exp = controller.run_iteration(running(8)).await.unwrap().experiment;
        assert_eq!(exp.arms.control.sample_count(), 8);
        assert_eq!(exp.arms.variant.sample_count(), 0);

        exp = controller.run_iteration(exp).await.unwrap().experiment;
        assert_eq!(exp.arms.control.sample_count(), 8);
        // second tick only calls the variant
        assert_eq!(harness.0.load(Ordering::SeqCst), 8 + 8 + 8);
    }

    #[tokio::test]
    async fn significance_completes_early() {
        struct Lopsided;

        #[async_trait::async_trait]
        impl ExecutionHarness for Lopsided {
            async fn execute(&self, request: &ExecutionRequest) -> Result<SampleOutcome, HarnessError> {
                Ok(SampleOutcome::new(request.config_id.as_str() == "var"))
            }
        }

        let controller = controller(Arc::new(Lopsided));
        let mut exp = running(1000);
        let mut ticks = 0;
        while exp.status == ExperimentStatus::Running {
            exp = controller.run_iteration(exp).await.unwrap().experiment;
            ticks += 1;
        }
        // floor of 30 per arm at 10 per tick
        assert_eq!(ticks, 3);
        assert_eq!(exp.status, ExperimentStatus::Completed);
        assert!(controller.evaluator().is_significant(&exp.arms, exp.confidence_threshold));
    }
}
