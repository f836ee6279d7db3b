//! Batch Runner
//!
//! Drives one round of sample collection for a single arm:
//! - Calls the execution harness `n` times, sequentially
//! - Classifies each outcome by the experiment's evaluation metric
//! - Drops samples the harness failed on (logged, never retried)
//! - Folds the surviving samples into the arm aggregate

use crate::aggregate::{ArmResult, BatchTotals};
use crate::config::{EngineConfig, SuccessThresholds};
use crate::error::HarnessError;
use crate::experiment::Experiment;
use crate::ports::{ExecutionHarness, ExecutionRequest, SampleOutcome};
use crate::types::{Arm, EvaluationMetric};
use std::sync::Arc;
use std::time::Duration;

/// Decide whether a sample counts as a success
#[must_use]
pub fn classify(
    metric: &EvaluationMetric,
    thresholds: &SuccessThresholds,
    outcome: &SampleOutcome,
) -> bool {
    match metric {
        EvaluationMetric::SuccessRate => outcome.success,
        EvaluationMetric::ResponseTime => outcome.response_time_ms < thresholds.response_time_ms,
        EvaluationMetric::TokenUsage => outcome.token_count < thresholds.token_count,
        EvaluationMetric::Cost => outcome.cost < thresholds.cost,
        EvaluationMetric::Custom(_) => outcome.validation_passed == Some(true),
    }
}

/// Collects batches of samples through the execution harness
#[derive(Clone)]
pub struct BatchRunner {
    harness: Arc<dyn ExecutionHarness>,
    thresholds: SuccessThresholds,
    sample_timeout: Option<Duration>,
}

impl BatchRunner {
    /// Create batch runner with default thresholds and no engine-side timeout
    #[must_use]
    pub fn new(harness: Arc<dyn ExecutionHarness>) -> Self {
        Self {
            harness,
            thresholds: SuccessThresholds::default(),
            sample_timeout: None,
        }
    }

    /// Create batch runner from engine configuration
    #[must_use]
    pub fn from_config(harness: Arc<dyn ExecutionHarness>, config: &EngineConfig) -> Self {
        Self {
            harness,
            thresholds: config.success_thresholds,
            sample_timeout: config.sample_timeout(),
        }
    }

    /// With success thresholds
    #[inline]
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: SuccessThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// With engine-side bound per harness call
    #[inline]
    #[must_use]
    pub fn with_sample_timeout(mut self, timeout: Duration) -> Self {
        self.sample_timeout = Some(timeout);
        self
    }

    /// Request sent for every sample of one arm
    #[must_use]
    pub fn request_for(experiment: &Experiment, arm: Arm) -> ExecutionRequest {
        ExecutionRequest {
            config_id: experiment.config_id(arm).clone(),
            provider_id: experiment.provider_id.clone(),
            model_id: experiment.model_id.clone(),
            parameters: experiment.test_parameters.clone(),
            validation_criteria: experiment.success_criteria.clone(),
        }
    }

    /// Run `n` harness calls and total the classified outcomes
    pub async fn collect(&self, experiment: &Experiment, arm: Arm, n: u32) -> BatchTotals {
        let request = Self::request_for(experiment, arm);
        let mut totals = BatchTotals::default();

        for attempt in 1..=n {
            match self.execute_one(&request).await {
                Ok(outcome) => {
                    let success =
                        classify(&experiment.evaluation_metric, &self.thresholds, &outcome);
                    totals.record(&outcome, success);
                }
                Err(e) => {
                    tracing::warn!(
                        experiment = %experiment.id,
                        %arm,
                        config = %request.config_id,
                        attempt,
                        error = %e,
                        "sample dropped"
                    );
                    totals.record_failure();
                }
            }
        }

        tracing::debug!(
            experiment = %experiment.id,
            %arm,
            attempted = totals.attempted,
            samples = totals.samples,
            successes = totals.successes,
            "batch collected"
        );
        totals
    }

    /// Run a batch for one arm and return the folded aggregate
    ///
    /// The experiment itself is not modified.
    pub async fn run_batch(&self, experiment: &Experiment, arm: Arm, n: u32) -> ArmResult {
        let totals = self.collect(experiment, arm, n).await;
        experiment.arms.get(arm).fold(&totals)
    }

    async fn execute_one(&self, request: &ExecutionRequest) -> Result<SampleOutcome, HarnessError> {
        match self.sample_timeout {
            Some(bound) => tokio::time::timeout(bound, self.harness.execute(request))
                .await
                .unwrap_or_else(|_| {
                    Err(HarnessError::Timeout {
                        duration_ms: u64::try_from(bound.as_millis()).unwrap_or(u64::MAX),
                    })
                }),
            None => self.harness.execute(request).await,
        }
    }
}

impl std::fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("thresholds", &self.thresholds)
            .field("sample_timeout", &self.sample_timeout)
            .finish_non_exhaustive()
    }
}
