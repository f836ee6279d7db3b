//! Synthetic collaborators for offline runs
//!
//! A seeded Bernoulli execution harness and a publisher that only logs.

use abx_core::{
    ConfigId, ExecutionHarness, ExecutionRequest, HarnessError, PublishError, SampleOutcome,
    VersionPublisher,
};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;

struct ArmModel {
    rate: f64,
    rng: StdRng,
    calls: u64,
}

/// Harness where every configuration succeeds with a fixed probability
///
/// Each configuration gets its own generator derived from the seed, so an
/// arm's sample stream does not depend on how calls interleave.
pub struct BernoulliHarness {
    seed: u64,
    failure_rate: f64,
    default_rate: f64,
    arms: Mutex<HashMap<ConfigId, ArmModel>>,
}

impl BernoulliHarness {
    /// Create harness; unregistered configurations succeed at `default_rate`
    #[must_use]
    pub fn new(seed: u64, default_rate: f64) -> Self {
        Self {
            seed,
            failure_rate: 0.0,
            default_rate: default_rate.clamp(0.0, 1.0),
            arms: Mutex::new(HashMap::new()),
        }
    }

    /// Fraction of calls that fail outright
    #[must_use]
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Register a configuration with its true success probability
    #[must_use]
    pub fn with_rate(self, config_id: ConfigId, rate: f64) -> Self {
        {
            let mut arms = self.arms.lock();
            let stream = self.seed.wrapping_add(arms.len() as u64 + 1);
            arms.insert(
                config_id,
                ArmModel {
                    rate: rate.clamp(0.0, 1.0),
                    rng: StdRng::seed_from_u64(stream),
                    calls: 0,
                },
            );
        }
        self
    }

    /// Calls made against one configuration
    #[must_use]
    pub fn calls(&self, config_id: &ConfigId) -> u64 {
        self.arms.lock().get(config_id).map_or(0, |arm| arm.calls)
    }

    fn draw(&self, config_id: &ConfigId) -> Result<SampleOutcome, HarnessError> {
        let mut arms = self.arms.lock();
        let stream = self.seed.wrapping_add(arms.len() as u64 + 1);
        let default_rate = self.default_rate;
        let arm = arms.entry(config_id.clone()).or_insert_with(|| ArmModel {
            rate: default_rate,
            rng: StdRng::seed_from_u64(stream),
            calls: 0,
        });
        arm.calls += 1;

        if arm.rng.random_bool(self.failure_rate) {
            return Err(HarnessError::Failed(format!(
                "simulated provider error on {config_id}"
            )));
        }
        let success = arm.rng.random_bool(arm.rate);
        let tokens = arm.rng.random_range(40..400_u64);
        #[allow(clippy::cast_precision_loss)]
        let cost = tokens as f64 * 0.000_02;
        Ok(SampleOutcome::new(success)
            .with_response_time(arm.rng.random_range(150..2_500))
            .with_tokens(tokens)
            .with_cost(cost)
            .with_execution_id(format!("{config_id}-{}", arm.calls)))
    }
}

impl std::fmt::Debug for BernoulliHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BernoulliHarness")
            .field("seed", &self.seed)
            .field("failure_rate", &self.failure_rate)
            .field("arms", &self.arms.lock().len())
            .finish()
    }
}

#[async_trait::async_trait]
impl ExecutionHarness for BernoulliHarness {
    async fn execute(&self, request: &ExecutionRequest) -> Result<SampleOutcome, HarnessError> {
        self.draw(&request.config_id)
    }
}

/// Publisher that logs adoptions and keeps them for the report
#[derive(Debug, Default)]
pub struct LoggingPublisher {
    adopted: Mutex<Vec<ConfigId>>,
}

impl LoggingPublisher {
    /// Create publisher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configurations adopted so far, in order
    #[must_use]
    pub fn adopted(&self) -> Vec<ConfigId> {
        self.adopted.lock().clone()
    }
}

#[async_trait::async_trait]
impl VersionPublisher for LoggingPublisher {
    async fn mark_adopted(&self, config_id: ConfigId) -> Result<(), PublishError> {
        tracing::info!(config = %config_id, "configuration adopted");
        self.adopted.lock().push(config_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(config: &str) -> ExecutionRequest {
        ExecutionRequest {
            config_id: ConfigId::new(config),
            provider_id: "sim".into(),
            model_id: "sim".into(),
            parameters: HashMap::new(),
            validation_criteria: None,
        }
    }

    #[tokio::test]
    async fn test_certain_rates() {
        let harness = BernoulliHarness::new(7, 0.5)
            .with_rate(ConfigId::new("always"), 1.0)
            .with_rate(ConfigId::new("never"), 0.0);

        for _ in 0..50 {
            assert!(harness.execute(&request("always")).await.unwrap().success);
            assert!(!harness.execute(&request("never")).await.unwrap().success);
        }
        assert_eq!(harness.calls(&ConfigId::new("always")), 50);
    }

    #[tokio::test]
    async fn test_same_seed_same_stream() {
        let outcomes = |seed| async move {
            let harness = BernoulliHarness::new(seed, 0.5).with_rate(ConfigId::new("a"), 0.5);
            let mut seen = Vec::new();
            for _ in 0..64 {
                seen.push(harness.execute(&request("a")).await.unwrap().success);
            }
            seen
        };
        assert_eq!(outcomes(11).await, outcomes(11).await);
    }

    #[tokio::test]
    async fn test_failure_rate_one_always_errors() {
        let harness = BernoulliHarness::new(1, 1.0).with_failure_rate(1.0);
        let err = harness.execute(&request("x")).await.unwrap_err();
        assert!(matches!(err, HarnessError::Failed(_)));
    }

    #[tokio::test]
    async fn test_logging_publisher_records() {
        let publisher = LoggingPublisher::new();
        publisher.mark_adopted(ConfigId::new("v2")).await.unwrap();
        assert_eq!(publisher.adopted(), vec![ConfigId::new("v2")]);
    }
}
