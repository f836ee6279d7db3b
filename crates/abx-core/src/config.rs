//! Engine configuration
//!
//! All policy knobs of the engine live here: batch cap, tick delay,
//! significance floor and the per-metric success thresholds.

use crate::error::ExperimentError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum samples collected per arm in one iteration
    pub max_batch_size: u32,
    /// Delay between scheduler ticks in milliseconds
    pub tick_delay_ms: u64,
    /// Both arms need at least this many samples before significance can complete a run
    pub min_samples_for_significance: u64,
    /// Lower clamp for the null-hypothesis success probability
    pub null_probability_floor: f64,
    /// Upper clamp for the null-hypothesis success probability
    pub null_probability_ceiling: f64,
    /// Thresholds for the threshold-based metrics
    pub success_thresholds: SuccessThresholds,
    /// Optional engine-side bound on a single harness call
    pub sample_timeout_ms: Option<u64>,
    /// Reload-and-retry attempts for lifecycle calls that hit a stale revision
    pub transition_retry_limit: u32,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML; missing keys take their defaults
    pub fn from_toml_str(source: &str) -> Result<Self, ExperimentError> {
        let config: Self =
            toml::from_str(source).map_err(|e| ExperimentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// With max batch size
    #[inline]
    #[must_use]
    pub fn with_max_batch_size(mut self, size: u32) -> Self {
        self.max_batch_size = size;
        self
    }

    /// With tick delay
    #[inline]
    #[must_use]
    pub fn with_tick_delay(mut self, delay: Duration) -> Self {
        self.tick_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With significance floor
    #[inline]
    #[must_use]
    pub fn with_min_samples(mut self, samples: u64) -> Self {
        self.min_samples_for_significance = samples;
        self
    }

    /// With success thresholds
    #[inline]
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: SuccessThresholds) -> Self {
        self.success_thresholds = thresholds;
        self
    }

    /// With per-sample timeout
    #[inline]
    #[must_use]
    pub fn with_sample_timeout(mut self, timeout: Duration) -> Self {
        self.sample_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Tick delay as a duration
    #[inline]
    #[must_use]
    pub fn tick_delay(&self) -> Duration {
        Duration::from_millis(self.tick_delay_ms)
    }

    /// Per-sample timeout as a duration
    #[inline]
    #[must_use]
    pub fn sample_timeout(&self) -> Option<Duration> {
        self.sample_timeout_ms.map(Duration::from_millis)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), ExperimentError> {
        if self.max_batch_size == 0 {
            return Err(ExperimentError::Config("max_batch_size must be positive".into()));
        }
        let floor = self.null_probability_floor;
        let ceiling = self.null_probability_ceiling;
        if !(floor > 0.0 && floor < ceiling && ceiling < 1.0) {
            return Err(ExperimentError::Config(format!(
                "null probability clamp must satisfy 0 < floor < ceiling < 1 (got {floor}, {ceiling})"
            )));
        }
        self.success_thresholds.validate()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            tick_delay_ms: 1000,
            min_samples_for_significance: 30,
            null_probability_floor: 0.01,
            null_probability_ceiling: 0.99,
            success_thresholds: SuccessThresholds::default(),
            sample_timeout_ms: None,
            transition_retry_limit: 3,
        }
    }
}

/// A sample counts as successful when its measurement is strictly below the threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuccessThresholds {
    /// For `response_time`
    pub response_time_ms: u64,
    /// For `token_usage`
    pub token_count: u64,
    /// For `cost`
    pub cost: f64,
}

impl SuccessThresholds {
    fn validate(&self) -> Result<(), ExperimentError> {
        if self.response_time_ms == 0 || self.token_count == 0 || self.cost <= 0.0 {
            return Err(ExperimentError::Config(
                "success thresholds must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SuccessThresholds {
    fn default() -> Self {
        Self {
            response_time_ms: 1000,
            token_count: 100,
            cost: 0.01,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::new();
        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.tick_delay(), Duration::from_secs(1));
        assert_eq!(config.min_samples_for_significance, 30);
        assert_eq!(config.success_thresholds.response_time_ms, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_overrides_and_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            max_batch_size = 4
            tick_delay_ms = 250

            [success_thresholds]
            token_count = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.max_batch_size, 4);
        assert_eq!(config.tick_delay_ms, 250);
        assert_eq!(config.success_thresholds.token_count, 500);
        assert_eq!(config.success_thresholds.response_time_ms, 1000);
        assert_eq!(config.min_samples_for_significance, 30);
    }

    #[test]
    fn rejects_zero_batch() {
        let config = EngineConfig::new().with_max_batch_size(0);
        assert!(matches!(config.validate(), Err(ExperimentError::Config(_))));
    }

    #[test]
    fn rejects_inverted_clamp() {
        let config = EngineConfig {
            null_probability_floor: 0.9,
            null_probability_ceiling: 0.1,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(EngineConfig::from_toml_str("null_probability_ceiling = 1.0").is_err());
    }

    #[test]
    fn builder_sets_timeout() {
        let config = EngineConfig::new().with_sample_timeout(Duration::from_millis(1500));
        assert_eq!(config.sample_timeout(), Some(Duration::from_millis(1500)));
    }
}
