//! Core types for ABX
//!
//! Defines identifiers, the lifecycle status, evaluation metrics and arm
//! selectors shared by every component.

use crate::error::ExperimentError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Unique experiment identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExperimentId(pub Ulid);

impl ExperimentId {
    /// Generate new experiment ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ExperimentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExperimentId {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| ExperimentError::validation(format!("invalid experiment id '{s}': {e}")))
    }
}

/// Identifier of a prompt configuration (one arm of an experiment)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigId(String);

impl ConfigId {
    /// Create new configuration ID
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConfigId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConfigId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Experiment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    /// Defined, never started
    Created,
    /// Collecting samples
    Running,
    /// Temporarily halted
    Paused,
    /// Finished (target or significance reached, or completed by hand)
    Completed,
    /// Abandoned
    Cancelled,
}

impl ExperimentStatus {
    /// No further mutation allowed
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Iterations may run
    #[inline]
    #[must_use]
    pub fn is_active(self) -> bool {
        self == Self::Running
    }

    /// Upper-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prefix that marks a custom, harness-judged metric
pub const CUSTOM_METRIC_PREFIX: &str = "custom_";

/// Dimension used to classify a sample as successful
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EvaluationMetric {
    /// Harness reported success
    SuccessRate,
    /// Response time under threshold
    ResponseTime,
    /// Token count under threshold
    TokenUsage,
    /// Cost under threshold
    Cost,
    /// Harness validation verdict; holds the full `custom_*` identifier
    Custom(String),
}

impl EvaluationMetric {
    /// Wire identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::SuccessRate => "success_rate",
            Self::ResponseTime => "response_time",
            Self::TokenUsage => "token_usage",
            Self::Cost => "cost",
            Self::Custom(name) => name,
        }
    }
}

impl FromStr for EvaluationMetric {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success_rate" => Ok(Self::SuccessRate),
            "response_time" => Ok(Self::ResponseTime),
            "token_usage" => Ok(Self::TokenUsage),
            "cost" => Ok(Self::Cost),
            custom if custom.starts_with(CUSTOM_METRIC_PREFIX) => {
                Ok(Self::Custom(custom.to_string()))
            }
            other => Err(ExperimentError::validation(format!(
                "unsupported evaluation metric: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for EvaluationMetric {
    type Error = ExperimentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EvaluationMetric> for String {
    fn from(value: EvaluationMetric) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EvaluationMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selects one of the two arms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arm {
    /// Baseline configuration
    Control,
    /// Candidate configuration
    Variant,
}

impl Arm {
    /// Both arms, control first
    pub const BOTH: [Arm; 2] = [Arm::Control, Arm::Variant];
}

impl fmt::Display for Arm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arm::Control => f.write_str("control"),
            Arm::Variant => f.write_str("variant"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminal_and_active() {
        assert!(ExperimentStatus::Completed.is_terminal());
        assert!(ExperimentStatus::Cancelled.is_terminal());
        assert!(!ExperimentStatus::Paused.is_terminal());
        assert!(ExperimentStatus::Running.is_active());
        assert!(!ExperimentStatus::Created.is_active());
    }

    #[test]
    fn metric_parses_builtins_and_custom() {
        assert_eq!(
            "success_rate".parse::<EvaluationMetric>().unwrap(),
            EvaluationMetric::SuccessRate
        );
        assert_eq!("cost".parse::<EvaluationMetric>().unwrap(), EvaluationMetric::Cost);
        assert_eq!(
            "custom_tone".parse::<EvaluationMetric>().unwrap(),
            EvaluationMetric::Custom("custom_tone".to_string())
        );
    }

    #[test]
    fn metric_rejects_unknown_names() {
        assert!("latency".parse::<EvaluationMetric>().is_err());
        assert!("Custom_tone".parse::<EvaluationMetric>().is_err());
    }

    #[test]
    fn metric_accepts_bare_custom_prefix() {
        assert_eq!(
            "custom_".parse::<EvaluationMetric>().unwrap(),
            EvaluationMetric::Custom("custom_".to_string())
        );
    }

    #[test]
    fn metric_serializes_as_identifier() {
        let json = serde_json::to_string(&EvaluationMetric::TokenUsage).unwrap();
        assert_eq!(json, "\"token_usage\"");
        let back: EvaluationMetric = serde_json::from_str("\"custom_judge\"").unwrap();
        assert_eq!(back.as_str(), "custom_judge");
    }

    #[test]
    fn experiment_id_round_trips_through_display() {
        let id = ExperimentId::new();
        let parsed: ExperimentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<ExperimentId>().is_err());
    }

    #[test]
    fn status_serializes_upper_case() {
        let json = serde_json::to_string(&ExperimentStatus::Paused).unwrap();
        assert_eq!(json, "\"PAUSED\"");
    }
}
