//! Experiment records and request shapes
//!
//! An [`Experiment`] always owns exactly two arms, held as a named pair so
//! that no read site needs to filter by the control flag.

use crate::aggregate::ArmResult;
use crate::error::ExperimentError;
use crate::types::{Arm, ConfigId, EvaluationMetric, ExperimentId, ExperimentStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The two arms of an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arms {
    /// Baseline arm
    pub control: ArmResult,
    /// Candidate arm
    pub variant: ArmResult,
}

impl Arms {
    /// Zeroed pair
    #[must_use]
    pub fn new(control: ConfigId, variant: ConfigId) -> Self {
        Self {
            control: ArmResult::new(control, true),
            variant: ArmResult::new(variant, false),
        }
    }

    /// Borrow one arm
    #[inline]
    #[must_use]
    pub fn get(&self, arm: Arm) -> &ArmResult {
        match arm {
            Arm::Control => &self.control,
            Arm::Variant => &self.variant,
        }
    }

    /// Mutably borrow one arm
    #[inline]
    pub fn get_mut(&mut self, arm: Arm) -> &mut ArmResult {
        match arm {
            Arm::Control => &mut self.control,
            Arm::Variant => &mut self.variant,
        }
    }

    /// Total samples over both arms
    #[inline]
    #[must_use]
    pub fn total_samples(&self) -> u64 {
        self.control.sample_count() + self.variant.sample_count()
    }
}

/// One two-arm comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    /// Identity
    pub id: ExperimentId,
    /// Display name
    pub name: String,
    /// Free-text description
    pub description: Option<String>,
    /// Lifecycle status
    pub status: ExperimentStatus,
    /// Creator
    pub created_by: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// First start
    pub started_at: Option<DateTime<Utc>>,
    /// Completion or cancellation
    pub completed_at: Option<DateTime<Utc>>,
    /// Baseline configuration
    pub control_config_id: ConfigId,
    /// Candidate configuration
    pub variant_config_id: ConfigId,
    /// Samples wanted per arm
    pub target_sample_size: u32,
    /// Required confidence (0-100) before significance completes a run
    pub confidence_threshold: f64,
    /// How samples are classified
    pub evaluation_metric: EvaluationMetric,
    /// Forwarded to the harness
    pub test_parameters: HashMap<String, serde_json::Value>,
    /// Forwarded to the harness as a validation criterion
    pub success_criteria: Option<String>,
    /// Backend provider
    pub provider_id: String,
    /// Backend model
    pub model_id: String,
    /// Arm aggregates
    pub arms: Arms,
    /// Optimistic-concurrency revision, owned by the repository
    pub revision: u64,
}

impl Experiment {
    /// Build a fresh CREATED experiment from a definition
    pub fn from_definition(
        definition: ExperimentDefinition,
        now: DateTime<Utc>,
    ) -> Result<Self, ExperimentError> {
        let metric = definition.validate()?;
        let arms = Arms::new(
            definition.control_config_id.clone(),
            definition.variant_config_id.clone(),
        );

        Ok(Self {
            id: ExperimentId::new(),
            name: definition.name,
            description: definition.description,
            status: ExperimentStatus::Created,
            created_by: definition.created_by,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            control_config_id: definition.control_config_id,
            variant_config_id: definition.variant_config_id,
            target_sample_size: definition.target_sample_size,
            confidence_threshold: definition.confidence_threshold,
            evaluation_metric: metric,
            test_parameters: definition.test_parameters,
            success_criteria: definition.success_criteria,
            provider_id: definition.provider_id.unwrap_or_default(),
            model_id: definition.model_id.unwrap_or_default(),
            arms,
            revision: 0,
        })
    }

    /// Configuration of one arm
    #[inline]
    #[must_use]
    pub fn config_id(&self, arm: Arm) -> &ConfigId {
        match arm {
            Arm::Control => &self.control_config_id,
            Arm::Variant => &self.variant_config_id,
        }
    }

    /// Samples still needed by one arm (negative once overshot)
    #[inline]
    #[must_use]
    pub fn remaining(&self, arm: Arm) -> i64 {
        i64::from(self.target_sample_size)
            - i64::try_from(self.arms.get(arm).sample_count()).unwrap_or(i64::MAX)
    }

    /// Verify the two-arm invariant
    pub fn check_arms(&self) -> Result<(), ExperimentError> {
        let Arms { control, variant } = &self.arms;
        if !control.is_control || variant.is_control {
            return Err(ExperimentError::InvariantViolation(format!(
                "experiment {} must have exactly one control arm",
                self.id
            )));
        }
        if control.config_id != self.control_config_id
            || variant.config_id != self.variant_config_id
        {
            return Err(ExperimentError::InvariantViolation(format!(
                "experiment {} arms do not match its configurations",
                self.id
            )));
        }
        if !control.counts_consistent() || !variant.counts_consistent() {
            return Err(ExperimentError::InvariantViolation(format!(
                "experiment {} has more successes than samples",
                self.id
            )));
        }
        Ok(())
    }

    /// Completion percentage over both arms, capped at 100, two decimals
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        let target = u64::from(self.target_sample_size) * 2;
        if target == 0 {
            return 0.0;
        }
        let raw = self.arms.total_samples() as f64 / target as f64 * 100.0;
        ((raw * 100.0).round() / 100.0).min(100.0)
    }
}

/// Request to create an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    /// Display name
    pub name: String,
    /// Free-text description
    pub description: Option<String>,
    /// Baseline configuration
    pub control_config_id: ConfigId,
    /// Candidate configuration
    pub variant_config_id: ConfigId,
    /// Samples wanted per arm
    pub target_sample_size: u32,
    /// Required confidence (0-100)
    pub confidence_threshold: f64,
    /// Metric identifier
    pub evaluation_metric: String,
    /// Forwarded to the harness
    #[serde(default)]
    pub test_parameters: HashMap<String, serde_json::Value>,
    /// Forwarded to the harness
    pub success_criteria: Option<String>,
    /// Backend provider
    pub provider_id: Option<String>,
    /// Backend model
    pub model_id: Option<String>,
    /// Creator; supplied by the caller's auth context
    pub created_by: String,
    /// Start right after creation
    #[serde(default)]
    pub start_immediately: bool,
}

impl ExperimentDefinition {
    /// Definition with defaults: 100 samples, 95% confidence, success rate
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        control: impl Into<ConfigId>,
        variant: impl Into<ConfigId>,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            control_config_id: control.into(),
            variant_config_id: variant.into(),
            target_sample_size: 100,
            confidence_threshold: 95.0,
            evaluation_metric: "success_rate".to_string(),
            test_parameters: HashMap::new(),
            success_criteria: None,
            provider_id: None,
            model_id: None,
            created_by: "system".to_string(),
            start_immediately: false,
        }
    }

    /// With description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// With per-arm target
    #[must_use]
    pub fn with_target_sample_size(mut self, size: u32) -> Self {
        self.target_sample_size = size;
        self
    }

    /// With confidence threshold
    #[must_use]
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// With metric identifier
    #[must_use]
    pub fn with_metric(mut self, metric: impl Into<String>) -> Self {
        self.evaluation_metric = metric.into();
        self
    }

    /// With provider and model
    #[must_use]
    pub fn with_backend(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider_id = Some(provider.into());
        self.model_id = Some(model.into());
        self
    }

    /// With one harness parameter
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.test_parameters.insert(key.into(), value);
        self
    }

    /// With success criteria
    #[must_use]
    pub fn with_success_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = Some(criteria.into());
        self
    }

    /// With creator
    #[must_use]
    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.created_by = creator.into();
        self
    }

    /// Start right after creation
    #[must_use]
    pub fn start_immediately(mut self) -> Self {
        self.start_immediately = true;
        self
    }

    /// Validate the request; returns the parsed metric
    pub fn validate(&self) -> Result<EvaluationMetric, ExperimentError> {
        if self.name.trim().is_empty() {
            return Err(ExperimentError::validation("experiment name is required"));
        }
        if self.control_config_id.as_str().is_empty() || self.variant_config_id.as_str().is_empty()
        {
            return Err(ExperimentError::validation(
                "control and variant configuration ids are required",
            ));
        }
        if self.control_config_id == self.variant_config_id {
            return Err(ExperimentError::validation(
                "control and variant configurations must be different",
            ));
        }
        validate_sample_size(self.target_sample_size)?;
        validate_confidence(self.confidence_threshold)?;
        let metric = self.evaluation_metric.parse()?;
        require_present("provider id", self.provider_id.as_deref())?;
        require_present("model id", self.model_id.as_deref())?;
        Ok(metric)
    }
}

/// Partial update of a non-terminal experiment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentUpdate {
    /// New name
    pub name: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New per-arm target
    pub target_sample_size: Option<u32>,
    /// New confidence threshold
    pub confidence_threshold: Option<f64>,
    /// New metric identifier
    pub evaluation_metric: Option<String>,
    /// Replacement harness parameters
    pub test_parameters: Option<HashMap<String, serde_json::Value>>,
    /// New success criteria
    pub success_criteria: Option<String>,
    /// New provider
    pub provider_id: Option<String>,
    /// New model
    pub model_id: Option<String>,
    /// Requested lifecycle change
    pub status: Option<ExperimentStatus>,
}

impl ExperimentUpdate {
    /// Apply the non-status fields; validates each before touching the record
    pub fn apply_fields(&self, experiment: &mut Experiment) -> Result<(), ExperimentError> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(ExperimentError::validation("experiment name is required"));
            }
        }
        if let Some(size) = self.target_sample_size {
            validate_sample_size(size)?;
        }
        if let Some(threshold) = self.confidence_threshold {
            validate_confidence(threshold)?;
        }
        let metric = self
            .evaluation_metric
            .as_deref()
            .map(str::parse::<EvaluationMetric>)
            .transpose()?;
        if let Some(provider) = &self.provider_id {
            require_present("provider id", Some(provider))?;
        }
        if let Some(model) = &self.model_id {
            require_present("model id", Some(model))?;
        }

        if let Some(name) = &self.name {
            experiment.name.clone_from(name);
        }
        if let Some(description) = &self.description {
            experiment.description = Some(description.clone());
        }
        if let Some(size) = self.target_sample_size {
            experiment.target_sample_size = size;
        }
        if let Some(threshold) = self.confidence_threshold {
            experiment.confidence_threshold = threshold;
        }
        if let Some(metric) = metric {
            experiment.evaluation_metric = metric;
        }
        if let Some(parameters) = &self.test_parameters {
            experiment.test_parameters.clone_from(parameters);
        }
        if let Some(criteria) = &self.success_criteria {
            experiment.success_criteria = Some(criteria.clone());
        }
        if let Some(provider) = &self.provider_id {
            experiment.provider_id.clone_from(provider);
        }
        if let Some(model) = &self.model_id {
            experiment.model_id.clone_from(model);
        }
        Ok(())
    }
}

fn validate_sample_size(size: u32) -> Result<(), ExperimentError> {
    if size == 0 {
        return Err(ExperimentError::validation("sample size must be positive"));
    }
    Ok(())
}

fn validate_confidence(threshold: f64) -> Result<(), ExperimentError> {
    if !(0.0..=100.0).contains(&threshold) {
        return Err(ExperimentError::validation(
            "confidence threshold must be between 0 and 100",
        ));
    }
    Ok(())
}

fn require_present(field: &str, value: Option<&str>) -> Result<(), ExperimentError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(()),
        _ => Err(ExperimentError::validation(format!("{field} is required"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ExperimentDefinition {
        ExperimentDefinition::new("greeting tone", "v1", "v2").with_backend("openai", "gpt-4o")
    }

    #[test]
    fn fresh_experiment_is_created_with_zeroed_arms() {
        let exp = Experiment::from_definition(valid(), Utc::now()).unwrap();
        assert_eq!(exp.status, ExperimentStatus::Created);
        assert!(exp.arms.control.is_control);
        assert!(!exp.arms.variant.is_control);
        assert_eq!(exp.arms.total_samples(), 0);
        assert!(exp.arms.variant.p_value.is_none());
        assert!(exp.check_arms().is_ok());
        assert_eq!(exp.remaining(Arm::Variant), 100);
    }

    #[test]
    fn rejects_identical_configs() {
        let def = ExperimentDefinition::new("same", "v1", "v1").with_backend("p", "m");
        assert!(matches!(def.validate(), Err(ExperimentError::Validation(_))));
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(valid().with_target_sample_size(0).validate().is_err());
        assert!(valid().with_confidence_threshold(100.5).validate().is_err());
        assert!(valid().with_confidence_threshold(-1.0).validate().is_err());
        assert!(valid().with_metric("latency").validate().is_err());
        assert!(ExperimentDefinition::new("x", "a", "b").validate().is_err());
        assert!(valid().with_backend("openai", " ").validate().is_err());
    }

    #[test]
    fn accepts_custom_metric() {
        let metric = valid().with_metric("custom_rubric").validate().unwrap();
        assert_eq!(metric, EvaluationMetric::Custom("custom_rubric".into()));
    }

    #[test]
    fn swapped_control_flag_is_invariant_violation() {
        let mut exp = Experiment::from_definition(valid(), Utc::now()).unwrap();
        exp.arms.variant.is_control = true;
        assert!(matches!(
            exp.check_arms(),
            Err(ExperimentError::InvariantViolation(_))
        ));
    }

    #[test]
    fn update_validates_before_mutating() {
        let mut exp = Experiment::from_definition(valid(), Utc::now()).unwrap();
        let update = ExperimentUpdate {
            name: Some("renamed".into()),
            target_sample_size: Some(0),
            ..ExperimentUpdate::default()
        };
        assert!(update.apply_fields(&mut exp).is_err());
        assert_eq!(exp.name, "greeting tone");

        let update = ExperimentUpdate {
            name: Some("renamed".into()),
            evaluation_metric: Some("cost".into()),
            ..ExperimentUpdate::default()
        };
        update.apply_fields(&mut exp).unwrap();
        assert_eq!(exp.name, "renamed");
        assert_eq!(exp.evaluation_metric, EvaluationMetric::Cost);
    }

    #[test]
    fn progress_is_capped_and_rounded() {
        let exp = Experiment::from_definition(valid().with_target_sample_size(3), Utc::now())
            .unwrap();
        assert!((exp.progress() - 0.0).abs() < f64::EPSILON);
    }
}
