//! Collaborator ports
//!
//! The engine owns no I/O. Sample execution, persistence and winner
//! publication are reached through these traits.

use crate::error::{HarnessError, PublishError, RepositoryError};
use crate::experiment::Experiment;
use crate::types::{ConfigId, ExperimentId, ExperimentStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One sample request sent to the execution harness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Configuration under test
    pub config_id: ConfigId,
    /// Backend provider
    pub provider_id: String,
    /// Backend model
    pub model_id: String,
    /// Opaque parameters forwarded from the experiment
    pub parameters: HashMap<String, serde_json::Value>,
    /// Free-text success criteria, if the experiment defines one
    pub validation_criteria: Option<String>,
}

/// Outcome metrics of one sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleOutcome {
    /// Harness reported a successful execution
    pub success: bool,
    /// Response time in milliseconds
    pub response_time_ms: u64,
    /// Tokens consumed
    pub token_count: u64,
    /// Monetary cost
    pub cost: f64,
    /// Verdict of the harness's own validation, when it ran one
    pub validation_passed: Option<bool>,
    /// Reference to the stored execution
    pub execution_id: Option<String>,
}

impl SampleOutcome {
    /// Outcome with zeroed measurements
    #[inline]
    #[must_use]
    pub fn new(success: bool) -> Self {
        Self {
            success,
            response_time_ms: 0,
            token_count: 0,
            cost: 0.0,
            validation_passed: None,
            execution_id: None,
        }
    }

    /// With response time
    #[inline]
    #[must_use]
    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = ms;
        self
    }

    /// With token count
    #[inline]
    #[must_use]
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.token_count = tokens;
        self
    }

    /// With cost
    #[inline]
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// With validation verdict
    #[inline]
    #[must_use]
    pub fn with_validation(mut self, passed: bool) -> Self {
        self.validation_passed = Some(passed);
        self
    }

    /// With execution reference
    #[inline]
    #[must_use]
    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = Some(id.into());
        self
    }
}

/// Runs one sample against a generative-model provider
///
/// Implementations own the call timeout; a timed-out call is an error.
#[async_trait::async_trait]
pub trait ExecutionHarness: Send + Sync {
    /// Execute a single sample
    async fn execute(&self, request: &ExecutionRequest) -> Result<SampleOutcome, HarnessError>;
}

/// Durable storage of experiments and their arms
///
/// `save` is atomic over the experiment and both arms and rejects writes
/// whose `revision` is not the stored one.
#[async_trait::async_trait]
pub trait ExperimentRepository: Send + Sync {
    /// Store a new experiment
    async fn insert(&self, experiment: &Experiment) -> Result<Experiment, RepositoryError>;

    /// Load an experiment with both arms
    async fn load(&self, id: ExperimentId) -> Result<Experiment, RepositoryError>;

    /// Replace a stored experiment; returns the stored copy with its new revision
    async fn save(&self, experiment: &Experiment) -> Result<Experiment, RepositoryError>;

    /// Remove an experiment and both arms
    async fn delete(&self, id: ExperimentId) -> Result<(), RepositoryError>;

    /// Query experiments, newest first
    async fn list(
        &self,
        filter: &ExperimentFilter,
        page: Page,
    ) -> Result<Vec<Experiment>, RepositoryError>;
}

/// Marks a configuration as the adopted one
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait VersionPublisher: Send + Sync {
    /// Adopt the winning configuration
    async fn mark_adopted(&self, config_id: ConfigId) -> Result<(), PublishError>;
}

/// Experiment query; every set field must match
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentFilter {
    /// Exact status
    pub status: Option<ExperimentStatus>,
    /// Creator
    pub created_by: Option<String>,
    /// Inclusive creation-time window
    pub created_between: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Control or variant configuration
    pub config_id: Option<ConfigId>,
    /// Case-insensitive name fragment
    pub name_contains: Option<String>,
    /// Terminal (`true`) or non-terminal (`false`)
    pub completed: Option<bool>,
}

impl ExperimentFilter {
    /// Match everything
    #[inline]
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// By status
    #[inline]
    #[must_use]
    pub fn with_status(mut self, status: ExperimentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// By creator
    #[inline]
    #[must_use]
    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.created_by = Some(creator.into());
        self
    }

    /// By creation window
    #[inline]
    #[must_use]
    pub fn with_created_between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.created_between = Some((from, to));
        self
    }

    /// By configuration on either arm
    #[inline]
    #[must_use]
    pub fn with_config(mut self, config_id: ConfigId) -> Self {
        self.config_id = Some(config_id);
        self
    }

    /// By name fragment
    #[inline]
    #[must_use]
    pub fn with_name_containing(mut self, fragment: impl Into<String>) -> Self {
        self.name_contains = Some(fragment.into());
        self
    }

    /// By completion
    #[inline]
    #[must_use]
    pub fn with_completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    /// Check an experiment against the filter
    #[must_use]
    pub fn matches(&self, experiment: &Experiment) -> bool {
        if self.status.is_some_and(|s| s != experiment.status) {
            return false;
        }
        if self
            .created_by
            .as_deref()
            .is_some_and(|c| c != experiment.created_by)
        {
            return false;
        }
        if let Some((from, to)) = self.created_between {
            if experiment.created_at < from || experiment.created_at > to {
                return false;
            }
        }
        if let Some(config) = &self.config_id {
            if *config != experiment.control_config_id && *config != experiment.variant_config_id {
                return false;
            }
        }
        if let Some(fragment) = &self.name_contains {
            if !experiment
                .name
                .to_lowercase()
                .contains(&fragment.to_lowercase())
            {
                return false;
            }
        }
        if self
            .completed
            .is_some_and(|c| c != experiment.status.is_terminal())
        {
            return false;
        }
        true
    }
}

/// Offset/limit window over a result list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Items to skip
    pub offset: usize,
    /// Maximum items returned
    pub limit: usize,
}

impl Page {
    /// New page window
    #[inline]
    #[must_use]
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// Everything
    #[inline]
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, 20)
    }
}
