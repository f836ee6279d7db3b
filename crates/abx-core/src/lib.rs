//! ABX Core - two-arm experiment engine
//!
//! Runs controlled comparisons between a control and a variant prompt
//! configuration:
//! - Drives experiments through their lifecycle
//! - Collects samples in bounded batches through an execution harness
//! - Folds samples into running per-arm aggregates
//! - Tests the variant against control with an exact binomial test
//! - Completes on target or significance and publishes the winner
//!
//! # Example
//!
//! ```rust,ignore
//! use abx_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     harness: Arc<dyn ExecutionHarness>,
//! #     publisher: Arc<dyn VersionPublisher>,
//! # ) -> Result<(), ExperimentError> {
//! let engine = ExperimentEngine::new(
//!     EngineConfig::new(),
//!     Arc::new(InMemoryExperimentRepository::new()),
//!     harness,
//!     publisher,
//! )?;
//!
//! let definition = ExperimentDefinition::new("greeting tone", "v1", "v2")
//!     .with_backend("openai", "gpt-4o")
//!     .with_target_sample_size(200);
//! let experiment = engine.create(definition).await?;
//! engine.start(experiment.id).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod aggregate;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod experiment;
pub mod iteration;
pub mod lifecycle;
pub mod ports;
pub mod report;
pub mod scheduler;
pub mod significance;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use aggregate::{ArmResult, BatchSnapshot, BatchTotals, RunningMean};
pub use batch::{classify, BatchRunner};
pub use config::{EngineConfig, SuccessThresholds};
pub use engine::ExperimentEngine;
pub use error::{ExperimentError, HarnessError, PublishError, RepositoryError};
pub use experiment::{Arms, Experiment, ExperimentDefinition, ExperimentUpdate};
pub use iteration::{IterationController, IterationOutcome, IterationResult};
pub use lifecycle::{allowed_transitions, apply_transition, validate_transition, Transition};
pub use ports::{
    ExecutionHarness, ExecutionRequest, ExperimentFilter, ExperimentRepository, Page,
    SampleOutcome, VersionPublisher,
};
pub use report::{ExperimentReport, Outcome};
pub use scheduler::{Scheduler, Tick};
pub use significance::{binomial_test_two_sided, Significance, SignificanceEvaluator};
pub use store::InMemoryExperimentRepository;
pub use types::{Arm, ConfigId, EvaluationMetric, ExperimentId, ExperimentStatus};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with ABX Core
    pub use crate::{
        Arm, ConfigId, EngineConfig, ExecutionHarness, ExecutionRequest, Experiment,
        ExperimentDefinition, ExperimentEngine, ExperimentError, ExperimentId,
        ExperimentRepository, ExperimentStatus, HarnessError, InMemoryExperimentRepository,
        SampleOutcome, VersionPublisher,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
