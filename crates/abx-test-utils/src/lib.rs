//! Testing utilities for ABX workspace
//!
//! Shared fakes and fixtures: a scripted execution harness, a recording
//! publisher, a repository that can be told to fail, and engine builders.

#![allow(missing_docs)]

use abx_core::{
    ConfigId, EngineConfig, ExecutionHarness, ExecutionRequest, Experiment, ExperimentDefinition,
    ExperimentEngine, ExperimentFilter, ExperimentId, ExperimentRepository, HarnessError,
    InMemoryExperimentRepository, Page, PublishError, RepositoryError, SampleOutcome,
    VersionPublisher,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const CONTROL: &str = "control-v1";
pub const VARIANT: &str = "variant-v2";

/// One scripted harness response
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// `success = true`
    Success,
    /// `success = false`
    Unsuccessful,
    /// Harness error
    Error,
}

/// How the harness answers for one configuration
#[derive(Debug, Clone, PartialEq)]
pub enum Behaviour {
    Succeed,
    Unsuccessful,
    /// Cycles through the steps forever
    Pattern(Vec<Step>),
    /// Always returns this outcome
    Outcome(SampleOutcome),
}

#[derive(Debug, Default)]
struct ScriptState {
    behaviours: HashMap<ConfigId, Behaviour>,
    calls: HashMap<ConfigId, u32>,
    requests: Vec<ExecutionRequest>,
}

/// Harness whose answers are scripted per configuration
///
/// Unscripted configurations always succeed.
#[derive(Debug, Default)]
pub struct ScriptedHarness {
    state: Mutex<ScriptState>,
    delay: Option<Duration>,
}

impl ScriptedHarness {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(self, config: &str, behaviour: Behaviour) -> Self {
        self.state
            .lock()
            .behaviours
            .insert(ConfigId::new(config), behaviour);
        self
    }

    /// Sleep before every answer
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set(&self, config: &str, behaviour: Behaviour) {
        self.state
            .lock()
            .behaviours
            .insert(ConfigId::new(config), behaviour);
    }

    #[must_use]
    pub fn calls(&self, config: &str) -> u32 {
        self.state
            .lock()
            .calls
            .get(&ConfigId::new(config))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn total_calls(&self) -> u32 {
        self.state.lock().calls.values().sum()
    }

    #[must_use]
    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.state.lock().requests.clone()
    }

    fn answer(&self, request: &ExecutionRequest) -> Result<SampleOutcome, HarnessError> {
        let mut state = self.state.lock();
        state.requests.push(request.clone());
        let call = {
            let count = state.calls.entry(request.config_id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let behaviour = state
            .behaviours
            .get(&request.config_id)
            .cloned()
            .unwrap_or(Behaviour::Succeed);

        let id = format!("{}-{call}", request.config_id);
        match behaviour {
            Behaviour::Succeed => Ok(SampleOutcome::new(true).with_execution_id(id)),
            Behaviour::Unsuccessful => Ok(SampleOutcome::new(false).with_execution_id(id)),
            Behaviour::Outcome(outcome) => Ok(outcome),
            Behaviour::Pattern(steps) if steps.is_empty() => Ok(SampleOutcome::new(true)),
            Behaviour::Pattern(steps) => {
                let index = (call as usize - 1) % steps.len();
                match steps[index] {
                    Step::Success => Ok(SampleOutcome::new(true).with_execution_id(id)),
                    Step::Unsuccessful => Ok(SampleOutcome::new(false).with_execution_id(id)),
                    Step::Error => Err(HarnessError::Failed(format!("scripted failure {id}"))),
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ExecutionHarness for ScriptedHarness {
    async fn execute(&self, request: &ExecutionRequest) -> Result<SampleOutcome, HarnessError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.answer(request)
    }
}

/// Publisher that records every adoption
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    adopted: Mutex<Vec<ConfigId>>,
    unavailable: Mutex<bool>,
}

impl RecordingPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    #[must_use]
    pub fn adopted(&self) -> Vec<ConfigId> {
        self.adopted.lock().clone()
    }
}

#[async_trait::async_trait]
impl VersionPublisher for RecordingPublisher {
    async fn mark_adopted(&self, config_id: ConfigId) -> Result<(), PublishError> {
        if *self.unavailable.lock() {
            return Err(PublishError::Unavailable("recording publisher offline".into()));
        }
        self.adopted.lock().push(config_id);
        Ok(())
    }
}

/// In-memory repository whose saves can be made to fail
#[derive(Debug, Default)]
pub struct FlakyRepository {
    inner: InMemoryExperimentRepository,
    failing_saves: AtomicU32,
    conflicting_saves: AtomicU32,
    saves: AtomicU32,
}

impl FlakyRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` saves with a storage error
    pub fn fail_next_saves(&self, n: u32) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` saves as stale, as if another writer got there first
    pub fn fail_next_saves_with_conflict(&self, n: u32) {
        self.conflicting_saves.store(n, Ordering::SeqCst);
    }

    /// Successful saves so far
    #[must_use]
    pub fn saves(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn inner(&self) -> &InMemoryExperimentRepository {
        &self.inner
    }
}

#[async_trait::async_trait]
impl ExperimentRepository for FlakyRepository {
    async fn insert(&self, experiment: &Experiment) -> Result<Experiment, RepositoryError> {
        self.inner.insert(experiment).await
    }

    async fn load(&self, id: ExperimentId) -> Result<Experiment, RepositoryError> {
        self.inner.load(id).await
    }

    async fn save(&self, experiment: &Experiment) -> Result<Experiment, RepositoryError> {
        if take_one(&self.conflicting_saves) {
            return Err(RepositoryError::Conflict {
                expected: experiment.revision,
                actual: experiment.revision + 1,
            });
        }
        if take_one(&self.failing_saves) {
            return Err(RepositoryError::Storage("injected save failure".into()));
        }
        let saved = self.inner.save(experiment).await?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(saved)
    }

    async fn delete(&self, id: ExperimentId) -> Result<(), RepositoryError> {
        self.inner.delete(id).await
    }

    async fn list(
        &self,
        filter: &ExperimentFilter,
        page: Page,
    ) -> Result<Vec<Experiment>, RepositoryError> {
        self.inner.list(filter, page).await
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Valid definition over [`CONTROL`] and [`VARIANT`]
#[must_use]
pub fn definition(target: u32) -> ExperimentDefinition {
    ExperimentDefinition::new("test experiment", CONTROL, VARIANT)
        .with_backend("test-provider", "test-model")
        .with_target_sample_size(target)
}

/// Default configuration with a short tick delay
#[must_use]
pub fn fast_config() -> EngineConfig {
    EngineConfig::new().with_tick_delay(Duration::from_millis(10))
}

/// Engine plus handles on its fakes
pub struct TestEngine {
    pub engine: ExperimentEngine,
    pub harness: Arc<ScriptedHarness>,
    pub publisher: Arc<RecordingPublisher>,
    pub repository: Arc<FlakyRepository>,
}

/// Engine over the given harness with fresh fakes elsewhere
#[must_use]
pub fn setup_test_engine(harness: ScriptedHarness) -> TestEngine {
    setup_test_engine_with(fast_config(), harness)
}

#[must_use]
pub fn setup_test_engine_with(config: EngineConfig, harness: ScriptedHarness) -> TestEngine {
    let harness = Arc::new(harness);
    let publisher = Arc::new(RecordingPublisher::new());
    let repository = Arc::new(FlakyRepository::new());
    let engine = ExperimentEngine::new(
        config,
        repository.clone(),
        harness.clone(),
        publisher.clone(),
    )
    .unwrap();
    TestEngine {
        engine,
        harness,
        publisher,
        repository,
    }
}

/// Poll until `check` holds for the stored experiment
///
/// # Panics
/// When it does not hold within `attempts` polls.
pub async fn wait_for<F>(
    engine: &ExperimentEngine,
    id: ExperimentId,
    attempts: u32,
    check: F,
) -> Experiment
where
    F: Fn(&Experiment) -> bool,
{
    for _ in 0..attempts {
        let experiment = engine.get(id).await.unwrap();
        if check(&experiment) {
            return experiment;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("experiment {id} never reached the expected state");
}
