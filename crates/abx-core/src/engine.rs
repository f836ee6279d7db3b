//! Experiment engine
//!
//! Facade over the engine components. Every operation reloads authoritative
//! state from the repository, applies its change and saves with a revision
//! check:
//! - Lifecycle calls retry on a stale revision up to the configured limit
//! - Iterations reconcile with whatever landed while their batch was running
//! - RUNNING experiments are handed to the [`Scheduler`]

use crate::batch::BatchRunner;
use crate::config::EngineConfig;
use crate::error::{ExperimentError, RepositoryError};
use crate::experiment::{Arms, Experiment, ExperimentDefinition, ExperimentUpdate};
use crate::iteration::IterationController;
use crate::lifecycle::{apply_transition, Transition};
use crate::ports::{
    ExecutionHarness, ExperimentFilter, ExperimentRepository, Page, VersionPublisher,
};
use crate::report::ExperimentReport;
use crate::scheduler::{Scheduler, Tick};
use crate::significance::SignificanceEvaluator;
use crate::types::{ConfigId, ExperimentId, ExperimentStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// State shared between the facade and the scheduler loops
struct EngineCore {
    config: EngineConfig,
    repository: Arc<dyn ExperimentRepository>,
    publisher: Arc<dyn VersionPublisher>,
    controller: IterationController,
}

impl EngineCore {
    fn evaluator(&self) -> &SignificanceEvaluator {
        self.controller.evaluator()
    }

    /// Load, mutate, save; retries the whole cycle on a stale revision
    async fn mutate<F>(&self, id: ExperimentId, change: F) -> Result<Experiment, ExperimentError>
    where
        F: Fn(&mut Experiment) -> Result<(), ExperimentError> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            let mut experiment = self.repository.load(id).await?;
            change(&mut experiment)?;
            match self.repository.save(&experiment).await {
                Ok(saved) => return Ok(saved),
                Err(RepositoryError::Conflict { expected, actual })
                    if attempt < self.config.transition_retry_limit =>
                {
                    attempt += 1;
                    tracing::warn!(
                        experiment = %id,
                        expected,
                        actual,
                        attempt,
                        "stale revision, reloading"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn transition(
        &self,
        id: ExperimentId,
        transition: Transition,
    ) -> Result<Experiment, ExperimentError> {
        let saved = self
            .mutate(id, |experiment| {
                apply_transition(experiment, transition, Utc::now())?;
                if transition == Transition::Complete {
                    self.evaluator().evaluate(&mut experiment.arms);
                }
                Ok(())
            })
            .await?;
        tracing::info!(
            experiment = %id,
            %transition,
            status = %saved.status,
            "experiment transitioned"
        );
        Ok(saved)
    }

    /// One iteration, persisted as a unit
    async fn iterate(&self, id: ExperimentId) -> Result<Experiment, ExperimentError> {
        let loaded = self.repository.load(id).await?;
        let baseline = loaded.arms.clone();
        let result = self.controller.run_iteration(loaded).await?;
        if !result.is_mutation() {
            return Ok(result.experiment);
        }

        match self.repository.save(&result.experiment).await {
            Ok(saved) => Ok(saved),
            Err(RepositoryError::Conflict { .. }) => {
                self.reconcile(result.experiment, &baseline).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Merge an iteration's arms onto a record that changed under it
    ///
    /// The batch is discarded when the record went terminal or its arms no
    /// longer match the ones the iteration started from.
    async fn reconcile(
        &self,
        computed: Experiment,
        baseline: &Arms,
    ) -> Result<Experiment, ExperimentError> {
        let mut latest = self.repository.load(computed.id).await?;
        if latest.status.is_terminal() {
            tracing::warn!(
                experiment = %latest.id,
                status = %latest.status,
                "experiment finished during iteration, batch discarded"
            );
            return Ok(latest);
        }
        if latest.arms != *baseline {
            tracing::warn!(
                experiment = %latest.id,
                "arms changed during iteration, batch discarded"
            );
            return Ok(latest);
        }

        latest.arms = computed.arms;
        latest.updated_at = computed.updated_at;
        if latest.status == ExperimentStatus::Running
            && computed.status == ExperimentStatus::Completed
        {
            apply_transition(&mut latest, Transition::Complete, Utc::now())?;
        }
        tracing::debug!(experiment = %latest.id, status = %latest.status, "iteration reconciled");
        Ok(self.repository.save(&latest).await?)
    }
}

#[async_trait::async_trait]
impl Tick for EngineCore {
    async fn tick(&self, id: ExperimentId) -> Result<ExperimentStatus, ExperimentError> {
        self.iterate(id).await.map(|experiment| experiment.status)
    }

    async fn status(&self, id: ExperimentId) -> Result<ExperimentStatus, ExperimentError> {
        Ok(self.repository.load(id).await?.status)
    }
}

/// Two-arm experiment engine
#[derive(Clone)]
pub struct ExperimentEngine {
    core: Arc<EngineCore>,
    scheduler: Scheduler,
}

impl ExperimentEngine {
    /// Create engine
    ///
    /// # Errors
    /// `Config` when the configuration is inconsistent.
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn ExperimentRepository>,
        harness: Arc<dyn ExecutionHarness>,
        publisher: Arc<dyn VersionPublisher>,
    ) -> Result<Self, ExperimentError> {
        config.validate()?;
        let runner = BatchRunner::from_config(harness, &config);
        let controller = IterationController::from_config(runner, &config);
        let delay = config.tick_delay();
        let tick_delay_ms = config.tick_delay_ms;

        let core = Arc::new(EngineCore {
            config,
            repository,
            publisher,
            controller,
        });
        let scheduler = Scheduler::new(Arc::clone(&core) as Arc<dyn Tick>, delay);

        tracing::info!(tick_delay_ms, "experiment engine ready");
        Ok(Self { core, scheduler })
    }

    /// Engine configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Scheduler driving RUNNING experiments
    #[inline]
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Significance evaluator used for iterations, winners and reports
    #[inline]
    #[must_use]
    pub fn evaluator(&self) -> &SignificanceEvaluator {
        self.core.evaluator()
    }

    /// Create an experiment in CREATED, optionally starting it
    pub async fn create(
        &self,
        definition: ExperimentDefinition,
    ) -> Result<Experiment, ExperimentError> {
        let start = definition.start_immediately;
        let experiment = Experiment::from_definition(definition, Utc::now())?;
        let stored = self.core.repository.insert(&experiment).await?;
        tracing::info!(
            experiment = %stored.id,
            name = %stored.name,
            control = %stored.control_config_id,
            variant = %stored.variant_config_id,
            target = stored.target_sample_size,
            "experiment created"
        );

        if start {
            return self.start(stored.id).await;
        }
        Ok(stored)
    }

    /// Load an experiment
    pub async fn get(&self, id: ExperimentId) -> Result<Experiment, ExperimentError> {
        Ok(self.core.repository.load(id).await?)
    }

    /// Partially update a non-terminal experiment
    ///
    /// A requested status goes through the state machine like the matching
    /// lifecycle call.
    pub async fn update(
        &self,
        id: ExperimentId,
        update: ExperimentUpdate,
    ) -> Result<Experiment, ExperimentError> {
        let requested = update.status.map(Transition::toward).transpose()?;
        let saved = self
            .core
            .mutate(id, |experiment| {
                if experiment.status.is_terminal() {
                    return Err(ExperimentError::illegal("update", experiment.status));
                }
                if let Some(transition) = requested {
                    if experiment.status != transition.target() {
                        apply_transition(experiment, transition, Utc::now())?;
                        if transition == Transition::Complete {
                            self.core.evaluator().evaluate(&mut experiment.arms);
                        }
                    }
                }
                update.apply_fields(experiment)?;
                experiment.updated_at = Utc::now();
                Ok(())
            })
            .await?;

        tracing::info!(experiment = %id, status = %saved.status, "experiment updated");
        if saved.status == ExperimentStatus::Running {
            self.scheduler.schedule(id);
        }
        Ok(saved)
    }

    /// Delete an experiment and both arms
    pub async fn delete(&self, id: ExperimentId) -> Result<(), ExperimentError> {
        self.core.repository.delete(id).await?;
        tracing::info!(experiment = %id, "experiment deleted");
        Ok(())
    }

    /// CREATED/PAUSED -> RUNNING; hands the experiment to the scheduler
    pub async fn start(&self, id: ExperimentId) -> Result<Experiment, ExperimentError> {
        let saved = self.core.transition(id, Transition::Start).await?;
        self.scheduler.schedule(id);
        Ok(saved)
    }

    /// RUNNING -> PAUSED; an in-flight iteration still finishes
    pub async fn pause(&self, id: ExperimentId) -> Result<Experiment, ExperimentError> {
        self.core.transition(id, Transition::Pause).await
    }

    /// PAUSED -> RUNNING
    pub async fn resume(&self, id: ExperimentId) -> Result<Experiment, ExperimentError> {
        let saved = self.core.transition(id, Transition::Resume).await?;
        self.scheduler.schedule(id);
        Ok(saved)
    }

    /// RUNNING/PAUSED -> COMPLETED, with a final significance evaluation
    pub async fn complete(&self, id: ExperimentId) -> Result<Experiment, ExperimentError> {
        self.core.transition(id, Transition::Complete).await
    }

    /// Any non-terminal state -> CANCELLED
    pub async fn cancel(&self, id: ExperimentId) -> Result<Experiment, ExperimentError> {
        self.core.transition(id, Transition::Cancel).await
    }

    /// Run one iteration synchronously
    ///
    /// A no-op unless the experiment is RUNNING.
    pub async fn run_iteration_now(&self, id: ExperimentId) -> Result<Experiment, ExperimentError> {
        self.core.iterate(id).await
    }

    /// Publish the winning configuration of a terminal experiment
    ///
    /// The variant wins only when it is significantly better; otherwise the
    /// control is adopted.
    pub async fn apply_winner(&self, id: ExperimentId) -> Result<ConfigId, ExperimentError> {
        let experiment = self.core.repository.load(id).await?;
        if !experiment.status.is_terminal() {
            return Err(ExperimentError::illegal("apply winner", experiment.status));
        }

        let significant = self
            .core
            .evaluator()
            .is_significant(&experiment.arms, experiment.confidence_threshold);
        let winner = if significant {
            experiment.variant_config_id.clone()
        } else {
            experiment.control_config_id.clone()
        };

        self.core.publisher.mark_adopted(winner.clone()).await?;
        tracing::info!(experiment = %id, winner = %winner, significant, "winner applied");
        Ok(winner)
    }

    /// Re-run the significance evaluator on the stored arms
    pub async fn recalculate(&self, id: ExperimentId) -> Result<Experiment, ExperimentError> {
        self.core
            .mutate(id, |experiment| {
                experiment.check_arms()?;
                self.core.evaluator().evaluate(&mut experiment.arms);
                Ok(())
            })
            .await
    }

    /// Experiment with progress and outcome
    pub async fn report(&self, id: ExperimentId) -> Result<ExperimentReport, ExperimentError> {
        let experiment = self.core.repository.load(id).await?;
        Ok(ExperimentReport::new(experiment, self.core.evaluator()))
    }

    /// Query experiments, newest first
    pub async fn list(
        &self,
        filter: &ExperimentFilter,
        page: Page,
    ) -> Result<Vec<Experiment>, ExperimentError> {
        Ok(self.core.repository.list(filter, page).await?)
    }

    /// Experiments in `status`; every experiment when `None`
    pub async fn by_status(
        &self,
        status: Option<ExperimentStatus>,
    ) -> Result<Vec<Experiment>, ExperimentError> {
        let filter = match status {
            Some(status) => ExperimentFilter::all().with_status(status),
            None => ExperimentFilter::all(),
        };
        self.list(&filter, Page::unbounded()).await
    }

    /// Experiments created by `creator`
    pub async fn by_creator(&self, creator: &str) -> Result<Vec<Experiment>, ExperimentError> {
        self.list(&ExperimentFilter::all().with_creator(creator), Page::unbounded())
            .await
    }

    /// Experiments created within `[from, to]`
    pub async fn by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Experiment>, ExperimentError> {
        if from > to {
            return Err(ExperimentError::validation("date range start is after its end"));
        }
        self.list(
            &ExperimentFilter::all().with_created_between(from, to),
            Page::unbounded(),
        )
        .await
    }

    /// Experiments using `config_id` on either arm
    pub async fn by_config(&self, config_id: ConfigId) -> Result<Vec<Experiment>, ExperimentError> {
        self.list(&ExperimentFilter::all().with_config(config_id), Page::unbounded())
            .await
    }

    /// Experiments whose name contains `fragment`, ignoring case
    pub async fn search_by_name(&self, fragment: &str) -> Result<Vec<Experiment>, ExperimentError> {
        self.list(
            &ExperimentFilter::all().with_name_containing(fragment),
            Page::unbounded(),
        )
        .await
    }

    /// Stop all scheduler loops at their next tick boundary
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

impl std::fmt::Debug for ExperimentEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentEngine")
            .field("config", &self.core.config)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;
    use crate::ports::{ExecutionRequest, MockVersionPublisher, SampleOutcome};
    use crate::store::InMemoryExperimentRepository;
    use std::time::Duration;

    /// Variant always succeeds, control always fails
    struct VariantWins;

    #[async_trait::async_trait]
    impl ExecutionHarness for VariantWins {
        async fn execute(
            &self,
            request: &ExecutionRequest,
        ) -> std::result::Result<SampleOutcome, HarnessError> {
            Ok(SampleOutcome::new(request.config_id.as_str() == "var"))
        }
    }

    fn engine_with(publisher: MockVersionPublisher) -> ExperimentEngine {
        let config = EngineConfig::new().with_tick_delay(Duration::from_millis(10));
        ExperimentEngine::new(
            config,
            Arc::new(InMemoryExperimentRepository::new()),
            Arc::new(VariantWins),
            Arc::new(publisher),
        )
        .unwrap()
    }

    fn definition(target: u32) -> ExperimentDefinition {
        ExperimentDefinition::new("engine", "ctl", "var")
            .with_backend("p", "m")
            .with_target_sample_size(target)
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let result = ExperimentEngine::new(
            EngineConfig::new().with_max_batch_size(0),
            Arc::new(InMemoryExperimentRepository::new()),
            Arc::new(VariantWins),
            Arc::new(MockVersionPublisher::new()),
        );
        assert!(matches!(result, Err(ExperimentError::Config(_))));
    }

    #[tokio::test]
    async fn apply_winner_publishes_significant_variant_once() {
        let mut publisher = MockVersionPublisher::new();
        publisher
            .expect_mark_adopted()
            .withf(|config| config.as_str() == "var")
            .times(1)
            .returning(|_| Ok(()));
        let engine = engine_with(publisher);
        engine.shutdown();

        let exp = engine.create(definition(1000)).await.unwrap();
        engine.start(exp.id).await.unwrap();
        for _ in 0..3 {
            engine.run_iteration_now(exp.id).await.unwrap();
        }
        let done = engine.get(exp.id).await.unwrap();
        assert_eq!(done.status, ExperimentStatus::Completed);

        let winner = engine.apply_winner(exp.id).await.unwrap();
        assert_eq!(winner.as_str(), "var");
    }

    #[tokio::test]
    async fn apply_winner_requires_terminal_state() {
        let mut publisher = MockVersionPublisher::new();
        publisher.expect_mark_adopted().times(0);
        let engine = engine_with(publisher);

        let exp = engine.create(definition(10)).await.unwrap();
        let err = engine.apply_winner(exp.id).await.unwrap_err();
        assert!(matches!(
            err,
            ExperimentError::IllegalTransition {
                current: ExperimentStatus::Created,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancelled_without_significance_adopts_control() {
        let mut publisher = MockVersionPublisher::new();
        publisher
            .expect_mark_adopted()
            .withf(|config| config.as_str() == "ctl")
            .times(1)
            .returning(|_| Ok(()));
        let engine = engine_with(publisher);

        let exp = engine.create(definition(10)).await.unwrap();
        engine.cancel(exp.id).await.unwrap();
        assert_eq!(engine.apply_winner(exp.id).await.unwrap().as_str(), "ctl");
    }

    #[tokio::test]
    async fn update_rejects_terminal_and_routes_status() {
        let engine = engine_with(MockVersionPublisher::new());
        engine.shutdown();
        let exp = engine.create(definition(10)).await.unwrap();

        let paused_request = ExperimentUpdate {
            status: Some(ExperimentStatus::Paused),
            ..ExperimentUpdate::default()
        };
        assert!(matches!(
            engine.update(exp.id, paused_request).await,
            Err(ExperimentError::IllegalTransition { .. })
        ));

        let update = ExperimentUpdate {
            name: Some("renamed".into()),
            status: Some(ExperimentStatus::Running),
            ..ExperimentUpdate::default()
        };
        let updated = engine.update(exp.id, update).await.unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.status, ExperimentStatus::Running);
        assert!(updated.started_at.is_some());

        engine.cancel(exp.id).await.unwrap();
        let late = ExperimentUpdate {
            name: Some("too late".into()),
            ..ExperimentUpdate::default()
        };
        assert!(engine.update(exp.id, late).await.is_err());
        assert_eq!(engine.get(exp.id).await.unwrap().name, "renamed");
    }

    #[tokio::test]
    async fn complete_forces_final_evaluation() {
        let engine = engine_with(MockVersionPublisher::new());
        engine.shutdown();
        let exp = engine.create(definition(100)).await.unwrap();
        engine.start(exp.id).await.unwrap();
        engine.run_iteration_now(exp.id).await.unwrap();

        let done = engine.complete(exp.id).await.unwrap();
        assert_eq!(done.status, ExperimentStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(done.arms.variant.p_value.is_some());
        assert_eq!(done.arms.control.p_value, Some(0.5));
    }

    #[tokio::test]
    async fn queries_and_delete() {
        let engine = engine_with(MockVersionPublisher::new());
        let a = engine
            .create(definition(10).with_creator("alice"))
            .await
            .unwrap();
        engine
            .create(ExperimentDefinition::new("other", "x", "y").with_backend("p", "m"))
            .await
            .unwrap();

        assert_eq!(engine.by_status(None).await.unwrap().len(), 2);
        assert_eq!(engine.by_creator("alice").await.unwrap().len(), 1);
        assert_eq!(engine.by_config(ConfigId::new("y")).await.unwrap().len(), 1);
        assert_eq!(engine.search_by_name("ENG").await.unwrap().len(), 1);
        let now = Utc::now();
        assert!(engine.by_date_range(now, now - chrono::Duration::days(1)).await.is_err());

        engine.delete(a.id).await.unwrap();
        assert!(matches!(
            engine.get(a.id).await,
            Err(ExperimentError::NotFound(_))
        ));
    }
}
