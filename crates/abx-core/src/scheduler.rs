//! Scheduler
//!
//! Re-runs iterations for RUNNING experiments until they leave RUNNING.
//!
//! - One loop per experiment, enforced by a claim set
//! - First tick immediately, then a fixed delay between ticks
//! - Pause/cancel take effect at the next tick boundary
//! - Retryable errors are retried on the next tick from freshly loaded state
//! - Fatal errors stop the loop

use crate::error::ExperimentError;
use crate::types::{ExperimentId, ExperimentStatus};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Something that can advance an experiment by one tick
#[async_trait::async_trait]
pub trait Tick: Send + Sync {
    /// Run one iteration and persist it; returns the resulting status
    async fn tick(&self, id: ExperimentId) -> Result<ExperimentStatus, ExperimentError>;

    /// Current persisted status
    async fn status(&self, id: ExperimentId) -> Result<ExperimentStatus, ExperimentError>;
}

/// Why a loop stopped ticking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Settled,
    Failed,
    Shutdown,
}

struct Inner {
    handler: Arc<dyn Tick>,
    delay: Duration,
    active: DashMap<ExperimentId, ()>,
    shutdown: watch::Sender<bool>,
}

/// Timer-driven iteration scheduler
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create scheduler driving `handler` with `delay` between ticks
    #[must_use]
    pub fn new(handler: Arc<dyn Tick>, delay: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                handler,
                delay,
                active: DashMap::new(),
                shutdown,
            }),
        }
    }

    /// Delay between ticks
    #[inline]
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    /// Start a loop for `id` unless one is already live
    ///
    /// Returns whether a new loop was spawned. Must be called from within a
    /// tokio runtime.
    pub fn schedule(&self, id: ExperimentId) -> bool {
        if self.is_shut_down() {
            tracing::debug!(experiment = %id, "scheduler shut down, not scheduling");
            return false;
        }
        if self.inner.active.insert(id, ()).is_some() {
            tracing::debug!(experiment = %id, "loop already live");
            return false;
        }
        tokio::spawn(drive(Arc::clone(&self.inner), id));
        true
    }

    /// Check if a loop is live for `id`
    #[inline]
    #[must_use]
    pub fn is_scheduled(&self, id: ExperimentId) -> bool {
        self.inner.active.contains_key(&id)
    }

    /// Number of live loops
    #[inline]
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Stop every loop at its next tick boundary; later `schedule` calls are ignored
    pub fn shutdown(&self) {
        tracing::info!(active = self.active_count(), "scheduler shutting down");
        self.inner.shutdown.send_replace(true);
    }

    /// Check if shutdown was requested
    #[inline]
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("delay", &self.inner.delay)
            .field("active", &self.inner.active.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[tracing::instrument(name = "experiment_loop", skip_all, fields(experiment = %id))]
async fn drive(inner: Arc<Inner>, id: ExperimentId) {
    loop {
        let exit = tick_until_settled(&inner, id).await;
        inner.active.remove(&id);
        if exit != Exit::Settled {
            return;
        }

        // A resume may have landed between the last tick and the release above.
        match inner.handler.status(id).await {
            Ok(ExperimentStatus::Running) if !*inner.shutdown.borrow() => {
                if inner.active.insert(id, ()).is_some() {
                    return;
                }
                tracing::debug!("experiment resumed while loop was exiting, continuing");
            }
            _ => return,
        }
    }
}

async fn tick_until_settled(inner: &Inner, id: ExperimentId) -> Exit {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        if *shutdown.borrow_and_update() {
            return Exit::Shutdown;
        }

        match inner.handler.tick(id).await {
            Ok(ExperimentStatus::Running) => {}
            Ok(status) => {
                tracing::info!(%status, "experiment left RUNNING, loop stopping");
                return Exit::Settled;
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(error = %e, "iteration failed, retrying next tick");
            }
            Err(e) => {
                tracing::error!(error = %e, "iteration failed permanently, loop stopping");
                return Exit::Failed;
            }
        }

        tokio::select! {
            () = tokio::time::sleep(inner.delay) => {}
            _ = shutdown.changed() => return Exit::Shutdown,
        }
    }
}
