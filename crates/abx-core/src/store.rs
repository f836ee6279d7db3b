//! In-memory experiment repository
//!
//! Provides [`InMemoryExperimentRepository`], a [`DashMap`]-backed
//! [`ExperimentRepository`] with revision-checked saves. Used by the
//! simulator and by tests; durable backends implement the same port.

use crate::error::RepositoryError;
use crate::experiment::Experiment;
use crate::ports::{ExperimentFilter, ExperimentRepository, Page};
use crate::types::ExperimentId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Repository keeping every experiment in memory
#[derive(Debug, Default)]
pub struct InMemoryExperimentRepository {
    records: DashMap<ExperimentId, Experiment>,
}

impl InMemoryExperimentRepository {
    /// Create new empty repository
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Number of stored experiments
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if repository is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait::async_trait]
impl ExperimentRepository for InMemoryExperimentRepository {
    async fn insert(&self, experiment: &Experiment) -> Result<Experiment, RepositoryError> {
        match self.records.entry(experiment.id) {
            Entry::Occupied(_) => Err(RepositoryError::Storage(format!(
                "experiment {} already exists",
                experiment.id
            ))),
            Entry::Vacant(slot) => {
                let mut stored = experiment.clone();
                stored.revision = 1;
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn load(&self, id: ExperimentId) -> Result<Experiment, RepositoryError> {
        self.records
            .get(&id)
            .map(|record| record.value().clone())
            .ok_or(RepositoryError::NotFound(id))
    }

    async fn save(&self, experiment: &Experiment) -> Result<Experiment, RepositoryError> {
        let mut record = self
            .records
            .get_mut(&experiment.id)
            .ok_or(RepositoryError::NotFound(experiment.id))?;

        if record.revision != experiment.revision {
            return Err(RepositoryError::Conflict {
                expected: experiment.revision,
                actual: record.revision,
            });
        }

        let mut stored = experiment.clone();
        stored.revision += 1;
        *record = stored.clone();
        Ok(stored)
    }

    async fn delete(&self, id: ExperimentId) -> Result<(), RepositoryError> {
        self.records
            .remove(&id)
            .map(|_| ())
            .ok_or(RepositoryError::NotFound(id))
    }

    async fn list(
        &self,
        filter: &ExperimentFilter,
        page: Page,
    ) -> Result<Vec<Experiment>, RepositoryError> {
        let mut matched: Vec<Experiment> = self
            .records
            .iter()
            .filter(|record| filter.matches(record.value()))
            .map(|record| record.value().clone())
            .collect();

        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.0.cmp(&a.id.0)));
        Ok(matched
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }
}
