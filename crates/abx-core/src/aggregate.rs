//! Arm aggregation
//!
//! Running aggregates for one arm. Raw samples are never retained: every
//! batch is folded into the previous aggregate with the incremental-average
//! law `new = (old * old_count + batch_sum) / (old_count + batch_count)`.

use crate::ports::SampleOutcome;
use crate::types::ConfigId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Count plus incrementally maintained mean
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    count: u64,
    mean: f64,
}

impl RunningMean {
    /// Number of observations folded so far
    #[inline]
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Current mean (0 when empty)
    #[inline]
    #[must_use]
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Fold a batch of `batch_count` observations summing to `batch_sum`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fold(self, batch_count: u64, batch_sum: f64) -> Self {
        if batch_count == 0 {
            return self;
        }
        let count = self.count + batch_count;
        let mean = (self.mean * self.count as f64 + batch_sum) / count as f64;
        Self { count, mean }
    }
}

/// Totals of one batch, before folding
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchTotals {
    /// Harness calls attempted
    pub attempted: u32,
    /// Calls that returned an outcome
    pub samples: u64,
    /// Outcomes classified successful
    pub successes: u64,
    /// Sum of response times (ms)
    pub response_time_sum: f64,
    /// Sum of token counts
    pub token_sum: f64,
    /// Sum of costs
    pub cost_sum: f64,
    /// Execution references returned by the harness
    pub execution_ids: Vec<String>,
}

impl BatchTotals {
    /// Record a completed sample
    #[allow(clippy::cast_precision_loss)]
    pub fn record(&mut self, outcome: &SampleOutcome, success: bool) {
        self.attempted += 1;
        self.samples += 1;
        if success {
            self.successes += 1;
        }
        self.response_time_sum += outcome.response_time_ms as f64;
        self.token_sum += outcome.token_count as f64;
        self.cost_sum += outcome.cost;
        if let Some(id) = &outcome.execution_id {
            self.execution_ids.push(id.clone());
        }
    }

    /// Record a sample dropped at the harness
    pub fn record_failure(&mut self) {
        self.attempted += 1;
    }

    /// Attempts that were dropped
    #[inline]
    #[must_use]
    pub fn failures(&self) -> u64 {
        u64::from(self.attempted) - self.samples
    }
}

/// Averages of the most recent batch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    /// Mean response time (ms)
    pub avg_response_time: f64,
    /// Mean token count
    pub avg_tokens: f64,
    /// Mean cost
    pub avg_cost: f64,
}

/// Running aggregate for one arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmResult {
    /// Configuration exercised by this arm
    pub config_id: ConfigId,
    /// Exactly one arm per experiment has this set
    pub is_control: bool,
    sample_count: u64,
    success_count: u64,
    success_rate: f64,
    response_time: RunningMean,
    tokens: RunningMean,
    cost: RunningMean,
    total_cost: f64,
    /// Set by the significance evaluator
    pub p_value: Option<f64>,
    /// Set by the significance evaluator
    pub confidence_level: Option<f64>,
    execution_ids: BTreeMap<String, Vec<String>>,
    last_batch: Option<BatchSnapshot>,
}

impl ArmResult {
    /// Zeroed arm
    #[must_use]
    pub fn new(config_id: ConfigId, is_control: bool) -> Self {
        Self {
            config_id,
            is_control,
            sample_count: 0,
            success_count: 0,
            success_rate: 0.0,
            response_time: RunningMean::default(),
            tokens: RunningMean::default(),
            cost: RunningMean::default(),
            total_cost: 0.0,
            p_value: None,
            confidence_level: None,
            execution_ids: BTreeMap::new(),
            last_batch: None,
        }
    }

    /// Samples collected
    #[inline]
    #[must_use]
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Samples classified successful
    #[inline]
    #[must_use]
    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    /// Success percentage (0-100)
    #[inline]
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        self.success_rate
    }

    /// Mean response time (ms)
    #[inline]
    #[must_use]
    pub fn average_response_time(&self) -> f64 {
        self.response_time.mean()
    }

    /// Mean token count
    #[inline]
    #[must_use]
    pub fn average_tokens(&self) -> f64 {
        self.tokens.mean()
    }

    /// Mean cost
    #[inline]
    #[must_use]
    pub fn average_cost(&self) -> f64 {
        self.cost.mean()
    }

    /// Sum of all sample costs
    #[inline]
    #[must_use]
    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    /// Execution references keyed by batch
    #[inline]
    #[must_use]
    pub fn execution_ids(&self) -> &BTreeMap<String, Vec<String>> {
        &self.execution_ids
    }

    /// Averages of the latest batch
    #[inline]
    #[must_use]
    pub fn last_batch(&self) -> Option<&BatchSnapshot> {
        self.last_batch.as_ref()
    }

    /// Fold a batch into a new aggregate
    ///
    /// A batch in which every call failed leaves the arm unchanged.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fold(&self, batch: &BatchTotals) -> Self {
        if batch.samples == 0 {
            return self.clone();
        }

        let mut next = self.clone();
        next.sample_count += batch.samples;
        next.success_count += batch.successes;
        next.success_rate = next.success_count as f64 / next.sample_count as f64 * 100.0;

        next.response_time = self.response_time.fold(batch.samples, batch.response_time_sum);
        next.tokens = self.tokens.fold(batch.samples, batch.token_sum);
        next.cost = self.cost.fold(batch.samples, batch.cost_sum);
        next.total_cost += batch.cost_sum;

        let n = batch.samples as f64;
        next.last_batch = Some(BatchSnapshot {
            avg_response_time: batch.response_time_sum / n,
            avg_tokens: batch.token_sum / n,
            avg_cost: batch.cost_sum / n,
        });

        let key = format!("batch_{}", self.execution_ids.len() + 1);
        next.execution_ids.insert(key, batch.execution_ids.clone());
        next
    }

    /// Check the count invariant
    #[inline]
    #[must_use]
    pub fn counts_consistent(&self) -> bool {
        self.success_count <= self.sample_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn outcome(ms: u64, tokens: u64, cost: f64, id: &str) -> SampleOutcome {
        SampleOutcome::new(true)
            .with_response_time(ms)
            .with_tokens(tokens)
            .with_cost(cost)
            .with_execution_id(id)
    }

    #[test]
    fn running_mean_folds_incrementally() {
        let mean = RunningMean::default().fold(2, 10.0).fold(3, 30.0);
        assert_eq!(mean.count(), 5);
        assert!((mean.mean() - 8.0).abs() < 1e-12);
    }

    #[test]
    fn running_mean_ignores_empty_batch() {
        let mean = RunningMean::default().fold(4, 8.0);
        assert_eq!(mean.fold(0, 100.0), mean);
    }

    #[test]
    fn fold_updates_counts_rate_and_averages() {
        let mut batch = BatchTotals::default();
        batch.record(&outcome(100, 10, 0.002, "e1"), true);
        batch.record(&outcome(300, 30, 0.004, "e2"), false);
        batch.record_failure();

        let arm = ArmResult::new(ConfigId::new("cfg-a"), true).fold(&batch);

        assert_eq!(arm.sample_count(), 2);
        assert_eq!(arm.success_count(), 1);
        assert!((arm.success_rate() - 50.0).abs() < 1e-12);
        assert!((arm.average_response_time() - 200.0).abs() < 1e-12);
        assert!((arm.average_tokens() - 20.0).abs() < 1e-12);
        assert!((arm.average_cost() - 0.003).abs() < 1e-12);
        assert!((arm.total_cost() - 0.006).abs() < 1e-12);
        assert_eq!(batch.failures(), 1);
        assert_eq!(
            arm.execution_ids().get("batch_1"),
            Some(&vec!["e1".to_string(), "e2".to_string()])
        );
    }

    #[test]
    fn second_batch_gets_new_key_and_weighted_average() {
        let mut first = BatchTotals::default();
        first.record(&outcome(100, 0, 0.0, "a"), true);
        let mut second = BatchTotals::default();
        second.record(&outcome(400, 0, 0.0, "b"), true);
        second.record(&outcome(400, 0, 0.0, "c"), true);

        let arm = ArmResult::new(ConfigId::new("cfg"), false)
            .fold(&first)
            .fold(&second);

        assert!((arm.average_response_time() - 300.0).abs() < 1e-12);
        assert!(arm.execution_ids().contains_key("batch_2"));
        let last = arm.last_batch().unwrap();
        assert!((last.avg_response_time - 400.0).abs() < 1e-12);
    }

    #[test]
    fn all_failed_batch_leaves_arm_unchanged() {
        let mut batch = BatchTotals::default();
        for _ in 0..5 {
            batch.record_failure();
        }
        let arm = ArmResult::new(ConfigId::new("cfg"), true);
        assert_eq!(arm.fold(&batch), arm);
    }

    proptest! {
        #[test]
        fn prop_fold_keeps_counts_consistent(
            batches in prop::collection::vec(
                prop::collection::vec((any::<bool>(), any::<bool>(), 0u64..5000), 0..12),
                1..8,
            )
        ) {
            let mut arm = ArmResult::new(ConfigId::new("cfg"), true);
            for batch_spec in batches {
                let mut batch = BatchTotals::default();
                for (completed, success, ms) in batch_spec {
                    if completed {
                        batch.record(&SampleOutcome::new(success).with_response_time(ms), success);
                    } else {
                        batch.record_failure();
                    }
                }
                let previous = arm.sample_count();
                arm = arm.fold(&batch);
                prop_assert!(arm.counts_consistent());
                prop_assert!(arm.sample_count() >= previous);
                prop_assert_eq!(arm.sample_count() - previous, batch.samples);
            }
        }

        #[test]
        fn prop_running_mean_matches_direct_mean(values in prop::collection::vec(0u32..10_000, 1..40), split in 0usize..40) {
            let split = split.min(values.len());
            let (head, tail) = values.split_at(split);
            let sum = |xs: &[u32]| xs.iter().map(|&x| f64::from(x)).sum::<f64>();
            let mean = RunningMean::default()
                .fold(head.len() as u64, sum(head))
                .fold(tail.len() as u64, sum(tail));
            let direct = sum(&values) / values.len() as f64;
            prop_assert!((mean.mean() - direct).abs() < 1e-6);
        }
    }
}
