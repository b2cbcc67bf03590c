//! Per-dataset running aggregates with a lock per dataset.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arrow::record_batch::RecordBatch;
use tracing::{debug, instrument};

use super::summary::PageSummary;
use super::types::{RunningAggregate, StatsConfig};

type Slot = Arc<Mutex<Option<RunningAggregate>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Merges page summaries into one running aggregate per dataset.
///
/// The outer map lock is only held to look up or create a dataset's slot. Each
/// slot has its own mutex, so merges for one dataset serialize without blocking
/// unrelated datasets. Page summarization happens before any lock is taken.
#[derive(Debug, Default)]
pub struct IncrementalStatsEngine {
    slots: Mutex<HashMap<String, Slot>>,
    config: StatsConfig,
}

impl IncrementalStatsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: StatsConfig) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    fn slot(&self, dataset_id: &str) -> Slot {
        lock(&self.slots)
            .entry(dataset_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, dataset_id: &str) -> Option<Slot> {
        lock(&self.slots).get(dataset_id).cloned()
    }

    /// Seeds the aggregate for `dataset_id` from `page`, replacing any prior state.
    pub fn initialize(&self, dataset_id: &str, page: &RecordBatch) -> RunningAggregate {
        self.initialize_summary(dataset_id, &PageSummary::from_batch(page))
    }

    #[instrument(skip(self, summary), fields(rows = summary.rows()))]
    pub fn initialize_summary(&self, dataset_id: &str, summary: &PageSummary) -> RunningAggregate {
        let aggregate = RunningAggregate::from_summary(summary, &self.config);
        let slot = self.slot(dataset_id);
        *lock(&slot) = Some(aggregate.clone());
        debug!(rows_seen = aggregate.rows_seen, "Initialized running aggregate");
        aggregate
    }

    /// Merges `page` into the aggregate, initializing it if none exists yet.
    pub fn update(&self, dataset_id: &str, page: &RecordBatch) -> RunningAggregate {
        self.update_summary(dataset_id, &PageSummary::from_batch(page))
    }

    #[instrument(skip(self, summary), fields(rows = summary.rows()))]
    pub fn update_summary(&self, dataset_id: &str, summary: &PageSummary) -> RunningAggregate {
        let slot = self.slot(dataset_id);
        let mut guard = lock(&slot);
        let aggregate = match guard.as_mut() {
            Some(aggregate) => {
                aggregate.merge_summary(summary, &self.config);
                aggregate.clone()
            }
            None => {
                let aggregate = RunningAggregate::from_summary(summary, &self.config);
                *guard = Some(aggregate.clone());
                aggregate
            }
        };
        debug!(rows_seen = aggregate.rows_seen, "Merged page into running aggregate");
        aggregate
    }

    /// Drops the aggregate for `dataset_id`. Unknown ids are ignored.
    pub fn clear(&self, dataset_id: &str) {
        if lock(&self.slots).remove(dataset_id).is_some() {
            debug!(dataset_id, "Cleared running aggregate");
        }
    }

    /// Keeps only aggregates whose id satisfies `keep`, returning how many were dropped.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let mut slots = lock(&self.slots);
        let before = slots.len();
        slots.retain(|id, _| keep(id));
        before - slots.len()
    }

    /// Rows merged so far, or 0 for an unknown id.
    pub fn rows_seen(&self, dataset_id: &str) -> u64 {
        self.existing_slot(dataset_id)
            .and_then(|slot| lock(&slot).as_ref().map(|aggregate| aggregate.rows_seen))
            .unwrap_or(0)
    }

    /// Snapshot of the current aggregate.
    pub fn aggregate(&self, dataset_id: &str) -> Option<RunningAggregate> {
        self.existing_slot(dataset_id)
            .and_then(|slot| lock(&slot).clone())
    }

    /// Number of datasets with a slot.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
