//! Aggregate types kept per dataset.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::summary::{ColumnSummary, PageSummary};

/// Tuning for the stats engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsConfig {
    /// Maximum number of distinct sample values kept per categorical column.
    pub sample_limit: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { sample_limit: 10 }
    }
}

/// Running summary of a numeric column.
///
/// `count` is the number of non-missing values that contributed. A column with
/// `count == 0` reports zeros for every statistic.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NumericStats {
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

impl NumericStats {
    /// Builds stats from an iterator of non-missing values.
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Self {
        let mut stats = Self::default();
        for value in values {
            if stats.count == 0 {
                stats.min = value;
                stats.max = value;
            } else {
                stats.min = stats.min.min(value);
                stats.max = stats.max.max(value);
            }
            stats.sum += value;
            stats.count += 1;
        }
        if stats.count > 0 {
            stats.mean = stats.sum / stats.count as f64;
        }
        stats
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Folds a page's stats into this running summary.
    ///
    /// The mean is the count-weighted combination of both means. A page without
    /// values leaves everything untouched, and a running summary without values
    /// is replaced outright so its placeholder zeros never reach min/max.
    pub fn merge(&mut self, page: &NumericStats) {
        if page.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = *page;
            return;
        }

        let total = self.count + page.count;
        self.mean = (self.mean * self.count as f64 + page.mean * page.count as f64) / total as f64;
        self.sum += page.sum;
        self.min = self.min.min(page.min);
        self.max = self.max.max(page.max);
        self.count = total;
    }
}

/// Running summary of a non-numeric column.
///
/// `distinct_count` is a lower-bound estimate: only the sample survives between
/// pages, so values that fell out of the sample cannot be recognized again.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CategoricalStats {
    #[serde(rename = "unique_values_count")]
    pub distinct_count: u64,
    #[serde(rename = "unique_values")]
    pub sample_values: Vec<String>,
}

impl CategoricalStats {
    /// Stats for a column seen for the first time.
    pub fn from_page(distinct_values: &[String], sample_limit: usize) -> Self {
        Self {
            distinct_count: distinct_values.len() as u64,
            sample_values: distinct_values.iter().take(sample_limit).cloned().collect(),
        }
    }

    /// Unions the page's distinct values into the sample.
    pub fn merge(&mut self, distinct_values: &[String], sample_limit: usize) {
        let mut union = std::mem::take(&mut self.sample_values);
        for value in distinct_values {
            if !union.contains(value) {
                union.push(value.clone());
            }
        }

        self.distinct_count = self.distinct_count.max(union.len() as u64);
        union.truncate(sample_limit);
        self.sample_values = union;
    }
}

/// Per-dataset aggregate over every page ingested so far.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunningAggregate {
    pub rows_seen: u64,
    pub numeric_columns: BTreeMap<String, NumericStats>,
    #[serde(rename = "string_columns")]
    pub categorical_columns: BTreeMap<String, CategoricalStats>,
}

impl RunningAggregate {
    /// Fresh aggregate computed from a single page.
    pub fn from_summary(summary: &PageSummary, config: &StatsConfig) -> Self {
        let mut aggregate = Self::default();
        aggregate.merge_summary(summary, config);
        aggregate
    }

    /// Merges a page into the aggregate.
    ///
    /// Columns missing from the page keep their previous entry. A column whose
    /// kind differs from the stored one starts over with the page's stats.
    pub fn merge_summary(&mut self, summary: &PageSummary, config: &StatsConfig) {
        self.rows_seen += summary.rows() as u64;

        for (name, column) in summary.columns() {
            match column {
                ColumnSummary::Numeric(page_stats) => {
                    self.categorical_columns.remove(name);
                    match self.numeric_columns.entry(name.clone()) {
                        Entry::Occupied(mut entry) => entry.get_mut().merge(page_stats),
                        Entry::Vacant(entry) => {
                            entry.insert(*page_stats);
                        }
                    }
                }
                ColumnSummary::Categorical(distinct_values) => {
                    self.numeric_columns.remove(name);
                    match self.categorical_columns.entry(name.clone()) {
                        Entry::Occupied(mut entry) => {
                            entry.get_mut().merge(distinct_values, config.sample_limit)
                        }
                        Entry::Vacant(entry) => {
                            entry.insert(CategoricalStats::from_page(
                                distinct_values,
                                config.sample_limit,
                            ));
                        }
                    }
                }
            }
        }
    }

    pub fn numeric(&self, column: &str) -> Option<&NumericStats> {
        self.numeric_columns.get(column)
    }

    pub fn categorical(&self, column: &str) -> Option<&CategoricalStats> {
        self.categorical_columns.get(column)
    }
}
