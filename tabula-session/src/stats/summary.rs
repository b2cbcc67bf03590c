//! Per-page column summaries computed from Arrow record batches.

use std::collections::HashSet;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type};
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use tracing::warn;

use super::types::NumericStats;

/// Summary of one column within one page.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnSummary {
    /// Stats over the page's non-missing, non-NaN values.
    Numeric(NumericStats),
    /// Every distinct non-missing value in order of first appearance.
    Categorical(Vec<String>),
}

/// Column summaries for a single page, computed without touching engine state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageSummary {
    rows: usize,
    columns: Vec<(String, ColumnSummary)>,
}

impl PageSummary {
    /// Summarizes every column of `batch`.
    ///
    /// Never fails: a column that cannot be decoded contributes no values.
    pub fn from_batch(batch: &RecordBatch) -> Self {
        let schema = batch.schema();
        let columns = schema
            .fields()
            .iter()
            .zip(batch.columns())
            .map(|(field, array)| {
                let summary = if field.data_type().is_numeric() {
                    ColumnSummary::Numeric(summarize_numeric(field.name(), array))
                } else {
                    ColumnSummary::Categorical(summarize_categorical(field.name(), array))
                };
                (field.name().clone(), summary)
            })
            .collect();

        Self {
            rows: batch.num_rows(),
            columns,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> &[(String, ColumnSummary)] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSummary> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, summary)| summary)
    }
}

fn summarize_numeric(column: &str, array: &ArrayRef) -> NumericStats {
    let floats = match cast(array, &DataType::Float64) {
        Ok(floats) => floats,
        Err(e) => {
            warn!(column, error = %e, "Numeric column could not be widened, skipping");
            return NumericStats::default();
        }
    };

    NumericStats::from_values(
        floats
            .as_primitive::<Float64Type>()
            .iter()
            .flatten()
            .filter(|value| !value.is_nan()),
    )
}

fn summarize_categorical(column: &str, array: &ArrayRef) -> Vec<String> {
    let formatter = match ArrayFormatter::try_new(array.as_ref(), &FormatOptions::default()) {
        Ok(formatter) => formatter,
        Err(e) => {
            warn!(column, error = %e, "Column values could not be rendered, skipping");
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut distinct = Vec::new();
    for row in 0..array.len() {
        if array.is_null(row) {
            continue;
        }
        let value = formatter.value(row).to_string();
        // Blank cells count as missing, matching how the CSV reader treats them.
        if value.trim().is_empty() {
            continue;
        }
        if seen.insert(value.clone()) {
            distinct.push(value);
        }
    }
    distinct
}
