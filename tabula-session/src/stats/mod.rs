//! Incremental column statistics.
//!
//! A page is reduced to a [`PageSummary`] (numeric stats or distinct values per
//! column) and folded into the dataset's [`RunningAggregate`]. Raw rows are never
//! retained, so the aggregate stays bounded no matter how many pages are read.
//!
//! ## Merge rules
//!
//! - Numeric: sums add, min/max combine, and the mean is re-weighted by the number
//!   of values each side contributed. A page with no values for a column is a no-op.
//! - Categorical: the page's distinct values are unioned into a bounded sample and
//!   the distinct count becomes the larger of the prior count and the union size.
//! - Columns absent from a page keep their previous entry.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use arrow::array::Int64Array;
//! use arrow::datatypes::{DataType, Field, Schema};
//! use arrow::record_batch::RecordBatch;
//! use tabula_session::stats::IncrementalStatsEngine;
//!
//! let schema = Arc::new(Schema::new(vec![Field::new("amount", DataType::Int64, true)]));
//! let page = |values: Vec<i64>| {
//!     RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(values))]).unwrap()
//! };
//!
//! let engine = IncrementalStatsEngine::new();
//! engine.initialize("0123456789abcdef", &page(vec![1, 2, 3]));
//! let aggregate = engine.update("0123456789abcdef", &page(vec![10]));
//!
//! assert_eq!(aggregate.rows_seen, 4);
//! assert_eq!(aggregate.numeric("amount").unwrap().sum, 16.0);
//! ```

mod engine;
mod summary;
mod types;

pub use engine::IncrementalStatsEngine;
pub use summary::{ColumnSummary, PageSummary};
pub use types::{CategoricalStats, NumericStats, RunningAggregate, StatsConfig};
