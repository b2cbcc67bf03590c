//! Registry of uploaded datasets and their page reads.
//!
//! Each dataset gets a stable id derived from its backing file, so the same
//! unchanged file always maps to the same entry. The registry map lock only
//! guards lookups and mutations of the map itself; every file read happens after
//! the dataset's `Arc` has been cloned out of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, UNIX_EPOCH};

use arrow::datatypes::SchemaRef;
use arrow::json::writer::JsonArray;
use arrow::json::WriterBuilder;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::clock::{system_clock, Clock};
use crate::error::{Result, SessionError};
use crate::log_data_op;
use crate::logging::LogConfig;
use crate::security::validate_dataset_id;
use crate::sources::{page_bounds, SourceKind, StorageHandle, TableReader, TextEncoding};
use crate::stats::IncrementalStatsEngine;

/// Width of a dataset id in hex characters.
pub const DATASET_ID_LEN: usize = 16;

/// Computes the dataset id for a backing file.
///
/// The id hashes the path, byte size and modification time, so it changes
/// whenever the file content is replaced.
pub fn dataset_id_for(handle: &StorageHandle) -> Result<String> {
    let metadata = handle.metadata()?;
    let modified_nanos = metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |since_epoch| since_epoch.as_nanos());

    let fingerprint = format!(
        "{}:{}:{}",
        handle.path().display(),
        metadata.len(),
        modified_nanos
    );
    let digest = hex::encode(Sha256::digest(fingerprint.as_bytes()));
    Ok(digest[..DATASET_ID_LEN].to_string())
}

/// A registered dataset.
#[derive(Debug)]
pub struct Dataset {
    id: String,
    handle: StorageHandle,
    schema: SchemaRef,
    total_rows: usize,
    created_at: Instant,
    created_at_utc: DateTime<Utc>,
    /// Full table kept for formats that are expensive to re-read.
    materialized: Mutex<Option<Arc<RecordBatch>>>,
}

impl Dataset {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> &StorageHandle {
        &self.handle
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn columns(&self) -> Vec<String> {
        self.schema
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect()
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn snapshot(&self) -> Option<Arc<RecordBatch>> {
        self.materialized
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_snapshot(&self, table: Arc<RecordBatch>) {
        *self
            .materialized
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(table);
    }

    pub fn is_materialized(&self) -> bool {
        self.snapshot().is_some()
    }
}

/// Public description of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetInfo {
    pub dataset_id: String,
    pub kind: SourceKind,
    pub encoding: TextEncoding,
    pub path: String,
    pub columns: Vec<String>,
    pub total_rows: usize,
    pub created_at: DateTime<Utc>,
    pub materialized: bool,
}

/// One page of rows read from a dataset.
#[derive(Debug, Clone)]
pub struct PageData {
    pub page: usize,
    pub page_size: usize,
    pub columns: Vec<String>,
    pub batch: RecordBatch,
}

impl PageData {
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    /// Renders the rows as JSON objects keyed by column name, nulls included.
    pub fn to_json_rows(&self) -> Result<Vec<Map<String, Value>>> {
        if self.batch.num_rows() == 0 {
            return Ok(Vec::new());
        }

        let mut writer = WriterBuilder::new()
            .with_explicit_nulls(true)
            .build::<_, JsonArray>(Vec::new());
        writer.write(&self.batch)?;
        writer.finish()?;
        let buffer = writer.into_inner();

        serde_json::from_slice(&buffer)
            .map_err(|e| SessionError::internal(format!("page rows are not valid JSON: {e}")))
    }
}

/// Tracks datasets by id and serves their pages.
#[derive(Debug)]
pub struct DatasetRegistry {
    datasets: RwLock<HashMap<String, Arc<Dataset>>>,
    reader: Arc<dyn TableReader>,
    clock: Arc<dyn Clock>,
    materialize: bool,
    log: LogConfig,
}

impl DatasetRegistry {
    pub fn new(reader: Arc<dyn TableReader>) -> Self {
        Self::with_clock(reader, system_clock())
    }

    pub fn with_clock(reader: Arc<dyn TableReader>, clock: Arc<dyn Clock>) -> Self {
        Self {
            datasets: RwLock::new(HashMap::new()),
            reader,
            clock,
            materialize: true,
            log: LogConfig::default(),
        }
    }

    /// Whether Excel/PDF datasets keep their full table in memory.
    pub fn with_materialization(mut self, enabled: bool) -> Self {
        self.materialize = enabled;
        self
    }

    pub fn with_log_config(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Dataset>>> {
        self.datasets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Dataset>>> {
        self.datasets.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a dataset. Malformed ids are rejected before the lookup.
    pub fn get(&self, dataset_id: &str) -> Result<Arc<Dataset>> {
        validate_dataset_id(dataset_id)?;
        self.read_map()
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound {
                dataset_id: dataset_id.to_string(),
            })
    }

    pub fn contains(&self, dataset_id: &str) -> bool {
        self.read_map().contains_key(dataset_id)
    }

    /// Records a dataset whose shape is already known.
    ///
    /// `materialized` is ignored for CSV, which is always re-read per page.
    pub fn register(
        &self,
        handle: StorageHandle,
        schema: SchemaRef,
        total_rows: usize,
        materialized: Option<RecordBatch>,
    ) -> Result<String> {
        let id = dataset_id_for(&handle)?;
        let retained = match handle.kind() {
            SourceKind::Csv => None,
            _ if self.materialize => materialized.map(Arc::new),
            _ => None,
        };

        let dataset = Arc::new(Dataset {
            id: id.clone(),
            handle,
            schema,
            total_rows,
            created_at: self.clock.now(),
            created_at_utc: Utc::now(),
            materialized: Mutex::new(retained),
        });

        log_data_op!(
            self.log,
            dataset_id = %id,
            kind = %dataset.handle.kind(),
            total_rows,
            columns = dataset.schema.fields().len(),
            "Registered dataset"
        );
        if self.write_map().insert(id.clone(), dataset).is_some() {
            debug!(dataset_id = %id, "Replaced existing registration for unchanged file");
        }
        Ok(id)
    }

    /// Probes a file through the reader and registers it.
    ///
    /// Excel and PDF tables are read in full once and, when materialization is
    /// enabled, kept for paging. CSV only has its encoding detected, its schema
    /// inferred and its rows counted.
    #[instrument(skip(self, handle), fields(path = %handle.path().display(), kind = %handle.kind()))]
    pub fn register_source(&self, handle: StorageHandle) -> Result<String> {
        let encoding = self.reader.resolve_encoding(&handle)?;
        let handle = handle.with_encoding(encoding);
        if handle.kind().prefers_materialization() {
            let table = self.reader.read_full(&handle)?;
            let (schema, total_rows) = (table.schema(), table.num_rows());
            self.register(handle, schema, total_rows, Some(table))
        } else {
            let schema = self.reader.read_schema(&handle)?;
            let total_rows = self.reader.count_rows(&handle)?;
            self.register(handle, schema, total_rows, None)
        }
    }

    /// Reads one page of a dataset.
    ///
    /// `page` is 1-based. Pages past the last row come back empty.
    pub fn fetch_page(&self, dataset_id: &str, page: usize, page_size: usize) -> Result<PageData> {
        if page == 0 || page_size == 0 {
            return Err(SessionError::invalid_input(
                "page and page_size must be positive",
            ));
        }
        let dataset = self.get(dataset_id)?;
        let (start, end) = page_bounds(page, page_size, dataset.total_rows);

        let batch = if start >= end {
            RecordBatch::new_empty(dataset.schema.clone())
        } else if dataset.handle.kind().prefers_materialization() && self.materialize {
            let table = match dataset.snapshot() {
                Some(table) => table,
                None => {
                    let table = Arc::new(self.reader.read_full(&dataset.handle)?);
                    dataset.store_snapshot(Arc::clone(&table));
                    table
                }
            };
            let (start, end) = page_bounds(page, page_size, table.num_rows());
            table.slice(start, end - start)
        } else {
            self.reader
                .read_page(&dataset.handle, &dataset.schema, page, page_size)?
        };

        debug!(dataset_id, page, page_size, rows = batch.num_rows(), "Fetched page");
        Ok(PageData {
            page,
            page_size,
            columns: dataset.columns(),
            batch,
        })
    }

    pub fn total_rows(&self, dataset_id: &str) -> Result<usize> {
        Ok(self.get(dataset_id)?.total_rows)
    }

    pub fn columns(&self, dataset_id: &str) -> Result<Vec<String>> {
        Ok(self.get(dataset_id)?.columns())
    }

    pub fn info(&self, dataset_id: &str) -> Result<DatasetInfo> {
        let dataset = self.get(dataset_id)?;
        Ok(DatasetInfo {
            dataset_id: dataset.id.clone(),
            kind: dataset.handle.kind(),
            encoding: dataset.handle.encoding(),
            path: dataset.handle.path().display().to_string(),
            columns: dataset.columns(),
            total_rows: dataset.total_rows,
            created_at: dataset.created_at_utc,
            materialized: dataset.is_materialized(),
        })
    }

    /// Removes one dataset, releasing its storage and aggregate.
    pub fn evict(&self, dataset_id: &str, stats: &IncrementalStatsEngine) -> bool {
        let removed = self.write_map().remove(dataset_id);
        match removed {
            Some(dataset) => {
                self.release(&dataset, stats);
                true
            }
            None => false,
        }
    }

    /// Removes every dataset older than `max_age` and returns their ids.
    ///
    /// Storage release failures are logged and do not stop the remaining evictions.
    pub fn evict_older_than(
        &self,
        max_age: Duration,
        stats: &IncrementalStatsEngine,
    ) -> Vec<String> {
        let now = self.clock.now();
        let expired: Vec<Arc<Dataset>> = {
            let mut datasets = self.write_map();
            let ids: Vec<String> = datasets
                .values()
                .filter(|dataset| now.saturating_duration_since(dataset.created_at) > max_age)
                .map(|dataset| dataset.id.clone())
                .collect();
            ids.iter().filter_map(|id| datasets.remove(id)).collect()
        };

        expired
            .iter()
            .map(|dataset| {
                self.release(dataset, stats);
                dataset.id.clone()
            })
            .collect()
    }

    fn release(&self, dataset: &Dataset, stats: &IncrementalStatsEngine) {
        stats.clear(&dataset.id);
        match dataset.handle.release() {
            Ok(true) => {
                debug!(dataset_id = %dataset.id, "Deleted uploaded file");
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    dataset_id = %dataset.id,
                    path = %dataset.handle.path().display(),
                    error = %e,
                    "Failed to delete uploaded file"
                );
            }
        }
        log_data_op!(self.log, dataset_id = %dataset.id, "Evicted dataset");
    }

    pub fn ids(&self) -> Vec<String> {
        self.read_map().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
