//! Table readers for uploaded files.
//!
//! The registry talks to storage only through [`TableReader`]. The bundled
//! [`FileTableReader`] handles CSV and Excel files; PDF table extraction is left
//! to an external reader plugged in through the same trait.

use std::fmt::Debug;
use std::fs::{File, Metadata};
use std::path::{Path, PathBuf};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

mod csv;
mod excel;

pub use self::csv::{count_csv_rows, detect_encoding, CsvTableReader};
pub use self::excel::ExcelTableReader;

/// File formats a dataset can be backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Csv,
    Excel,
    PdfTable,
}

impl SourceKind {
    /// Detects the kind from the file extension, case-insensitively.
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_lowercase();
        match extension.as_str() {
            "csv" => Some(Self::Csv),
            "xlsx" | "xls" | "xlsm" | "xlsb" => Some(Self::Excel),
            "pdf" => Some(Self::PdfTable),
            _ => None,
        }
    }

    /// Whether re-reading a single page is expensive enough to keep the full table.
    pub fn prefers_materialization(&self) -> bool {
        matches!(self, Self::Excel | Self::PdfTable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Excel => "excel",
            Self::PdfTable => "pdf_table",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Character encoding of a text source.
///
/// Files that are not valid UTF-8 are read as Windows-1251, the usual legacy
/// export encoding for Cyrillic spreadsheets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    #[default]
    Utf8,
    Windows1251,
}

/// Location and format of a dataset's backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHandle {
    path: PathBuf,
    kind: SourceKind,
    encoding: TextEncoding,
    ephemeral: bool,
}

impl StorageHandle {
    /// Creates a handle, detecting the kind from the extension.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let kind = SourceKind::from_path(&path).ok_or_else(|| {
            SessionError::invalid_input(format!(
                "unsupported file type '{}', expected csv, xlsx, xls or pdf",
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .unwrap_or_default()
            ))
        })?;
        Ok(Self::with_kind(path, kind))
    }

    pub fn with_kind(path: impl Into<PathBuf>, kind: SourceKind) -> Self {
        Self {
            path: path.into(),
            kind,
            encoding: TextEncoding::default(),
            ephemeral: false,
        }
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Marks the file as an upload owned by the session; it is deleted on eviction.
    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Filesystem metadata, or `StorageUnavailable` if the file is gone.
    pub fn metadata(&self) -> Result<Metadata> {
        std::fs::metadata(&self.path).map_err(|e| SessionError::storage(&self.path, e.to_string()))
    }

    pub(crate) fn open(&self) -> Result<File> {
        File::open(&self.path).map_err(|e| SessionError::storage(&self.path, e.to_string()))
    }

    /// Deletes the backing file if the session owns it.
    ///
    /// Returns `Ok(false)` for files the session does not own and for files that
    /// are already gone.
    pub fn release(&self) -> std::io::Result<bool> {
        if !self.ephemeral {
            return Ok(false);
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Reads tables out of storage.
///
/// Implementations do blocking I/O; callers run them off the async executor.
/// `page` is 1-based and a page past the end yields an empty batch.
pub trait TableReader: Debug + Send + Sync {
    /// Column names and types.
    fn read_schema(&self, handle: &StorageHandle) -> Result<SchemaRef>;

    /// Number of data rows, header excluded.
    fn count_rows(&self, handle: &StorageHandle) -> Result<usize>;

    /// Reads rows `[(page - 1) * page_size, page * page_size)`.
    fn read_page(
        &self,
        handle: &StorageHandle,
        schema: &SchemaRef,
        page: usize,
        page_size: usize,
    ) -> Result<RecordBatch>;

    /// Reads the whole table into memory.
    fn read_full(&self, handle: &StorageHandle) -> Result<RecordBatch>;

    /// Text encoding to read `handle` with. Binary formats keep the handle's own.
    fn resolve_encoding(&self, handle: &StorageHandle) -> Result<TextEncoding> {
        Ok(handle.encoding())
    }
}

/// Reader for local CSV and Excel files.
#[derive(Debug, Clone, Default)]
pub struct FileTableReader {
    csv: CsvTableReader,
    excel: ExcelTableReader,
}

impl FileTableReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits CSV schema inference to the first `records` rows.
    ///
    /// Without a limit, registering a CSV parses the whole file once to infer
    /// column types, on top of the byte scan that counts rows. A limit makes
    /// uploads of large files cheaper, but a column whose values change type
    /// after the first `records` rows (say, integers followed by `n/a`) is then
    /// typed from the prefix alone and pages past that point fail to decode.
    /// No limit is set by default.
    pub fn with_csv_infer_limit(mut self, records: usize) -> Self {
        self.csv = self.csv.with_infer_limit(records);
        self
    }

    fn delegate(&self, handle: &StorageHandle) -> Result<&dyn TableReader> {
        match handle.kind() {
            SourceKind::Csv => Ok(&self.csv),
            SourceKind::Excel => Ok(&self.excel),
            SourceKind::PdfTable => Err(SessionError::invalid_input(
                "PDF tables need an external extraction reader",
            )),
        }
    }
}

impl TableReader for FileTableReader {
    fn read_schema(&self, handle: &StorageHandle) -> Result<SchemaRef> {
        self.delegate(handle)?.read_schema(handle)
    }

    fn count_rows(&self, handle: &StorageHandle) -> Result<usize> {
        self.delegate(handle)?.count_rows(handle)
    }

    fn read_page(
        &self,
        handle: &StorageHandle,
        schema: &SchemaRef,
        page: usize,
        page_size: usize,
    ) -> Result<RecordBatch> {
        self.delegate(handle)?
            .read_page(handle, schema, page, page_size)
    }

    fn read_full(&self, handle: &StorageHandle) -> Result<RecordBatch> {
        self.delegate(handle)?.read_full(handle)
    }

    fn resolve_encoding(&self, handle: &StorageHandle) -> Result<TextEncoding> {
        self.delegate(handle)?.resolve_encoding(handle)
    }
}

/// Row range covered by a 1-based page, clamped to `total_rows`.
pub(crate) fn page_bounds(page: usize, page_size: usize, total_rows: usize) -> (usize, usize) {
    let start = page
        .saturating_sub(1)
        .saturating_mul(page_size)
        .min(total_rows);
    let end = start.saturating_add(page_size).min(total_rows);
    (start, end)
}
