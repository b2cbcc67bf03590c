//! Excel reader backed by calamine.
//!
//! Workbooks cannot be read a page at a time, so every call decodes the first
//! worksheet in full. The registry keeps the result around to avoid repeating that.

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use calamine::{open_workbook_auto, Data, Reader};
use tracing::debug;

use super::{page_bounds, StorageHandle, TableReader};
use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Default)]
pub struct ExcelTableReader;

impl ExcelTableReader {
    pub fn new() -> Self {
        Self
    }
}

fn numeric_cell(cell: &Data) -> Option<f64> {
    match cell {
        Data::Int(value) => Some(*value as f64),
        Data::Float(value) => Some(*value),
        _ => None,
    }
}

fn is_blank(cell: &Data) -> bool {
    match cell {
        Data::Empty | Data::Error(_) => true,
        Data::String(value) => value.trim().is_empty(),
        _ => false,
    }
}

fn header_name(cell: Option<&Data>, index: usize) -> String {
    match cell {
        Some(cell) if !is_blank(cell) => cell.to_string().trim().to_string(),
        _ => format!("Column_{}", index + 1),
    }
}

/// Builds one Arrow column from a worksheet column.
///
/// A column whose non-blank cells are all numbers becomes Float64, anything
/// else is rendered as text.
fn build_column(cells: &[Option<&Data>]) -> (DataType, ArrayRef) {
    let numeric = cells
        .iter()
        .flatten()
        .filter(|cell| !is_blank(cell))
        .all(|cell| numeric_cell(cell).is_some());

    if numeric {
        let values: Float64Array = cells
            .iter()
            .map(|cell| cell.and_then(numeric_cell))
            .collect();
        (DataType::Float64, Arc::new(values))
    } else {
        let values: StringArray = cells
            .iter()
            .map(|cell| match cell {
                Some(cell) if !is_blank(cell) => Some(cell.to_string()),
                _ => None,
            })
            .collect();
        (DataType::Utf8, Arc::new(values))
    }
}

impl TableReader for ExcelTableReader {
    fn read_schema(&self, handle: &StorageHandle) -> Result<SchemaRef> {
        Ok(self.read_full(handle)?.schema())
    }

    fn count_rows(&self, handle: &StorageHandle) -> Result<usize> {
        Ok(self.read_full(handle)?.num_rows())
    }

    fn read_page(
        &self,
        handle: &StorageHandle,
        _schema: &SchemaRef,
        page: usize,
        page_size: usize,
    ) -> Result<RecordBatch> {
        let table = self.read_full(handle)?;
        let (start, end) = page_bounds(page, page_size, table.num_rows());
        Ok(table.slice(start, end - start))
    }

    fn read_full(&self, handle: &StorageHandle) -> Result<RecordBatch> {
        handle.metadata()?;
        let mut workbook = open_workbook_auto(handle.path())
            .map_err(|e| SessionError::invalid_input(format!("unreadable workbook: {e}")))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| SessionError::invalid_input("workbook has no worksheets"))?
            .map_err(|e| SessionError::invalid_input(format!("unreadable worksheet: {e}")))?;

        let mut rows = range.rows();
        let Some(header) = rows.next() else {
            return Err(SessionError::invalid_input("worksheet is empty"));
        };
        let body: Vec<&[Data]> = rows.collect();

        let mut fields = Vec::with_capacity(header.len());
        let mut columns = Vec::with_capacity(header.len());
        for index in 0..header.len() {
            let cells: Vec<Option<&Data>> = body.iter().map(|row| row.get(index)).collect();
            let (data_type, column) = build_column(&cells);
            fields.push(Field::new(header_name(header.get(index), index), data_type, true));
            columns.push(column);
        }

        debug!(
            path = %handle.path().display(),
            rows = body.len(),
            columns = fields.len(),
            "Read Excel worksheet"
        );

        let options = RecordBatchOptions::new().with_row_count(Some(body.len()));
        Ok(RecordBatch::try_new_with_options(
            Arc::new(Schema::new(fields)),
            columns,
            &options,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::Float64Type;

    #[test]
    fn test_numeric_column_detection() {
        let one = Data::Int(1);
        let half = Data::Float(0.5);
        let empty = Data::Empty;
        let cells = vec![Some(&one), Some(&half), Some(&empty), None];

        let (data_type, column) = build_column(&cells);
        assert_eq!(data_type, DataType::Float64);
        let values = column.as_primitive::<Float64Type>();
        assert_eq!(values.value(0), 1.0);
        assert_eq!(values.value(1), 0.5);
        assert!(values.is_null(2));
        assert!(values.is_null(3));
    }

    #[test]
    fn test_mixed_column_becomes_text() {
        let one = Data::Int(1);
        let text = Data::String("n/a".to_string());
        let blank = Data::String("   ".to_string());
        let cells = vec![Some(&one), Some(&text), Some(&blank)];

        let (data_type, column) = build_column(&cells);
        assert_eq!(data_type, DataType::Utf8);
        let values = column.as_string::<i32>();
        assert_eq!(values.value(0), "1");
        assert_eq!(values.value(1), "n/a");
        assert!(values.is_null(2));
    }

    #[test]
    fn test_blank_headers_get_positional_names() {
        let name = Data::String("Region".to_string());
        let empty = Data::Empty;
        assert_eq!(header_name(Some(&name), 0), "Region");
        assert_eq!(header_name(Some(&empty), 1), "Column_2");
        assert_eq!(header_name(None, 4), "Column_5");
    }

    #[test]
    fn test_missing_workbook_is_storage_unavailable() {
        let handle = StorageHandle::new("/nonexistent/report.xlsx").unwrap();
        assert!(matches!(
            ExcelTableReader::new().read_full(&handle),
            Err(SessionError::StorageUnavailable { .. })
        ));
    }

    #[test]
    fn test_corrupt_workbook_is_invalid_input() {
        let file = tempfile::Builder::new().suffix(".xlsx").tempfile().unwrap();
        std::fs::write(file.path(), b"definitely not a zip archive").unwrap();
        let handle = StorageHandle::new(file.path()).unwrap();

        assert!(matches!(
            ExcelTableReader::new().read_full(&handle),
            Err(SessionError::InvalidInput { .. })
        ));
    }
}
