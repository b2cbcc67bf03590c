//! CSV reader with positioned page reads.
//!
//! Rows may be shorter than the header; missing trailing fields read as nulls.
//! Files that are not valid UTF-8 are transcoded from Windows-1251 on the fly.

use std::io::{BufReader, Read};
use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use encoding_rs::{DecoderResult, UTF_8, WINDOWS_1251};
use encoding_rs_io::DecodeReaderBytesBuilder;
use tracing::{debug, warn};

use super::{StorageHandle, TableReader, TextEncoding};
use crate::error::{Result, SessionError};

const SCAN_CHUNK_BYTES: usize = 64 * 1024;
const MAX_BATCH_ROWS: usize = 8192;

/// Counts data rows in a CSV stream by scanning for newlines.
///
/// A trailing line without a newline still counts, and the header line is
/// subtracted. Quoted fields containing newlines are over-counted; the figure
/// is meant for pagination, not for exact record counts.
pub fn count_csv_rows<R: Read>(mut reader: R) -> std::io::Result<usize> {
    let mut buffer = vec![0u8; SCAN_CHUNK_BYTES];
    let mut lines = 0usize;
    let mut last_byte = None;

    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let chunk = &buffer[..read];
        lines += chunk.iter().filter(|&&byte| byte == b'\n').count();
        last_byte = chunk.last().copied();
    }

    if matches!(last_byte, Some(byte) if byte != b'\n') {
        lines += 1;
    }
    Ok(lines.saturating_sub(1))
}

/// Detects whether a stream is UTF-8 or needs the Windows-1251 fallback.
///
/// The whole stream is validated, so a single stray byte near the end still
/// switches the file to Windows-1251.
pub fn detect_encoding<R: Read>(mut reader: R) -> std::io::Result<TextEncoding> {
    let mut decoder = UTF_8.new_decoder_without_bom_handling();
    let mut input = vec![0u8; SCAN_CHUNK_BYTES];
    let mut output = vec![0u8; SCAN_CHUNK_BYTES];

    loop {
        let read = match reader.read(&mut input) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let last = read == 0;
        let mut pending = &input[..read];
        loop {
            let (result, consumed, _) =
                decoder.decode_to_utf8_without_replacement(pending, &mut output, last);
            pending = &pending[consumed..];
            match result {
                DecoderResult::InputEmpty => break,
                DecoderResult::OutputFull => continue,
                DecoderResult::Malformed(..) => return Ok(TextEncoding::Windows1251),
            }
        }
        if last {
            return Ok(TextEncoding::Utf8);
        }
    }
}

/// Opens a CSV file as UTF-8 text.
fn open_text(handle: &StorageHandle) -> Result<BufReader<Box<dyn Read>>> {
    let file = handle.open()?;
    let reader: Box<dyn Read> = match handle.encoding() {
        TextEncoding::Utf8 => Box::new(file),
        TextEncoding::Windows1251 => Box::new(
            DecodeReaderBytesBuilder::new()
                .encoding(Some(WINDOWS_1251))
                .build(file),
        ),
    };
    Ok(BufReader::new(reader))
}

/// Reads CSV files with a header row.
///
/// Pages are decoded straight from disk on every request, so memory use is
/// bounded by the page size rather than the file size.
#[derive(Debug, Clone, Default)]
pub struct CsvTableReader {
    infer_limit: Option<usize>,
}

impl CsvTableReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Infers the schema from at most `records` rows instead of the whole file.
    ///
    /// Values past the limit that do not fit the inferred type fail to decode
    /// when their page is read.
    pub fn with_infer_limit(mut self, records: usize) -> Self {
        self.infer_limit = Some(records);
        self
    }

    fn read_bounded(
        &self,
        handle: &StorageHandle,
        schema: &SchemaRef,
        start: usize,
        end: usize,
    ) -> Result<RecordBatch> {
        let reader = ReaderBuilder::new(schema.clone())
            .with_header(true)
            .with_truncated_rows(true)
            .with_batch_size((end - start).clamp(1, MAX_BATCH_ROWS))
            .with_bounds(start, end)
            .build(open_text(handle)?)?;

        let batches = reader.collect::<std::result::Result<Vec<_>, ArrowError>>()?;
        Ok(concat_batches(schema, &batches)?)
    }

    fn read_streaming(
        &self,
        handle: &StorageHandle,
        schema: &SchemaRef,
        page: usize,
        page_size: usize,
    ) -> Result<RecordBatch> {
        let mut reader = ReaderBuilder::new(schema.clone())
            .with_header(true)
            .with_truncated_rows(true)
            .with_batch_size(page_size)
            .build(open_text(handle)?)?;

        match reader.nth(page - 1) {
            Some(batch) => Ok(batch?),
            None => Ok(RecordBatch::new_empty(schema.clone())),
        }
    }
}

impl TableReader for CsvTableReader {
    fn read_schema(&self, handle: &StorageHandle) -> Result<SchemaRef> {
        let (schema, records) = Format::default()
            .with_header(true)
            .with_truncated_rows(true)
            .infer_schema(open_text(handle)?, self.infer_limit)?;

        if schema.fields().is_empty() {
            return Err(SessionError::invalid_input("CSV file has no header row"));
        }
        debug!(
            path = %handle.path().display(),
            columns = schema.fields().len(),
            records,
            encoding = ?handle.encoding(),
            "Inferred CSV schema"
        );
        Ok(Arc::new(schema))
    }

    fn count_rows(&self, handle: &StorageHandle) -> Result<usize> {
        count_csv_rows(handle.open()?).map_err(|e| SessionError::storage(handle.path(), e.to_string()))
    }

    fn read_page(
        &self,
        handle: &StorageHandle,
        schema: &SchemaRef,
        page: usize,
        page_size: usize,
    ) -> Result<RecordBatch> {
        if page == 0 || page_size == 0 {
            return Err(SessionError::invalid_input(
                "page and page_size must be positive",
            ));
        }
        let start = (page - 1).saturating_mul(page_size);
        let end = start.saturating_add(page_size);

        match self.read_bounded(handle, schema, start, end) {
            Ok(batch) => Ok(batch),
            Err(e @ SessionError::StorageUnavailable { .. }) => Err(e),
            Err(e) => {
                warn!(
                    path = %handle.path().display(),
                    page,
                    error = %e,
                    "Positioned CSV read failed, falling back to streaming"
                );
                self.read_streaming(handle, schema, page, page_size)
            }
        }
    }

    fn read_full(&self, handle: &StorageHandle) -> Result<RecordBatch> {
        let schema = self.read_schema(handle)?;
        let reader = ReaderBuilder::new(schema.clone())
            .with_header(true)
            .with_truncated_rows(true)
            .build(open_text(handle)?)?;
        let batches = reader.collect::<std::result::Result<Vec<_>, ArrowError>>()?;
        Ok(concat_batches(&schema, &batches)?)
    }

    fn resolve_encoding(&self, handle: &StorageHandle) -> Result<TextEncoding> {
        let encoding = detect_encoding(handle.open()?)
            .map_err(|e| SessionError::storage(handle.path(), e.to_string()))?;
        if encoding != TextEncoding::Utf8 {
            debug!(
                path = %handle.path().display(),
                ?encoding,
                "CSV is not UTF-8, using fallback encoding"
            );
        }
        Ok(encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::{DataType, Int64Type};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn csv_file(content: &str) -> (NamedTempFile, StorageHandle) {
        csv_bytes(content.as_bytes())
    }

    fn csv_bytes(content: &[u8]) -> (NamedTempFile, StorageHandle) {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        let handle = StorageHandle::new(file.path()).unwrap();
        (file, handle)
    }

    fn numbered_csv(rows: usize) -> String {
        let mut content = String::from("id,name\n");
        for i in 0..rows {
            content.push_str(&format!("{i},name_{i}\n"));
        }
        content
    }

    #[test]
    fn test_count_csv_rows() {
        assert_eq!(count_csv_rows("col1,col2\n1,2\n3,4\n5,6\n".as_bytes()).unwrap(), 3);
        assert_eq!(count_csv_rows("col1,col2\n1,2\n3,4\n5,6".as_bytes()).unwrap(), 3);
        assert_eq!(count_csv_rows("col1,col2\n".as_bytes()).unwrap(), 0);
        assert_eq!(count_csv_rows("col1,col2".as_bytes()).unwrap(), 0);
        assert_eq!(count_csv_rows("".as_bytes()).unwrap(), 0);
    }

    #[test]
    fn test_count_csv_rows_across_chunks() {
        let content = numbered_csv(20_000);
        assert!(content.len() > SCAN_CHUNK_BYTES);
        assert_eq!(count_csv_rows(content.as_bytes()).unwrap(), 20_000);
    }

    #[test]
    fn test_schema_inference() {
        let (_file, handle) = csv_file("id,name,score\n1,a,0.5\n2,b,1.5\n");
        let schema = CsvTableReader::new().read_schema(&handle).unwrap();

        assert_eq!(schema.fields().len(), 3);
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(2).data_type(), &DataType::Float64);
    }

    #[test]
    fn test_read_page_returns_exact_range() {
        let (_file, handle) = csv_file(&numbered_csv(25));
        let reader = CsvTableReader::new();
        let schema = reader.read_schema(&handle).unwrap();

        let page = reader.read_page(&handle, &schema, 2, 10).unwrap();
        assert_eq!(page.num_rows(), 10);
        let ids = page.column(0).as_primitive::<Int64Type>();
        assert_eq!(ids.value(0), 10);
        assert_eq!(ids.value(9), 19);

        let last = reader.read_page(&handle, &schema, 3, 10).unwrap();
        assert_eq!(last.num_rows(), 5);
        assert_eq!(last.column(0).as_primitive::<Int64Type>().value(4), 24);
    }

    #[test]
    fn test_read_page_beyond_end_is_empty() {
        let (_file, handle) = csv_file(&numbered_csv(5));
        let reader = CsvTableReader::new();
        let schema = reader.read_schema(&handle).unwrap();

        let page = reader.read_page(&handle, &schema, 9, 10).unwrap();
        assert_eq!(page.num_rows(), 0);
        assert_eq!(page.num_columns(), 2);
    }

    #[test]
    fn test_streaming_fallback_matches_positioned_read() {
        let (_file, handle) = csv_file(&numbered_csv(25));
        let reader = CsvTableReader::new();
        let schema = reader.read_schema(&handle).unwrap();

        let positioned = reader.read_bounded(&handle, &schema, 10, 20).unwrap();
        let streamed = reader.read_streaming(&handle, &schema, 2, 10).unwrap();
        assert_eq!(positioned, streamed);

        let past_end = reader.read_streaming(&handle, &schema, 5, 10).unwrap();
        assert_eq!(past_end.num_rows(), 0);
    }

    #[test]
    fn test_missing_values_become_nulls() {
        let (_file, handle) = csv_file("a,b\n1,\n,x\n3,y\n");
        let reader = CsvTableReader::new();
        let batch = reader.read_full(&handle).unwrap();

        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.column(0).null_count(), 1);
    }

    #[test]
    fn test_deleted_file_is_storage_unavailable() {
        let (file, handle) = csv_file(&numbered_csv(3));
        let reader = CsvTableReader::new();
        let schema = reader.read_schema(&handle).unwrap();
        drop(file);

        assert!(matches!(
            reader.read_page(&handle, &schema, 1, 10),
            Err(SessionError::StorageUnavailable { .. })
        ));
        assert!(matches!(
            reader.count_rows(&handle),
            Err(SessionError::StorageUnavailable { .. })
        ));
    }

    #[test]
    fn test_short_rows_fill_missing_fields_with_nulls() {
        let (_file, handle) = csv_file("a,b,c\n1,2,3\n4,5\n6,7,8\n");
        let reader = CsvTableReader::new();
        let schema = reader.read_schema(&handle).unwrap();
        assert_eq!(schema.fields().len(), 3);
        assert_eq!(schema.field(2).data_type(), &DataType::Int64);

        let page = reader.read_page(&handle, &schema, 1, 10).unwrap();
        assert_eq!(page.num_rows(), 3);
        let c = page.column(2).as_primitive::<Int64Type>();
        assert_eq!(c.value(0), 3);
        assert!(c.is_null(1));
        assert_eq!(c.value(2), 8);

        let streamed = reader.read_streaming(&handle, &schema, 1, 10).unwrap();
        assert_eq!(page, streamed);
        assert_eq!(reader.read_full(&handle).unwrap().num_rows(), 3);
    }

    #[test]
    fn test_detect_encoding() {
        assert_eq!(detect_encoding("id,name\n1,plain\n".as_bytes()).unwrap(), TextEncoding::Utf8);
        assert_eq!(detect_encoding("город\nМосква\n".as_bytes()).unwrap(), TextEncoding::Utf8);
        assert_eq!(detect_encoding(&b""[..]).unwrap(), TextEncoding::Utf8);

        let (cp1251, _, _) = WINDOWS_1251.encode("город\nМосква\n");
        assert_eq!(detect_encoding(&cp1251[..]).unwrap(), TextEncoding::Windows1251);

        // A truncated multi-byte sequence at end of input is not UTF-8.
        assert_eq!(detect_encoding(&b"ok\n\xd0"[..]).unwrap(), TextEncoding::Windows1251);
    }

    #[test]
    fn test_detect_encoding_across_chunks() {
        // Puts a two-byte character across the scan chunk boundary.
        let mut content = "x".repeat(SCAN_CHUNK_BYTES - 1);
        content.push_str("ж\n");
        assert_eq!(detect_encoding(content.as_bytes()).unwrap(), TextEncoding::Utf8);

        let mut bytes = content.into_bytes();
        bytes.push(0xff);
        assert_eq!(detect_encoding(&bytes[..]).unwrap(), TextEncoding::Windows1251);
    }

    #[test]
    fn test_windows_1251_file_is_transcoded() {
        let (content, _, _) = WINDOWS_1251.encode("город,сумма\nМосква,10\nКазань,20\n");
        let (_file, handle) = csv_bytes(&content);
        let reader = CsvTableReader::new();

        let encoding = reader.resolve_encoding(&handle).unwrap();
        assert_eq!(encoding, TextEncoding::Windows1251);
        let handle = handle.with_encoding(encoding);

        let schema = reader.read_schema(&handle).unwrap();
        assert_eq!(schema.field(0).name(), "город");
        assert_eq!(schema.field(1).data_type(), &DataType::Int64);

        let page = reader.read_page(&handle, &schema, 1, 10).unwrap();
        assert_eq!(page.num_rows(), 2);
        let cities = page.column(0).as_string::<i32>();
        assert_eq!(cities.value(0), "Москва");
        assert_eq!(cities.value(1), "Казань");
        assert_eq!(reader.count_rows(&handle).unwrap(), 2);
    }
}
