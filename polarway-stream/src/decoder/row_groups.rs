//! Row-group framing for ranged partition reads
//!
//! A partition is fetched footer first. Its row groups are grouped into spans
//! of at most the chunk threshold (never less than one row group), and each
//! span's column chunks are copied into a standalone Parquet file that either
//! backend decodes. A decode unit therefore holds one span, not the object.

use std::ops::Range;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use parquet::column::writer::ColumnCloseResult;
use parquet::errors::ParquetError;
use parquet::file::metadata::{ParquetMetaData, RowGroupMetaData};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{ChunkReader, FileReader, Length, SerializedFileReader};
use parquet::file::writer::SerializedFileWriter;

use super::PARQUET_MAGIC;
use crate::error::{Result, StreamError};

/// Metadata length (u32 LE) followed by the magic
pub const FOOTER_TAIL_LEN: u64 = 8;

/// Tail bytes requested by the first footer read
pub const FOOTER_PREFETCH: u64 = 64 * 1024;

/// Metadata block length announced by the last 8 bytes of an object
pub fn metadata_len(tail: &[u8]) -> Result<u64> {
    match tail {
        [a, b, c, d, magic @ ..] if magic == PARQUET_MAGIC => Ok(u64::from(u32::from_le_bytes([*a, *b, *c, *d]))),
        _ => Err(StreamError::DecodeFailure("object does not end with a Parquet footer".into())),
    }
}

/// Consecutive row groups decoded as one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowGroupSpan {
    pub row_groups: Range<usize>,
    /// Byte range of the span's column chunks in the object
    pub bytes: Range<u64>,
    pub rows: i64,
}

impl RowGroupSpan {
    pub fn byte_len(&self) -> u64 {
        self.bytes.end - self.bytes.start
    }
}

/// Parsed footer of a remote Parquet object
#[derive(Debug, Clone)]
pub struct ParquetFooter {
    object_size: u64,
    metadata: Arc<ParquetMetaData>,
}

impl ParquetFooter {
    /// Parse the last `tail.len()` bytes of an object of `object_size` bytes.
    /// `tail` must cover the metadata block and the 8-byte trailer.
    pub fn decode(object_size: u64, tail: Bytes) -> Result<Self> {
        let offset = object_size.checked_sub(tail.len() as u64).ok_or_else(|| {
            StreamError::InvalidArgument(format!("{} footer bytes for a {object_size}-byte object", tail.len()))
        })?;
        let reader = SerializedFileReader::new(FetchedRange::new(object_size, offset, tail))?;
        Ok(Self {
            object_size,
            metadata: Arc::new(reader.metadata().clone()),
        })
    }

    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    pub fn num_row_groups(&self) -> usize {
        self.metadata.num_row_groups()
    }

    pub fn num_rows(&self) -> i64 {
        self.metadata.file_metadata().num_rows()
    }

    /// Group row groups, in file order, into spans of at most `threshold` bytes.
    /// A row group larger than the threshold gets a span of its own.
    pub fn spans(&self, threshold: usize) -> Vec<RowGroupSpan> {
        let threshold = threshold.max(1) as u64;
        let mut spans: Vec<RowGroupSpan> = Vec::new();

        for (idx, group) in self.metadata.row_groups().iter().enumerate() {
            let Some(bytes) = column_chunk_bytes(group) else {
                continue;
            };
            if let Some(span) = spans.last_mut() {
                let merged = span.bytes.start.min(bytes.start)..span.bytes.end.max(bytes.end);
                if span.row_groups.end == idx && merged.end - merged.start <= threshold {
                    span.row_groups.end = idx + 1;
                    span.bytes = merged;
                    span.rows += group.num_rows();
                    continue;
                }
            }
            spans.push(RowGroupSpan {
                row_groups: idx..idx + 1,
                bytes,
                rows: group.num_rows(),
            });
        }
        spans
    }

    /// Standalone Parquet file holding the row groups of `span`, built from
    /// the span's fetched bytes
    pub fn frame(&self, span: &RowGroupSpan, bytes: Bytes) -> Result<Bytes> {
        if bytes.len() as u64 != span.byte_len() {
            return Err(StreamError::InvalidArgument(format!(
                "span {:?} needs {} bytes, got {}",
                span.bytes,
                span.byte_len(),
                bytes.len()
            )));
        }
        let groups = self
            .metadata
            .row_groups()
            .get(span.row_groups.clone())
            .ok_or_else(|| StreamError::InvalidArgument(format!("no row groups {:?}", span.row_groups)))?;

        let file = self.metadata.file_metadata();
        let props = WriterProperties::builder()
            .set_created_by(file.created_by().unwrap_or("polarway-stream").to_string())
            .set_key_value_metadata(file.key_value_metadata().cloned())
            .build();

        let capacity = bytes.len() + 4096;
        let source = FetchedRange::new(self.object_size, span.bytes.start, bytes);
        let mut out = Vec::with_capacity(capacity);
        let mut writer = SerializedFileWriter::new(&mut out, file.schema_descr().root_schema_ptr(), Arc::new(props))?;
        for group in groups {
            let mut group_writer = writer.next_row_group()?;
            for column in group.columns() {
                group_writer.append_column(
                    &source,
                    ColumnCloseResult {
                        bytes_written: column.compressed_size().max(0) as u64,
                        rows_written: group.num_rows().max(0) as u64,
                        metadata: column.clone(),
                        bloom_filter: None,
                        column_index: None,
                        offset_index: None,
                    },
                )?;
            }
            group_writer.close()?;
        }
        writer.close()?;
        Ok(Bytes::from(out))
    }
}

/// Bytes covered by a row group's column chunks, `None` without columns
fn column_chunk_bytes(group: &RowGroupMetaData) -> Option<Range<u64>> {
    group
        .columns()
        .iter()
        .map(|column| {
            let (start, len) = column.byte_range();
            start..start + len
        })
        .reduce(|a, b| a.start.min(b.start)..a.end.max(b.end))
}

/// One fetched byte range standing in for a whole object
struct FetchedRange {
    object_size: u64,
    offset: u64,
    data: Bytes,
}

impl FetchedRange {
    fn new(object_size: u64, offset: u64, data: Bytes) -> Self {
        Self {
            object_size,
            offset,
            data,
        }
    }

    fn local(&self, start: u64, length: u64) -> parquet::errors::Result<Range<usize>> {
        let end = self.offset + self.data.len() as u64;
        if start < self.offset || start + length > end {
            return Err(ParquetError::General(format!(
                "bytes {start}..{} outside fetched range {}..{end}",
                start + length,
                self.offset
            )));
        }
        let from = (start - self.offset) as usize;
        Ok(from..from + length as usize)
    }
}

impl Length for FetchedRange {
    fn len(&self) -> u64 {
        self.object_size
    }
}

impl ChunkReader for FetchedRange {
    type T = bytes::buf::Reader<Bytes>;

    fn get_read(&self, start: u64) -> parquet::errors::Result<Self::T> {
        let rest = (self.offset + self.data.len() as u64).saturating_sub(start);
        let range = self.local(start, rest)?;
        Ok(self.data.slice(range).reader())
    }

    fn get_bytes(&self, start: u64, length: usize) -> parquet::errors::Result<Bytes> {
        let range = self.local(start, length as u64)?;
        Ok(self.data.slice(range))
    }
}
