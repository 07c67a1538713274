//! Primary backend: polars `ParquetReader`

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use polars::prelude::*;

use super::{date_from_days, datetime_from_micros, unsigned, BackendFactory, BoxedRecordIter, DecoderBackend};
use crate::error::Result;
use crate::record::{FieldInfo, FieldValue, RawRecord};

/// Decodes a whole Parquet buffer into a `DataFrame`, then projects rows out of it
#[derive(Debug, Default)]
pub struct PolarsBackend;

impl PolarsBackend {
    fn read_frame(buffer: &Bytes) -> Result<DataFrame> {
        let df = ParquetReader::new(Cursor::new(buffer.clone())).finish()?;
        Ok(df)
    }
}

impl DecoderBackend for PolarsBackend {
    fn name(&self) -> &'static str {
        "polars"
    }

    fn decode(&self, buffer: &Bytes) -> Result<Vec<RawRecord>> {
        let df = Self::read_frame(buffer)?;
        (0..df.height()).map(|i| row_at(&df, i)).collect()
    }

    fn decode_lazy(&self, buffer: Bytes) -> Result<BoxedRecordIter> {
        // The footer and column chunks have to be read before any row exists,
        // so the frame is materialized up front and rows are projected on demand.
        let df = Self::read_frame(&buffer)?;
        let height = df.height();
        Ok(Box::new((0..height).map(move |i| row_at(&df, i))))
    }

    fn schema(&self, buffer: &Bytes) -> Result<Vec<FieldInfo>> {
        let schema = ParquetReader::new(Cursor::new(buffer.clone())).schema()?;
        Ok(schema
            .iter_values()
            .map(|field| FieldInfo {
                name: field.name.to_string(),
                data_type: DataType::from_arrow_field(field).to_string(),
                nullable: field.is_nullable,
            })
            .collect())
    }
}

fn row_at(df: &DataFrame, idx: usize) -> Result<RawRecord> {
    let columns = df.get_columns();
    let mut record = RawRecord::with_capacity(columns.len());
    for column in columns {
        let value = column.get(idx)?;
        record.insert(column.name().as_str(), any_to_field(value));
    }
    Ok(record)
}

fn any_to_field(value: AnyValue<'_>) -> FieldValue {
    match value {
        AnyValue::Null => FieldValue::Null,
        AnyValue::Boolean(b) => FieldValue::Bool(b),
        AnyValue::String(s) => FieldValue::Str(s.to_string()),
        AnyValue::StringOwned(s) => FieldValue::Str(s.to_string()),
        AnyValue::Int8(v) => FieldValue::Int(i64::from(v)),
        AnyValue::Int16(v) => FieldValue::Int(i64::from(v)),
        AnyValue::Int32(v) => FieldValue::Int(i64::from(v)),
        AnyValue::Int64(v) => FieldValue::Int(v),
        AnyValue::UInt8(v) => FieldValue::Int(i64::from(v)),
        AnyValue::UInt16(v) => FieldValue::Int(i64::from(v)),
        AnyValue::UInt32(v) => FieldValue::Int(i64::from(v)),
        AnyValue::UInt64(v) => unsigned(v),
        AnyValue::Float32(v) => FieldValue::Float(f64::from(v)),
        AnyValue::Float64(v) => FieldValue::Float(v),
        AnyValue::Date(days) => date_from_days(days),
        AnyValue::Datetime(v, unit, _) => datetime_from_micros(to_micros(v, unit)),
        AnyValue::DatetimeOwned(v, unit, _) => datetime_from_micros(to_micros(v, unit)),
        other => FieldValue::Str(other.to_string()),
    }
}

fn to_micros(v: i64, unit: TimeUnit) -> i64 {
    match unit {
        TimeUnit::Nanoseconds => v / 1_000,
        TimeUnit::Microseconds => v,
        TimeUnit::Milliseconds => v.saturating_mul(1_000),
    }
}

/// polars is linked in, so initialization cannot fail at runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct PolarsFactory;

impl BackendFactory for PolarsFactory {
    fn name(&self) -> &'static str {
        "polars"
    }

    fn init(&self) -> Result<Arc<dyn DecoderBackend>> {
        Ok(Arc::new(PolarsBackend))
    }
}
