//! Fallback backend: the `parquet` crate's record reader
//!
//! Walks row groups one record at a time, so nothing beyond the current row
//! group's pages is held in memory.

use std::sync::Arc;

use bytes::Bytes;
use parquet::basic::{ConvertedType, LogicalType, Type as PhysicalType};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::reader::RowIter;
use parquet::record::{Field, Row};
use parquet::schema::types::ColumnDescriptor;

use super::{date_from_days, datetime_from_micros, unsigned, BackendFactory, BoxedRecordIter, DecoderBackend};
use crate::error::Result;
use crate::record::{FieldInfo, FieldValue, RawRecord};

#[derive(Debug, Default)]
pub struct ParquetRowBackend;

impl DecoderBackend for ParquetRowBackend {
    fn name(&self) -> &'static str {
        "parquet-rows"
    }

    fn decode(&self, buffer: &Bytes) -> Result<Vec<RawRecord>> {
        self.decode_lazy(buffer.clone())?.collect()
    }

    fn decode_lazy(&self, buffer: Bytes) -> Result<BoxedRecordIter> {
        let reader = SerializedFileReader::new(buffer)?;
        let rows = RowIter::from_file_into(Box::new(reader));
        Ok(Box::new(rows.map(|row| -> Result<RawRecord> { Ok(row_to_record(row?)) })))
    }

    fn schema(&self, buffer: &Bytes) -> Result<Vec<FieldInfo>> {
        let reader = SerializedFileReader::new(buffer.clone())?;
        let descr = reader.metadata().file_metadata().schema_descr();
        Ok(descr
            .columns()
            .iter()
            .map(|col| FieldInfo {
                name: col.name().to_string(),
                data_type: type_name(col).to_string(),
                nullable: col.self_type().is_optional(),
            })
            .collect())
    }
}

fn row_to_record(row: Row) -> RawRecord {
    row.into_columns()
        .into_iter()
        .map(|(name, field)| (name, field_to_value(field)))
        .collect()
}

fn field_to_value(field: Field) -> FieldValue {
    match field {
        Field::Null => FieldValue::Null,
        Field::Bool(b) => FieldValue::Bool(b),
        Field::Byte(v) => FieldValue::Int(i64::from(v)),
        Field::Short(v) => FieldValue::Int(i64::from(v)),
        Field::Int(v) => FieldValue::Int(i64::from(v)),
        Field::Long(v) => FieldValue::Int(v),
        Field::UByte(v) => FieldValue::Int(i64::from(v)),
        Field::UShort(v) => FieldValue::Int(i64::from(v)),
        Field::UInt(v) => FieldValue::Int(i64::from(v)),
        Field::ULong(v) => unsigned(v),
        Field::Float16(v) => FieldValue::Float(f64::from(v)),
        Field::Float(v) => FieldValue::Float(f64::from(v)),
        Field::Double(v) => FieldValue::Float(v),
        Field::Str(s) => FieldValue::Str(s),
        Field::Date(days) => date_from_days(days),
        Field::TimestampMillis(ms) => datetime_from_micros(ms.saturating_mul(1_000)),
        Field::TimestampMicros(us) => datetime_from_micros(us),
        other => FieldValue::Str(other.to_string()),
    }
}

/// Type names aligned with the polars dtype names the primary backend reports
fn type_name(col: &ColumnDescriptor) -> &'static str {
    match col.converted_type() {
        ConvertedType::UTF8 | ConvertedType::ENUM | ConvertedType::JSON => return "str",
        ConvertedType::DATE => return "date",
        ConvertedType::TIMESTAMP_MILLIS | ConvertedType::TIMESTAMP_MICROS => return "datetime",
        ConvertedType::INT_8 => return "i8",
        ConvertedType::INT_16 => return "i16",
        ConvertedType::UINT_8 => return "u8",
        ConvertedType::UINT_16 => return "u16",
        ConvertedType::UINT_32 => return "u32",
        ConvertedType::UINT_64 => return "u64",
        _ => {}
    }
    match col.logical_type() {
        Some(LogicalType::String) => return "str",
        Some(LogicalType::Date) => return "date",
        Some(LogicalType::Timestamp { .. }) => return "datetime",
        _ => {}
    }
    match col.physical_type() {
        PhysicalType::BOOLEAN => "bool",
        PhysicalType::INT32 => "i32",
        PhysicalType::INT64 => "i64",
        PhysicalType::INT96 => "datetime",
        PhysicalType::FLOAT => "f32",
        PhysicalType::DOUBLE => "f64",
        PhysicalType::BYTE_ARRAY | PhysicalType::FIXED_LEN_BYTE_ARRAY => "binary",
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ParquetRowFactory;

impl BackendFactory for ParquetRowFactory {
    fn name(&self) -> &'static str {
        "parquet-rows"
    }

    fn init(&self) -> Result<Arc<dyn DecoderBackend>> {
        Ok(Arc::new(ParquetRowBackend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;

    fn sample_parquet() -> Bytes {
        let mut df = DataFrame::new(vec![
            Series::new("genre_name".into(), vec![Some("beauty"), None, Some("food")]).into(),
            Series::new("digg_count".into(), vec![10i64, 20, 30]).into(),
            Series::new("cost".into(), vec![1.5f64, 2.5, 3.5]).into(),
        ])
        .unwrap();
        let mut out = Vec::new();
        ParquetWriter::new(&mut out).finish(&mut df).unwrap();
        Bytes::from(out)
    }

    #[test]
    fn test_rows_decode_in_order() {
        let records = ParquetRowBackend.decode(&sample_parquet()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].text("genre_name"), Some("beauty"));
        assert!(records[1].get("genre_name").unwrap().is_null());
        assert_eq!(records[2].get("digg_count"), Some(&FieldValue::Int(30)));
        assert_eq!(records[2].get("cost"), Some(&FieldValue::Float(3.5)));
    }

    #[test]
    fn test_agrees_with_primary_backend() {
        let buf = sample_parquet();
        let primary = super::super::PolarsBackend.decode(&buf).unwrap();
        let fallback = ParquetRowBackend.decode(&buf).unwrap();
        assert_eq!(primary, fallback);
    }

    #[test]
    fn test_schema_names_and_types() {
        let fields = ParquetRowBackend.schema(&sample_parquet()).unwrap();
        let described: Vec<(&str, &str)> = fields
            .iter()
            .map(|f| (f.name.as_str(), f.data_type.as_str()))
            .collect();
        assert_eq!(
            described,
            vec![("genre_name", "str"), ("digg_count", "i64"), ("cost", "f64")]
        );
        assert!(fields[0].nullable);
    }

    #[test]
    fn test_truncated_buffer_fails() {
        let buf = sample_parquet();
        let half = buf.slice(0..buf.len() / 2);
        assert!(ParquetRowBackend.decode_lazy(half).is_err());
    }
}
