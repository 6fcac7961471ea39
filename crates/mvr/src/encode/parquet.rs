//! Parquet encoder.
//!
//! One optional leaf per destination column; every batch becomes one row
//! group of Snappy-compressed column chunks. Workers stage values in
//! typed per-column buffers with definition levels and only take the
//! encoder mutex for the row-group write.

use std::io::Write as _;
use std::sync::{Arc, Mutex};

use parquet::basic::{Compression, LogicalType, Repetition, TimeUnit, Type as PhysicalType};
use parquet::data_type::{
    BoolType, ByteArray, ByteArrayType, DoubleType, FixedLenByteArray, FixedLenByteArrayType,
    FloatType, Int32Type, Int64Type,
};
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use parquet::file::writer::SerializedFileWriter;
use parquet::format::KeyValue;
use parquet::schema::types::{Type, TypePtr};

use crate::core::{Batch, CanonicalType, Column, ColumnMetadata, DataStream, Value};
use crate::error::{MvrError, Result};
use crate::sink::SinkStack;

use super::decimal::{fixed_len_for_precision, to_parquet_decimal, ParquetDecimal};
use super::{format_text_value, json_text, BatchWriter, Encoder};

fn epoch_date() -> chrono::NaiveDate {
    chrono::NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid epoch")
}

fn pq_err(e: parquet::errors::ParquetError) -> MvrError {
    MvrError::Sink(format!("parquet: {}", e))
}

/// Which staging buffer a column uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufKind {
    Bool,
    I32,
    I64,
    F32,
    F64,
    Bytes,
    Fixed,
}

/// Physical + logical mapping for one destination column.
#[derive(Debug, Clone)]
struct MappedColumn {
    physical: PhysicalType,
    logical: Option<LogicalType>,
    fixed_len: i32,
    kind: BufKind,
}

fn map_column(col: &Column) -> MappedColumn {
    let plain = |physical, kind| MappedColumn {
        physical,
        logical: None,
        fixed_len: 0,
        kind,
    };
    let logical = |physical, logical, kind| MappedColumn {
        physical,
        logical: Some(logical),
        fixed_len: 0,
        kind,
    };

    match col.canonical_type {
        CanonicalType::Boolean => plain(PhysicalType::BOOLEAN, BufKind::Bool),
        CanonicalType::SmallInt | CanonicalType::Integer => plain(PhysicalType::INT32, BufKind::I32),
        CanonicalType::BigInt => plain(PhysicalType::INT64, BufKind::I64),
        CanonicalType::Real => plain(PhysicalType::FLOAT, BufKind::F32),
        CanonicalType::Double => plain(PhysicalType::DOUBLE, BufKind::F64),
        CanonicalType::Uuid => MappedColumn {
            physical: PhysicalType::FIXED_LEN_BYTE_ARRAY,
            logical: Some(LogicalType::Uuid),
            fixed_len: 16,
            kind: BufKind::Fixed,
        },
        CanonicalType::Date => logical(PhysicalType::INT32, LogicalType::Date, BufKind::I32),
        CanonicalType::Timestamp => logical(
            PhysicalType::INT64,
            LogicalType::Timestamp {
                is_adjusted_to_u_t_c: false,
                unit: TimeUnit::NANOS(Default::default()),
            },
            BufKind::I64,
        ),
        CanonicalType::TimestampTz => logical(
            PhysicalType::INT64,
            LogicalType::Timestamp {
                is_adjusted_to_u_t_c: true,
                unit: TimeUnit::NANOS(Default::default()),
            },
            BufKind::I64,
        ),
        CanonicalType::Numeric => numeric_mapping(col),
        CanonicalType::Varchar | CanonicalType::Text | CanonicalType::TextArray => {
            logical(PhysicalType::BYTE_ARRAY, LogicalType::String, BufKind::Bytes)
        }
        CanonicalType::Json | CanonicalType::Jsonb => {
            logical(PhysicalType::BYTE_ARRAY, LogicalType::Json, BufKind::Bytes)
        }
        CanonicalType::Bytes => plain(PhysicalType::BYTE_ARRAY, BufKind::Bytes),
    }
}

fn numeric_mapping(col: &Column) -> MappedColumn {
    // a NUMERIC with unreported precision has no fixed width to encode
    // into, so it degrades to DOUBLE like the Arrow mapping does
    if col.precision <= 0 {
        return MappedColumn {
            physical: PhysicalType::DOUBLE,
            logical: None,
            fixed_len: 0,
            kind: BufKind::F64,
        };
    }

    let decimal = LogicalType::Decimal {
        scale: col.scale as i32,
        precision: col.precision as i32,
    };
    if col.precision <= 9 {
        MappedColumn {
            physical: PhysicalType::INT32,
            logical: Some(decimal),
            fixed_len: 0,
            kind: BufKind::I32,
        }
    } else if col.precision <= 18 {
        MappedColumn {
            physical: PhysicalType::INT64,
            logical: Some(decimal),
            fixed_len: 0,
            kind: BufKind::I64,
        }
    } else {
        MappedColumn {
            physical: PhysicalType::FIXED_LEN_BYTE_ARRAY,
            logical: Some(decimal),
            fixed_len: fixed_len_for_precision(col.precision) as i32,
            kind: BufKind::Fixed,
        }
    }
}

fn build_schema(columns: &[Column]) -> Result<TypePtr> {
    let mut fields: Vec<TypePtr> = Vec::with_capacity(columns.len());
    for col in columns {
        let mapped = map_column(col);
        let mut builder = Type::primitive_type_builder(&col.name, mapped.physical)
            .with_repetition(Repetition::OPTIONAL)
            .with_id(Some(col.ordinal));
        if mapped.physical == PhysicalType::FIXED_LEN_BYTE_ARRAY {
            builder = builder.with_length(mapped.fixed_len);
        }
        if let Some(LogicalType::Decimal { scale, precision }) = &mapped.logical {
            builder = builder.with_precision(*precision).with_scale(*scale);
        }
        builder = builder.with_logical_type(mapped.logical);
        fields.push(Arc::new(builder.build().map_err(pq_err)?));
    }

    let root = Type::group_type_builder("schema")
        .with_fields(fields)
        .build()
        .map_err(pq_err)?;
    Ok(Arc::new(root))
}

pub struct ParquetEncoder {
    shared: Arc<ParquetShared>,
}

struct ParquetShared {
    ds: Arc<DataStream>,
    mapped: Vec<MappedColumn>,
    writer: Mutex<Option<SerializedFileWriter<SinkStack>>>,
}

impl ParquetEncoder {
    pub fn new(ds: Arc<DataStream>, sink: SinkStack) -> Result<Self> {
        let schema = build_schema(&ds.dest_columns)?;

        let metadata = ColumnMetadata::from_columns(&ds.dest_columns);
        let metadata_json = serde_json::to_string(&metadata)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_statistics_enabled(EnabledStatistics::Page)
            .set_key_value_metadata(Some(vec![KeyValue::new(
                "cols".to_string(),
                metadata_json,
            )]))
            .build();

        let writer =
            SerializedFileWriter::new(sink, schema, Arc::new(props)).map_err(pq_err)?;

        let mapped = ds.dest_columns.iter().map(map_column).collect();

        Ok(Self {
            shared: Arc::new(ParquetShared {
                ds,
                mapped,
                writer: Mutex::new(Some(writer)),
            }),
        })
    }
}

impl Encoder for ParquetEncoder {
    fn create_batch_writer(&self) -> Box<dyn BatchWriter> {
        let buffers = self
            .shared
            .mapped
            .iter()
            .map(|m| match m.kind {
                BufKind::Bool => ColumnBuffer::Bool(Vec::new()),
                BufKind::I32 => ColumnBuffer::I32(Vec::new()),
                BufKind::I64 => ColumnBuffer::I64(Vec::new()),
                BufKind::F32 => ColumnBuffer::F32(Vec::new()),
                BufKind::F64 => ColumnBuffer::F64(Vec::new()),
                BufKind::Bytes => ColumnBuffer::Bytes(Vec::new()),
                BufKind::Fixed => ColumnBuffer::Fixed(Vec::new()),
            })
            .collect();
        let def_levels = vec![Vec::new(); self.shared.mapped.len()];

        Box::new(ParquetBatchWriter {
            shared: self.shared.clone(),
            buffers,
            def_levels,
        })
    }

    fn flush(&self) -> Result<()> {
        // row groups flush themselves; the footer is written on close
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.shared.writer.lock().expect("parquet writer poisoned");
        if let Some(writer) = guard.take() {
            let mut sink = writer.into_inner().map_err(pq_err)?;
            let _ = sink.flush();
            sink.close()?;
        }
        Ok(())
    }
}

/// Typed staging buffer; one per column per worker.
enum ColumnBuffer {
    Bool(Vec<bool>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Bytes(Vec<ByteArray>),
    Fixed(Vec<FixedLenByteArray>),
}

impl ColumnBuffer {
    fn clear(&mut self) {
        match self {
            ColumnBuffer::Bool(v) => v.clear(),
            ColumnBuffer::I32(v) => v.clear(),
            ColumnBuffer::I64(v) => v.clear(),
            ColumnBuffer::F32(v) => v.clear(),
            ColumnBuffer::F64(v) => v.clear(),
            ColumnBuffer::Bytes(v) => v.clear(),
            ColumnBuffer::Fixed(v) => v.clear(),
        }
    }
}

struct ParquetBatchWriter {
    shared: Arc<ParquetShared>,
    buffers: Vec<ColumnBuffer>,
    def_levels: Vec<Vec<i16>>,
}

impl BatchWriter for ParquetBatchWriter {
    fn write_batch(&mut self, batch: &Batch) -> Result<()> {
        for row in &batch.rows {
            for (i, col) in self.shared.ds.dest_columns.iter().enumerate() {
                let value = &row[i];
                if value.is_null() {
                    self.def_levels[i].push(0);
                    continue;
                }
                self.def_levels[i].push(1);
                append_value(&mut self.buffers[i], col, value)?;
            }
        }

        self.write_row_group(batch.len())?;

        for buffer in &mut self.buffers {
            buffer.clear();
        }
        for defs in &mut self.def_levels {
            defs.clear();
        }
        Ok(())
    }
}

impl ParquetBatchWriter {
    fn write_row_group(&mut self, _row_count: usize) -> Result<()> {
        let mut guard = self.shared.writer.lock().expect("parquet writer poisoned");
        let writer = guard
            .as_mut()
            .ok_or_else(|| MvrError::Sink("parquet encoder already closed".to_string()))?;

        let mut row_group = writer.next_row_group().map_err(pq_err)?;
        let mut idx = 0;
        while let Some(mut col_writer) = row_group.next_column().map_err(pq_err)? {
            let defs = &self.def_levels[idx];
            match &self.buffers[idx] {
                ColumnBuffer::Bool(values) => {
                    col_writer
                        .typed::<BoolType>()
                        .write_batch(values, Some(defs), None)
                        .map_err(pq_err)?;
                }
                ColumnBuffer::I32(values) => {
                    col_writer
                        .typed::<Int32Type>()
                        .write_batch(values, Some(defs), None)
                        .map_err(pq_err)?;
                }
                ColumnBuffer::I64(values) => {
                    col_writer
                        .typed::<Int64Type>()
                        .write_batch(values, Some(defs), None)
                        .map_err(pq_err)?;
                }
                ColumnBuffer::F32(values) => {
                    col_writer
                        .typed::<FloatType>()
                        .write_batch(values, Some(defs), None)
                        .map_err(pq_err)?;
                }
                ColumnBuffer::F64(values) => {
                    col_writer
                        .typed::<DoubleType>()
                        .write_batch(values, Some(defs), None)
                        .map_err(pq_err)?;
                }
                ColumnBuffer::Bytes(values) => {
                    col_writer
                        .typed::<ByteArrayType>()
                        .write_batch(values, Some(defs), None)
                        .map_err(pq_err)?;
                }
                ColumnBuffer::Fixed(values) => {
                    col_writer
                        .typed::<FixedLenByteArrayType>()
                        .write_batch(values, Some(defs), None)
                        .map_err(pq_err)?;
                }
            }
            col_writer.close().map_err(pq_err)?;
            idx += 1;
        }
        row_group.close().map_err(pq_err)?;
        Ok(())
    }
}

fn append_value(buffer: &mut ColumnBuffer, col: &Column, value: &Value) -> Result<()> {
    match col.canonical_type {
        CanonicalType::Boolean => {
            let ColumnBuffer::Bool(buf) = buffer else {
                return Err(buffer_mismatch(col));
            };
            match value {
                Value::Bool(b) => buf.push(*b),
                other => {
                    return Err(MvrError::encode(
                        &col.name,
                        format!("expected bool, got {:?}", other),
                    ))
                }
            }
        }
        CanonicalType::SmallInt | CanonicalType::Integer => {
            let ColumnBuffer::I32(buf) = buffer else {
                return Err(buffer_mismatch(col));
            };
            let v = value
                .as_i64()
                .ok_or_else(|| int_coercion_error(col, value))?;
            let v: i32 = v
                .try_into()
                .map_err(|_| MvrError::encode(&col.name, format!("{} does not fit INT32", v)))?;
            buf.push(v);
        }
        CanonicalType::BigInt => {
            let ColumnBuffer::I64(buf) = buffer else {
                return Err(buffer_mismatch(col));
            };
            buf.push(
                value
                    .as_i64()
                    .ok_or_else(|| int_coercion_error(col, value))?,
            );
        }
        CanonicalType::Real => {
            let ColumnBuffer::F32(buf) = buffer else {
                return Err(buffer_mismatch(col));
            };
            buf.push(value.as_f64().ok_or_else(|| int_coercion_error(col, value))? as f32);
        }
        CanonicalType::Double => {
            let ColumnBuffer::F64(buf) = buffer else {
                return Err(buffer_mismatch(col));
            };
            buf.push(
                value
                    .as_f64()
                    .ok_or_else(|| int_coercion_error(col, value))?,
            );
        }
        CanonicalType::Uuid => {
            let ColumnBuffer::Fixed(buf) = buffer else {
                return Err(buffer_mismatch(col));
            };
            let bytes: [u8; 16] = match value {
                Value::Uuid(u) => *u.as_bytes(),
                Value::Bytes(b) if b.len() == 16 => b.as_slice().try_into().unwrap(),
                Value::Text(s) => *uuid::Uuid::parse_str(s)
                    .map_err(|e| MvrError::encode(&col.name, e.to_string()))?
                    .as_bytes(),
                other => {
                    return Err(MvrError::encode(
                        &col.name,
                        format!("expected uuid, got {:?}", other),
                    ))
                }
            };
            buf.push(FixedLenByteArray::from(ByteArray::from(bytes.to_vec())));
        }
        CanonicalType::Date => {
            let ColumnBuffer::I32(buf) = buffer else {
                return Err(buffer_mismatch(col));
            };
            let date = match value {
                Value::Date(d) => *d,
                Value::DateTime(dt) => dt.date(),
                Value::DateTimeTz(dt) => dt.date_naive(),
                other => {
                    return Err(MvrError::encode(
                        &col.name,
                        format!("expected date, got {:?}", other),
                    ))
                }
            };
            buf.push(date.signed_duration_since(epoch_date()).num_days() as i32);
        }
        CanonicalType::Timestamp | CanonicalType::TimestampTz => {
            let ColumnBuffer::I64(buf) = buffer else {
                return Err(buffer_mismatch(col));
            };
            let nanos = match value {
                Value::DateTime(dt) => dt.and_utc().timestamp_nanos_opt(),
                Value::DateTimeTz(dt) => dt.timestamp_nanos_opt(),
                other => {
                    return Err(MvrError::encode(
                        &col.name,
                        format!("expected timestamp, got {:?}", other),
                    ))
                }
            };
            buf.push(nanos.ok_or_else(|| {
                MvrError::encode(&col.name, "timestamp out of nanosecond range".to_string())
            })?);
        }
        CanonicalType::Numeric => append_numeric(buffer, col, value)?,
        CanonicalType::Json | CanonicalType::Jsonb | CanonicalType::TextArray => {
            let ColumnBuffer::Bytes(buf) = buffer else {
                return Err(buffer_mismatch(col));
            };
            buf.push(ByteArray::from(json_text(value, col)?.into_bytes()));
        }
        CanonicalType::Varchar | CanonicalType::Text => {
            let ColumnBuffer::Bytes(buf) = buffer else {
                return Err(buffer_mismatch(col));
            };
            buf.push(ByteArray::from(
                format_text_value(value, col)?.into_bytes(),
            ));
        }
        CanonicalType::Bytes => {
            let ColumnBuffer::Bytes(buf) = buffer else {
                return Err(buffer_mismatch(col));
            };
            match value {
                Value::Bytes(b) => buf.push(ByteArray::from(b.clone())),
                other => buf.push(ByteArray::from(other.coerce_string().into_bytes())),
            }
        }
    }
    Ok(())
}

fn append_numeric(buffer: &mut ColumnBuffer, col: &Column, value: &Value) -> Result<()> {
    if col.precision <= 0 {
        let ColumnBuffer::F64(buf) = buffer else {
            return Err(buffer_mismatch(col));
        };
        buf.push(
            value
                .as_f64()
                .ok_or_else(|| int_coercion_error(col, value))?,
        );
        return Ok(());
    }

    match (to_parquet_decimal(value, col)?, buffer) {
        (ParquetDecimal::I32(v), ColumnBuffer::I32(buf)) => buf.push(v),
        (ParquetDecimal::I64(v), ColumnBuffer::I64(buf)) => buf.push(v),
        (ParquetDecimal::Bytes(v), ColumnBuffer::Fixed(buf)) => {
            buf.push(FixedLenByteArray::from(ByteArray::from(v)));
        }
        _ => return Err(buffer_mismatch(col)),
    }
    Ok(())
}

fn buffer_mismatch(col: &Column) -> MvrError {
    MvrError::encode(
        &col.name,
        format!("column buffer mismatch for {}", col.canonical_type),
    )
}

fn int_coercion_error(col: &Column, value: &Value) -> MvrError {
    MvrError::encode(
        &col.name,
        format!(
            "cannot coerce {:?} to {}",
            value, col.canonical_type
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn stream_with(cols: Vec<Column>) -> Arc<DataStream> {
        Arc::new(DataStream::new(cols.clone(), cols, 100, 2))
    }

    async fn write_file(
        dir: &tempfile::TempDir,
        ds: Arc<DataStream>,
        batches: Vec<Batch>,
    ) -> std::path::PathBuf {
        let path = dir.path().join("out.parquet");
        let url = url::Url::from_file_path(&path).unwrap();
        let sink = crate::sink::open_sink(&url, "snappy", "parquet").await.unwrap();
        let encoder = ParquetEncoder::new(ds, sink).unwrap();
        let mut writer = encoder.create_batch_writer();
        for batch in &batches {
            writer.write_batch(batch).unwrap();
        }
        encoder.close().unwrap();
        path
    }

    #[test]
    fn test_numeric_physical_dispatch() {
        let mut col = Column::new("n", CanonicalType::Numeric, 0);
        col.precision = 9;
        col.scale = 2;
        assert_eq!(map_column(&col).physical, PhysicalType::INT32);
        col.precision = 18;
        assert_eq!(map_column(&col).physical, PhysicalType::INT64);
        col.precision = 38;
        let mapped = map_column(&col);
        assert_eq!(mapped.physical, PhysicalType::FIXED_LEN_BYTE_ARRAY);
        assert_eq!(mapped.fixed_len, 16);
        col.precision = 0;
        assert_eq!(map_column(&col).physical, PhysicalType::DOUBLE);
    }

    #[test]
    fn test_schema_all_optional() {
        let cols = vec![
            Column::new("a", CanonicalType::Integer, 0),
            Column::new("b", CanonicalType::Uuid, 1),
        ];
        let schema = build_schema(&cols).unwrap();
        assert_eq!(schema.name(), "schema");
        for field in schema.get_fields() {
            assert_eq!(field.get_basic_info().repetition(), Repetition::OPTIONAL);
        }
    }

    #[tokio::test]
    async fn test_row_groups_and_footer_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut amount = Column::new("amount", CanonicalType::Numeric, 0);
        amount.precision = 38;
        amount.scale = 15;
        let id = Column::new("id", CanonicalType::BigInt, 1);
        let ds = stream_with(vec![amount, id]);

        let mut batch1 = Batch::with_capacity(2);
        batch1.rows.push(vec![
            Value::Decimal(Decimal::from_str("639529.823302734").unwrap()),
            Value::I64(1),
        ]);
        batch1.rows.push(vec![Value::Null, Value::I64(2)]);
        let mut batch2 = Batch::with_capacity(1);
        batch2.rows.push(vec![
            Value::Text("-123456789012345.123456789012345".into()),
            Value::Null,
        ]);

        let path = write_file(&dir, ds, vec![batch1, batch2]).await;

        let reader = SerializedFileReader::new(std::fs::File::open(&path).unwrap()).unwrap();
        let meta = reader.metadata();
        // one row group per batch
        assert_eq!(meta.num_row_groups(), 2);
        assert_eq!(meta.file_metadata().num_rows(), 3);

        let kv = meta
            .file_metadata()
            .key_value_metadata()
            .expect("cols metadata");
        let cols_entry = kv.iter().find(|kv| kv.key == "cols").unwrap();
        let parsed: Vec<ColumnMetadata> =
            serde_json::from_str(cols_entry.value.as_ref().unwrap()).unwrap();
        assert_eq!(parsed[0].name, "amount");
        assert_eq!(parsed[0].type_name, "NUMERIC");
    }

    #[tokio::test]
    async fn test_timestamp_and_uuid_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cols = vec![
            Column::new("ts", CanonicalType::Timestamp, 0),
            Column::new("uid", CanonicalType::Uuid, 1),
            Column::new("d", CanonicalType::Date, 2),
        ];
        let ds = stream_with(cols);

        let ts = NaiveDate::from_ymd_opt(2024, 10, 8)
            .unwrap()
            .and_hms_opt(17, 22, 0)
            .unwrap();
        let uid = uuid::Uuid::from_str("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11").unwrap();
        let mut batch = Batch::with_capacity(1);
        batch.rows.push(vec![
            Value::DateTime(ts),
            Value::Uuid(uid),
            Value::Date(NaiveDate::from_ymd_opt(2024, 10, 8).unwrap()),
        ]);

        let path = write_file(&dir, ds, vec![batch]).await;
        let reader = SerializedFileReader::new(std::fs::File::open(&path).unwrap()).unwrap();
        let schema = reader.metadata().file_metadata().schema();
        let fields = schema.get_fields();

        assert_eq!(fields[0].name(), "ts");
        assert!(matches!(
            fields[0].get_basic_info().logical_type(),
            Some(LogicalType::Timestamp {
                is_adjusted_to_u_t_c: false,
                ..
            })
        ));

        assert_eq!(fields[1].name(), "uid");
        assert_eq!(
            fields[1].get_physical_type(),
            PhysicalType::FIXED_LEN_BYTE_ARRAY
        );
        assert!(matches!(
            fields[1].get_basic_info().logical_type(),
            Some(LogicalType::Uuid)
        ));

        assert!(matches!(
            fields[2].get_basic_info().logical_type(),
            Some(LogicalType::Date)
        ));
        assert_eq!(reader.metadata().file_metadata().num_rows(), 1);
    }

    #[test]
    fn test_int32_overflow_is_an_error() {
        let col = Column::new("i", CanonicalType::Integer, 0);
        let mut buf = ColumnBuffer::I32(Vec::new());
        assert!(append_value(&mut buf, &col, &Value::I64(i64::MAX)).is_err());
        assert!(append_value(&mut buf, &col, &Value::I32(7)).is_ok());
    }
}
