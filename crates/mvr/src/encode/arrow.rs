//! Arrow IPC encoder.
//!
//! One Arrow record per batch; fields carry the original canonical type
//! and its quantitative attributes as metadata so downstream consumers
//! can reconstruct the source schema.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::{Arc, Mutex};

use arrow::array::{
    ArrayRef, BooleanBuilder, Date32Builder, Decimal128Builder, FixedSizeBinaryBuilder,
    Float32Builder, Float64Builder, Int16Builder, Int32Builder, Int64Builder, StringBuilder,
    TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;

use crate::core::{Batch, CanonicalType, Column, DataStream, Value};
use crate::error::{MvrError, Result};
use crate::sink::SinkStack;

use super::decimal::unscaled_i128;
use super::{format_text_value, json_text, BatchWriter, Encoder};

fn arrow_err(e: arrow::error::ArrowError) -> MvrError {
    MvrError::Sink(format!("arrow: {}", e))
}

fn arrow_data_type(col: &Column) -> DataType {
    match col.canonical_type {
        CanonicalType::Boolean => DataType::Boolean,
        CanonicalType::SmallInt => DataType::Int16,
        CanonicalType::Integer => DataType::Int32,
        CanonicalType::BigInt => DataType::Int64,
        CanonicalType::Real => DataType::Float32,
        CanonicalType::Double => DataType::Float64,
        CanonicalType::Uuid => DataType::FixedSizeBinary(16),
        CanonicalType::Date => DataType::Date32,
        CanonicalType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        CanonicalType::TimestampTz => {
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        }
        CanonicalType::Numeric => {
            if col.precision > 0 && col.precision <= 38 {
                DataType::Decimal128(col.precision as u8, col.scale as i8)
            } else {
                DataType::Float64
            }
        }
        _ => DataType::Utf8,
    }
}

fn build_schema(columns: &[Column]) -> Schema {
    let fields: Vec<Field> = columns
        .iter()
        .map(|col| {
            let metadata = HashMap::from([
                ("original_type".to_string(), col.canonical_type.to_string()),
                ("precision".to_string(), col.precision.to_string()),
                ("scale".to_string(), col.scale.to_string()),
                ("length".to_string(), col.length.to_string()),
            ]);
            Field::new(&col.name, arrow_data_type(col), true).with_metadata(metadata)
        })
        .collect();
    Schema::new(fields)
}

pub struct ArrowEncoder {
    shared: Arc<ArrowShared>,
}

struct ArrowShared {
    ds: Arc<DataStream>,
    schema: Arc<Schema>,
    writer: Mutex<Option<StreamWriter<SinkStack>>>,
}

impl ArrowEncoder {
    pub fn new(ds: Arc<DataStream>, sink: SinkStack) -> Result<Self> {
        let schema = Arc::new(build_schema(&ds.dest_columns));
        let writer = StreamWriter::try_new(sink, &schema).map_err(arrow_err)?;
        Ok(Self {
            shared: Arc::new(ArrowShared {
                ds,
                schema,
                writer: Mutex::new(Some(writer)),
            }),
        })
    }
}

impl Encoder for ArrowEncoder {
    fn create_batch_writer(&self) -> Box<dyn BatchWriter> {
        Box::new(ArrowBatchWriter {
            shared: self.shared.clone(),
        })
    }

    fn flush(&self) -> Result<()> {
        let mut guard = self.shared.writer.lock().expect("arrow writer poisoned");
        if let Some(writer) = guard.as_mut() {
            writer.flush().map_err(arrow_err)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.shared.writer.lock().expect("arrow writer poisoned");
        if let Some(mut writer) = guard.take() {
            writer.finish().map_err(arrow_err)?;
            let mut sink = writer.into_inner().map_err(arrow_err)?;
            let _ = sink.flush();
            sink.close()?;
        }
        Ok(())
    }
}

struct ArrowBatchWriter {
    shared: Arc<ArrowShared>,
}

impl BatchWriter for ArrowBatchWriter {
    fn write_batch(&mut self, batch: &Batch) -> Result<()> {
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.shared.ds.dest_columns.len());
        for (i, col) in self.shared.ds.dest_columns.iter().enumerate() {
            arrays.push(build_array(col, batch, i)?);
        }

        let record = RecordBatch::try_new(self.shared.schema.clone(), arrays).map_err(arrow_err)?;

        let mut guard = self.shared.writer.lock().expect("arrow writer poisoned");
        let writer = guard
            .as_mut()
            .ok_or_else(|| MvrError::Sink("arrow encoder already closed".to_string()))?;
        writer.write(&record).map_err(arrow_err)?;
        Ok(())
    }
}

fn build_array(col: &Column, batch: &Batch, idx: usize) -> Result<ArrayRef> {
    let rows = batch.len();
    let cells = batch.rows.iter().map(|row| &row[idx]);

    let array: ArrayRef = match arrow_data_type(col) {
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(rows);
            for v in cells {
                match v {
                    Value::Null => b.append_null(),
                    Value::Bool(x) => b.append_value(*x),
                    other => {
                        return Err(MvrError::encode(
                            &col.name,
                            format!("expected bool, got {:?}", other),
                        ))
                    }
                }
            }
            Arc::new(b.finish())
        }
        DataType::Int16 => {
            let mut b = Int16Builder::with_capacity(rows);
            for v in cells {
                match v {
                    Value::Null => b.append_null(),
                    other => b.append_value(
                        other
                            .as_i64()
                            .ok_or_else(|| coercion_error(col, other))?
                            as i16,
                    ),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Int32 => {
            let mut b = Int32Builder::with_capacity(rows);
            for v in cells {
                match v {
                    Value::Null => b.append_null(),
                    other => b.append_value(
                        other
                            .as_i64()
                            .ok_or_else(|| coercion_error(col, other))?
                            as i32,
                    ),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(rows);
            for v in cells {
                match v {
                    Value::Null => b.append_null(),
                    other => {
                        b.append_value(other.as_i64().ok_or_else(|| coercion_error(col, other))?)
                    }
                }
            }
            Arc::new(b.finish())
        }
        DataType::Float32 => {
            let mut b = Float32Builder::with_capacity(rows);
            for v in cells {
                match v {
                    Value::Null => b.append_null(),
                    other => b.append_value(
                        other.as_f64().ok_or_else(|| coercion_error(col, other))? as f32,
                    ),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(rows);
            for v in cells {
                match v {
                    Value::Null => b.append_null(),
                    other => {
                        b.append_value(other.as_f64().ok_or_else(|| coercion_error(col, other))?)
                    }
                }
            }
            Arc::new(b.finish())
        }
        DataType::FixedSizeBinary(16) => {
            let mut b = FixedSizeBinaryBuilder::with_capacity(rows, 16);
            for v in cells {
                match v {
                    Value::Null => b.append_null(),
                    Value::Uuid(u) => b.append_value(u.as_bytes()).map_err(arrow_err)?,
                    Value::Bytes(bytes) if bytes.len() == 16 => {
                        b.append_value(bytes).map_err(arrow_err)?
                    }
                    Value::Text(s) => {
                        let u = uuid::Uuid::parse_str(s)
                            .map_err(|e| MvrError::encode(&col.name, e.to_string()))?;
                        b.append_value(u.as_bytes()).map_err(arrow_err)?;
                    }
                    other => return Err(coercion_error(col, other)),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Date32 => {
            let epoch = chrono::NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid epoch");
            let mut b = Date32Builder::with_capacity(rows);
            for v in cells {
                match v {
                    Value::Null => b.append_null(),
                    Value::Date(d) => {
                        b.append_value(d.signed_duration_since(epoch).num_days() as i32)
                    }
                    Value::DateTime(dt) => b.append_value(
                        dt.date().signed_duration_since(epoch).num_days() as i32,
                    ),
                    other => return Err(coercion_error(col, other)),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Timestamp(TimeUnit::Microsecond, tz) => {
            let mut b = TimestampMicrosecondBuilder::with_capacity(rows);
            if let Some(tz) = &tz {
                b = b.with_timezone(tz.clone());
            }
            for v in cells {
                match v {
                    Value::Null => b.append_null(),
                    Value::DateTime(dt) => b.append_value(dt.and_utc().timestamp_micros()),
                    Value::DateTimeTz(dt) => b.append_value(dt.timestamp_micros()),
                    other => return Err(coercion_error(col, other)),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Decimal128(precision, scale) => {
            let mut b = Decimal128Builder::with_capacity(rows)
                .with_precision_and_scale(precision, scale)
                .map_err(arrow_err)?;
            for v in cells {
                match v {
                    Value::Null => b.append_null(),
                    other => b.append_value(unscaled_i128(other, col)?),
                }
            }
            Arc::new(b.finish())
        }
        _ => {
            let mut b = StringBuilder::with_capacity(rows, rows * 16);
            for v in cells {
                match v {
                    Value::Null => b.append_null(),
                    other if col.canonical_type.is_json() => {
                        b.append_value(json_text(other, col)?)
                    }
                    other => b.append_value(format_text_value(other, col)?),
                }
            }
            Arc::new(b.finish())
        }
    };
    Ok(array)
}

fn coercion_error(col: &Column, value: &Value) -> MvrError {
    MvrError::encode(
        &col.name,
        format!("cannot coerce {:?} to {}", value, col.canonical_type),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Decimal128Array};
    use arrow::ipc::reader::StreamReader;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn stream_with(cols: Vec<Column>) -> Arc<DataStream> {
        Arc::new(DataStream::new(cols.clone(), cols, 100, 2))
    }

    #[test]
    fn test_type_map() {
        let col = |t| Column::new("c", t, 0);
        assert_eq!(arrow_data_type(&col(CanonicalType::SmallInt)), DataType::Int16);
        assert_eq!(
            arrow_data_type(&col(CanonicalType::Uuid)),
            DataType::FixedSizeBinary(16)
        );
        assert_eq!(
            arrow_data_type(&col(CanonicalType::Timestamp)),
            DataType::Timestamp(TimeUnit::Microsecond, None)
        );
        assert_eq!(
            arrow_data_type(&col(CanonicalType::TimestampTz)),
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );
        // NUMERIC without precision degrades to Float64
        assert_eq!(arrow_data_type(&col(CanonicalType::Numeric)), DataType::Float64);
        let mut numeric = col(CanonicalType::Numeric);
        numeric.precision = 38;
        numeric.scale = 15;
        assert_eq!(arrow_data_type(&numeric), DataType::Decimal128(38, 15));
    }

    #[test]
    fn test_field_metadata() {
        let mut col = Column::new("amount", CanonicalType::Numeric, 0);
        col.precision = 18;
        col.scale = 4;
        col.length = 0;
        let schema = build_schema(&[col]);
        let meta = schema.field(0).metadata();
        assert_eq!(meta["original_type"], "NUMERIC");
        assert_eq!(meta["precision"], "18");
        assert_eq!(meta["scale"], "4");
    }

    #[tokio::test]
    async fn test_record_per_batch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.arrow");
        let url = url::Url::from_file_path(&path).unwrap();
        let sink = crate::sink::open_sink(&url, "", "arrow").await.unwrap();

        let mut amount = Column::new("amount", CanonicalType::Numeric, 0);
        amount.precision = 38;
        amount.scale = 15;
        let name = Column::new("name", CanonicalType::Varchar, 1);
        let ds = stream_with(vec![amount, name]);

        let encoder = ArrowEncoder::new(ds, sink).unwrap();
        let mut writer = encoder.create_batch_writer();

        let mut batch = Batch::with_capacity(2);
        batch.rows.push(vec![
            Value::Decimal(Decimal::from_str("639529.823302734").unwrap()),
            Value::Text("a".into()),
        ]);
        batch.rows.push(vec![Value::Null, Value::Null]);
        writer.write_batch(&batch).unwrap();

        let mut second = Batch::with_capacity(1);
        second
            .rows
            .push(vec![Value::Text("1.5".into()), Value::Text("b".into())]);
        writer.write_batch(&second).unwrap();
        encoder.close().unwrap();

        let reader =
            StreamReader::try_new(std::fs::File::open(&path).unwrap(), None).unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].num_rows(), 2);
        assert_eq!(batches[1].num_rows(), 1);

        let decimals = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<Decimal128Array>()
            .unwrap();
        assert_eq!(decimals.value(0), 639529823302734000000i128);
        assert!(decimals.is_null(1));
    }
}
