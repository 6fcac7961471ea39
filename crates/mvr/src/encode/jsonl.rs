//! Newline-delimited JSON encoder.
//!
//! One object per line with keys in sorted order so output is stable
//! across runs and worker counts.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use base64::Engine;

use crate::core::{Batch, CanonicalType, Column, DataStream, Value};
use crate::error::{MvrError, Result};
use crate::sink::SinkStack;

use super::{json_value, BatchWriter, Encoder};

pub struct JsonlEncoder {
    shared: Arc<JsonlShared>,
}

struct JsonlShared {
    ds: Arc<DataStream>,
    out: Mutex<Option<SinkStack>>,
}

impl JsonlEncoder {
    pub fn new(ds: Arc<DataStream>, sink: SinkStack) -> Self {
        Self {
            shared: Arc::new(JsonlShared {
                ds,
                out: Mutex::new(Some(sink)),
            }),
        }
    }
}

impl Encoder for JsonlEncoder {
    fn create_batch_writer(&self) -> Box<dyn BatchWriter> {
        Box::new(JsonlBatchWriter {
            shared: self.shared.clone(),
            staging: Vec::new(),
        })
    }

    fn flush(&self) -> Result<()> {
        let mut guard = self.shared.out.lock().expect("jsonl sink poisoned");
        if let Some(out) = guard.as_mut() {
            out.flush().map_err(|e| MvrError::Sink(e.to_string()))?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.shared.out.lock().expect("jsonl sink poisoned");
        if let Some(mut out) = guard.take() {
            out.close()?;
        }
        Ok(())
    }
}

struct JsonlBatchWriter {
    shared: Arc<JsonlShared>,
    staging: Vec<u8>,
}

impl BatchWriter for JsonlBatchWriter {
    fn write_batch(&mut self, batch: &Batch) -> Result<()> {
        self.staging.clear();

        for row in &batch.rows {
            let mut object = BTreeMap::new();
            for (value, col) in row.iter().zip(&self.shared.ds.dest_columns) {
                object.insert(col.name.clone(), cell_to_json(value, col)?);
            }
            serde_json::to_writer(&mut self.staging, &object)
                .map_err(|e| MvrError::Sink(e.to_string()))?;
            self.staging.push(b'\n');
        }

        let mut guard = self.shared.out.lock().expect("jsonl sink poisoned");
        let out = guard
            .as_mut()
            .ok_or_else(|| MvrError::Sink("jsonl encoder already closed".to_string()))?;
        out.write_all(&self.staging)
            .map_err(|e| MvrError::Sink(e.to_string()))?;
        Ok(())
    }
}

fn cell_to_json(value: &Value, col: &Column) -> Result<serde_json::Value> {
    if value.is_null() {
        return Ok(serde_json::Value::Null);
    }

    let json = match col.canonical_type {
        CanonicalType::Timestamp => match value {
            Value::DateTime(dt) => {
                serde_json::Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }
            Value::DateTimeTz(dt) => serde_json::Value::String(
                dt.naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            ),
            other => serde_json::Value::String(other.coerce_string()),
        },
        CanonicalType::TimestampTz => match value {
            Value::DateTimeTz(dt) => serde_json::Value::String(
                dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
            ),
            other => serde_json::Value::String(other.coerce_string()),
        },
        // fixed-scale string avoids binary64 rounding of wide decimals
        CanonicalType::Numeric => match value {
            Value::Decimal(d) => {
                serde_json::Value::String(format!("{:.*}", col.scale.max(0) as usize, d))
            }
            other => number_or_string(other),
        },
        CanonicalType::Uuid => serde_json::Value::String(super::format_text_value(value, col)?),
        t if t.is_json() => json_value(value, col)?,
        _ => plain_json(value),
    };
    Ok(json)
}

fn number_or_string(value: &Value) -> serde_json::Value {
    match value {
        Value::F32(v) => serde_json::Number::from_f64(*v as f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::F64(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        other => serde_json::Value::String(other.coerce_string()),
    }
}

fn plain_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::I16(v) => serde_json::Value::Number((*v).into()),
        Value::I32(v) => serde_json::Value::Number((*v).into()),
        Value::I64(v) => serde_json::Value::Number((*v).into()),
        Value::F32(v) => serde_json::Number::from_f64(*v as f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::F64(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Bytes(b) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
        Value::Json(v) => v.clone(),
        other => serde_json::Value::String(other.coerce_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use std::str::FromStr;

    fn users_stream() -> Arc<DataStream> {
        let cols = vec![
            Column::new("name", CanonicalType::Varchar, 0),
            Column::new("createdz", CanonicalType::TimestampTz, 1),
            Column::new("nullable_id", CanonicalType::Integer, 2),
            Column::new("unique_id", CanonicalType::Uuid, 3),
            Column::new("active", CanonicalType::Boolean, 4),
        ];
        Arc::new(DataStream::new(cols.clone(), cols, 10, 2))
    }

    #[tokio::test]
    async fn test_sorted_keys_and_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let url = url::Url::from_file_path(&path).unwrap();
        let sink = crate::sink::open_sink(&url, "", "jsonl").await.unwrap();

        let ds = users_stream();
        let encoder = JsonlEncoder::new(ds, sink);
        let mut writer = encoder.create_batch_writer();

        let createdz = DateTime::parse_from_rfc3339("2024-10-08T17:22:00Z").unwrap();
        let uuid = uuid::Uuid::from_str("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11").unwrap();

        let mut batch = Batch::with_capacity(1);
        batch.rows.push(vec![
            Value::Text("John Doe".into()),
            Value::DateTimeTz(createdz),
            Value::Null,
            Value::Uuid(uuid),
            Value::Bool(true),
        ]);
        writer.write_batch(&batch).unwrap();
        encoder.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "{\"active\":true,\"createdz\":\"2024-10-08T17:22:00Z\",\"name\":\"John Doe\",\"nullable_id\":null,\"unique_id\":\"a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11\"}\n"
        );
    }

    #[tokio::test]
    async fn test_round_trip_keys_match_dest_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rt.jsonl");
        let url = url::Url::from_file_path(&path).unwrap();
        let sink = crate::sink::open_sink(&url, "", "jsonl").await.unwrap();

        let ds = users_stream();
        let encoder = JsonlEncoder::new(ds.clone(), sink);
        let mut writer = encoder.create_batch_writer();

        let mut batch = Batch::with_capacity(2);
        for i in 0..2 {
            batch.rows.push(vec![
                Value::Text(format!("user{}", i)),
                Value::Null,
                Value::I32(i),
                Value::Null,
                Value::Bool(false),
            ]);
        }
        writer.write_batch(&batch).unwrap();
        encoder.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        for line in content.lines() {
            let parsed: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(line).unwrap();
            let mut keys: Vec<&str> = parsed.keys().map(String::as_str).collect();
            keys.sort_unstable();
            let mut expected: Vec<&str> =
                ds.dest_columns.iter().map(|c| c.name.as_str()).collect();
            expected.sort_unstable();
            assert_eq!(keys, expected);
        }
    }

    #[tokio::test]
    async fn test_numeric_as_fixed_scale_string() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("num.jsonl");
        let url = url::Url::from_file_path(&path).unwrap();
        let sink = crate::sink::open_sink(&url, "", "jsonl").await.unwrap();

        let mut amount = Column::new("decimal_value", CanonicalType::Numeric, 0);
        amount.scale = 15;
        amount.precision = 38;
        let cols = vec![amount];
        let ds = Arc::new(DataStream::new(cols.clone(), cols, 10, 2));

        let encoder = JsonlEncoder::new(ds, sink);
        let mut writer = encoder.create_batch_writer();
        let mut batch = Batch::with_capacity(1);
        batch.rows.push(vec![Value::Decimal(
            rust_decimal::Decimal::from_str("507531.111989867").unwrap(),
        )]);
        writer.write_batch(&batch).unwrap();
        encoder.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content.trim(),
            "{\"decimal_value\":\"507531.111989867000000\"}"
        );
    }
}
