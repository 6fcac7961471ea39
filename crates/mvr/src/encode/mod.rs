//! Format encoders: CSV, JSONL, Parquet, Arrow IPC.

pub mod arrow;
pub mod csv;
pub mod decimal;
pub mod jsonl;
pub mod parquet;

use std::sync::Arc;

use crate::core::{Batch, CanonicalType, Column, DataStream, Value};
use crate::error::{MvrError, Result};
use crate::sink::SinkStack;

/// Per-worker handle with a private staging buffer.
///
/// `write_batch` formats rows into the staging area, then flushes it to
/// the shared byte sink under the encoder's mutex, so workers contend
/// only on byte emission, never on per-row formatting.
pub trait BatchWriter: Send {
    fn write_batch(&mut self, batch: &Batch) -> Result<()>;
}

/// A typed writer over the sink stack.
pub trait Encoder: Send + Sync {
    fn create_batch_writer(&self) -> Box<dyn BatchWriter>;
    fn flush(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
}

/// Build the encoder for a format over an opened sink.
pub fn build_encoder(
    format: &str,
    ds: Arc<DataStream>,
    sink: SinkStack,
) -> Result<Arc<dyn Encoder>> {
    match format.to_lowercase().as_str() {
        "csv" => Ok(Arc::new(csv::CsvEncoder::new(ds, sink)?)),
        "jsonl" => Ok(Arc::new(jsonl::JsonlEncoder::new(ds, sink))),
        "parquet" => Ok(Arc::new(parquet::ParquetEncoder::new(ds, sink)?)),
        "arrow" => Ok(Arc::new(arrow::ArrowEncoder::new(ds, sink)?)),
        other => Err(MvrError::Config(format!("unsupported format: {}", other))),
    }
}

/// Write the format's empty-file skeleton and close the sink.
///
/// Used for stdout destinations after a mid-stream failure so downstream
/// readers still see a well-formed artifact.
pub fn write_empty_artifact(format: &str, ds: Arc<DataStream>, sink: SinkStack) -> Result<()> {
    let encoder = build_encoder(format, ds, sink)?;
    encoder.flush()?;
    encoder.close()
}

/// String form of a cell for text-shaped destinations (CSV fields,
/// Parquet/Arrow string buffers).
pub(crate) fn format_text_value(value: &Value, col: &Column) -> Result<String> {
    if value.is_null() {
        return Ok(String::new());
    }

    match col.canonical_type {
        CanonicalType::Timestamp => Ok(match value {
            Value::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            Value::DateTimeTz(dt) => dt.naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            other => other.coerce_string(),
        }),
        CanonicalType::TimestampTz => Ok(match value {
            Value::DateTimeTz(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
            other => other.coerce_string(),
        }),
        CanonicalType::Numeric => Ok(match value {
            Value::Decimal(d) => format!("{:.*}", col.scale.max(0) as usize, d),
            other => other.coerce_string(),
        }),
        CanonicalType::Uuid => match value {
            Value::Uuid(u) => Ok(u.to_string()),
            Value::Bytes(b) if b.len() == 16 => {
                let uuid = uuid::Uuid::from_slice(b)
                    .map_err(|e| MvrError::encode(&col.name, e.to_string()))?;
                Ok(uuid.to_string())
            }
            other => Ok(other.coerce_string()),
        },
        t if t.is_json() => json_text(value, col),
        _ => Ok(value.coerce_string()),
    }
}

/// Normalized JSON text for JSON/JSONB/text-array destinations.
///
/// String sources are parsed and re-marshaled so output is normalized;
/// non-JSON strings marshal as JSON strings.
pub(crate) fn json_text(value: &Value, col: &Column) -> Result<String> {
    let json = json_value(value, col)?;
    serde_json::to_string(&json).map_err(|e| MvrError::encode(&col.name, e.to_string()))
}

pub(crate) fn json_value(value: &Value, _col: &Column) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Text(s) => match serde_json::from_str(s) {
            Ok(parsed) => parsed,
            Err(_) => serde_json::Value::String(s.clone()),
        },
        Value::Json(v) => v.clone(),
        Value::Null => serde_json::Value::Null,
        other => {
            let text = other.coerce_string();
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        }
    })
}
