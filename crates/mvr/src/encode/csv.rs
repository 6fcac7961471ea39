//! CSV encoder.
//!
//! The header row is written at construction from the source-column
//! names. Fields are quoted per RFC 4180 only when they need it.

use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::core::{Batch, CanonicalType, DataStream, Value};
use crate::error::{MvrError, Result};
use crate::sink::SinkStack;

use super::{format_text_value, BatchWriter, Encoder};

pub struct CsvEncoder {
    shared: Arc<CsvShared>,
}

struct CsvShared {
    ds: Arc<DataStream>,
    out: Mutex<Option<SinkStack>>,
}

impl CsvEncoder {
    pub fn new(ds: Arc<DataStream>, mut sink: SinkStack) -> Result<Self> {
        let mut header = Vec::new();
        write_record(
            &mut header,
            ds.columns.iter().map(|c| c.name.clone()).collect(),
        )?;
        sink.write_all(&header)
            .map_err(|e| MvrError::Sink(e.to_string()))?;

        Ok(Self {
            shared: Arc::new(CsvShared {
                ds,
                out: Mutex::new(Some(sink)),
            }),
        })
    }
}

impl Encoder for CsvEncoder {
    fn create_batch_writer(&self) -> Box<dyn BatchWriter> {
        Box::new(CsvBatchWriter {
            shared: self.shared.clone(),
            staging: Vec::new(),
        })
    }

    fn flush(&self) -> Result<()> {
        let mut guard = self.shared.out.lock().expect("csv sink poisoned");
        if let Some(out) = guard.as_mut() {
            out.flush().map_err(|e| MvrError::Sink(e.to_string()))?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.shared.out.lock().expect("csv sink poisoned");
        if let Some(mut out) = guard.take() {
            out.close()?;
        }
        Ok(())
    }
}

struct CsvBatchWriter {
    shared: Arc<CsvShared>,
    staging: Vec<u8>,
}

impl BatchWriter for CsvBatchWriter {
    fn write_batch(&mut self, batch: &Batch) -> Result<()> {
        self.staging.clear();

        for row in &batch.rows {
            let mut fields = Vec::with_capacity(row.len());
            for (value, col) in row.iter().zip(&self.shared.ds.dest_columns) {
                fields.push(format_field(value, col)?);
            }
            write_record(&mut self.staging, fields)?;
        }

        let mut guard = self.shared.out.lock().expect("csv sink poisoned");
        let out = guard
            .as_mut()
            .ok_or_else(|| MvrError::Sink("csv encoder already closed".to_string()))?;
        out.write_all(&self.staging)
            .map_err(|e| MvrError::Sink(e.to_string()))?;
        Ok(())
    }
}

fn format_field(value: &Value, col: &crate::core::Column) -> Result<String> {
    if value.is_null() {
        return Ok("NULL".to_string());
    }
    if col.canonical_type == CanonicalType::Boolean {
        if let Value::Bool(b) = value {
            return Ok(b.to_string());
        }
    }
    format_text_value(value, col)
}

fn write_record(out: &mut Vec<u8>, fields: Vec<String>) -> Result<()> {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        if needs_quoting(field) {
            out.push(b'"');
            for b in field.bytes() {
                if b == b'"' {
                    out.push(b'"');
                }
                out.push(b);
            }
            out.push(b'"');
        } else {
            out.extend_from_slice(field.as_bytes());
        }
    }
    out.push(b'\n');
    Ok(())
}

fn needs_quoting(field: &str) -> bool {
    field
        .bytes()
        .any(|b| b == b',' || b == b'"' || b == b'\n' || b == b'\r')
}
