//! Dynamic cell values carried through the pipeline.
//!
//! Rows arrive from the drivers as heterogeneous sequences; the tagged
//! variant keeps them type-safe without runtime reflection. Encoders
//! dispatch on the destination column once per column per batch, then
//! coerce values with the `as_*` helpers.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

/// A single cell. Null is a first-class value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Decimal(Decimal),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Timestamp without timezone.
    DateTime(NaiveDateTime),
    /// Timestamp with explicit offset.
    DateTimeTz(DateTime<FixedOffset>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Best-effort 64-bit integer view.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I16(v) => Some(*v as i64),
            Value::I32(v) => Some(*v as i64),
            Value::I64(v) => Some(*v),
            Value::Bool(v) => Some(*v as i64),
            Value::Decimal(d) => d.trunc().to_i64(),
            Value::F64(v) => Some(*v as i64),
            Value::F32(v) => Some(*v as i64),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Best-effort binary64 view.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            Value::I16(v) => Some(*v as f64),
            Value::I32(v) => Some(*v as f64),
            Value::I64(v) => Some(*v as f64),
            Value::Decimal(d) => d.to_f64(),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Idiomatic string coercion used by the CSV fallback arm and the
    /// Parquet/Arrow string buffers.
    pub fn coerce_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(v) => v.to_string(),
            Value::I16(v) => v.to_string(),
            Value::I32(v) => v.to_string(),
            Value::I64(v) => v.to_string(),
            Value::F32(v) => v.to_string(),
            Value::F64(v) => v.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Uuid(u) => u.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Date(d) => d.to_string(),
            Value::Time(t) => t.to_string(),
            Value::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            Value::DateTimeTz(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
            Value::Json(v) => v.to_string(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::I16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// An ordered group of rows carried as a unit through the pipeline.
///
/// Owned by the task currently holding it; transfer through the batch
/// channel is a handoff.
#[derive(Debug, Default)]
pub struct Batch {
    pub rows: Vec<Vec<Value>>,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rows: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_detection() {
        assert!(Value::Null.is_null());
        assert!(!Value::I32(0).is_null());
        let v: Value = Option::<i64>::None.into();
        assert!(v.is_null());
    }

    #[test]
    fn test_integer_views() {
        assert_eq!(Value::I16(7).as_i64(), Some(7));
        assert_eq!(Value::Text("42".into()).as_i64(), Some(42));
        assert_eq!(Value::Decimal(Decimal::new(12345, 2)).as_i64(), Some(123));
        assert_eq!(Value::Uuid(Uuid::nil()).as_i64(), None);
    }

    #[test]
    fn test_datetime_string_forms() {
        let dt = NaiveDate::from_ymd_opt(2024, 10, 8)
            .unwrap()
            .and_hms_opt(17, 22, 0)
            .unwrap();
        assert_eq!(Value::DateTime(dt).coerce_string(), "2024-10-08T17:22:00");

        let tz = DateTime::parse_from_rfc3339("2024-10-08T17:22:00Z").unwrap();
        assert_eq!(Value::DateTimeTz(tz).coerce_string(), "2024-10-08T17:22:00Z");
    }

    #[test]
    fn test_float_formatting_stays_positional() {
        assert_eq!(Value::F64(1.0).coerce_string(), "1");
        assert_eq!(Value::F64(1234567890.12345).coerce_string(), "1234567890.12345");
        assert_eq!(
            Value::F64(1.2345678901234567e+20).coerce_string(),
            "123456789012345670000"
        );
        assert_eq!(Value::F64(0.0).coerce_string(), "0");
    }

    #[test]
    fn test_batch_handoff_sizes() {
        let mut batch = Batch::with_capacity(4);
        batch.rows.push(vec![Value::I32(1), Value::Null]);
        assert_eq!(batch.len(), 1);
        assert!(!batch.is_empty());
    }
}
