//! Column records and override application.

use serde::{Deserialize, Serialize};

use super::types::CanonicalType;

/// A single result-set column.
///
/// `canonical_type` is the common currency between drivers and encoders;
/// `driver_type` keeps the raw name the driver reported for logging and
/// diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// Column name as reported by the driver.
    pub name: String,

    /// Canonical type after driver normalization.
    #[serde(rename = "type")]
    pub canonical_type: CanonicalType,

    /// Raw driver-reported type name.
    #[serde(default)]
    pub driver_type: String,

    /// Maximum length for string/binary types (-1 for unbounded).
    #[serde(default)]
    pub length: i64,

    /// Numeric precision (0 when unreported).
    #[serde(default)]
    pub precision: i64,

    /// Numeric scale.
    #[serde(default)]
    pub scale: i64,

    /// Whether the column allows NULL.
    #[serde(default)]
    pub nullable: bool,

    /// Ordinal position (0-based).
    #[serde(default)]
    pub ordinal: i32,
}

impl Column {
    pub fn new(name: impl Into<String>, canonical_type: CanonicalType, ordinal: i32) -> Self {
        Self {
            name: name.into(),
            canonical_type,
            driver_type: String::new(),
            length: 0,
            precision: 0,
            scale: 0,
            nullable: true,
            ordinal,
        }
    }
}

/// A user-supplied column override from config or the CLI.
///
/// Empty/zero fields leave the destination column untouched; the name
/// match is case-insensitive. The type name is uppercased before alias
/// resolution, so `type: "text"` on a UUID column is legal and turns the
/// encoder output into the canonical 36-character string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnOverride {
    pub name: String,

    #[serde(rename = "type", default)]
    pub type_name: String,

    #[serde(default)]
    pub length: i64,

    #[serde(default)]
    pub precision: i64,

    #[serde(default)]
    pub scale: i64,

    #[serde(default)]
    pub nullable: bool,
}

/// Apply overrides to a destination column set.
///
/// Overrides that match no column are ignored; an unknown type name is a
/// configuration error because a silent TEXT fallback would hide typos in
/// exactly the place users reach for precision control.
pub fn override_columns(
    columns: &mut [Column],
    overrides: &[ColumnOverride],
) -> crate::error::Result<()> {
    for ov in overrides {
        let Some(col) = columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(&ov.name))
        else {
            continue;
        };

        if !ov.type_name.is_empty() {
            let canonical = CanonicalType::parse(&ov.type_name).ok_or_else(|| {
                crate::error::MvrError::Config(format!(
                    "unknown type '{}' in override for column '{}'",
                    ov.type_name, ov.name
                ))
            })?;
            col.canonical_type = canonical;
        }
        if ov.length != 0 {
            col.length = ov.length;
        }
        if ov.precision != 0 {
            col.precision = ov.precision;
        }
        if ov.scale != 0 {
            col.scale = ov.scale;
        }
        if ov.nullable {
            col.nullable = true;
        }

        if col.canonical_type == CanonicalType::Numeric && col.precision != 0 {
            if col.precision < 1 || col.scale < 0 || col.scale > col.precision {
                return Err(crate::error::MvrError::Config(format!(
                    "invalid NUMERIC({},{}) for column '{}': precision must be >= 1 \
                     and 0 <= scale <= precision",
                    col.precision, col.scale, col.name
                )));
            }
        }
    }
    Ok(())
}

/// Entry of the `cols` footer metadata written into Parquet files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub len: i64,
}

impl ColumnMetadata {
    pub fn from_columns(columns: &[Column]) -> Vec<ColumnMetadata> {
        columns
            .iter()
            .map(|c| ColumnMetadata {
                name: c.name.clone(),
                type_name: c.canonical_type.as_str().to_string(),
                len: c.length,
            })
            .collect()
    }
}
