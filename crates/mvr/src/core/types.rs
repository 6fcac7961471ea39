//! Canonical type vocabulary for cross-driver column normalization.
//!
//! Every driver-reported type is translated into one closed vocabulary so
//! the encoders never see driver-specific names. Instead of each encoder
//! understanding three type systems, each driver provides one
//! `to_canonical` translation and the encoders consume only
//! [`CanonicalType`].

use serde::{Deserialize, Serialize};

/// Closed canonical type vocabulary.
///
/// Quantitative attributes (precision, scale, length) live on the column,
/// not the type tag, so the tag stays `Copy` and cheap to match on in the
/// per-batch dispatch loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanonicalType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Numeric,
    Uuid,
    Date,
    Timestamp,
    /// Timestamp with explicit offset/UTC semantics.
    TimestampTz,
    Varchar,
    Text,
    Json,
    Jsonb,
    Bytes,
    /// PostgreSQL `text[]`; serialized as JSON by the encoders.
    TextArray,
}

impl CanonicalType {
    /// Canonical uppercase name, as written in configs and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalType::Boolean => "BOOLEAN",
            CanonicalType::SmallInt => "SMALLINT",
            CanonicalType::Integer => "INTEGER",
            CanonicalType::BigInt => "BIGINT",
            CanonicalType::Real => "REAL",
            CanonicalType::Double => "DOUBLE",
            CanonicalType::Numeric => "NUMERIC",
            CanonicalType::Uuid => "UUID",
            CanonicalType::Date => "DATE",
            CanonicalType::Timestamp => "TIMESTAMP",
            CanonicalType::TimestampTz => "TIMESTAMPTZ",
            CanonicalType::Varchar => "VARCHAR",
            CanonicalType::Text => "TEXT",
            CanonicalType::Json => "JSON",
            CanonicalType::Jsonb => "JSONB",
            CanonicalType::Bytes => "BYTES",
            CanonicalType::TextArray => "_TEXT",
        }
    }

    /// Resolve a type name or accepted alias, case-insensitively.
    ///
    /// Returns `None` for names outside the vocabulary; callers decide
    /// whether that means "fall back to TEXT" (driver input) or "reject"
    /// (user override).
    pub fn parse(name: &str) -> Option<CanonicalType> {
        let upper = name.trim().to_uppercase();
        let t = match upper.as_str() {
            "BOOLEAN" | "BOOL" => CanonicalType::Boolean,
            "SMALLINT" | "INT2" => CanonicalType::SmallInt,
            "INTEGER" | "INT" | "INT4" => CanonicalType::Integer,
            "BIGINT" | "INT8" => CanonicalType::BigInt,
            "REAL" | "FLOAT4" => CanonicalType::Real,
            "DOUBLE" | "DOUBLE PRECISION" | "FLOAT8" => CanonicalType::Double,
            "NUMERIC" | "DECIMAL" => CanonicalType::Numeric,
            "UUID" => CanonicalType::Uuid,
            "DATE" => CanonicalType::Date,
            "TIMESTAMP" | "TIMESTAMP WITHOUT TIME ZONE" => CanonicalType::Timestamp,
            "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" => CanonicalType::TimestampTz,
            "VARCHAR" | "CHARACTER VARYING" => CanonicalType::Varchar,
            "TEXT" => CanonicalType::Text,
            "JSON" => CanonicalType::Json,
            "JSONB" => CanonicalType::Jsonb,
            "BYTES" | "BYTEA" => CanonicalType::Bytes,
            "_TEXT" => CanonicalType::TextArray,
            _ => return None,
        };
        Some(t)
    }

    /// Whether the type carries textual JSON payloads.
    pub fn is_json(&self) -> bool {
        matches!(
            self,
            CanonicalType::Json | CanonicalType::Jsonb | CanonicalType::TextArray
        )
    }
}

impl std::fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of normalizing a driver type: the canonical tag plus any
/// attributes the rule adjusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedType {
    pub canonical: CanonicalType,
    pub precision: i64,
    pub scale: i64,
}

impl NormalizedType {
    fn plain(canonical: CanonicalType) -> Self {
        Self {
            canonical,
            precision: 0,
            scale: 0,
        }
    }

    fn numeric(precision: i64, scale: i64) -> Self {
        Self {
            canonical: CanonicalType::Numeric,
            precision,
            scale,
        }
    }
}

/// SQL Server length sentinel for `varchar(max)` / `nvarchar(max)`.
const MSSQL_UNBOUNDED: i64 = -1;

/// Snowflake TEXT columns report this length when unbounded.
const SNOWFLAKE_MAX_TEXT: i64 = 16_777_216;

/// Normalize a SQL Server type name reported at preflight.
pub fn mssql_to_canonical(
    driver_type: &str,
    length: i64,
    precision: i64,
    scale: i64,
) -> NormalizedType {
    match driver_type.to_uppercase().as_str() {
        "BIT" => NormalizedType::plain(CanonicalType::Boolean),
        "TINYINT" | "SMALLINT" => NormalizedType::plain(CanonicalType::SmallInt),
        "INT" => NormalizedType::plain(CanonicalType::Integer),
        "BIGINT" => NormalizedType::plain(CanonicalType::BigInt),
        "REAL" => NormalizedType::plain(CanonicalType::Real),
        "FLOAT" => NormalizedType::plain(CanonicalType::Double),
        "DECIMAL" | "NUMERIC" | "MONEY" | "SMALLMONEY" => NormalizedType::numeric(precision, scale),
        "DATETIMEOFFSET" => NormalizedType::plain(CanonicalType::TimestampTz),
        "DATETIME" | "DATETIME2" | "SMALLDATETIME" => NormalizedType::plain(CanonicalType::Timestamp),
        "DATE" => NormalizedType::plain(CanonicalType::Date),
        "UNIQUEIDENTIFIER" => NormalizedType::plain(CanonicalType::Uuid),
        "VARBINARY" | "BINARY" | "IMAGE" => NormalizedType::plain(CanonicalType::Bytes),
        "NVARCHAR" | "VARCHAR" | "CHAR" | "NCHAR" => {
            if length == MSSQL_UNBOUNDED {
                NormalizedType::plain(CanonicalType::Text)
            } else {
                NormalizedType::plain(CanonicalType::Varchar)
            }
        }
        "NTEXT" | "TEXT" | "XML" => NormalizedType::plain(CanonicalType::Text),
        _ => NormalizedType::plain(CanonicalType::Text),
    }
}

/// Normalize a Snowflake type name reported at preflight.
///
/// `TIMESTAMP_LTZ` is treated the same as `TIMESTAMP_NTZ`: local-time
/// values arrive with no offset, so callers must set the session timezone
/// to get the wall-clock they expect.
pub fn snowflake_to_canonical(
    driver_type: &str,
    length: i64,
    precision: i64,
    scale: i64,
) -> NormalizedType {
    match driver_type.to_uppercase().as_str() {
        "FIXED" | "NUMBER" => {
            if scale == 0 {
                if precision <= 4 {
                    NormalizedType::plain(CanonicalType::SmallInt)
                } else if precision <= 9 {
                    NormalizedType::plain(CanonicalType::Integer)
                } else {
                    NormalizedType::plain(CanonicalType::BigInt)
                }
            } else {
                NormalizedType::numeric(precision, scale)
            }
        }
        "REAL" | "FLOAT" | "DOUBLE" => NormalizedType::plain(CanonicalType::Double),
        "BOOLEAN" => NormalizedType::plain(CanonicalType::Boolean),
        "DATE" => NormalizedType::plain(CanonicalType::Date),
        "TIMESTAMP_NTZ" | "TIMESTAMP_LTZ" => NormalizedType::plain(CanonicalType::Timestamp),
        "TIMESTAMP_TZ" => NormalizedType::plain(CanonicalType::TimestampTz),
        "ARRAY" | "VARIANT" | "OBJECT" => NormalizedType::plain(CanonicalType::Jsonb),
        "BINARY" => NormalizedType::plain(CanonicalType::Bytes),
        "TEXT" => {
            if length > 0 && length < SNOWFLAKE_MAX_TEXT {
                NormalizedType::plain(CanonicalType::Varchar)
            } else {
                NormalizedType::plain(CanonicalType::Text)
            }
        }
        _ => NormalizedType::plain(CanonicalType::Text),
    }
}

/// Reorder a SQL Server UNIQUEIDENTIFIER payload into RFC-4122 order.
///
/// The server stores the first three fields little-endian; bytes 0-3, 4-5
/// and 6-7 are each reversed, bytes 8-15 are unchanged. The swap is its
/// own inverse.
pub fn swap_uuid_fields(bytes: [u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0] = bytes[3];
    out[1] = bytes[2];
    out[2] = bytes[1];
    out[3] = bytes[0];
    out[4] = bytes[5];
    out[5] = bytes[4];
    out[6] = bytes[7];
    out[7] = bytes[6];
    out[8..16].copy_from_slice(&bytes[8..16]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_alias_resolution() {
        assert_eq!(CanonicalType::parse("bool"), Some(CanonicalType::Boolean));
        assert_eq!(CanonicalType::parse("INT2"), Some(CanonicalType::SmallInt));
        assert_eq!(CanonicalType::parse("int4"), Some(CanonicalType::Integer));
        assert_eq!(CanonicalType::parse("INT8"), Some(CanonicalType::BigInt));
        assert_eq!(CanonicalType::parse("float4"), Some(CanonicalType::Real));
        assert_eq!(CanonicalType::parse("FLOAT8"), Some(CanonicalType::Double));
        assert_eq!(CanonicalType::parse("decimal"), Some(CanonicalType::Numeric));
        assert_eq!(
            CanonicalType::parse("timestamp with time zone"),
            Some(CanonicalType::TimestampTz)
        );
        assert_eq!(CanonicalType::parse("bytea"), Some(CanonicalType::Bytes));
        assert_eq!(CanonicalType::parse("_text"), Some(CanonicalType::TextArray));
        assert_eq!(CanonicalType::parse("geography"), None);
    }

    #[test]
    fn test_mssql_rules() {
        assert_eq!(
            mssql_to_canonical("BIT", 0, 0, 0).canonical,
            CanonicalType::Boolean
        );
        assert_eq!(
            mssql_to_canonical("INT", 0, 0, 0).canonical,
            CanonicalType::Integer
        );
        assert_eq!(
            mssql_to_canonical("FLOAT", 0, 0, 0).canonical,
            CanonicalType::Double
        );
        assert_eq!(
            mssql_to_canonical("DATETIMEOFFSET", 0, 0, 0).canonical,
            CanonicalType::TimestampTz
        );
        assert_eq!(
            mssql_to_canonical("DATETIME2", 0, 0, 0).canonical,
            CanonicalType::Timestamp
        );
        assert_eq!(
            mssql_to_canonical("UNIQUEIDENTIFIER", 0, 0, 0).canonical,
            CanonicalType::Uuid
        );

        let dec = mssql_to_canonical("DECIMAL", 0, 18, 4);
        assert_eq!(dec.canonical, CanonicalType::Numeric);
        assert_eq!((dec.precision, dec.scale), (18, 4));

        assert_eq!(
            mssql_to_canonical("NVARCHAR", 100, 0, 0).canonical,
            CanonicalType::Varchar
        );
        assert_eq!(
            mssql_to_canonical("NVARCHAR", -1, 0, 0).canonical,
            CanonicalType::Text
        );
    }

    #[test]
    fn test_snowflake_fixed_scale_zero_widths() {
        assert_eq!(
            snowflake_to_canonical("FIXED", 0, 4, 0).canonical,
            CanonicalType::SmallInt
        );
        assert_eq!(
            snowflake_to_canonical("FIXED", 0, 9, 0).canonical,
            CanonicalType::Integer
        );
        assert_eq!(
            snowflake_to_canonical("FIXED", 0, 38, 0).canonical,
            CanonicalType::BigInt
        );
        let dec = snowflake_to_canonical("FIXED", 0, 38, 15);
        assert_eq!(dec.canonical, CanonicalType::Numeric);
        assert_eq!((dec.precision, dec.scale), (38, 15));
    }

    #[test]
    fn test_snowflake_timestamps_and_semistructured() {
        assert_eq!(
            snowflake_to_canonical("TIMESTAMP_NTZ", 0, 0, 0).canonical,
            CanonicalType::Timestamp
        );
        assert_eq!(
            snowflake_to_canonical("TIMESTAMP_LTZ", 0, 0, 0).canonical,
            CanonicalType::Timestamp
        );
        assert_eq!(
            snowflake_to_canonical("TIMESTAMP_TZ", 0, 0, 0).canonical,
            CanonicalType::TimestampTz
        );
        assert_eq!(
            snowflake_to_canonical("VARIANT", 0, 0, 0).canonical,
            CanonicalType::Jsonb
        );
        assert_eq!(
            snowflake_to_canonical("TEXT", 255, 0, 0).canonical,
            CanonicalType::Varchar
        );
        assert_eq!(
            snowflake_to_canonical("TEXT", 16_777_216, 0, 0).canonical,
            CanonicalType::Text
        );
    }

    #[test]
    fn test_unknown_types_fall_back_to_text() {
        assert_eq!(
            mssql_to_canonical("SQL_VARIANT", 0, 0, 0).canonical,
            CanonicalType::Text
        );
        assert_eq!(
            snowflake_to_canonical("GEOGRAPHY", 0, 0, 0).canonical,
            CanonicalType::Text
        );
    }

    #[test]
    fn test_uuid_field_swap() {
        let wire: [u8; 16] = [
            0x99, 0xbc, 0xee, 0xa0, 0x0b, 0x9c, 0xf8, 0x4e, 0xbb, 0x6d, 0x6b, 0xb9, 0xbd, 0x38,
            0x0a, 0x11,
        ];
        let swapped = swap_uuid_fields(wire);
        let uuid = Uuid::from_bytes(swapped);
        assert_eq!(uuid.to_string(), "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11");

        // applying the swap twice recovers the wire order
        assert_eq!(swap_uuid_fields(swapped), wire);
    }
}
