//! Arbitrary-precision decimal scaling and fixed-byte encoding.
//!
//! A NUMERIC(p,s) value is carried as its unscaled integer
//! `round(v * 10^s)`. Values with p <= 9 fit INT32, p <= 18 fit INT64,
//! larger precisions are encoded as big-endian two's-complement byte
//! strings of a fixed width derived from the precision.

use num_bigint::{BigInt, Sign};
use num_traits::{ToPrimitive, Zero};

use crate::core::{Column, Value};
use crate::error::{MvrError, Result};

/// An unscaled decimal ready for a Parquet column buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum ParquetDecimal {
    I32(i32),
    I64(i64),
    Bytes(Vec<u8>),
}

/// Byte width of the FIXED_LEN_BYTE_ARRAY encoding for a precision.
///
/// `ceil((ceil(p * log2(10)) + 1) / 8)`: enough bits for 10^p - 1 plus a
/// sign bit, rounded up to whole bytes.
pub fn fixed_len_for_precision(precision: i64) -> usize {
    let bits_needed = (precision as f64 * 10f64.log2()).ceil() as usize + 1;
    bits_needed.div_ceil(8)
}

/// Convert a decimal string to its unscaled integer.
///
/// Splits on the decimal point, rejects more than one point or a
/// fractional part longer than `scale`, right-pads the fraction with
/// zeros to `scale`, concatenates and parses as a signed big integer.
pub fn unscaled_from_str(decimal_str: &str, scale: i64) -> Result<BigInt> {
    if decimal_str.is_empty() {
        return Err(MvrError::Stream("empty decimal string".to_string()));
    }

    let (negative, digits) = match decimal_str.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, decimal_str),
    };

    let mut parts = digits.split('.');
    let integer_part = parts.next().unwrap_or("");
    let fractional_part = parts.next().unwrap_or("");
    if parts.next().is_some() {
        return Err(MvrError::Stream(format!(
            "invalid decimal format: {}",
            decimal_str
        )));
    }

    if fractional_part.len() as i64 > scale {
        return Err(MvrError::Stream(format!(
            "fractional part exceeds scale {}: {}",
            scale, decimal_str
        )));
    }

    let mut unscaled = String::with_capacity(integer_part.len() + scale as usize);
    unscaled.push_str(integer_part);
    unscaled.push_str(fractional_part);
    for _ in 0..(scale as usize - fractional_part.len()) {
        unscaled.push('0');
    }

    let mut value: BigInt = unscaled
        .parse()
        .map_err(|_| MvrError::Stream(format!("failed to parse unscaled value: {}", unscaled)))?;
    if negative {
        value = -value;
    }
    Ok(value)
}

/// Encode an unscaled integer as a big-endian two's-complement byte
/// string of exactly `fixed_len_for_precision(precision)` bytes.
///
/// Negative values are encoded as `2^(8*size) - |v|` with 0xFF fill in
/// the leading bytes; values whose magnitude needs more than `size`
/// bytes are rejected.
pub fn bigint_to_fixed_bytes(value: &BigInt, precision: i64) -> Result<Vec<u8>> {
    let size = fixed_len_for_precision(precision);

    if value.bits() > (8 * size) as u64 {
        return Err(MvrError::Stream(format!(
            "value {} exceeds {} bytes",
            value, size
        )));
    }

    let raw = if value.sign() == Sign::Minus {
        // 2^(8*size) - |v|, as v is negative this is 2^(8*size) + v
        let twos = (BigInt::from(1u8) << (8 * size)) + value;
        twos.to_bytes_be().1
    } else if value.is_zero() {
        vec![]
    } else {
        value.to_bytes_be().1
    };

    if raw.len() > size {
        return Err(MvrError::Stream(format!(
            "value {} exceeds {} bytes",
            value, size
        )));
    }

    let fill = if value.sign() == Sign::Minus { 0xFF } else { 0x00 };
    let mut fixed = vec![fill; size];
    fixed[size - raw.len()..].copy_from_slice(&raw);
    Ok(fixed)
}

/// Reduce a cell to its unscaled integer for the column's scale.
fn unscaled_from_value(value: &Value, column: &Column) -> Result<BigInt> {
    let scale = column.scale;
    match value {
        Value::Decimal(d) => {
            let fixed = format!("{:.*}", scale.max(0) as usize, d);
            unscaled_from_str(&fixed, scale)
        }
        Value::Text(s) => unscaled_from_str(s, scale),
        Value::F64(_) | Value::F32(_) => {
            let f = value.as_f64().unwrap_or(0.0);
            let fixed = format!("{:.*}", scale.max(0) as usize, f);
            unscaled_from_str(&fixed, scale)
        }
        Value::I16(_) | Value::I32(_) | Value::I64(_) => {
            let base = BigInt::from(value.as_i64().unwrap_or(0));
            Ok(base * BigInt::from(10u8).pow(scale.max(0) as u32))
        }
        other => Err(MvrError::encode(
            &column.name,
            format!("unsupported value {:?} for NUMERIC conversion", other),
        )),
    }
}

/// Unscaled integer as i128 for Arrow Decimal128 buffers.
pub fn unscaled_i128(value: &Value, column: &Column) -> Result<i128> {
    let unscaled = unscaled_from_value(value, column)?;
    unscaled.to_i128().ok_or_else(|| {
        MvrError::encode(
            &column.name,
            format!("unscaled value {} does not fit 128 bits", unscaled),
        )
    })
}

/// Convert a cell into the Parquet decimal form implied by the column's
/// precision, with fit checks at each width.
pub fn to_parquet_decimal(value: &Value, column: &Column) -> Result<ParquetDecimal> {
    let unscaled = unscaled_from_value(value, column)?;
    let precision = column.precision;

    if precision <= 9 {
        let v = unscaled.to_i32().ok_or_else(|| {
            MvrError::encode(
                &column.name,
                format!("unscaled value {} does not fit INT32", unscaled),
            )
        })?;
        Ok(ParquetDecimal::I32(v))
    } else if precision <= 18 {
        let v = unscaled.to_i64().ok_or_else(|| {
            MvrError::encode(
                &column.name,
                format!("unscaled value {} does not fit INT64", unscaled),
            )
        })?;
        Ok(ParquetDecimal::I64(v))
    } else {
        Ok(ParquetDecimal::Bytes(bigint_to_fixed_bytes(
            &unscaled, precision,
        )?))
    }
}
