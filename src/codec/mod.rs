//! Typed value codec.
//!
//! Every cloud variable is stored as a canonical string. This module converts
//! between that string and the native typed value:
//! - integers and floats use the standard textual number format
//! - booleans are written as `1` / `0` (reads also accept `true` / `false`)
//! - timestamps are milliseconds since 1970-01-01T00:00:00Z
//! - decimals keep their exact digits and scale

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{SyncError, SyncResult};

/// Declared type of a cloud variable.
///
/// The numeric codes are part of the persisted format and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Double,
    Float,
    Int,
    String,
    #[serde(rename = "uint", alias = "u_int")]
    UInt,
    Long,
    Decimal,
    Timestamp,
}

impl DataType {
    /// Persisted numeric code.
    pub const fn code(self) -> i64 {
        match self {
            DataType::Bool => 0,
            DataType::Double => 1,
            DataType::Float => 2,
            DataType::Int => 3,
            DataType::String => 4,
            DataType::UInt => 5,
            DataType::Long => 6,
            DataType::Decimal => 7,
            DataType::Timestamp => 8,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        let data_type = match code {
            0 => DataType::Bool,
            1 => DataType::Double,
            2 => DataType::Float,
            3 => DataType::Int,
            4 => DataType::String,
            5 => DataType::UInt,
            6 => DataType::Long,
            7 => DataType::Decimal,
            8 => DataType::Timestamp,
            _ => return None,
        };
        Some(data_type)
    }

    /// Returns true if values of this type can be merged by Highest/Lowest.
    pub const fn is_ordered(self) -> bool {
        !matches!(self, DataType::Bool | DataType::String)
    }

    /// The value a variable of this type holds when nothing else is declared.
    pub fn zero_value(self) -> TypedValue {
        match self {
            DataType::Bool => TypedValue::Bool(false),
            DataType::Double => TypedValue::Double(0.0),
            DataType::Float => TypedValue::Float(0.0),
            DataType::Int => TypedValue::Int(0),
            DataType::String => TypedValue::String(String::new()),
            DataType::UInt => TypedValue::UInt(0),
            DataType::Long => TypedValue::Long(0),
            DataType::Decimal => TypedValue::Decimal(Decimal::ZERO),
            DataType::Timestamp => TypedValue::Timestamp(DateTime::<Utc>::default()),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::Double => "double",
            DataType::Float => "float",
            DataType::Int => "int",
            DataType::String => "string",
            DataType::UInt => "uint",
            DataType::Long => "long",
            DataType::Decimal => "decimal",
            DataType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

impl FromStr for DataType {
    type Err = SyncError;

    /// Accepts the type name in any case, as written by older clients.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(DataType::Bool),
            "double" => Ok(DataType::Double),
            "float" => Ok(DataType::Float),
            "int" => Ok(DataType::Int),
            "string" => Ok(DataType::String),
            "uint" => Ok(DataType::UInt),
            "long" => Ok(DataType::Long),
            "decimal" => Ok(DataType::Decimal),
            "timestamp" | "datetime" => Ok(DataType::Timestamp),
            other => Err(SyncError::General(format!("Unknown data type: {}", other))),
        }
    }
}

/// A decoded, native cloud variable value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Bool(bool),
    Double(f64),
    Float(f32),
    Int(i32),
    String(String),
    UInt(u32),
    Long(i64),
    Decimal(Decimal),
    Timestamp(DateTime<Utc>),
}

impl TypedValue {
    pub fn data_type(&self) -> DataType {
        match self {
            TypedValue::Bool(_) => DataType::Bool,
            TypedValue::Double(_) => DataType::Double,
            TypedValue::Float(_) => DataType::Float,
            TypedValue::Int(_) => DataType::Int,
            TypedValue::String(_) => DataType::String,
            TypedValue::UInt(_) => DataType::UInt,
            TypedValue::Long(_) => DataType::Long,
            TypedValue::Decimal(_) => DataType::Decimal,
            TypedValue::Timestamp(_) => DataType::Timestamp,
        }
    }

    /// Canonical string encoding of this value.
    pub fn encode(&self) -> String {
        encode(self)
    }

    /// Orders two values of the same ordered type.
    ///
    /// Returns `None` for mismatched types, for bool/string, and for NaN.
    pub fn compare(&self, other: &TypedValue) -> Option<Ordering> {
        match (self, other) {
            (TypedValue::Double(a), TypedValue::Double(b)) => a.partial_cmp(b),
            (TypedValue::Float(a), TypedValue::Float(b)) => a.partial_cmp(b),
            (TypedValue::Int(a), TypedValue::Int(b)) => Some(a.cmp(b)),
            (TypedValue::UInt(a), TypedValue::UInt(b)) => Some(a.cmp(b)),
            (TypedValue::Long(a), TypedValue::Long(b)) => Some(a.cmp(b)),
            (TypedValue::Decimal(a), TypedValue::Decimal(b)) => Some(a.cmp(b)),
            (TypedValue::Timestamp(a), TypedValue::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Encode a typed value into its canonical string.
pub fn encode(value: &TypedValue) -> String {
    match value {
        TypedValue::Bool(b) => String::from(if *b { "1" } else { "0" }),
        TypedValue::Double(v) => v.to_string(),
        TypedValue::Float(v) => v.to_string(),
        TypedValue::Int(v) => v.to_string(),
        TypedValue::String(s) => s.clone(),
        TypedValue::UInt(v) => v.to_string(),
        TypedValue::Long(v) => v.to_string(),
        TypedValue::Decimal(d) => d.to_string(),
        TypedValue::Timestamp(ts) => ts.timestamp_millis().to_string(),
    }
}

/// Decode a canonical string as `data_type`.
///
/// Fails with [`SyncError::Format`] if the string does not parse. NaN and
/// infinities are not valid floats.
pub fn decode(data_type: DataType, raw: &str) -> SyncResult<TypedValue> {
    let format_error = || SyncError::Format {
        data_type,
        value: raw.to_string(),
    };

    let value = match data_type {
        DataType::Bool => TypedValue::Bool(decode_bool(raw).ok_or_else(format_error)?),
        DataType::Double => {
            let v: f64 = raw.trim().parse().map_err(|_| format_error())?;
            if !v.is_finite() {
                return Err(format_error());
            }
            TypedValue::Double(v)
        }
        DataType::Float => {
            let v: f32 = raw.trim().parse().map_err(|_| format_error())?;
            if !v.is_finite() {
                return Err(format_error());
            }
            TypedValue::Float(v)
        }
        DataType::Int => TypedValue::Int(raw.trim().parse().map_err(|_| format_error())?),
        DataType::String => TypedValue::String(raw.to_string()),
        DataType::UInt => TypedValue::UInt(raw.trim().parse().map_err(|_| format_error())?),
        DataType::Long => TypedValue::Long(raw.trim().parse().map_err(|_| format_error())?),
        DataType::Decimal => {
            TypedValue::Decimal(Decimal::from_str(raw.trim()).map_err(|_| format_error())?)
        }
        DataType::Timestamp => {
            let millis: i64 = raw.trim().parse().map_err(|_| format_error())?;
            TypedValue::Timestamp(timestamp_from_millis(millis).ok_or_else(format_error)?)
        }
    };

    Ok(value)
}

/// Booleans are written as 1/0. Any other integer reads as false,
/// and the words true/false are accepted in any case.
fn decode_bool(raw: &str) -> Option<bool> {
    let trimmed = raw.trim();
    if let Ok(number) = trimmed.parse::<i64>() {
        return Some(number == 1);
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Convert milliseconds since the Unix epoch into a UTC instant.
pub fn timestamp_from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Drop sub-millisecond precision, which the persisted format cannot hold.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    timestamp_from_millis(ts.timestamp_millis()).unwrap_or(ts)
}
