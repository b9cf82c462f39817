//! PostgreSQL type encoding and decoding.
//!
//! This module provides binary and text format encoding/decoding for the
//! built-in PostgreSQL types, plus the `Encode` / `Decode` contract used to
//! move Rust values in and out of queries.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};

use crate::buffer::ReadBuffer;
use crate::error::{PgError, PgResult};

/// Microseconds between 1970-01-01 and 2000-01-01, the PostgreSQL epoch.
const PG_EPOCH_UNIX_MICROS: i64 = 946_684_800_000_000;

/// Days from 0001-01-01 (CE day 1) to 2000-01-01.
const PG_EPOCH_CE_DAYS: i32 = 730_120;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    /// Lets the server infer the type.
    pub const UNSPECIFIED: Oid = Oid(0);

    // Boolean types
    pub const BOOL: Oid = Oid(16);

    // Binary data
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);

    // Text types
    pub const TEXT: Oid = Oid(25);

    // OID type
    pub const OID_TYPE: Oid = Oid(26);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);

    pub const UNKNOWN: Oid = Oid(705);

    // String types
    pub const VARCHAR: Oid = Oid(1043);
    pub const BPCHAR: Oid = Oid(1042);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);

    // UUID
    pub const UUID: Oid = Oid(2950);

    // JSON types
    pub const JSON: Oid = Oid(114);
    pub const JSONB: Oid = Oid(3802);

    // Numeric
    pub const NUMERIC: Oid = Oid(1700);

    // Array types
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const BYTEA_ARRAY: Oid = Oid(1001);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIME_ARRAY: Oid = Oid(1183);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);
    pub const UUID_ARRAY: Oid = Oid(2951);
    pub const JSON_ARRAY: Oid = Oid(199);
    pub const JSONB_ARRAY: Oid = Oid(3807);

    const ARRAYS: [(Oid, Oid); 16] = [
        (Oid::BOOL, Oid::BOOL_ARRAY),
        (Oid::BYTEA, Oid::BYTEA_ARRAY),
        (Oid::INT2, Oid::INT2_ARRAY),
        (Oid::INT4, Oid::INT4_ARRAY),
        (Oid::TEXT, Oid::TEXT_ARRAY),
        (Oid::VARCHAR, Oid::VARCHAR_ARRAY),
        (Oid::INT8, Oid::INT8_ARRAY),
        (Oid::FLOAT4, Oid::FLOAT4_ARRAY),
        (Oid::FLOAT8, Oid::FLOAT8_ARRAY),
        (Oid::TIMESTAMP, Oid::TIMESTAMP_ARRAY),
        (Oid::DATE, Oid::DATE_ARRAY),
        (Oid::TIME, Oid::TIME_ARRAY),
        (Oid::TIMESTAMPTZ, Oid::TIMESTAMPTZ_ARRAY),
        (Oid::UUID, Oid::UUID_ARRAY),
        (Oid::JSON, Oid::JSON_ARRAY),
        (Oid::JSONB, Oid::JSONB_ARRAY),
    ];

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }

    /// Element type of a one-dimensional array type.
    pub fn array_element(self) -> Option<Oid> {
        Self::ARRAYS
            .iter()
            .find(|(_, array)| *array == self)
            .map(|(element, _)| *element)
    }

    /// Array type whose elements are of this type.
    pub fn array_of(self) -> Option<Oid> {
        Self::ARRAYS
            .iter()
            .find(|(element, _)| *element == self)
            .map(|(_, array)| *array)
    }

    /// The catalog name of a built-in type, `"unknown"` otherwise.
    pub fn name(self) -> &'static str {
        match self {
            Oid::BOOL => "bool",
            Oid::BYTEA => "bytea",
            Oid::CHAR => "char",
            Oid::NAME => "name",
            Oid::INT8 => "int8",
            Oid::INT2 => "int2",
            Oid::INT4 => "int4",
            Oid::TEXT => "text",
            Oid::OID_TYPE => "oid",
            Oid::FLOAT4 => "float4",
            Oid::FLOAT8 => "float8",
            Oid::VARCHAR => "varchar",
            Oid::BPCHAR => "bpchar",
            Oid::DATE => "date",
            Oid::TIME => "time",
            Oid::TIMESTAMP => "timestamp",
            Oid::TIMESTAMPTZ => "timestamptz",
            Oid::INTERVAL => "interval",
            Oid::TIMETZ => "timetz",
            Oid::UUID => "uuid",
            Oid::JSON => "json",
            Oid::JSONB => "jsonb",
            Oid::NUMERIC => "numeric",
            Oid::BOOL_ARRAY => "_bool",
            Oid::BYTEA_ARRAY => "_bytea",
            Oid::INT2_ARRAY => "_int2",
            Oid::INT4_ARRAY => "_int4",
            Oid::TEXT_ARRAY => "_text",
            Oid::VARCHAR_ARRAY => "_varchar",
            Oid::INT8_ARRAY => "_int8",
            Oid::FLOAT4_ARRAY => "_float4",
            Oid::FLOAT8_ARRAY => "_float8",
            Oid::TIMESTAMP_ARRAY => "_timestamp",
            Oid::DATE_ARRAY => "_date",
            Oid::TIME_ARRAY => "_time",
            Oid::TIMESTAMPTZ_ARRAY => "_timestamptz",
            Oid::UUID_ARRAY => "_uuid",
            Oid::JSON_ARRAY => "_json",
            Oid::JSONB_ARRAY => "_jsonb",
            _ => "unknown",
        }
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Uuid([u8; 16]),
    // Timestamps stored as microseconds since 2000-01-01
    Timestamp(i64),
    TimestampTz(i64),
    // Days since 2000-01-01
    Date(i32),
    // Microseconds since midnight
    Time(i64),
    Json(String),
    /// One-dimensional array.
    Array {
        element: Oid,
        values: Vec<PgValue>,
    },
    // For types we don't handle specially - store raw bytes
    Raw {
        oid: Oid,
        data: Vec<u8>,
    },
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Encode this value to binary format.
    pub fn encode_binary(&self) -> Vec<u8> {
        match self {
            PgValue::Null => vec![],
            PgValue::Bool(v) => vec![u8::from(*v)],
            PgValue::Int2(v) => v.to_be_bytes().to_vec(),
            PgValue::Int4(v) => v.to_be_bytes().to_vec(),
            PgValue::Int8(v) => v.to_be_bytes().to_vec(),
            PgValue::Float4(v) => v.to_be_bytes().to_vec(),
            PgValue::Float8(v) => v.to_be_bytes().to_vec(),
            PgValue::Text(v) => v.as_bytes().to_vec(),
            PgValue::Bytea(v) => v.clone(),
            PgValue::Uuid(v) => v.to_vec(),
            PgValue::Timestamp(v) | PgValue::TimestampTz(v) => v.to_be_bytes().to_vec(),
            PgValue::Date(v) => v.to_be_bytes().to_vec(),
            PgValue::Time(v) => v.to_be_bytes().to_vec(),
            PgValue::Json(v) => {
                // jsonb version byte
                let mut out = Vec::with_capacity(v.len() + 1);
                out.push(1);
                out.extend_from_slice(v.as_bytes());
                out
            }
            PgValue::Array { element, values } => encode_array(*element, values),
            PgValue::Raw { data, .. } => data.clone(),
        }
    }

    /// Encode this value in the text format, `None` for NULL and raw values.
    pub fn encode_text(&self) -> Option<String> {
        let text = match self {
            PgValue::Null | PgValue::Raw { .. } => return None,
            PgValue::Bool(v) => (if *v { "t" } else { "f" }).to_string(),
            PgValue::Int2(v) => v.to_string(),
            PgValue::Int4(v) => v.to_string(),
            PgValue::Int8(v) => v.to_string(),
            PgValue::Float4(v) => format_float(f64::from(*v)),
            PgValue::Float8(v) => format_float(*v),
            PgValue::Text(v) | PgValue::Json(v) => v.clone(),
            PgValue::Bytea(v) => {
                let mut out = String::with_capacity(2 + v.len() * 2);
                out.push_str("\\x");
                for b in v {
                    out.push_str(&format!("{b:02x}"));
                }
                out
            }
            PgValue::Uuid(v) => uuid::Uuid::from_bytes(*v).hyphenated().to_string(),
            PgValue::Timestamp(v) => timestamp_from_micros(*v)?
                .format("%Y-%m-%d %H:%M:%S%.6f")
                .to_string(),
            PgValue::TimestampTz(v) => timestamp_from_micros(*v)?
                .format("%Y-%m-%d %H:%M:%S%.6f+00")
                .to_string(),
            PgValue::Date(v) => date_from_days(*v)?.format("%Y-%m-%d").to_string(),
            PgValue::Time(v) => time_from_micros(*v)?.format("%H:%M:%S%.6f").to_string(),
            PgValue::Array { values, .. } => {
                let items: Vec<Option<String>> = values.iter().map(PgValue::encode_text).collect();
                format_array_literal(&items)
            }
        };
        Some(text)
    }

    /// Get the OID for this value's type
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNSPECIFIED,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::TimestampTz(_) => Oid::TIMESTAMPTZ,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Array { element, .. } => element.array_of().unwrap_or(Oid::UNSPECIFIED),
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Convert towards `target` without losing information.
    ///
    /// Returns `None` when no lossless binary conversion exists; callers then
    /// fall back to the text format and let the server parse the value.
    pub fn coerce(&self, target: Oid) -> Option<PgValue> {
        use PgValue::*;

        if target == Oid::UNSPECIFIED || self.type_oid() == target {
            return Some(self.clone());
        }

        match (self, target) {
            (Null, _) => Some(Null),
            (Int2(v), Oid::INT4) => Some(Int4(i32::from(*v))),
            (Int2(v), Oid::INT8) => Some(Int8(i64::from(*v))),
            (Int4(v), Oid::INT2) => i16::try_from(*v).ok().map(Int2),
            (Int4(v), Oid::INT8) => Some(Int8(i64::from(*v))),
            (Int8(v), Oid::INT2) => i16::try_from(*v).ok().map(Int2),
            (Int8(v), Oid::INT4) => i32::try_from(*v).ok().map(Int4),
            (Int2(v), Oid::FLOAT4) => Some(Float4(f32::from(*v))),
            (Int2(v), Oid::FLOAT8) => Some(Float8(f64::from(*v))),
            (Int4(v), Oid::FLOAT8) => Some(Float8(f64::from(*v))),
            (Float4(v), Oid::FLOAT8) => Some(Float8(f64::from(*v))),
            // varchar, bpchar and name share text's binary format
            (Text(_), t) if t.is_text_like() => Some(self.clone()),
            (Timestamp(v), Oid::TIMESTAMPTZ) => Some(TimestampTz(*v)),
            (TimestampTz(v), Oid::TIMESTAMP) => Some(Timestamp(*v)),
            (Array { values, .. }, t) => {
                let element = t.array_element()?;
                let values = values
                    .iter()
                    .map(|v| v.coerce(element))
                    .collect::<Option<Vec<_>>>()?;
                Some(Array { element, values })
            }
            _ => None,
        }
    }

    /// Decode a value from binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> Result<Self, String> {
        match oid {
            Oid::BOOL => {
                let [b] = fixed::<1>(data, "bool")?;
                Ok(PgValue::Bool(b != 0))
            }
            Oid::INT2 => Ok(PgValue::Int2(i16::from_be_bytes(fixed(data, "int2")?))),
            Oid::INT4 => Ok(PgValue::Int4(i32::from_be_bytes(fixed(data, "int4")?))),
            Oid::INT8 => Ok(PgValue::Int8(i64::from_be_bytes(fixed(data, "int8")?))),
            Oid::FLOAT4 => Ok(PgValue::Float4(f32::from_be_bytes(fixed(data, "float4")?))),
            Oid::FLOAT8 => Ok(PgValue::Float8(f64::from_be_bytes(fixed(data, "float8")?))),

            _ if oid.is_text_like() => std::str::from_utf8(data)
                .map(|s| PgValue::Text(s.to_owned()))
                .map_err(|e| format!("invalid UTF-8 in text: {e}")),

            Oid::BYTEA => Ok(PgValue::Bytea(data.to_vec())),
            Oid::UUID => Ok(PgValue::Uuid(fixed(data, "uuid")?)),
            Oid::TIMESTAMP => Ok(PgValue::Timestamp(i64::from_be_bytes(fixed(
                data,
                "timestamp",
            )?))),
            Oid::TIMESTAMPTZ => Ok(PgValue::TimestampTz(i64::from_be_bytes(fixed(
                data,
                "timestamptz",
            )?))),
            Oid::DATE => Ok(PgValue::Date(i32::from_be_bytes(fixed(data, "date")?))),
            Oid::TIME => Ok(PgValue::Time(i64::from_be_bytes(fixed(data, "time")?))),

            Oid::JSON | Oid::JSONB => {
                // JSONB has a version byte prefix
                let json_data = match (oid, data.split_first()) {
                    (Oid::JSONB, Some((1, rest))) => rest,
                    (Oid::JSONB, Some((version, _))) => {
                        return Err(format!("unsupported jsonb version {version}"))
                    }
                    _ => data,
                };
                std::str::from_utf8(json_data)
                    .map(|s| PgValue::Json(s.to_owned()))
                    .map_err(|e| format!("invalid UTF-8 in json: {e}"))
            }

            Oid::NUMERIC => decode_numeric(data).map(PgValue::Text),

            _ if oid.array_element().is_some() => decode_array(data),

            // For unknown types, store raw bytes
            _ => Ok(PgValue::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }

    /// Decode from text format (simple query protocol).
    ///
    /// Date/time values the calendar types cannot represent (`infinity`,
    /// BC dates) are kept as text.
    pub fn decode_text(oid: Oid, data: &[u8]) -> Result<Self, String> {
        let text = std::str::from_utf8(data).map_err(|e| format!("invalid UTF-8: {e}"))?;

        match oid {
            Oid::BOOL => match text {
                "t" | "true" => Ok(PgValue::Bool(true)),
                "f" | "false" => Ok(PgValue::Bool(false)),
                other => Err(format!("invalid bool {other:?}")),
            },
            Oid::INT2 => text
                .parse::<i16>()
                .map(PgValue::Int2)
                .map_err(|e| format!("invalid int2: {e}")),
            Oid::INT4 => text
                .parse::<i32>()
                .map(PgValue::Int4)
                .map_err(|e| format!("invalid int4: {e}")),
            Oid::INT8 => text
                .parse::<i64>()
                .map(PgValue::Int8)
                .map_err(|e| format!("invalid int8: {e}")),
            Oid::FLOAT4 => text
                .parse::<f32>()
                .map(PgValue::Float4)
                .map_err(|e| format!("invalid float4: {e}")),
            Oid::FLOAT8 => text
                .parse::<f64>()
                .map(PgValue::Float8)
                .map_err(|e| format!("invalid float8: {e}")),
            Oid::BYTEA => Ok(PgValue::Bytea(
                decode_hex_bytea(text).unwrap_or_else(|| data.to_vec()),
            )),
            Oid::UUID => uuid::Uuid::parse_str(text)
                .map(|u| PgValue::Uuid(*u.as_bytes()))
                .map_err(|e| format!("invalid uuid: {e}")),
            Oid::JSON | Oid::JSONB => Ok(PgValue::Json(text.to_owned())),
            Oid::DATE => Ok(NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(|d| PgValue::Date(days_from_date(d)))
                .unwrap_or_else(|_| PgValue::Text(text.to_owned()))),
            Oid::TIME => Ok(NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                .map(|t| PgValue::Time(micros_from_time(t)))
                .unwrap_or_else(|_| PgValue::Text(text.to_owned()))),
            Oid::TIMESTAMP => Ok(NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .map(|ts| PgValue::Timestamp(micros_from_timestamp(ts)))
                .unwrap_or_else(|_| PgValue::Text(text.to_owned()))),
            Oid::TIMESTAMPTZ => Ok(DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
                .map(|ts| PgValue::TimestampTz(micros_from_timestamp(ts.naive_utc())))
                .unwrap_or_else(|_| PgValue::Text(text.to_owned()))),
            _ => match oid.array_element() {
                Some(element) => {
                    let items = parse_array_literal(text).map_err(|e| e.to_string())?;
                    let values = items
                        .into_iter()
                        .map(|item| match item {
                            None => Ok(PgValue::Null),
                            Some(s) => PgValue::decode_text(element, s.as_bytes()),
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(PgValue::Array { element, values })
                }
                // Default: treat as text
                None => Ok(PgValue::Text(text.to_owned())),
            },
        }
    }
}

fn fixed<const N: usize>(data: &[u8], type_name: &str) -> Result<[u8; N], String> {
    data.try_into()
        .map_err(|_| format!("invalid {type_name} length: {}", data.len()))
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        (if v > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
    } else {
        v.to_string()
    }
}

fn decode_hex_bytea(text: &str) -> Option<Vec<u8>> {
    let hex = text.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Render a binary numeric as its decimal text.
fn decode_numeric(data: &[u8]) -> Result<String, String> {
    let mut buf = ReadBuffer::new(Bytes::copy_from_slice(data));
    let err = |e: PgError| e.to_string();

    let ndigits = buf.read_i16().map_err(err)?.max(0) as usize;
    let weight = i32::from(buf.read_i16().map_err(err)?);
    let sign = buf.read_i16().map_err(err)? as u16;
    let dscale = buf.read_i16().map_err(err)?.max(0) as usize;

    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let mut digits = Vec::with_capacity(ndigits);
    for _ in 0..ndigits {
        digits.push(buf.read_i16().map_err(err)?);
    }

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }

    // Integer part: base-10000 groups 0..=weight
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            let d = digits.get(i as usize).copied().unwrap_or(0);
            if i == 0 {
                out.push_str(&d.to_string());
            } else {
                out.push_str(&format!("{d:04}"));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::new();
        let mut i = weight + 1;
        while frac.len() < dscale {
            let d = if i < 0 {
                0
            } else {
                digits.get(i as usize).copied().unwrap_or(0)
            };
            frac.push_str(&format!("{d:04}"));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Ok(out)
}

fn encode_array(element: Oid, values: &[PgValue]) -> Vec<u8> {
    let mut out = Vec::new();
    let has_null = values.iter().any(PgValue::is_null);

    if values.is_empty() {
        out.extend_from_slice(&0i32.to_be_bytes());
        out.extend_from_slice(&0i32.to_be_bytes());
        out.extend_from_slice(&element.as_i32().to_be_bytes());
        return out;
    }

    out.extend_from_slice(&1i32.to_be_bytes()); // ndim
    out.extend_from_slice(&i32::from(has_null).to_be_bytes());
    out.extend_from_slice(&element.as_i32().to_be_bytes());
    out.extend_from_slice(&(values.len() as i32).to_be_bytes());
    out.extend_from_slice(&1i32.to_be_bytes()); // lower bound

    for value in values {
        if value.is_null() {
            out.extend_from_slice(&(-1i32).to_be_bytes());
        } else {
            let encoded = value.encode_binary();
            out.extend_from_slice(&(encoded.len() as i32).to_be_bytes());
            out.extend_from_slice(&encoded);
        }
    }
    out
}

fn decode_array(data: &[u8]) -> Result<PgValue, String> {
    let mut buf = ReadBuffer::new(Bytes::copy_from_slice(data));
    let err = |e: PgError| e.to_string();

    let ndim = buf.read_i32().map_err(err)?;
    let _has_null = buf.read_i32().map_err(err)?;
    let element = Oid::from_i32(buf.read_i32().map_err(err)?);

    match ndim {
        0 => {
            return Ok(PgValue::Array {
                element,
                values: Vec::new(),
            })
        }
        1 => {}
        n => return Err(format!("{n}-dimensional arrays are not supported")),
    }

    let len = buf.read_i32().map_err(err)?.max(0) as usize;
    let _lower_bound = buf.read_i32().map_err(err)?;

    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        let item_len = buf.read_i32().map_err(err)?;
        if item_len < 0 {
            values.push(PgValue::Null);
        } else {
            let item = buf.read_exact(item_len as usize).map_err(err)?;
            values.push(PgValue::decode_binary(element, &item)?);
        }
    }

    Ok(PgValue::Array { element, values })
}

// ============================================================================
// Array literals
// ============================================================================

/// Parse a one-dimensional PostgreSQL array literal such as `{1,"a b",NULL}`.
///
/// Unquoted `NULL` (any case) becomes `None`; quoted elements keep their
/// exact text with backslash escapes resolved.
pub fn parse_array_literal(literal: &str) -> PgResult<Vec<Option<String>>> {
    let malformed = |why: &str| PgError::Protocol(format!("malformed array literal {literal:?}: {why}"));

    let mut text = literal.trim();
    // Optional dimension decoration, e.g. "[0:2]={1,2,3}"
    if text.starts_with('[') {
        let eq = text.find('=').ok_or_else(|| malformed("missing '=' after dimensions"))?;
        text = text[eq + 1..].trim_start();
    }

    let inner = text
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .ok_or_else(|| malformed("missing braces"))?;

    let mut items = Vec::new();
    if inner.trim().is_empty() {
        return Ok(items);
    }

    let mut chars = inner.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut item = String::new();
        let quoted = chars.peek() == Some(&'"');
        if quoted {
            chars.next();
            loop {
                match chars.next() {
                    Some('\\') => item.push(chars.next().ok_or_else(|| malformed("dangling escape"))?),
                    Some('"') => break,
                    Some(c) => item.push(c),
                    None => return Err(malformed("unterminated quote")),
                }
            }
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
        } else {
            while let Some(&c) = chars.peek() {
                match c {
                    ',' => break,
                    '{' | '}' => return Err(malformed("nested arrays are not supported")),
                    '\\' => {
                        chars.next();
                        item.push(chars.next().ok_or_else(|| malformed("dangling escape"))?);
                    }
                    _ => {
                        item.push(c);
                        chars.next();
                    }
                }
            }
            let trimmed = item.trim_end().len();
            item.truncate(trimmed);
        }

        if !quoted && item.eq_ignore_ascii_case("NULL") {
            items.push(None);
        } else {
            items.push(Some(item));
        }

        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(c) => return Err(malformed(&format!("unexpected character {c:?}"))),
        }
    }

    Ok(items)
}

/// Format elements as a one-dimensional array literal, quoting where needed.
pub fn format_array_literal(items: &[Option<String>]) -> String {
    let mut out = String::from("{");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match item {
            None => out.push_str("NULL"),
            Some(s) => {
                let needs_quotes = s.is_empty()
                    || s.eq_ignore_ascii_case("NULL")
                    || s
                        .chars()
                        .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace());
                if needs_quotes {
                    out.push('"');
                    for c in s.chars() {
                        if c == '"' || c == '\\' {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push('"');
                } else {
                    out.push_str(s);
                }
            }
        }
    }
    out.push('}');
    out
}

// ============================================================================
// Calendar conversions
// ============================================================================

fn timestamp_from_micros(micros: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(micros.checked_add(PG_EPOCH_UNIX_MICROS)?).map(|dt| dt.naive_utc())
}

fn micros_from_timestamp(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_micros() - PG_EPOCH_UNIX_MICROS
}

fn date_from_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(PG_EPOCH_CE_DAYS)?)
}

fn days_from_date(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - PG_EPOCH_CE_DAYS
}

fn time_from_micros(micros: i64) -> Option<NaiveTime> {
    let secs = u32::try_from(micros.div_euclid(1_000_000)).ok()?;
    let nanos = u32::try_from(micros.rem_euclid(1_000_000) * 1_000).ok()?;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
}

fn micros_from_time(time: NaiveTime) -> i64 {
    i64::from(time.num_seconds_from_midnight()) * 1_000_000 + i64::from(time.nanosecond() / 1_000)
}

// ============================================================================
// Encode / Decode
// ============================================================================

/// Conversion of a Rust value into a query parameter.
pub trait Encode {
    fn encode(&self) -> PgValue;
}

/// Conversion of a column value into a Rust value.
///
/// The error is a human-readable reason; callers attach the column context.
pub trait Decode: Sized {
    fn decode(value: &PgValue) -> Result<Self, String>;
}

fn mismatch(value: &PgValue) -> String {
    match value {
        PgValue::Null => "unexpected NULL".to_string(),
        other => format!("incompatible value {other:?}"),
    }
}

impl Encode for PgValue {
    fn encode(&self) -> PgValue {
        self.clone()
    }
}

impl Decode for PgValue {
    fn decode(value: &PgValue) -> Result<Self, String> {
        Ok(value.clone())
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self) -> PgValue {
        (**self).encode()
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self) -> PgValue {
        match self {
            Some(v) => v.encode(),
            None => PgValue::Null,
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(value: &PgValue) -> Result<Self, String> {
        match value {
            PgValue::Null => Ok(None),
            other => T::decode(other).map(Some),
        }
    }
}

macro_rules! scalar {
    ($ty:ty, $variant:ident) => {
        impl Encode for $ty {
            fn encode(&self) -> PgValue {
                PgValue::from(self.clone())
            }
        }

        impl From<$ty> for PgValue {
            fn from(v: $ty) -> Self {
                PgValue::$variant(v)
            }
        }
    };
}

scalar!(bool, Bool);
scalar!(i16, Int2);
scalar!(i32, Int4);
scalar!(i64, Int8);
scalar!(f32, Float4);
scalar!(f64, Float8);
scalar!(String, Text);
scalar!(Vec<u8>, Bytea);

impl Encode for str {
    fn encode(&self) -> PgValue {
        PgValue::Text(self.to_owned())
    }
}

impl From<&str> for PgValue {
    fn from(v: &str) -> Self {
        PgValue::Text(v.to_owned())
    }
}

impl Encode for [u8] {
    fn encode(&self) -> PgValue {
        PgValue::Bytea(self.to_vec())
    }
}

impl Encode for uuid::Uuid {
    fn encode(&self) -> PgValue {
        PgValue::Uuid(*self.as_bytes())
    }
}

impl Encode for NaiveDate {
    fn encode(&self) -> PgValue {
        PgValue::Date(days_from_date(*self))
    }
}

impl Encode for NaiveTime {
    fn encode(&self) -> PgValue {
        PgValue::Time(micros_from_time(*self))
    }
}

impl Encode for NaiveDateTime {
    fn encode(&self) -> PgValue {
        PgValue::Timestamp(micros_from_timestamp(*self))
    }
}

impl Encode for DateTime<Utc> {
    fn encode(&self) -> PgValue {
        PgValue::TimestampTz(micros_from_timestamp(self.naive_utc()))
    }
}

impl Decode for bool {
    fn decode(value: &PgValue) -> Result<Self, String> {
        match value {
            PgValue::Bool(v) => Ok(*v),
            other => Err(mismatch(other)),
        }
    }
}

impl Decode for i16 {
    fn decode(value: &PgValue) -> Result<Self, String> {
        match value {
            PgValue::Int2(v) => Ok(*v),
            other => Err(mismatch(other)),
        }
    }
}

impl Decode for i32 {
    fn decode(value: &PgValue) -> Result<Self, String> {
        match value {
            PgValue::Int2(v) => Ok(i32::from(*v)),
            PgValue::Int4(v) => Ok(*v),
            other => Err(mismatch(other)),
        }
    }
}

impl Decode for i64 {
    fn decode(value: &PgValue) -> Result<Self, String> {
        match value {
            PgValue::Int2(v) => Ok(i64::from(*v)),
            PgValue::Int4(v) => Ok(i64::from(*v)),
            PgValue::Int8(v) => Ok(*v),
            other => Err(mismatch(other)),
        }
    }
}

impl Decode for f32 {
    fn decode(value: &PgValue) -> Result<Self, String> {
        match value {
            PgValue::Float4(v) => Ok(*v),
            other => Err(mismatch(other)),
        }
    }
}

impl Decode for f64 {
    fn decode(value: &PgValue) -> Result<Self, String> {
        match value {
            PgValue::Float4(v) => Ok(f64::from(*v)),
            PgValue::Float8(v) => Ok(*v),
            other => Err(mismatch(other)),
        }
    }
}

impl Decode for String {
    fn decode(value: &PgValue) -> Result<Self, String> {
        match value {
            PgValue::Text(v) | PgValue::Json(v) => Ok(v.clone()),
            other => Err(mismatch(other)),
        }
    }
}

impl Decode for Vec<u8> {
    fn decode(value: &PgValue) -> Result<Self, String> {
        match value {
            PgValue::Bytea(v) => Ok(v.clone()),
            other => Err(mismatch(other)),
        }
    }
}

impl Decode for uuid::Uuid {
    fn decode(value: &PgValue) -> Result<Self, String> {
        match value {
            PgValue::Uuid(v) => Ok(uuid::Uuid::from_bytes(*v)),
            other => Err(mismatch(other)),
        }
    }
}

impl Decode for NaiveDate {
    fn decode(value: &PgValue) -> Result<Self, String> {
        match value {
            PgValue::Date(v) => date_from_days(*v).ok_or_else(|| format!("date out of range: {v}")),
            other => Err(mismatch(other)),
        }
    }
}

impl Decode for NaiveTime {
    fn decode(value: &PgValue) -> Result<Self, String> {
        match value {
            PgValue::Time(v) => time_from_micros(*v).ok_or_else(|| format!("time out of range: {v}")),
            other => Err(mismatch(other)),
        }
    }
}

impl Decode for NaiveDateTime {
    fn decode(value: &PgValue) -> Result<Self, String> {
        match value {
            PgValue::Timestamp(v) | PgValue::TimestampTz(v) => {
                timestamp_from_micros(*v).ok_or_else(|| format!("timestamp out of range: {v}"))
            }
            other => Err(mismatch(other)),
        }
    }
}

impl Decode for DateTime<Utc> {
    fn decode(value: &PgValue) -> Result<Self, String> {
        NaiveDateTime::decode(value).map(|ts| ts.and_utc())
    }
}

macro_rules! array {
    ($ty:ty, $element:expr) => {
        impl Encode for Vec<$ty> {
            fn encode(&self) -> PgValue {
                PgValue::Array {
                    element: $element,
                    values: self.iter().map(Encode::encode).collect(),
                }
            }
        }

        impl Encode for Vec<Option<$ty>> {
            fn encode(&self) -> PgValue {
                PgValue::Array {
                    element: $element,
                    values: self.iter().map(Encode::encode).collect(),
                }
            }
        }

        impl Decode for Vec<$ty> {
            fn decode(value: &PgValue) -> Result<Self, String> {
                match value {
                    PgValue::Array { values, .. } => values.iter().map(<$ty>::decode).collect(),
                    other => Err(mismatch(other)),
                }
            }
        }

        impl Decode for Vec<Option<$ty>> {
            fn decode(value: &PgValue) -> Result<Self, String> {
                match value {
                    PgValue::Array { values, .. } => {
                        values.iter().map(<Option<$ty>>::decode).collect()
                    }
                    other => Err(mismatch(other)),
                }
            }
        }
    };
}

array!(bool, Oid::BOOL);
array!(i16, Oid::INT2);
array!(i32, Oid::INT4);
array!(i64, Oid::INT8);
array!(f32, Oid::FLOAT4);
array!(f64, Oid::FLOAT8);
array!(String, Oid::TEXT);
array!(uuid::Uuid, Oid::UUID);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());

        assert!(Oid::INT4.is_integer());
        assert!(!Oid::FLOAT8.is_integer());
        assert!(Oid::FLOAT4.is_float());

        assert_eq!(Oid::INT4.array_of(), Some(Oid::INT4_ARRAY));
        assert_eq!(Oid::TEXT_ARRAY.array_element(), Some(Oid::TEXT));
        assert_eq!(Oid(99999).name(), "unknown");
        assert_eq!(Oid::JSONB.to_string(), "3802");
    }

    #[test]
    fn test_int4_roundtrip() {
        let original = PgValue::Int4(12345);
        let encoded = original.encode_binary();
        let decoded = PgValue::decode_binary(Oid::INT4, &encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_bad_length_is_reported() {
        let err = PgValue::decode_binary(Oid::INT8, &[0, 1]).unwrap_err();
        assert!(err.contains("int8"), "{err}");
    }

    #[test]
    fn test_jsonb_version_byte() {
        let value = PgValue::Json("{\"a\":1}".to_string());
        let encoded = value.encode_binary();
        assert_eq!(encoded[0], 1);
        assert_eq!(PgValue::decode_binary(Oid::JSONB, &encoded).unwrap(), value);
        assert_eq!(
            PgValue::decode_binary(Oid::JSON, b"[1]").unwrap(),
            PgValue::Json("[1]".to_string())
        );
    }

    #[test]
    fn test_array_binary_with_null() {
        let value = PgValue::Array {
            element: Oid::INT4,
            values: vec![PgValue::Int4(1), PgValue::Null, PgValue::Int4(3)],
        };
        assert_eq!(value.type_oid(), Oid::INT4_ARRAY);
        let decoded = PgValue::decode_binary(Oid::INT4_ARRAY, &value.encode_binary()).unwrap();
        assert_eq!(decoded, value);

        let ints: Vec<Option<i32>> = Decode::decode(&decoded).unwrap();
        assert_eq!(ints, vec![Some(1), None, Some(3)]);
    }

    #[test]
    fn test_empty_array_binary() {
        let value = Vec::<i64>::new().encode();
        let decoded = PgValue::decode_binary(Oid::INT8_ARRAY, &value.encode_binary()).unwrap();
        assert_eq!(
            decoded,
            PgValue::Array {
                element: Oid::INT8,
                values: vec![]
            }
        );
    }

    #[test]
    fn test_parse_array_literal() {
        assert_eq!(
            parse_array_literal("{1,2,3,4}").unwrap(),
            vec![
                Some("1".to_string()),
                Some("2".to_string()),
                Some("3".to_string()),
                Some("4".to_string())
            ]
        );
        assert_eq!(
            parse_array_literal("{test,NULL,also a test}").unwrap(),
            vec![
                Some("test".to_string()),
                None,
                Some("also a test".to_string())
            ]
        );
        assert!(parse_array_literal("{}").unwrap().is_empty());
        assert_eq!(
            parse_array_literal(r#"{"a,b","say \"hi\"","NULL",""}"#).unwrap(),
            vec![
                Some("a,b".to_string()),
                Some("say \"hi\"".to_string()),
                Some("NULL".to_string()),
                Some(String::new())
            ]
        );
        assert_eq!(
            parse_array_literal("[0:1]={x,y}").unwrap(),
            vec![Some("x".to_string()), Some("y".to_string())]
        );
    }

    #[test]
    fn test_malformed_array_literal() {
        assert!(parse_array_literal("1,2").is_err());
        assert!(parse_array_literal("{\"open}").is_err());
        assert!(parse_array_literal("{{1,2},{3,4}}").is_err());
    }

    #[test]
    fn test_format_array_literal_quotes() {
        let items = vec![
            Some("plain".to_string()),
            None,
            Some("needs quoting".to_string()),
            Some("back\\slash \"q\"".to_string()),
            Some("null".to_string()),
            Some(String::new()),
        ];
        let literal = format_array_literal(&items);
        assert_eq!(
            literal,
            r#"{plain,NULL,"needs quoting","back\\slash \"q\"","null",""}"#
        );
        assert_eq!(parse_array_literal(&literal).unwrap(), items);
    }

    #[test]
    fn test_decode_text_values() {
        assert_eq!(
            PgValue::decode_text(Oid::BOOL, b"t").unwrap(),
            PgValue::Bool(true)
        );
        assert_eq!(
            PgValue::decode_text(Oid::INT4_ARRAY, b"{1,NULL,3}").unwrap(),
            PgValue::Array {
                element: Oid::INT4,
                values: vec![PgValue::Int4(1), PgValue::Null, PgValue::Int4(3)]
            }
        );
        assert_eq!(
            PgValue::decode_text(Oid::BYTEA, b"\\xdead").unwrap(),
            PgValue::Bytea(vec![0xde, 0xad])
        );
        assert_eq!(
            PgValue::decode_text(Oid::DATE, b"infinity").unwrap(),
            PgValue::Text("infinity".to_string())
        );
        assert!(PgValue::decode_text(Oid::INT2, b"70000").is_err());
    }

    #[test]
    fn test_calendar_values() {
        let date = NaiveDate::from_ymd_opt(2000, 1, 2).unwrap();
        assert_eq!(date.encode(), PgValue::Date(1));
        assert_eq!(
            PgValue::decode_text(Oid::DATE, b"2000-01-02").unwrap(),
            PgValue::Date(1)
        );

        let ts = NaiveDate::from_ymd_opt(1999, 12, 31)
            .unwrap()
            .and_hms_micro_opt(23, 59, 59, 500_000)
            .unwrap();
        assert_eq!(ts.encode(), PgValue::Timestamp(-500_000));
        assert_eq!(NaiveDateTime::decode(&ts.encode()).unwrap(), ts);
        assert_eq!(
            ts.encode().encode_text().unwrap(),
            "1999-12-31 23:59:59.500000"
        );

        assert_eq!(
            PgValue::decode_text(Oid::TIMESTAMPTZ, b"2000-01-01 01:00:00+01").unwrap(),
            PgValue::TimestampTz(0)
        );
    }

    #[test]
    fn test_coerce() {
        assert_eq!(
            PgValue::Int4(7).coerce(Oid::INT8),
            Some(PgValue::Int8(7))
        );
        assert_eq!(PgValue::Int8(1 << 40).coerce(Oid::INT4), None);
        assert_eq!(
            PgValue::Text("x".into()).coerce(Oid::VARCHAR),
            Some(PgValue::Text("x".into()))
        );
        assert_eq!(PgValue::Text("5".into()).coerce(Oid::INT4), None);
        assert_eq!(
            vec![1i32, 2].encode().coerce(Oid::INT8_ARRAY),
            Some(PgValue::Array {
                element: Oid::INT8,
                values: vec![PgValue::Int8(1), PgValue::Int8(2)]
            })
        );
    }

    #[test]
    fn test_numeric_binary() {
        // 12345.678: ndigits 3, weight 1, sign +, dscale 3, digits [1, 2345, 6780]
        let data = [0, 3, 0, 1, 0, 0, 0, 3, 0, 1, 0x09, 0x29, 0x1a, 0x7c];
        assert_eq!(
            PgValue::decode_binary(Oid::NUMERIC, &data).unwrap(),
            PgValue::Text("12345.678".to_string())
        );

        // -0.05: ndigits 1, weight -1, sign -, dscale 2, digits [500]
        let data = [0, 1, 0xff, 0xff, 0x40, 0x00, 0, 2, 0x01, 0xf4];
        assert_eq!(
            PgValue::decode_binary(Oid::NUMERIC, &data).unwrap(),
            PgValue::Text("-0.05".to_string())
        );
    }
}
