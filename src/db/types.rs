//! Row decoding.
//!
//! sqlx rows are turned into [`Row`] maps keyed by column label. Columns are
//! classified by their declared type name; SQLite columns without a useful
//! declaration are decoded by the storage class of the value itself.

use crate::models::Row;
use serde_json::Value as JsonValue;
use sqlx::error::BoxDynError;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as _, Type, TypeInfo, ValueRef};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Null,
}

/// Classify a database type name.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_ascii_lowercase();

    // Checked before floats: "numeric" is not a float.
    if lower.contains("decimal") || lower.contains("numeric") {
        return TypeCategory::Decimal;
    }
    if lower.contains("int") || lower.contains("serial") || lower == "tiny" {
        return TypeCategory::Integer;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }
    if lower == "uuid" {
        return TypeCategory::Uuid;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    if lower == "null" {
        return TypeCategory::Null;
    }
    TypeCategory::Text
}

/// DECIMAL/NUMERIC rendered exactly as a string.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        categorize_type(ty.name()) == TypeCategory::Decimal
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, BoxDynError> {
        // MySQL sends decimals as text in both protocols.
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("numeric")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        categorize_type(ty.name()) == TypeCategory::Decimal
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => pg_numeric_to_string(value.as_bytes()?).map(RawDecimal),
        }
    }
}

/// Render the binary NUMERIC wire format: a header of digit count, weight,
/// sign and display scale followed by base-10000 digit groups.
fn pg_numeric_to_string(buf: &[u8]) -> Result<String, BoxDynError> {
    const NEGATIVE: u16 = 0x4000;
    const NAN: u16 = 0xC000;

    let word = |i: usize| -> Result<u16, BoxDynError> {
        buf.get(i..i + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "NUMERIC value is truncated".into())
    };

    let ndigits = word(0)? as usize;
    let weight = word(2)? as i16 as i32;
    let sign = word(4)?;
    let dscale = word(6)? as usize;
    if sign == NAN {
        return Ok("NaN".to_string());
    }
    let digits = (0..ndigits)
        .map(|i| word(8 + i * 2))
        .collect::<Result<Vec<_>, _>>()?;
    let group = |idx: i32| -> u16 {
        usize::try_from(idx)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NEGATIVE {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&group(0).to_string());
        for idx in 1..=weight {
            out.push_str(&format!("{:04}", group(idx)));
        }
    }
    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", group(idx)));
            idx += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn bytes_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

/// Text that may hold JSON when the declared type says so.
fn text_value(text: String, type_name: &str) -> JsonValue {
    if type_name.to_ascii_lowercase().contains("json") {
        if let Ok(json) = serde_json::from_str::<JsonValue>(&text) {
            return json;
        }
    }
    JsonValue::String(text)
}

/// Converts a driver row into a [`Row`].
pub trait RowToJson {
    fn to_json_map(&self) -> Row;
}

macro_rules! impl_row_to_json {
    ($row:ty, $decode:path) => {
        impl RowToJson for $row {
            fn to_json_map(&self) -> Row {
                self.columns()
                    .iter()
                    .map(|col| {
                        let value = $decode(self, col.ordinal(), col.type_info().name());
                        (col.name().to_string(), value)
                    })
                    .collect()
            }
        }
    };
}

impl_row_to_json!(MySqlRow, mysql::decode_column);
impl_row_to_json!(PgRow, postgres::decode_column);
impl_row_to_json!(SqliteRow, sqlite::decode_column);

mod mysql {
    use super::*;

    pub fn decode_column(row: &MySqlRow, idx: usize, type_name: &str) -> JsonValue {
        match categorize_type(type_name) {
            TypeCategory::Decimal => match row.try_get::<Option<RawDecimal>, _>(idx) {
                Ok(v) => v.map(|d| JsonValue::String(d.0)).unwrap_or(JsonValue::Null),
                Err(e) => {
                    tracing::error!(column = idx, error = %e, "Failed to decode DECIMAL");
                    JsonValue::Null
                }
            },
            TypeCategory::Integer => decode_integer(row, idx, type_name),
            TypeCategory::Boolean => opt(row.try_get::<Option<bool>, _>(idx), JsonValue::Bool),
            TypeCategory::Float => {
                if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
                    return v.map(float_value).unwrap_or(JsonValue::Null);
                }
                opt(row.try_get::<Option<f32>, _>(idx), |v| float_value(v as f64))
            }
            TypeCategory::Binary => opt(row.try_get::<Option<Vec<u8>>, _>(idx), |v| {
                bytes_value(&v)
            }),
            TypeCategory::Json => opt(row.try_get::<Option<JsonValue>, _>(idx), |v| v),
            _ => opt(row.try_get::<Option<String>, _>(idx), |v| {
                text_value(v, type_name)
            }),
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize, type_name: &str) -> JsonValue {
        if type_name.to_ascii_uppercase().contains("UNSIGNED") {
            return opt(row.try_get::<Option<u64>, _>(idx), |v| {
                JsonValue::Number(v.into())
            });
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null);
        }
        opt(row.try_get::<Option<i8>, _>(idx), |v| JsonValue::Number(v.into()))
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> JsonValue {
        match categorize_type(type_name) {
            TypeCategory::Decimal => match row.try_get::<Option<RawDecimal>, _>(idx) {
                Ok(v) => v.map(|d| JsonValue::String(d.0)).unwrap_or(JsonValue::Null),
                Err(e) => {
                    tracing::error!(column = idx, error = %e, "Failed to decode NUMERIC");
                    JsonValue::Null
                }
            },
            TypeCategory::Integer => match type_name.to_ascii_uppercase().as_str() {
                "INT2" => opt(row.try_get::<Option<i16>, _>(idx), |v| JsonValue::Number(v.into())),
                "INT4" => opt(row.try_get::<Option<i32>, _>(idx), |v| JsonValue::Number(v.into())),
                _ => opt(row.try_get::<Option<i64>, _>(idx), |v| JsonValue::Number(v.into())),
            },
            TypeCategory::Boolean => opt(row.try_get::<Option<bool>, _>(idx), JsonValue::Bool),
            TypeCategory::Float => {
                if type_name.eq_ignore_ascii_case("FLOAT4") {
                    opt(row.try_get::<Option<f32>, _>(idx), |v| float_value(v as f64))
                } else {
                    opt(row.try_get::<Option<f64>, _>(idx), float_value)
                }
            }
            TypeCategory::Binary => opt(row.try_get::<Option<Vec<u8>>, _>(idx), |v| {
                bytes_value(&v)
            }),
            TypeCategory::Json => opt(row.try_get::<Option<JsonValue>, _>(idx), |v| v),
            TypeCategory::Uuid => opt(row.try_get::<Option<uuid::Uuid>, _>(idx), |v| {
                JsonValue::String(v.to_string())
            }),
            _ => opt(row.try_get::<Option<String>, _>(idx), JsonValue::String),
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, declared: &str) -> JsonValue {
        let Ok(raw) = row.try_get_raw(idx) else {
            return JsonValue::Null;
        };
        if raw.is_null() {
            return JsonValue::Null;
        }
        let storage = raw.type_info().name().to_string();

        // Declared BOOLEAN columns are stored as integers.
        if categorize_type(declared) == TypeCategory::Boolean {
            return opt(row.try_get::<Option<bool>, _>(idx), JsonValue::Bool);
        }
        match categorize_type(&storage) {
            TypeCategory::Integer => {
                opt(row.try_get::<Option<i64>, _>(idx), |v| JsonValue::Number(v.into()))
            }
            TypeCategory::Float | TypeCategory::Decimal => {
                opt(row.try_get::<Option<f64>, _>(idx), float_value)
            }
            TypeCategory::Binary => opt(row.try_get::<Option<Vec<u8>>, _>(idx), |v| {
                bytes_value(&v)
            }),
            _ => opt(row.try_get::<Option<String>, _>(idx), |v| {
                text_value(v, declared)
            }),
        }
    }
}

fn opt<T, E: std::fmt::Display>(
    decoded: Result<Option<T>, E>,
    to_json: impl FnOnce(T) -> JsonValue,
) -> JsonValue {
    match decoded {
        Ok(Some(v)) => to_json(v),
        Ok(None) => JsonValue::Null,
        Err(e) => {
            tracing::debug!(error = %e, "Column could not be decoded; returning null");
            JsonValue::Null
        }
    }
}
