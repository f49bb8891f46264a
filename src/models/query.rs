//! Query-related data models.
//!
//! This module defines statement parameters, compiled statements, query inputs
//! and the row representation returned by the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// A materialized row: column name to JSON value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Arbitrary JSON document
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

impl fmt::Display for QueryParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{:?}", v),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Self::Json(v) => write!(f, "{}", v),
        }
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Statement text plus positional parameters, ready for the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledStatement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
}

impl CompiledStatement {
    pub fn new(sql: impl Into<String>, params: Vec<QueryParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Add a parameter to this statement.
    pub fn with_param(mut self, param: impl Into<QueryParam>) -> Self {
        self.params.push(param.into());
        self
    }
}

impl fmt::Display for CompiledStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)?;
        if !self.params.is_empty() {
            let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
            write!(f, " -- [{}]", params.join(", "))?;
        }
        Ok(())
    }
}

/// Pipeline input: either a structured query for the compiler, or a literal
/// statement that is passed through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Structured(JsonValue),
    Literal(CompiledStatement),
}

impl Query {
    /// Literal statement without parameters.
    pub fn sql(sql: impl Into<String>) -> Self {
        Self::Literal(CompiledStatement::new(sql, Vec::new()))
    }

    /// Literal statement with positional parameters.
    pub fn sql_with(sql: impl Into<String>, params: Vec<QueryParam>) -> Self {
        Self::Literal(CompiledStatement::new(sql, params))
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Structured(_))
    }
}

impl From<CompiledStatement> for Query {
    fn from(stmt: CompiledStatement) -> Self {
        Self::Literal(stmt)
    }
}

impl From<JsonValue> for Query {
    fn from(form: JsonValue) -> Self {
        Self::Structured(form)
    }
}

impl From<&str> for Query {
    fn from(sql: &str) -> Self {
        Self::sql(sql)
    }
}
