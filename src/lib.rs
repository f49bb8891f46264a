//! modeldb
//!
//! Model-keyed connection routing, ambient transaction scopes and an
//! instrumented statement pipeline for SQL databases (SQLite, PostgreSQL,
//! MySQL) on top of sqlx.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, DatabaseConfig};
pub use db::{Database, SqlxDriver, with_call_counting, with_tracing};
pub use error::{DbError, DbResult, ErrorKind};
pub use models::{CompiledStatement, Model, Query, QueryParam, Row, Table};
