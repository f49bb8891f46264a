//! Data models for modeldb.
//!
//! This module re-exports all model types used throughout the library.

pub mod model;
pub mod query;

// Re-export commonly used types
pub use model::{KeyMetadata, Model, ModelMetadata, PrimaryKey, Table};
pub use query::{CompiledStatement, Query, QueryParam, Row};
