//! Model descriptors and primary-key metadata.
//!
//! A model is only used here as a routing key and as a source of primary-key
//! columns for inserts; its data shape is not modeled.

use crate::db::dispatch::DispatchKey;
use crate::error::{DbError, DbResult};

/// A logical entity type that queries can target.
pub trait Model: Send + Sync {
    /// Stable model name, usually the table name.
    fn name(&self) -> &str;

    /// Key used for connection and strategy lookups. Defaults to the name.
    fn dispatch_key(&self) -> DispatchKey {
        DispatchKey::new(self.name().to_string())
    }

    /// Primary-key columns. Defaults to a single `id` column.
    fn primary_key(&self) -> PrimaryKey {
        PrimaryKey::single("id")
    }
}

/// Primary-key column set of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryKey {
    Single(String),
    Composite(Vec<String>),
}

impl PrimaryKey {
    pub fn single(column: impl Into<String>) -> Self {
        Self::Single(column.into())
    }

    pub fn composite<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Composite(columns.into_iter().map(Into::into).collect())
    }

    /// Ordered column names.
    pub fn columns(&self) -> Vec<String> {
        match self {
            Self::Single(column) => vec![column.clone()],
            Self::Composite(columns) => columns.clone(),
        }
    }
}

/// A model described at runtime by name and primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    primary_key: PrimaryKey,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: PrimaryKey::single("id"),
        }
    }

    pub fn with_primary_key(mut self, primary_key: PrimaryKey) -> Self {
        self.primary_key = primary_key;
        self
    }
}

impl Model for Table {
    fn name(&self) -> &str {
        &self.name
    }

    fn primary_key(&self) -> PrimaryKey {
        self.primary_key.clone()
    }
}

/// Source of primary-key columns for a model, consulted by inserts.
pub trait KeyMetadata: Send + Sync {
    fn primary_key_columns(&self, model: &dyn Model) -> DbResult<Vec<String>>;
}

/// Reads primary keys straight from [`Model::primary_key`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelMetadata;

impl KeyMetadata for ModelMetadata {
    fn primary_key_columns(&self, model: &dyn Model) -> DbResult<Vec<String>> {
        let columns = model.primary_key().columns();
        if columns.is_empty() || columns.iter().any(|c| c.is_empty()) {
            return Err(DbError::invalid_input(format!(
                "Model '{}' declares an empty primary key",
                model.name()
            )));
        }
        Ok(columns)
    }
}
