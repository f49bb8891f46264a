//! Query compiler seam.
//!
//! Structured queries are turned into [`CompiledStatement`]s by a
//! [`QueryCompiler`] supplied by the application; literal statements bypass it.

use crate::error::{DbError, DbResult};
use crate::models::{CompiledStatement, Model};
use serde_json::Value as JsonValue;

/// Compiles a structured query for a model.
pub trait QueryCompiler: Send + Sync {
    fn compile(&self, model: Option<&dyn Model>, form: &JsonValue) -> DbResult<CompiledStatement>;
}

impl<F> QueryCompiler for F
where
    F: Fn(Option<&dyn Model>, &JsonValue) -> DbResult<CompiledStatement> + Send + Sync,
{
    fn compile(&self, model: Option<&dyn Model>, form: &JsonValue) -> DbResult<CompiledStatement> {
        self(model, form)
    }
}

/// Compiler used when none is configured: only literal statements are accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectStructured;

impl QueryCompiler for RejectStructured {
    fn compile(&self, _model: Option<&dyn Model>, form: &JsonValue) -> DbResult<CompiledStatement> {
        Err(DbError::compilation(format!(
            "No query compiler configured; cannot compile structured query {}",
            form
        )))
    }
}
