//! Statement execution pipeline.
//!
//! Every operation runs the same steps:
//! 1. compile the query (structured forms go through the [`QueryCompiler`],
//!    literal statements pass through unchanged)
//! 2. trace the structured form and the compiled statement if tracing is on
//! 3. acquire the connection: the pinned transaction if one is active,
//!    otherwise the descriptor registered for the model's dispatch key
//! 4. dispatch to the [`Driver`] for the operation kind
//! 5. bump the innermost call counter once, whatever the outcome
//!
//! Reducible queries run steps 1-2 when created and steps 3-5 each time they
//! are consumed.

use crate::db::compiler::{QueryCompiler, RejectStructured};
use crate::db::dispatch::{DispatchKey, key_of};
use crate::db::driver::{Connection, Driver, Target, with_target};
use crate::db::registry::ConnectionRegistry;
use crate::db::scope::{ScopeContext, count_call};
use crate::db::trace::{StdoutSink, TraceSink};
use crate::error::{DbError, DbResult};
use crate::models::{CompiledStatement, KeyMetadata, Model, ModelMetadata, Query, QueryParam, Row};
use std::sync::Arc;
use tracing::{debug, warn};

/// Entry point for all data access: connection routing, transactions and the
/// statement pipeline for one driver.
pub struct Database<D: Driver> {
    pub(crate) driver: D,
    pub(crate) registry: ConnectionRegistry<D::Pool>,
    compiler: Arc<dyn QueryCompiler>,
    metadata: Arc<dyn KeyMetadata>,
    sink: Arc<dyn TraceSink>,
}

impl<D: Driver> std::fmt::Debug for Database<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<D: Driver> Database<D> {
    /// Create a database with an empty registry and default collaborators.
    ///
    /// Prefer [`Database::builder`], which validates the registry.
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            registry: ConnectionRegistry::new(),
            compiler: Arc::new(RejectStructured),
            metadata: Arc::new(ModelMetadata),
            sink: Arc::new(StdoutSink),
        }
    }

    pub fn builder(driver: D) -> DatabaseBuilder<D> {
        DatabaseBuilder {
            inner: Self::new(driver),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The connection registry. Registrations are expected at startup.
    pub fn registry(&self) -> &ConnectionRegistry<D::Pool> {
        &self.registry
    }

    /// Fail with a configuration error unless a default provider is registered.
    pub async fn validate(&self) -> DbResult<()> {
        self.registry.validate().await
    }

    /// Run a query and materialize all rows.
    pub async fn query(
        &self,
        model: Option<&dyn Model>,
        query: impl Into<Query>,
    ) -> DbResult<Vec<Row>> {
        let key = key_of(model);
        let stmt = self.compile(model, query.into())?;
        let conn = self.current_connection(&key).await?;

        debug!(
            key = %key,
            sql = %stmt.sql,
            params = stmt.params.len(),
            "Executing query"
        );

        let result = with_target!(&conn, |target| self.driver.fetch_all(target, &stmt).await);
        count_call();

        if let Ok(rows) = &result {
            debug!(key = %key, row_count = rows.len(), "Query returned rows");
        }
        result
    }

    /// Compile a query now and defer its execution until it is consumed.
    pub fn reducible_query(
        &self,
        model: Option<&dyn Model>,
        query: impl Into<Query>,
    ) -> DbResult<Reducible<'_, D>> {
        let key = key_of(model);
        let stmt = self.compile(model, query.into())?;
        Ok(Reducible {
            db: self,
            key,
            stmt,
        })
    }

    /// Run a side-effecting statement and return the affected-row count.
    pub async fn execute(&self, model: Option<&dyn Model>, query: impl Into<Query>) -> DbResult<u64> {
        let key = key_of(model);
        let stmt = self.compile(model, query.into())?;
        let conn = self.current_connection(&key).await?;

        debug!(
            key = %key,
            sql = %stmt.sql,
            params = stmt.params.len(),
            "Executing statement"
        );

        let result = with_target!(&conn, |target| self.driver.execute(target, &stmt).await);
        count_call();

        if let Ok(rows_affected) = &result {
            debug!(key = %key, rows_affected = rows_affected, "Statement executed");
        }
        result
    }

    /// Run one statement text once per parameter set, on one connection.
    ///
    /// Returns one affected-row count per parameter set.
    pub async fn execute_batch(
        &self,
        model: Option<&dyn Model>,
        sql: impl Into<String>,
        param_sets: Vec<Vec<QueryParam>>,
    ) -> DbResult<Vec<u64>> {
        let key = key_of(model);
        let sql = sql.into();
        if ScopeContext::current().is_tracing() {
            for params in &param_sets {
                let stmt = CompiledStatement::new(sql.clone(), params.clone());
                self.sink.emit(&stmt.to_string());
            }
        }
        let conn = self.current_connection(&key).await?;

        debug!(
            key = %key,
            sql = %sql,
            batch_size = param_sets.len(),
            "Executing batch"
        );

        let result = with_target!(&conn, |target| {
            self.driver.execute_batch(target, &sql, &param_sets).await
        });
        count_call();
        result
    }

    /// Run an update; true when at least one row was affected.
    pub async fn update(&self, model: Option<&dyn Model>, query: impl Into<Query>) -> DbResult<bool> {
        Ok(self.execute(model, query).await? > 0)
    }

    /// Run a delete; true when at least one row was affected.
    pub async fn delete(&self, model: Option<&dyn Model>, query: impl Into<Query>) -> DbResult<bool> {
        Ok(self.execute(model, query).await? > 0)
    }

    /// Run an insert and return the generated primary keys.
    ///
    /// The statement is prepared on the resolved connection, asking for the
    /// model's primary-key columns. Keys are fetched only when a row was
    /// affected; otherwise the result is empty.
    pub async fn insert(&self, model: &dyn Model, query: impl Into<Query>) -> DbResult<Vec<Row>> {
        let key = model.dispatch_key();
        let stmt = self.compile(Some(model), query.into())?;
        let key_columns = self.metadata.primary_key_columns(model)?;
        let conn = self.current_connection(&key).await?;

        debug!(
            key = %key,
            sql = %stmt.sql,
            key_columns = ?key_columns,
            "Executing insert"
        );

        let result = with_target!(&conn, |target| {
            self.insert_returning_keys(target, &stmt, &key_columns).await
        });
        count_call();
        result
    }

    async fn insert_returning_keys(
        &self,
        mut target: Target<'_, D>,
        stmt: &CompiledStatement,
        key_columns: &[String],
    ) -> DbResult<Vec<Row>> {
        let mut prepared = self
            .driver
            .prepare_insert(target.reborrow(), stmt, key_columns)
            .await?;
        let outcome = self.run_prepared(target, &mut prepared).await;
        let closed = self.driver.close_prepared(prepared).await;

        match (outcome, closed) {
            (Ok(keys), Ok(())) => Ok(keys),
            (Ok(_), Err(close_err)) => Err(into_resource_error(close_err)),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                warn!(
                    error = %close_err,
                    "Failed to release prepared insert after a failed insert"
                );
                Err(err)
            }
        }
    }

    async fn run_prepared(
        &self,
        mut target: Target<'_, D>,
        prepared: &mut D::PreparedInsert,
    ) -> DbResult<Vec<Row>> {
        let rows_affected = self
            .driver
            .execute_prepared(target.reborrow(), prepared)
            .await?;
        if rows_affected == 0 {
            return Ok(Vec::new());
        }
        self.driver.generated_keys(target, prepared).await
    }

    fn compile(&self, model: Option<&dyn Model>, query: Query) -> DbResult<CompiledStatement> {
        let tracing = ScopeContext::current().is_tracing();
        match query {
            Query::Literal(stmt) => {
                if tracing {
                    self.sink.emit(&stmt.to_string());
                }
                Ok(stmt)
            }
            Query::Structured(form) => {
                if tracing {
                    let pretty = serde_json::to_string_pretty(&form).unwrap_or_else(|_| form.to_string());
                    self.sink.emit(&pretty);
                }
                let stmt = self.compiler.compile(model, &form)?;
                if tracing {
                    self.sink.emit(&stmt.to_string());
                }
                Ok(stmt)
            }
        }
    }
}

fn into_resource_error(err: DbError) -> DbError {
    match err {
        DbError::Resource { .. } => err,
        other => DbError::resource(format!("Failed to release prepared insert: {}", other)),
    }
}

/// A compiled query whose execution is deferred until it is consumed.
///
/// Each consumption resolves a connection in the consuming scope and runs
/// the statement again; results are not memoized.
pub struct Reducible<'db, D: Driver> {
    db: &'db Database<D>,
    key: DispatchKey,
    stmt: CompiledStatement,
}

impl<'db, D: Driver> Reducible<'db, D> {
    pub fn statement(&self) -> &CompiledStatement {
        &self.stmt
    }

    /// Fold every row into an accumulator.
    pub async fn reduce<A, F>(&self, init: A, mut f: F) -> DbResult<A>
    where
        A: Send,
        F: FnMut(A, Row) -> A + Send,
    {
        let conn: Connection<D> = self.db.current_connection(&self.key).await?;

        debug!(key = %self.key, sql = %self.stmt.sql, "Executing reducible query");

        let mut acc = Some(init);
        let mut sink = |row: Row| {
            if let Some(current) = acc.take() {
                acc = Some(f(current, row));
            }
        };
        let result = with_target!(&conn, |target| {
            self.db.driver.fetch_each(target, &self.stmt, &mut sink).await
        });
        count_call();
        result?;

        acc.ok_or_else(|| DbError::internal("Reduction accumulator was lost"))
    }

    /// Call `f` for every row.
    pub async fn for_each<F>(&self, mut f: F) -> DbResult<()>
    where
        F: FnMut(Row) + Send,
    {
        self.reduce((), |(), row| f(row)).await
    }

    /// Materialize all rows.
    pub async fn collect(&self) -> DbResult<Vec<Row>> {
        self.reduce(Vec::new(), |mut rows, row| {
            rows.push(row);
            rows
        })
        .await
    }
}

/// Builder for [`Database`].
pub struct DatabaseBuilder<D: Driver> {
    inner: Database<D>,
}

impl<D: Driver> DatabaseBuilder<D> {
    pub fn compiler(mut self, compiler: impl QueryCompiler + 'static) -> Self {
        self.inner.compiler = Arc::new(compiler);
        self
    }

    pub fn metadata(mut self, metadata: impl KeyMetadata + 'static) -> Self {
        self.inner.metadata = Arc::new(metadata);
        self
    }

    pub fn trace_sink(mut self, sink: impl TraceSink + 'static) -> Self {
        self.inner.sink = Arc::new(sink);
        self
    }

    /// Share an existing registry instead of starting from an empty one.
    pub fn registry(mut self, registry: ConnectionRegistry<D::Pool>) -> Self {
        self.inner.registry = registry;
        self
    }

    /// Register a fixed descriptor under `key`.
    pub async fn pool(self, key: impl Into<DispatchKey>, pool: D::Pool) -> Self {
        self.inner.registry.register_pool(key, pool).await;
        self
    }

    /// Register the default descriptor.
    pub async fn default_pool(self, pool: D::Pool) -> Self {
        self.pool(DispatchKey::default_key(), pool).await
    }

    /// Validate the registry and finish.
    pub async fn build(self) -> DbResult<Database<D>> {
        self.inner.validate().await?;
        Ok(self.inner)
    }
}
