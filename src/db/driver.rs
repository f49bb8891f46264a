//! Driver abstraction.
//!
//! A [`Driver`] executes compiled statements against either a pool handle or a
//! pinned transaction connection. [`crate::db::SqlxDriver`] implements it on
//! top of sqlx; tests plug in recording drivers.

use crate::error::{DbError, DbResult};
use crate::models::{CompiledStatement, QueryParam, Row};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Database driver used by the execution pipeline.
pub trait Driver: Sized + Send + Sync + 'static {
    /// Connection descriptor handed out by registered providers.
    type Pool: Clone + Send + Sync + 'static;
    /// A live connection with an open transaction.
    type Transaction: Send + 'static;
    /// An explicitly prepared insert awaiting execution.
    type PreparedInsert: Send;

    /// Acquire a connection from `pool` and begin a transaction on it.
    fn begin(&self, pool: &Self::Pool)
    -> impl Future<Output = DbResult<Self::Transaction>> + Send;

    fn commit(&self, tx: Self::Transaction) -> impl Future<Output = DbResult<()>> + Send;

    fn rollback(&self, tx: Self::Transaction) -> impl Future<Output = DbResult<()>> + Send;

    /// Eager row fetch.
    fn fetch_all(
        &self,
        target: Target<'_, Self>,
        stmt: &CompiledStatement,
    ) -> impl Future<Output = DbResult<Vec<Row>>> + Send;

    /// Lazy row fetch: rows are handed to `sink` one at a time as they are read.
    fn fetch_each(
        &self,
        target: Target<'_, Self>,
        stmt: &CompiledStatement,
        sink: &mut (dyn FnMut(Row) + Send),
    ) -> impl Future<Output = DbResult<()>> + Send;

    /// Generic execute returning the affected-row count.
    fn execute(
        &self,
        target: Target<'_, Self>,
        stmt: &CompiledStatement,
    ) -> impl Future<Output = DbResult<u64>> + Send;

    /// Execute one statement text once per parameter set.
    fn execute_batch(
        &self,
        target: Target<'_, Self>,
        sql: &str,
        param_sets: &[Vec<QueryParam>],
    ) -> impl Future<Output = DbResult<Vec<u64>>> + Send;

    /// Prepare an insert that reports the generated `key_columns`.
    fn prepare_insert(
        &self,
        target: Target<'_, Self>,
        stmt: &CompiledStatement,
        key_columns: &[String],
    ) -> impl Future<Output = DbResult<Self::PreparedInsert>> + Send;

    /// Run a prepared insert, returning the affected-row count.
    fn execute_prepared(
        &self,
        target: Target<'_, Self>,
        prepared: &mut Self::PreparedInsert,
    ) -> impl Future<Output = DbResult<u64>> + Send;

    /// Read the generated-keys result set of an executed insert.
    fn generated_keys(
        &self,
        target: Target<'_, Self>,
        prepared: &mut Self::PreparedInsert,
    ) -> impl Future<Output = DbResult<Vec<Row>>> + Send;

    /// Release a prepared insert and its key cursor.
    fn close_prepared(
        &self,
        prepared: Self::PreparedInsert,
    ) -> impl Future<Output = DbResult<()>> + Send;
}

/// What a statement runs against.
pub enum Target<'a, D: Driver> {
    Pool(&'a D::Pool),
    Transaction(&'a mut D::Transaction),
}

impl<'a, D: Driver> Target<'a, D> {
    /// Borrow this target again for another call.
    pub fn reborrow(&mut self) -> Target<'_, D> {
        match self {
            Target::Pool(pool) => Target::Pool(*pool),
            Target::Transaction(tx) => Target::Transaction(&mut **tx),
        }
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self, Target::Transaction(_))
    }
}

/// The connection one pipeline invocation runs on.
pub enum Connection<D: Driver> {
    /// A descriptor resolved from the registry.
    Pool(D::Pool),
    /// The connection pinned by the enclosing transaction scope.
    Transaction(Arc<TransactionHandle<D>>),
}

impl<D: Driver> Clone for Connection<D> {
    fn clone(&self) -> Self {
        match self {
            Connection::Pool(pool) => Connection::Pool(pool.clone()),
            Connection::Transaction(handle) => Connection::Transaction(Arc::clone(handle)),
        }
    }
}

impl<D: Driver> std::fmt::Debug for Connection<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Pool(_) => f.debug_tuple("Pool").finish(),
            Connection::Transaction(handle) => {
                f.debug_tuple("Transaction").field(&handle.id()).finish()
            }
        }
    }
}

/// A transaction pinned to one connection for the lifetime of a scope.
///
/// The connection sits behind an async mutex: statements issued from the
/// scope, including from tasks the scope was propagated into, run one at a
/// time in submission order.
pub struct TransactionHandle<D: Driver> {
    id: String,
    started_at: DateTime<Utc>,
    transaction: Mutex<Option<D::Transaction>>,
}

impl<D: Driver> TransactionHandle<D> {
    pub(crate) fn new(transaction: D::Transaction) -> Self {
        Self {
            id: generate_transaction_id(),
            started_at: Utc::now(),
            transaction: Mutex::new(Some(transaction)),
        }
    }

    /// Unique transaction identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the transaction was begun.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Lock the pinned connection for one statement.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Option<D::Transaction>> {
        self.transaction.lock().await
    }

    /// Take the transaction out for commit or rollback. Later statements fail.
    pub(crate) async fn take(&self) -> DbResult<D::Transaction> {
        self.transaction
            .lock()
            .await
            .take()
            .ok_or_else(|| DbError::transaction("Transaction is no longer active", &self.id))
    }
}

/// Run `$body` with `$target` bound to the [`Target`] of a [`Connection`].
///
/// For pinned transactions the connection stays locked while `$body` runs.
/// The body may use `.await` and `?`.
macro_rules! with_target {
    ($conn:expr, |$target:ident| $body:expr) => {
        match $conn {
            $crate::db::driver::Connection::Pool(pool) => {
                let $target = $crate::db::driver::Target::Pool(pool);
                $body
            }
            $crate::db::driver::Connection::Transaction(handle) => {
                let mut guard = handle.lock().await;
                let tx = guard.as_mut().ok_or_else(|| {
                    $crate::error::DbError::transaction(
                        "Transaction is no longer active",
                        handle.id(),
                    )
                })?;
                let $target = $crate::db::driver::Target::Transaction(tx);
                $body
            }
        }
    };
}

pub(crate) use with_target;

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 3 + 32); // "tx_" + 32 hex chars
    }
}
