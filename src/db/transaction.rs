//! Transaction scopes.
//!
//! [`Database::with_transaction`] begins a transaction on the default
//! connection, pins it in the task scope and runs the operation. Every
//! statement issued inside the scope, whatever its model's dispatch key, runs
//! on the pinned connection. Nested scopes join the outermost transaction.

use crate::db::dispatch::DispatchKey;
use crate::db::driver::{Connection, Driver, TransactionHandle};
use crate::db::executor::Database;
use crate::db::scope::ScopeContext;
use crate::error::{DbError, DbResult};
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl<D: Driver> Database<D> {
    /// Run `op` inside a transaction.
    ///
    /// The transaction commits when `op` returns `Ok` and rolls back when it
    /// returns `Err` or panics. Inside an enclosing transaction scope `op`
    /// runs directly in the existing transaction, so only the outermost scope
    /// commits or rolls back.
    pub async fn with_transaction<F, Fut, T>(&self, op: F) -> DbResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let ctx = ScopeContext::current();
        if ctx.in_transaction() {
            debug!("Joining enclosing transaction");
            return op().await;
        }

        let pool = self.registry.resolve(&DispatchKey::default_key()).await?;
        let tx = self.driver.begin(&pool).await?;
        let handle = Arc::new(TransactionHandle::<D>::new(tx));
        info!(transaction_id = %handle.id(), "Transaction started");

        let pinned: Arc<dyn Any + Send + Sync> = handle.clone();
        let outcome = AssertUnwindSafe(ctx.with_transaction(pinned).scope(async move { op().await }))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                self.commit(&handle).await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.rollback_after(&handle, &err.to_string()).await;
                Err(err)
            }
            Err(panic) => {
                self.rollback_after(&handle, "panic").await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// The connection a statement for `key` should run on in the current scope.
    pub async fn current_connection(&self, key: &DispatchKey) -> DbResult<Connection<D>> {
        if let Some(pinned) = ScopeContext::current().transaction() {
            return Arc::clone(pinned)
                .downcast::<TransactionHandle<D>>()
                .map(Connection::Transaction)
                .map_err(|_| {
                    DbError::transaction(
                        "Enclosing transaction was opened by a different driver",
                        "unknown",
                    )
                });
        }
        self.registry.resolve(key).await.map(Connection::Pool)
    }

    async fn commit(&self, handle: &TransactionHandle<D>) -> DbResult<()> {
        let tx = handle.take().await?;
        let elapsed_ms = (chrono::Utc::now() - handle.started_at()).num_milliseconds();
        match self.driver.commit(tx).await {
            Ok(()) => {
                info!(
                    transaction_id = %handle.id(),
                    elapsed_ms = elapsed_ms,
                    "Transaction committed"
                );
                Ok(())
            }
            Err(e) => {
                warn!(transaction_id = %handle.id(), error = %e, "Transaction commit failed");
                Err(e)
            }
        }
    }

    /// Roll back after a failure. The failure that caused the rollback is the
    /// one reported, so rollback errors are only logged.
    async fn rollback_after(&self, handle: &TransactionHandle<D>, cause: &str) {
        let tx = match handle.take().await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(transaction_id = %handle.id(), error = %e, "Nothing to roll back");
                return;
            }
        };
        match self.driver.rollback(tx).await {
            Ok(()) => info!(
                transaction_id = %handle.id(),
                cause = cause,
                "Transaction rolled back"
            ),
            Err(e) => warn!(
                transaction_id = %handle.id(),
                cause = cause,
                error = %e,
                "Transaction rollback failed"
            ),
        }
    }
}
