//! Task-local execution scope.
//!
//! Transaction pinning, statement tracing and call counting are carried in a
//! single [`ScopeContext`] stored in a tokio task-local. Entering a scoped
//! block installs a modified copy of the current context for the duration of
//! that block only, so scopes nest with stack discipline and are invisible to
//! unrelated tasks.
//!
//! Task-locals are not inherited by `tokio::spawn`. To carry the current
//! scope into a spawned task, capture it with [`ScopeContext::current`] and
//! run the task's future through [`ScopeContext::scope`]:
//!
//! ```ignore
//! let ctx = ScopeContext::current();
//! tokio::spawn(ctx.scope(async move { db.execute(None, stmt).await }));
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

tokio::task_local! {
    static SCOPE: ScopeContext;
}

/// Snapshot of the ambient scope of the current task.
#[derive(Clone, Default)]
pub struct ScopeContext {
    transaction: Option<Arc<dyn Any + Send + Sync>>,
    tracing: bool,
    counter: Option<CallCounter>,
}

impl ScopeContext {
    /// The context of the current task; empty outside any scope.
    pub fn current() -> Self {
        SCOPE.try_with(Clone::clone).unwrap_or_default()
    }

    /// Run `fut` with this context installed.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        SCOPE.scope(self, fut).await
    }

    pub fn is_tracing(&self) -> bool {
        self.tracing
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn call_counter(&self) -> Option<&CallCounter> {
        self.counter.as_ref()
    }

    pub(crate) fn transaction(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.transaction.as_ref()
    }

    pub(crate) fn with_transaction(mut self, transaction: Arc<dyn Any + Send + Sync>) -> Self {
        self.transaction = Some(transaction);
        self
    }

    fn with_tracing(mut self) -> Self {
        self.tracing = true;
        self
    }

    fn with_counter(mut self, counter: CallCounter) -> Self {
        self.counter = Some(counter);
        self
    }
}

impl fmt::Debug for ScopeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeContext")
            .field("in_transaction", &self.in_transaction())
            .field("tracing", &self.tracing)
            .field("counter", &self.counter)
            .finish()
    }
}

/// Shared statement counter of a counting scope.
///
/// Clones share the same count, so it can be read from any task the scope
/// was propagated into.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicU64>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of statements dispatched so far.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for CallCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallCounter").field(&self.get()).finish()
    }
}

/// Run `op` with statement tracing enabled.
pub async fn with_tracing<F, Fut>(op: F) -> Fut::Output
where
    F: FnOnce() -> Fut,
    Fut: Future,
{
    ScopeContext::current().with_tracing().scope(op()).await
}

/// Run `op` with a fresh call counter.
///
/// `op` receives the counter; it counts every statement dispatched through
/// the pipeline while `op` runs. A nested counting scope shadows this one:
/// statements inside it are counted only by the innermost counter.
pub async fn with_call_counting<F, Fut>(op: F) -> Fut::Output
where
    F: FnOnce(CallCounter) -> Fut,
    Fut: Future,
{
    let counter = CallCounter::new();
    ScopeContext::current()
        .with_counter(counter.clone())
        .scope(op(counter))
        .await
}

/// Increment the innermost active call counter, if any.
pub(crate) fn count_call() {
    let _ = SCOPE.try_with(|ctx| {
        if let Some(counter) = &ctx.counter {
            counter.increment();
        }
    });
}
