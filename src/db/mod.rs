//! Database access layer.
//!
//! - Dispatch keys and the connection registry
//! - Ambient task scope: transactions, tracing, call counting
//! - The statement pipeline and transaction scopes on [`Database`]
//! - The [`Driver`] seam and its sqlx implementation

pub mod compiler;
pub mod dispatch;
pub mod driver;
pub mod executor;
pub mod params;
pub mod pool;
pub mod registry;
pub mod scope;
pub mod sqlx_driver;
pub mod trace;
pub mod transaction;
pub mod types;

pub use compiler::{QueryCompiler, RejectStructured};
pub use dispatch::{DEFAULT_KEY, DispatchKey, key_of};
pub use driver::{Connection, Driver, Target, TransactionHandle};
pub use executor::{Database, DatabaseBuilder, Reducible};
pub use pool::{DbPool, LazyPool, create_pool};
pub use registry::{ConnectionProvider, ConnectionRegistry};
pub use scope::{CallCounter, ScopeContext, with_call_counting, with_tracing};
pub use sqlx_driver::{DbTransaction, PreparedInsert, SqlxDriver};
pub use trace::{MemorySink, StdoutSink, TraceSink, TracingSink};
