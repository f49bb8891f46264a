//! [`Driver`] implementation on top of sqlx.
//!
//! Statements run on a connection acquired from a [`DbPool`] or on the
//! connection of a pinned [`DbTransaction`]. Each backend keeps its own pool
//! and transaction type, so every value goes through the backend's native
//! type support.

use crate::config::{DatabaseConfig, DatabaseType};
use crate::db::driver::{Driver, Target};
use crate::db::executor::Database;
use crate::db::params::{mysql_query, postgres_query, sqlite_query, with_returning};
use crate::db::pool::{DbPool, LazyPool};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{CompiledStatement, QueryParam, Row};
use futures_util::TryStreamExt;
use serde_json::Value as JsonValue;
use sqlx::pool::PoolConnection;
use sqlx::{Executor, MySql, Postgres, Sqlite, Transaction};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// An open transaction holding one pooled connection.
pub enum DbTransaction {
    MySql(Transaction<'static, MySql>),
    Postgres(Transaction<'static, Postgres>),
    SQLite(Transaction<'static, Sqlite>),
}

impl DbTransaction {
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbTransaction::MySql(_) => DatabaseType::MySQL,
            DbTransaction::Postgres(_) => DatabaseType::PostgreSQL,
            DbTransaction::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DbTransaction").field(&self.db_type()).finish()
    }
}

/// An insert prepared on its connection, with the key columns it reports.
///
/// When the insert was prepared against a pool, the pooled connection it was
/// prepared on is held until the insert is closed, so execution and key
/// retrieval run on that same connection.
#[derive(Debug)]
pub struct PreparedInsert {
    sql: String,
    params: Vec<QueryParam>,
    key_columns: Vec<String>,
    connection: Option<HeldConnection>,
    generated: Option<Vec<Row>>,
}

/// A pooled connection checked out for the lifetime of a prepared insert.
enum HeldConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

impl HeldConnection {
    async fn acquire(pool: &DbPool) -> DbResult<Self> {
        Ok(match pool {
            DbPool::MySql(p) => HeldConnection::MySql(p.acquire().await?),
            DbPool::Postgres(p) => HeldConnection::Postgres(p.acquire().await?),
            DbPool::SQLite(p) => HeldConnection::SQLite(p.acquire().await?),
        })
    }

    async fn prepare(&mut self, sql: &str) -> DbResult<()> {
        match self {
            HeldConnection::MySql(conn) => {
                (&mut **conn).prepare(sql).await?;
            }
            HeldConnection::Postgres(conn) => {
                (&mut **conn).prepare(sql).await?;
            }
            HeldConnection::SQLite(conn) => {
                (&mut **conn).prepare(sql).await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for HeldConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self {
            HeldConnection::MySql(_) => DatabaseType::MySQL,
            HeldConnection::Postgres(_) => DatabaseType::PostgreSQL,
            HeldConnection::SQLite(_) => DatabaseType::SQLite,
        };
        f.debug_tuple("HeldConnection").field(&backend).finish()
    }
}

/// Run `$body` with `$conn` bound to the backend connection of a [`Target`]
/// and `$query` bound to that backend's statement builder.
///
/// Pool targets acquire one connection for the whole body.
macro_rules! on_connection {
    ($target:expr, |$conn:ident, $query:ident| $body:expr) => {
        match $target {
            Target::Pool(DbPool::MySql(pool)) => {
                #[allow(unused_imports)]
                use $crate::db::params::mysql_query as $query;
                let mut pooled = pool.acquire().await?;
                let $conn: &mut sqlx::MySqlConnection = &mut *pooled;
                $body
            }
            Target::Pool(DbPool::Postgres(pool)) => {
                #[allow(unused_imports)]
                use $crate::db::params::postgres_query as $query;
                let mut pooled = pool.acquire().await?;
                let $conn: &mut sqlx::PgConnection = &mut *pooled;
                $body
            }
            Target::Pool(DbPool::SQLite(pool)) => {
                #[allow(unused_imports)]
                use $crate::db::params::sqlite_query as $query;
                let mut pooled = pool.acquire().await?;
                let $conn: &mut sqlx::SqliteConnection = &mut *pooled;
                $body
            }
            Target::Transaction(DbTransaction::MySql(tx)) => {
                #[allow(unused_imports)]
                use $crate::db::params::mysql_query as $query;
                let $conn: &mut sqlx::MySqlConnection = &mut **tx;
                $body
            }
            Target::Transaction(DbTransaction::Postgres(tx)) => {
                #[allow(unused_imports)]
                use $crate::db::params::postgres_query as $query;
                let $conn: &mut sqlx::PgConnection = &mut **tx;
                $body
            }
            Target::Transaction(DbTransaction::SQLite(tx)) => {
                #[allow(unused_imports)]
                use $crate::db::params::sqlite_query as $query;
                let $conn: &mut sqlx::SqliteConnection = &mut **tx;
                $body
            }
        }
    };
}

/// sqlx-backed driver for MySQL, PostgreSQL and SQLite.
#[derive(Debug, Clone, Default)]
pub struct SqlxDriver {
    query_timeout: Option<Duration>,
}

impl SqlxDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail statements that run longer than `limit` with a timeout error.
    pub fn with_query_timeout(mut self, limit: Duration) -> Self {
        self.query_timeout = Some(limit);
        self
    }

    /// A provider that opens the configured pool on first use.
    pub fn lazy_provider(config: DatabaseConfig) -> LazyPool {
        LazyPool::new(config)
    }

    async fn timed<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = DbResult<T>>,
    ) -> DbResult<T> {
        match self.query_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| DbError::timeout(operation, limit))?,
            None => fut.await,
        }
    }
}

fn backend_of(target: &Target<'_, SqlxDriver>) -> DatabaseType {
    match target {
        Target::Pool(pool) => pool.db_type(),
        Target::Transaction(tx) => tx.db_type(),
    }
}

impl Driver for SqlxDriver {
    type Pool = DbPool;
    type Transaction = DbTransaction;
    type PreparedInsert = PreparedInsert;

    async fn begin(&self, pool: &DbPool) -> DbResult<DbTransaction> {
        let tx = match pool {
            DbPool::MySql(p) => DbTransaction::MySql(p.begin().await?),
            DbPool::Postgres(p) => DbTransaction::Postgres(p.begin().await?),
            DbPool::SQLite(p) => DbTransaction::SQLite(p.begin().await?),
        };
        debug!(db_type = %tx.db_type(), "Began transaction");
        Ok(tx)
    }

    async fn commit(&self, tx: DbTransaction) -> DbResult<()> {
        match tx {
            DbTransaction::MySql(tx) => tx.commit().await?,
            DbTransaction::Postgres(tx) => tx.commit().await?,
            DbTransaction::SQLite(tx) => tx.commit().await?,
        }
        Ok(())
    }

    async fn rollback(&self, tx: DbTransaction) -> DbResult<()> {
        match tx {
            DbTransaction::MySql(tx) => tx.rollback().await?,
            DbTransaction::Postgres(tx) => tx.rollback().await?,
            DbTransaction::SQLite(tx) => tx.rollback().await?,
        }
        Ok(())
    }

    async fn fetch_all(&self, target: Target<'_, Self>, stmt: &CompiledStatement) -> DbResult<Vec<Row>> {
        self.timed("query", async {
            on_connection!(target, |conn, query| {
                let rows = query(&stmt.sql, &stmt.params).fetch_all(&mut *conn).await?;
                Ok::<_, DbError>(rows.iter().map(RowToJson::to_json_map).collect())
            })
        })
        .await
    }

    async fn fetch_each(
        &self,
        target: Target<'_, Self>,
        stmt: &CompiledStatement,
        sink: &mut (dyn FnMut(Row) + Send),
    ) -> DbResult<()> {
        self.timed("query", async {
            on_connection!(target, |conn, query| {
                let mut rows = query(&stmt.sql, &stmt.params).fetch(&mut *conn);
                while let Some(row) = rows.try_next().await? {
                    sink(row.to_json_map());
                }
                Ok::<_, DbError>(())
            })
        })
        .await
    }

    async fn execute(&self, target: Target<'_, Self>, stmt: &CompiledStatement) -> DbResult<u64> {
        self.timed("execute", async {
            on_connection!(target, |conn, query| {
                let result = query(&stmt.sql, &stmt.params).execute(&mut *conn).await?;
                Ok::<_, DbError>(result.rows_affected())
            })
        })
        .await
    }

    async fn execute_batch(
        &self,
        target: Target<'_, Self>,
        sql: &str,
        param_sets: &[Vec<QueryParam>],
    ) -> DbResult<Vec<u64>> {
        self.timed("execute_batch", async {
            on_connection!(target, |conn, query| {
                let mut counts = Vec::with_capacity(param_sets.len());
                for params in param_sets {
                    let result = query(sql, params).execute(&mut *conn).await?;
                    counts.push(result.rows_affected());
                }
                Ok::<_, DbError>(counts)
            })
        })
        .await
    }

    async fn prepare_insert(
        &self,
        target: Target<'_, Self>,
        stmt: &CompiledStatement,
        key_columns: &[String],
    ) -> DbResult<PreparedInsert> {
        let sql = match backend_of(&target) {
            // MySQL reports keys through LAST_INSERT_ID() instead of RETURNING.
            DatabaseType::MySQL => {
                if key_columns.len() > 1 {
                    return Err(DbError::invalid_input(format!(
                        "MySQL reports generated keys for a single auto-increment column, got {:?}",
                        key_columns
                    )));
                }
                stmt.sql.clone()
            }
            DatabaseType::PostgreSQL | DatabaseType::SQLite => with_returning(stmt, key_columns),
        };

        let connection = match target {
            Target::Pool(pool) => {
                let mut held = HeldConnection::acquire(pool).await?;
                held.prepare(&sql).await?;
                Some(held)
            }
            tx @ Target::Transaction(_) => {
                on_connection!(tx, |conn, _query| {
                    conn.prepare(&sql).await?;
                    Ok::<_, DbError>(())
                })?;
                None
            }
        };

        Ok(PreparedInsert {
            sql,
            params: stmt.params.clone(),
            key_columns: key_columns.to_vec(),
            connection,
            generated: None,
        })
    }

    async fn execute_prepared(
        &self,
        target: Target<'_, Self>,
        prepared: &mut PreparedInsert,
    ) -> DbResult<u64> {
        let PreparedInsert {
            sql,
            params,
            key_columns,
            connection,
            generated,
        } = prepared;

        let (rows_affected, keys) = self
            .timed("insert", async {
                match (connection.as_mut(), target) {
                    (Some(HeldConnection::MySql(conn)), _) => {
                        mysql_insert(&mut **conn, sql, params, key_columns).await
                    }
                    (Some(HeldConnection::Postgres(conn)), _) => {
                        let rows = postgres_query(sql, params).fetch_all(&mut **conn).await?;
                        Ok(returned_keys(&rows))
                    }
                    (Some(HeldConnection::SQLite(conn)), _) => {
                        let rows = sqlite_query(sql, params).fetch_all(&mut **conn).await?;
                        Ok(returned_keys(&rows))
                    }
                    (None, Target::Transaction(DbTransaction::MySql(tx))) => {
                        mysql_insert(&mut **tx, sql, params, key_columns).await
                    }
                    (None, Target::Transaction(DbTransaction::Postgres(tx))) => {
                        let rows = postgres_query(sql, params).fetch_all(&mut **tx).await?;
                        Ok(returned_keys(&rows))
                    }
                    (None, Target::Transaction(DbTransaction::SQLite(tx))) => {
                        let rows = sqlite_query(sql, params).fetch_all(&mut **tx).await?;
                        Ok(returned_keys(&rows))
                    }
                    (None, Target::Pool(_)) => Err(DbError::internal(
                        "Prepared insert no longer holds the connection it was prepared on",
                    )),
                }
            })
            .await?;

        *generated = Some(keys);
        Ok(rows_affected)
    }

    async fn generated_keys(
        &self,
        _target: Target<'_, Self>,
        prepared: &mut PreparedInsert,
    ) -> DbResult<Vec<Row>> {
        prepared
            .generated
            .take()
            .ok_or_else(|| DbError::internal("Generated keys requested before the insert ran"))
    }

    async fn close_prepared(&self, prepared: PreparedInsert) -> DbResult<()> {
        // Dropping the held connection hands it back to its pool.
        drop(prepared);
        Ok(())
    }
}

/// Keys from the `RETURNING` rows of an insert; one row per inserted row.
fn returned_keys<R: RowToJson>(rows: &[R]) -> (u64, Vec<Row>) {
    let keys: Vec<Row> = rows.iter().map(RowToJson::to_json_map).collect();
    (keys.len() as u64, keys)
}

async fn mysql_insert(
    conn: &mut sqlx::MySqlConnection,
    sql: &str,
    params: &[QueryParam],
    key_columns: &[String],
) -> DbResult<(u64, Vec<Row>)> {
    let result = mysql_query(sql, params).execute(&mut *conn).await?;
    let keys = mysql_generated_keys(key_columns, result.last_insert_id(), result.rows_affected());
    Ok((result.rows_affected(), keys))
}

/// Keys of a MySQL insert: consecutive auto-increment values starting at
/// `last_insert_id`, which is the id of the first inserted row.
fn mysql_generated_keys(key_columns: &[String], last_insert_id: u64, rows_affected: u64) -> Vec<Row> {
    let Some(column) = key_columns.first() else {
        return Vec::new();
    };
    if last_insert_id == 0 {
        return Vec::new();
    }
    (0..rows_affected)
        .map(|offset| {
            let mut row = Row::new();
            row.insert(column.clone(), JsonValue::from(last_insert_id + offset));
            row
        })
        .collect()
}

impl Database<SqlxDriver> {
    /// Register every configured database under its key; pools open lazily.
    pub async fn register_configs(&self, configs: impl IntoIterator<Item = DatabaseConfig>) {
        for config in configs {
            let key = config.key.clone();
            self.registry()
                .register(key, SqlxDriver::lazy_provider(config))
                .await;
        }
    }
}
