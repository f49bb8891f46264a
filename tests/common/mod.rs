//! Recording driver shared by the integration tests.
//!
//! Every driver call is appended to an event log together with the pool it
//! ran against and whether it ran inside a transaction. Row results, affected
//! counts and failures are scripted per test.

#![allow(dead_code)]

use modeldb::db::{Database, Driver, Target};
use modeldb::error::{DbError, DbResult};
use modeldb::models::{CompiledStatement, QueryParam, Row};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub op: &'static str,
    pub pool: String,
    pub sql: Option<String>,
    pub in_tx: bool,
}

#[derive(Debug, Clone)]
pub struct FakePool {
    pub name: String,
}

impl FakePool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct FakeTx {
    pool: String,
}

#[derive(Debug)]
pub struct FakePrepared {
    pool: String,
    sql: String,
    key_columns: Vec<String>,
    affected: u64,
}

#[derive(Default)]
struct Script {
    events: Vec<Event>,
    rows: Vec<Row>,
    affected: u64,
    fail_sql: Option<String>,
    fail_close: bool,
    fail_commit: bool,
}

#[derive(Clone, Default)]
pub struct FakeDriver {
    script: Arc<Mutex<Script>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        let driver = Self::default();
        driver.set_affected(1);
        driver
    }

    /// Rows returned by every fetch.
    pub fn set_rows(&self, rows: Vec<Row>) {
        self.script.lock().unwrap().rows = rows;
    }

    /// Affected-row count reported by executes and prepared inserts.
    pub fn set_affected(&self, affected: u64) {
        self.script.lock().unwrap().affected = affected;
    }

    /// Fail every statement whose text contains `fragment`.
    pub fn fail_on(&self, fragment: &str) {
        self.script.lock().unwrap().fail_sql = Some(fragment.to_string());
    }

    pub fn fail_close(&self) {
        self.script.lock().unwrap().fail_close = true;
    }

    pub fn fail_commit(&self) {
        self.script.lock().unwrap().fail_commit = true;
    }

    pub fn events(&self) -> Vec<Event> {
        self.script.lock().unwrap().events.clone()
    }

    pub fn ops(&self) -> Vec<&'static str> {
        self.events().into_iter().map(|e| e.op).collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.events().iter().filter(|e| e.op == op).count()
    }

    fn record(&self, op: &'static str, target: &Target<'_, Self>, sql: Option<&str>) {
        let (pool, in_tx) = match target {
            Target::Pool(pool) => (pool.name.clone(), false),
            Target::Transaction(tx) => (tx.pool.clone(), true),
        };
        self.push(op, pool, sql, in_tx);
    }

    fn push(&self, op: &'static str, pool: String, sql: Option<&str>, in_tx: bool) {
        self.script.lock().unwrap().events.push(Event {
            op,
            pool,
            sql: sql.map(String::from),
            in_tx,
        });
    }

    fn check(&self, sql: &str) -> DbResult<()> {
        let script = self.script.lock().unwrap();
        match &script.fail_sql {
            Some(fragment) if sql.contains(fragment.as_str()) => Err(DbError::database(
                format!("scripted failure for '{}'", sql),
                Some("XX000".to_string()),
                "",
            )),
            _ => Ok(()),
        }
    }

    fn rows(&self) -> Vec<Row> {
        self.script.lock().unwrap().rows.clone()
    }

    fn affected(&self) -> u64 {
        self.script.lock().unwrap().affected
    }
}

impl Driver for FakeDriver {
    type Pool = FakePool;
    type Transaction = FakeTx;
    type PreparedInsert = FakePrepared;

    async fn begin(&self, pool: &FakePool) -> DbResult<FakeTx> {
        self.push("begin", pool.name.clone(), None, false);
        Ok(FakeTx {
            pool: pool.name.clone(),
        })
    }

    async fn commit(&self, tx: FakeTx) -> DbResult<()> {
        self.push("commit", tx.pool, None, true);
        if self.script.lock().unwrap().fail_commit {
            return Err(DbError::database("scripted commit failure", None, ""));
        }
        Ok(())
    }

    async fn rollback(&self, tx: FakeTx) -> DbResult<()> {
        self.push("rollback", tx.pool, None, true);
        Ok(())
    }

    async fn fetch_all(&self, target: Target<'_, Self>, stmt: &CompiledStatement) -> DbResult<Vec<Row>> {
        self.record("fetch_all", &target, Some(&stmt.sql));
        self.check(&stmt.sql)?;
        Ok(self.rows())
    }

    async fn fetch_each(
        &self,
        target: Target<'_, Self>,
        stmt: &CompiledStatement,
        sink: &mut (dyn FnMut(Row) + Send),
    ) -> DbResult<()> {
        self.record("fetch_each", &target, Some(&stmt.sql));
        self.check(&stmt.sql)?;
        for row in self.rows() {
            sink(row);
        }
        Ok(())
    }

    async fn execute(&self, target: Target<'_, Self>, stmt: &CompiledStatement) -> DbResult<u64> {
        self.record("execute", &target, Some(&stmt.sql));
        self.check(&stmt.sql)?;
        Ok(self.affected())
    }

    async fn execute_batch(
        &self,
        target: Target<'_, Self>,
        sql: &str,
        param_sets: &[Vec<QueryParam>],
    ) -> DbResult<Vec<u64>> {
        self.record("execute_batch", &target, Some(sql));
        self.check(sql)?;
        Ok(vec![self.affected(); param_sets.len()])
    }

    async fn prepare_insert(
        &self,
        target: Target<'_, Self>,
        stmt: &CompiledStatement,
        key_columns: &[String],
    ) -> DbResult<FakePrepared> {
        self.record("prepare_insert", &target, Some(&stmt.sql));
        let pool = match &target {
            Target::Pool(pool) => pool.name.clone(),
            Target::Transaction(tx) => tx.pool.clone(),
        };
        Ok(FakePrepared {
            pool,
            sql: stmt.sql.clone(),
            key_columns: key_columns.to_vec(),
            affected: 0,
        })
    }

    async fn execute_prepared(
        &self,
        target: Target<'_, Self>,
        prepared: &mut FakePrepared,
    ) -> DbResult<u64> {
        self.record("execute_prepared", &target, Some(&prepared.sql));
        self.check(&prepared.sql)?;
        prepared.affected = self.affected();
        Ok(prepared.affected)
    }

    async fn generated_keys(
        &self,
        target: Target<'_, Self>,
        prepared: &mut FakePrepared,
    ) -> DbResult<Vec<Row>> {
        self.record("generated_keys", &target, None);
        Ok((0..prepared.affected)
            .map(|i| {
                let mut row = Row::new();
                for column in &prepared.key_columns {
                    row.insert(column.clone(), json!(i + 1));
                }
                row
            })
            .collect())
    }

    async fn close_prepared(&self, prepared: FakePrepared) -> DbResult<()> {
        self.push("close_prepared", prepared.pool, None, false);
        if self.script.lock().unwrap().fail_close {
            return Err(DbError::resource("scripted close failure"));
        }
        Ok(())
    }
}

/// A database over a fresh recording driver with pools registered for
/// `default` and each of `keys`.
pub async fn database_with(keys: &[&'static str]) -> (Database<FakeDriver>, FakeDriver) {
    let driver = FakeDriver::new();
    let mut builder = Database::builder(driver.clone())
        .default_pool(FakePool::new("default"))
        .await;
    for key in keys {
        builder = builder.pool(*key, FakePool::new(key)).await;
    }
    (builder.build().await.unwrap(), driver)
}

pub fn row(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}
