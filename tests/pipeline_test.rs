//! Statement pipeline: routing, compilation, tracing and operation kinds.

mod common;

use common::{FakeDriver, FakePool, database_with, row};
use modeldb::db::{Database, DispatchKey, MemorySink, QueryCompiler, with_tracing};
use modeldb::error::{DbError, DbResult, ErrorKind};
use modeldb::models::{CompiledStatement, Model, PrimaryKey, Query, QueryParam, Table};
use serde_json::{Value as JsonValue, json};
use std::sync::{Arc, Mutex};

/// Compiles `{"select": [cols], "from": table, "where": {col: value}}` forms
/// and remembers every form it saw.
#[derive(Clone, Default)]
struct SelectCompiler {
    seen: Arc<Mutex<Vec<(Option<String>, JsonValue)>>>,
}

impl QueryCompiler for SelectCompiler {
    fn compile(&self, model: Option<&dyn Model>, form: &JsonValue) -> DbResult<CompiledStatement> {
        self.seen
            .lock()
            .unwrap()
            .push((model.map(|m| m.name().to_string()), form.clone()));

        let table = form["from"]
            .as_str()
            .ok_or_else(|| DbError::compilation("missing 'from'"))?;
        let columns = form["select"]
            .as_array()
            .map(|cols| {
                cols.iter()
                    .filter_map(JsonValue::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_else(|| "*".to_string());

        let mut stmt = CompiledStatement::new(format!("SELECT {} FROM {}", columns, table), vec![]);
        if let Some(JsonValue::Object(filters)) = form.get("where") {
            let clauses: Vec<String> = filters.keys().map(|k| format!("{} = ?", k)).collect();
            stmt.sql = format!("{} WHERE {}", stmt.sql, clauses.join(" AND "));
            for value in filters.values() {
                stmt = stmt.with_param(value.as_i64().unwrap_or_default());
            }
        }
        Ok(stmt)
    }
}

#[tokio::test]
async fn test_unregistered_key_falls_back_to_default() {
    let (db, driver) = database_with(&["audit"]).await;
    let users = Table::new("users");

    db.query(Some(&users), "SELECT 1").await.unwrap();
    db.query(None, "SELECT 2").await.unwrap();

    let events = driver.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.pool == "default" && !e.in_tx));
}

#[tokio::test]
async fn test_registered_key_routes_to_its_pool() {
    let (db, driver) = database_with(&["audit", "users"]).await;
    let audit = Table::new("audit");
    let users = Table::new("users");

    db.execute(Some(&audit), "DELETE FROM audit").await.unwrap();
    db.query(Some(&users), "SELECT * FROM users").await.unwrap();

    let pools: Vec<String> = driver.events().into_iter().map(|e| e.pool).collect();
    assert_eq!(pools, vec!["audit", "users"]);
}

#[tokio::test]
async fn test_missing_registration_is_configuration_error() {
    let driver = FakeDriver::new();
    let db = Database::new(driver.clone());
    db.registry()
        .register_pool("audit", FakePool::new("audit"))
        .await;

    let err = db
        .query(Some(&Table::new("users")), "SELECT 1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("users"));
    assert!(driver.events().is_empty());

    assert!(db.validate().await.is_err());
    let unvalidated = Database::builder(FakeDriver::new()).build().await;
    assert!(matches!(unvalidated, Err(DbError::Configuration { .. })));
}

#[tokio::test]
async fn test_registry_replacement_and_unregister() {
    let (db, driver) = database_with(&["audit"]).await;
    let audit = Table::new("audit");

    db.registry()
        .register_pool("audit", FakePool::new("audit-replica"))
        .await;
    db.query(Some(&audit), "SELECT 1").await.unwrap();

    assert!(db.registry().unregister(&DispatchKey::new("audit")).await);
    db.query(Some(&audit), "SELECT 2").await.unwrap();

    let pools: Vec<String> = driver.events().into_iter().map(|e| e.pool).collect();
    assert_eq!(pools, vec!["audit-replica", "default"]);
}

#[tokio::test]
async fn test_structured_query_is_compiled_for_model() {
    let compiler = SelectCompiler::default();
    let driver = FakeDriver::new();
    driver.set_rows(vec![row(json!({"id": 7, "name": "ada"}))]);
    let db = Database::builder(driver.clone())
        .compiler(compiler.clone())
        .default_pool(FakePool::new("default"))
        .await
        .pool("users", FakePool::new("users"))
        .await
        .build()
        .await
        .unwrap();

    let users = Table::new("users");
    let form = json!({"select": ["id", "name"], "from": "users", "where": {"id": 7}});
    let rows = db.query(Some(&users), form.clone()).await.unwrap();

    assert_eq!(rows, vec![row(json!({"id": 7, "name": "ada"}))]);
    assert_eq!(
        *compiler.seen.lock().unwrap(),
        vec![(Some("users".to_string()), form)]
    );
    let events = driver.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].pool, "users");
    assert_eq!(
        events[0].sql.as_deref(),
        Some("SELECT id, name FROM users WHERE id = ?")
    );
}

#[tokio::test]
async fn test_literal_statement_bypasses_compiler() {
    let compiler = SelectCompiler::default();
    let driver = FakeDriver::new();
    let db = Database::builder(driver.clone())
        .compiler(compiler.clone())
        .default_pool(FakePool::new("default"))
        .await
        .build()
        .await
        .unwrap();

    let stmt = CompiledStatement::new("UPDATE t SET a = ?", vec![QueryParam::Int(1)]);
    db.execute(None, stmt).await.unwrap();

    assert!(compiler.seen.lock().unwrap().is_empty());
    assert_eq!(driver.events()[0].sql.as_deref(), Some("UPDATE t SET a = ?"));
}

#[tokio::test]
async fn test_compile_failure_never_reaches_driver() {
    let (db, driver) = database_with(&[]).await;

    let err = db
        .query(None, json!({"select": ["*"], "from": "t"}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Compilation);
    assert!(driver.events().is_empty());
}

#[tokio::test]
async fn test_reducible_query_is_lazy_and_reruns() {
    let (db, driver) = database_with(&[]).await;
    driver.set_rows(vec![row(json!({"n": 1})), row(json!({"n": 2})), row(json!({"n": 3}))]);

    let reducible = db.reducible_query(None, "SELECT n FROM numbers").unwrap();
    assert!(driver.events().is_empty());

    let sum = reducible
        .reduce(0, |acc, r| acc + r["n"].as_i64().unwrap())
        .await
        .unwrap();
    assert_eq!(sum, 6);

    let rows = reducible.collect().await.unwrap();
    assert_eq!(rows.len(), 3);

    let mut seen = Vec::new();
    reducible
        .for_each(|r| seen.push(r["n"].clone()))
        .await
        .unwrap();
    assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);

    assert_eq!(driver.ops(), vec!["fetch_each", "fetch_each", "fetch_each"]);
}

#[tokio::test]
async fn test_reducible_query_uses_consuming_scope() {
    let (db, driver) = database_with(&["audit"]).await;
    let audit = Table::new("audit");

    let reducible = db.reducible_query(Some(&audit), "SELECT * FROM audit").unwrap();
    reducible.collect().await.unwrap();
    db.with_transaction(|| async { reducible.collect().await })
        .await
        .unwrap();

    let events = driver.events();
    assert_eq!(events[0].pool, "audit");
    assert!(!events[0].in_tx);
    // Inside the scope the pinned default connection wins over the model's key.
    let inside = events.iter().filter(|e| e.op == "fetch_each").nth(1).unwrap();
    assert_eq!(inside.pool, "default");
    assert!(inside.in_tx);
}

#[tokio::test]
async fn test_update_and_delete_report_whether_rows_changed() {
    let (db, driver) = database_with(&[]).await;

    for (affected, expected) in [(0, false), (1, true), (3, true)] {
        driver.set_affected(affected);
        assert_eq!(db.update(None, "UPDATE t SET a = 1").await.unwrap(), expected);
        assert_eq!(db.delete(None, "DELETE FROM t").await.unwrap(), expected);
    }
    assert_eq!(driver.count("execute"), 6);
}

#[tokio::test]
async fn test_execute_returns_affected_count() {
    let (db, driver) = database_with(&[]).await;
    driver.set_affected(4);
    assert_eq!(db.execute(None, "DELETE FROM t").await.unwrap(), 4);
}

#[tokio::test]
async fn test_execute_batch_is_one_dispatch() {
    let (db, driver) = database_with(&[]).await;
    driver.set_affected(1);

    let counts = db
        .execute_batch(
            None,
            "INSERT INTO t (a) VALUES (?)",
            vec![
                vec![QueryParam::Int(1)],
                vec![QueryParam::Int(2)],
                vec![QueryParam::Int(3)],
            ],
        )
        .await
        .unwrap();

    assert_eq!(counts, vec![1, 1, 1]);
    assert_eq!(driver.ops(), vec!["execute_batch"]);
}

#[tokio::test]
async fn test_insert_returns_generated_keys() {
    let (db, driver) = database_with(&["users"]).await;
    let users = Table::new("users");

    let keys = db
        .insert(&users, "INSERT INTO users (name) VALUES ('ada')")
        .await
        .unwrap();

    assert_eq!(keys, vec![row(json!({"id": 1}))]);
    assert_eq!(
        driver.ops(),
        vec![
            "prepare_insert",
            "execute_prepared",
            "generated_keys",
            "close_prepared"
        ]
    );
    assert!(driver.events().iter().all(|e| e.pool == "users"));
}

#[tokio::test]
async fn test_insert_with_composite_key() {
    let (db, _driver) = database_with(&[]).await;
    let memberships =
        Table::new("memberships").with_primary_key(PrimaryKey::composite(["user_id", "group_id"]));

    let keys = db
        .insert(&memberships, "INSERT INTO memberships VALUES (1, 2)")
        .await
        .unwrap();

    assert_eq!(keys, vec![row(json!({"user_id": 1, "group_id": 1}))]);
}

#[tokio::test]
async fn test_insert_without_affected_rows_skips_keys() {
    let (db, driver) = database_with(&[]).await;
    driver.set_affected(0);

    let keys = db
        .insert(&Table::new("users"), "INSERT INTO users SELECT * FROM staging")
        .await
        .unwrap();

    assert!(keys.is_empty());
    assert_eq!(driver.count("generated_keys"), 0);
    assert_eq!(driver.count("close_prepared"), 1);
}

#[tokio::test]
async fn test_insert_close_failure_is_resource_error() {
    let (db, driver) = database_with(&[]).await;
    driver.fail_close();

    let err = db
        .insert(&Table::new("users"), "INSERT INTO users VALUES (1)")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
}

#[tokio::test]
async fn test_insert_close_failure_keeps_original_error() {
    let (db, driver) = database_with(&[]).await;
    driver.fail_close();
    driver.fail_on("INSERT");

    let err = db
        .insert(&Table::new("users"), "INSERT INTO users VALUES (1)")
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
    assert_eq!(driver.count("close_prepared"), 1);
}

#[tokio::test]
async fn test_tracing_emits_form_and_statement() {
    let sink = MemorySink::new();
    let db = Database::builder(FakeDriver::new())
        .compiler(SelectCompiler::default())
        .trace_sink(sink.clone())
        .default_pool(FakePool::new("default"))
        .await
        .build()
        .await
        .unwrap();

    db.query(None, "SELECT 1").await.unwrap();
    assert!(sink.lines().is_empty());

    with_tracing(|| async {
        db.query(None, json!({"select": ["a"], "from": "t"}))
            .await
            .unwrap();
        db.execute(None, Query::sql_with("DELETE FROM t WHERE id = ?", vec![QueryParam::Int(5)]))
            .await
            .unwrap();
    })
    .await;

    let lines = sink.lines();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("\"select\""));
    assert!(lines[0].contains("\"from\""));
    assert!(lines[1].starts_with("SELECT a FROM t"));
    assert!(lines[2].starts_with("DELETE FROM t WHERE id = ?"));
    assert!(lines[2].contains('5'));

    sink.clear();
    db.query(None, "SELECT 1").await.unwrap();
    assert!(sink.lines().is_empty());
}

#[tokio::test]
async fn test_tracing_does_not_change_results() {
    let (db, driver) = database_with(&[]).await;
    driver.set_rows(vec![row(json!({"a": 1}))]);

    let plain = db.query(None, "SELECT a FROM t").await.unwrap();
    let traced = with_tracing(|| db.query(None, "SELECT a FROM t")).await.unwrap();

    assert_eq!(plain, traced);
    assert_eq!(driver.count("fetch_all"), 2);
}

#[tokio::test]
async fn test_tracing_batch_emits_every_parameter_set() {
    let sink = MemorySink::new();
    let db = Database::builder(FakeDriver::new())
        .trace_sink(sink.clone())
        .default_pool(FakePool::new("default"))
        .await
        .build()
        .await
        .unwrap();

    with_tracing(|| {
        db.execute_batch(
            None,
            "INSERT INTO t (a, b) VALUES (?, ?)",
            vec![
                vec![QueryParam::Int(1), QueryParam::String("x".into())],
                vec![QueryParam::Int(2), QueryParam::Null],
            ],
        )
    })
    .await
    .unwrap();

    assert_eq!(
        sink.lines(),
        vec![
            "INSERT INTO t (a, b) VALUES (?, ?) -- [1, \"x\"]".to_string(),
            "INSERT INTO t (a, b) VALUES (?, ?) -- [2, NULL]".to_string(),
        ]
    );
}
