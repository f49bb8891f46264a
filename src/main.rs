//! modeldb - run SQL statements through the pipeline from the command line.
//!
//! Rows are printed to stdout as JSON lines; logs go to stderr.

use modeldb::config::{Config, Mode};
use modeldb::db::{Database, SqlxDriver, with_call_counting, with_tracing};
use modeldb::error::DbResult;
use modeldb::models::{Model, Table};
use serde_json::{Value as JsonValue, json};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

async fn run_statements(
    db: &Database<SqlxDriver>,
    model: Option<&dyn Model>,
    config: &Config,
) -> DbResult<()> {
    for sql in &config.statements {
        match config.mode {
            Mode::Query => {
                for row in db.query(model, sql.as_str()).await? {
                    println!("{}", JsonValue::Object(row));
                }
            }
            Mode::Execute => {
                let rows_affected = db.execute(model, sql.as_str()).await?;
                println!("{}", json!({ "rows_affected": rows_affected }));
            }
        }
    }
    Ok(())
}

async fn run(db: &Database<SqlxDriver>, config: &Config) -> DbResult<()> {
    let table = config.model.as_deref().map(Table::new);
    let model = table.as_ref().map(|t| t as &dyn Model);

    if config.transaction {
        db.with_transaction(|| run_statements(db, model, config))
            .await
    } else {
        run_statements(db, model, config).await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();
    init_tracing(&config);

    if config.databases.is_empty() {
        eprintln!("Error: At least one database must be configured.");
        eprintln!();
        eprintln!("Usage: modeldb --database <url> [--database <key>=<url>] [SQL]...");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  modeldb --database sqlite:data.db 'SELECT * FROM users'");
        eprintln!("  modeldb --database postgres://localhost/app --database audit=sqlite:audit.db \\");
        eprintln!("          --model audit --mode execute 'DELETE FROM events'");
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting modeldb");

    let db = Database::new(SqlxDriver::new());
    db.register_configs(config.parse_databases()?).await;
    db.validate().await?;

    let traced = async {
        if config.trace {
            with_tracing(|| run(&db, &config)).await
        } else {
            run(&db, &config).await
        }
    };

    let result = if config.count {
        with_call_counting(|counter| async move {
            let result = traced.await;
            println!("{}", json!({ "statements_dispatched": counter.get() }));
            result
        })
        .await
    } else {
        traced.await
    };

    if let Err(e) = result {
        error!(error = %e, kind = ?e.kind(), "Statement failed");
        if let Some(suggestion) = e.suggestion() {
            eprintln!("Hint: {}", suggestion);
        }
        return Err(e.into());
    }
    Ok(())
}
