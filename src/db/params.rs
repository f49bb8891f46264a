//! Binding `QueryParam` values to backend-specific sqlx queries.

use crate::models::{CompiledStatement, QueryParam};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

pub(crate) type MySqlQuery<'q> = sqlx::query::Query<'q, MySql, MySqlArguments>;
pub(crate) type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;
pub(crate) type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

pub(crate) fn bind_mysql_param<'q>(query: MySqlQuery<'q>, param: &'q QueryParam) -> MySqlQuery<'q> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

pub(crate) fn bind_postgres_param<'q>(query: PgQuery<'q>, param: &'q QueryParam) -> PgQuery<'q> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

pub(crate) fn bind_sqlite_param<'q>(query: SqliteQuery<'q>, param: &'q QueryParam) -> SqliteQuery<'q> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        // No native JSON type; stored as text
        QueryParam::Json(v) => query.bind(v.to_string()),
    }
}

pub(crate) fn mysql_query<'q>(sql: &'q str, params: &'q [QueryParam]) -> MySqlQuery<'q> {
    params
        .iter()
        .fold(sqlx::query(sql), |q, p| bind_mysql_param(q, p))
}

pub(crate) fn postgres_query<'q>(sql: &'q str, params: &'q [QueryParam]) -> PgQuery<'q> {
    params
        .iter()
        .fold(sqlx::query(sql), |q, p| bind_postgres_param(q, p))
}

pub(crate) fn sqlite_query<'q>(sql: &'q str, params: &'q [QueryParam]) -> SqliteQuery<'q> {
    params
        .iter()
        .fold(sqlx::query(sql), |q, p| bind_sqlite_param(q, p))
}

/// Statement text with `RETURNING` appended for the given key columns.
///
/// A statement that already has its own `RETURNING` clause is kept as is.
pub(crate) fn with_returning(stmt: &CompiledStatement, key_columns: &[String]) -> String {
    let sql = stmt.sql.trim_end().trim_end_matches(';');
    if key_columns.is_empty() || has_returning_clause(sql) {
        return sql.to_string();
    }
    // A trailing line comment would swallow the clause.
    let separator = if sql.contains("--") { "\n" } else { " " };
    format!("{}{}RETURNING {}", sql, separator, key_columns.join(", "))
}

/// Whether `RETURNING` appears as a keyword, outside quoted text and comments.
fn has_returning_clause(sql: &str) -> bool {
    let mut chars = sql.chars().peekable();
    let mut word = String::new();
    while let Some(c) = chars.next() {
        if c.is_ascii_alphanumeric() || c == '_' {
            word.push(c);
            continue;
        }
        if word.eq_ignore_ascii_case("RETURNING") {
            return true;
        }
        word.clear();
        match c {
            '\'' | '"' | '`' => {
                // Doubled quotes inside a literal close and reopen it.
                for inner in chars.by_ref() {
                    if inner == c {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = ' ';
                for inner in chars.by_ref() {
                    if previous == '*' && inner == '/' {
                        break;
                    }
                    previous = inner;
                }
            }
            _ => {}
        }
    }
    word.eq_ignore_ascii_case("RETURNING")
}
