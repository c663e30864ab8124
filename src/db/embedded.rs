//! Embedded-file database backend (sqlite).
//!
//! Databases live at `base_dir/project_<id>/<name>.db`. Pools are cached by
//! the service; this module owns opening, querying and introspection.

use super::identifier::{quoted_identifier, validate_identifier};
use super::types::{ColumnInfo, DbError, QueryResult, TableInfo};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, SqlitePool, TypeInfo, ValueRef};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

/// Open (creating if missing) the sqlite file at `path`.
///
/// # Errors
///
/// Returns driver errors; the parent directory must already exist.
pub(crate) async fn open_pool(path: &Path) -> Result<SqlitePool, DbError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    debug!(path = %path.display(), "opened embedded database");
    Ok(pool)
}

/// Execute one statement with a deadline. Row statements stream rows; other
/// statements report affected rows. Failures ride inside the result.
pub(crate) async fn run_query(pool: &SqlitePool, sql: &str, deadline: Duration) -> QueryResult {
    let started = Instant::now();
    let work = async {
        if super::is_row_statement(sql) {
            let rows = sqlx::query(sql).fetch_all(pool).await?;
            let columns = rows
                .first()
                .map(|row| {
                    row.columns()
                        .iter()
                        .map(|c| c.name().to_string())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            let data: Vec<Vec<serde_json::Value>> = rows
                .iter()
                .map(|row| {
                    (0..row.columns().len())
                        .map(|idx| decode_value(row, idx))
                        .collect()
                })
                .collect();
            Ok::<QueryResult, sqlx::Error>(QueryResult {
                row_count: data.len(),
                columns,
                rows: data,
                affected_rows: 0,
                duration_ms: 0,
                error: String::new(),
            })
        } else {
            let outcome = sqlx::query(sql).execute(pool).await?;
            Ok(QueryResult {
                affected_rows: outcome.rows_affected(),
                ..Default::default()
            })
        }
    };

    let mut result = match tokio::time::timeout(deadline, work).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => QueryResult::failure(e.to_string(), 0),
        Err(_) => QueryResult::failure(
            format!("query exceeded {}ms deadline", deadline.as_millis()),
            0,
        ),
    };
    result.duration_ms = started.elapsed().as_millis() as u64;
    result
}

/// List user tables with row counts; tables with invalid names are skipped.
pub(crate) async fn get_tables(pool: &SqlitePool) -> Result<Vec<TableInfo>, DbError> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let Ok(valid) = validate_identifier(&name) else {
            debug!(table = %name, "skipping table with invalid name");
            continue;
        };
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quoted_identifier(valid)?))
                .fetch_one(pool)
                .await?;
        tables.push(TableInfo {
            name,
            row_count: count,
        });
    }
    Ok(tables)
}

/// Column metadata for one table.
///
/// # Errors
///
/// Rejects invalid table names before touching the catalog.
pub(crate) async fn get_table_schema(
    pool: &SqlitePool,
    table: &str,
) -> Result<Vec<ColumnInfo>, DbError> {
    let quoted = quoted_identifier(table)?;
    let rows = sqlx::query(&format!("PRAGMA table_info({quoted})"))
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| ColumnInfo {
            name: row.try_get::<String, _>("name").unwrap_or_default(),
            data_type: row.try_get::<String, _>("type").unwrap_or_default(),
            nullable: row.try_get::<i64, _>("notnull").unwrap_or(0) == 0,
            default_value: row.try_get::<Option<String>, _>("dflt_value").ok().flatten(),
        })
        .collect())
}

/// Materialize one column value: blobs become UTF-8 strings, datetimes
/// RFC3339 strings, the rest their natural JSON shape.
fn decode_value(row: &SqliteRow, idx: usize) -> serde_json::Value {
    use serde_json::Value;

    if let Ok(raw) = row.try_get_raw(idx) {
        if raw.is_null() {
            return Value::Null;
        }
    }

    let type_name = row.columns()[idx].type_info().name().to_uppercase();
    match type_name.as_str() {
        "INTEGER" | "INT" | "BIGINT" => row
            .try_get::<i64, _>(idx)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "REAL" | "FLOAT" | "DOUBLE" => row
            .try_get::<f64, _>(idx)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "BOOLEAN" | "BOOL" => row
            .try_get::<bool, _>(idx)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(idx)
            .map(|bytes| Value::from(String::from_utf8_lossy(&bytes).into_owned()))
            .unwrap_or(Value::Null),
        "DATETIME" | "TIMESTAMP" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|ts| Value::from(ts.to_rfc3339()))
            .or_else(|_| row.try_get::<String, _>(idx).map(Value::from))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<String, _>(idx)
            .map(Value::from)
            .or_else(|_| row.try_get::<i64, _>(idx).map(Value::from))
            .or_else(|_| row.try_get::<f64, _>(idx).map(Value::from))
            .unwrap_or(serde_json::Value::Null),
    }
}
