//! Relational database backend (postgres).
//!
//! Provisioning runs as the admin role: create the project database, mint a
//! user, grant privileges. "Already exists" failures are treated as
//! success so provisioning is idempotent. All identifiers pass through the
//! sanitization chokepoint; the password literal goes through
//! `quote_literal` because postgres has no parameterized `CREATE USER`.

use super::identifier::{quote_literal, quoted_identifier, validate_identifier};
use super::types::{ColumnInfo, DbError, QueryResult, TableInfo};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Row, TypeInfo, ValueRef};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Admin endpoint settings.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub admin_user: String,
    pub admin_password: String,
    /// `disable` by default; managed databases live on a private network
    pub sslmode: String,
    pub connect_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            admin_user: "postgres".to_string(),
            admin_password: String::new(),
            sslmode: "disable".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl PostgresConfig {
    /// Connection URL for a database on this host.
    pub fn url(&self, user: &str, password: &str, database: &str) -> String {
        format!(
            "postgresql://{user}:{password}@{}:{}/{database}?sslmode={}",
            self.host, self.port, self.sslmode
        )
    }
}

/// Connect to the host DBMS as admin.
///
/// # Errors
///
/// Returns driver errors; the caller degrades to the embedded backend when
/// this fails.
pub(crate) async fn connect_admin(config: &PostgresConfig) -> Result<PgPool, DbError> {
    let url = config.url(&config.admin_user, &config.admin_password, "postgres");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(config.connect_timeout)
        .connect(&url)
        .await?;
    debug!(host = %config.host, port = config.port, "connected to relational admin endpoint");
    Ok(pool)
}

/// Open a pool for one managed database as its minted user.
pub(crate) async fn connect_database(
    config: &PostgresConfig,
    username: &str,
    password: &str,
    database: &str,
    max_connections: u32,
) -> Result<PgPool, DbError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(config.connect_timeout)
        .connect(&config.url(username, password, database))
        .await?;
    Ok(pool)
}

/// Create database, user and grants. Idempotent: "already exists" errors
/// are swallowed.
///
/// # Errors
///
/// Returns driver errors other than "already exists".
pub(crate) async fn provision(
    admin: &PgPool,
    database: &str,
    username: &str,
    password: &str,
) -> Result<(), DbError> {
    let database = quoted_identifier(validate_identifier(database)?)?;
    let username_quoted = quoted_identifier(validate_identifier(username)?)?;

    let create_db = format!("CREATE DATABASE {database}");
    tolerate_existing(sqlx::query(&create_db).execute(admin).await)?;

    let create_user = format!(
        "CREATE USER {username_quoted} WITH PASSWORD {}",
        quote_literal(password)
    );
    tolerate_existing(sqlx::query(&create_user).execute(admin).await)?;

    let grant = format!("GRANT ALL PRIVILEGES ON DATABASE {database} TO {username_quoted}");
    tolerate_existing(sqlx::query(&grant).execute(admin).await)?;

    info!(%database, user = %username, "relational database provisioned");
    Ok(())
}

/// Drop the database and its user. Missing targets are not errors.
pub(crate) async fn drop_database(
    admin: &PgPool,
    database: &str,
    username: &str,
) -> Result<(), DbError> {
    let database = quoted_identifier(validate_identifier(database)?)?;
    let username = quoted_identifier(validate_identifier(username)?)?;

    sqlx::query(&format!("DROP DATABASE IF EXISTS {database}"))
        .execute(admin)
        .await?;
    sqlx::query(&format!("DROP USER IF EXISTS {username}"))
        .execute(admin)
        .await?;
    Ok(())
}

/// Rotate a minted user's password.
pub(crate) async fn alter_password(
    admin: &PgPool,
    username: &str,
    new_password: &str,
) -> Result<(), DbError> {
    let username = quoted_identifier(validate_identifier(username)?)?;
    let alter = format!(
        "ALTER USER {username} WITH PASSWORD {}",
        quote_literal(new_password)
    );
    sqlx::query(&alter).execute(admin).await?;
    Ok(())
}

fn tolerate_existing<T>(outcome: Result<T, sqlx::Error>) -> Result<(), DbError> {
    match outcome {
        Ok(_) => Ok(()),
        Err(e) if e.to_string().contains("already exists") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Execute one statement with a deadline; same contract as the embedded
/// backend.
pub(crate) async fn run_query(pool: &PgPool, sql: &str, deadline: Duration) -> QueryResult {
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

/// List public tables with row counts; invalid names are skipped.
pub(crate) async fn get_tables(pool: &PgPool) -> Result<Vec<TableInfo>, DbError> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = 'public' AND table_type = 'BASE TABLE' ORDER BY table_name",
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

/// Column metadata for one table; the name is validated and bound as a
/// parameter.
pub(crate) async fn get_table_schema(
    pool: &PgPool,
    table: &str,
) -> Result<Vec<ColumnInfo>, DbError> {
    let table = validate_identifier(table)?;
    let rows = sqlx::query(
        "SELECT column_name, data_type, is_nullable, column_default \
         FROM information_schema.columns WHERE table_name = $1 ORDER BY ordinal_position",
    )
    .bind(table)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ColumnInfo {
            name: row.try_get::<String, _>(0).unwrap_or_default(),
            data_type: row.try_get::<String, _>(1).unwrap_or_default(),
            nullable: row.try_get::<String, _>(2).unwrap_or_default() == "YES",
            default_value: row.try_get::<Option<String>, _>(3).ok().flatten(),
        })
        .collect())
}

/// Materialize one column value: bytea becomes a UTF-8 string, timestamps
/// RFC3339 strings, the rest their natural JSON shape.
fn decode_value(row: &PgRow, idx: usize) -> serde_json::Value {
    use serde_json::Value;

    if let Ok(raw) = row.try_get_raw(idx) {
        if raw.is_null() {
            return Value::Null;
        }
    }

    let type_name = row.columns()[idx].type_info().name().to_uppercase();
    match type_name.as_str() {
        "BOOL" => row
            .try_get::<bool, _>(idx)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "INT2" => row
            .try_get::<i16, _>(idx)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "INT4" => row
            .try_get::<i32, _>(idx)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<i64, _>(idx)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "FLOAT4" => row
            .try_get::<f32, _>(idx)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "FLOAT8" => row
            .try_get::<f64, _>(idx)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|ts| Value::from(ts.to_rfc3339()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(|ts| Value::from(ts.and_utc().to_rfc3339()))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map(|d| Value::from(d.to_string()))
            .unwrap_or(Value::Null),
        "BYTEA" => row
            .try_get::<Vec<u8>, _>(idx)
            .map(|bytes| Value::from(String::from_utf8_lossy(&bytes).into_owned()))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<serde_json::Value, _>(idx)
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<uuid::Uuid, _>(idx)
            .map(|u| Value::from(u.to_string()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<String, _>(idx)
            .map(Value::from)
            .or_else(|_| row.try_get::<i64, _>(idx).map(Value::from))
            .or_else(|_| row.try_get::<f64, _>(idx).map(Value::from))
            .unwrap_or(Value::Null),
    }
}
