//! # Managed Per-Project Data Plane
//!
//! Provisions and lifecycles one of {relational, key-value, embedded-file}
//! database instances per project: credential minting, safe identifier
//! handling, connection pooling, query execution and introspection.
//!
//! ## Backends
//!
//! - **Relational** (postgres): admin-provisioned database + minted user.
//!   When the admin endpoint is unreachable the instance silently degrades
//!   to an embedded-file database so projects keep working offline.
//! - **Key-value** (redis): a logical namespace, verified by ping.
//! - **Embedded** (sqlite): a file under `base_dir/project_<id>/`.
//!
//! Passwords are minted from a fixed alphabet, encrypted through the
//! secrets manager and never persisted in plaintext. Every identifier used
//! in DDL passes through the [`identifier`] chokepoint.

use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use redis::aio::ConnectionManager;
use sqlx::{PgPool, SqlitePool};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Identifier sanitization chokepoint.
pub mod identifier;

/// Managed-database data types.
pub mod types;

mod embedded;
mod kv;
mod relational;

pub use identifier::{quote_literal, sanitize_database_name, validate_identifier};
pub use kv::RedisConfig;
pub use relational::PostgresConfig;
pub use types::{
    ColumnInfo, DbError, DbKind, DbQuotas, DbState, DbUsage, ManagedDatabase, QueryResult,
    TableInfo,
};

use crate::audit::{SecurityEvent, Severity, SharedAudit};
use crate::env;
use crate::metrics::{DB_QUERY_TOTAL, SharedMetrics};
use crate::secrets::SecretsManager;
use std::sync::Arc;

/// Statements that stream rows back; everything else reports affected rows.
pub(crate) fn is_row_statement(sql: &str) -> bool {
    let first = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase();
    matches!(first.as_str(), "SELECT" | "SHOW" | "DESCRIBE" | "EXPLAIN")
}

/// Mint a password from the fixed alphabet.
fn mint_password() -> String {
    let mut rng = rand::rng();
    (0..env::db::PASSWORD_LENGTH)
        .map(|_| {
            let idx = rng.random_range(0..env::db::PASSWORD_ALPHABET.len());
            env::db::PASSWORD_ALPHABET[idx] as char
        })
        .collect()
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct DbServiceConfig {
    /// Root directory for embedded database files
    pub base_dir: PathBuf,
    pub postgres: PostgresConfig,
    pub redis: RedisConfig,
    /// Deadline applied to every query
    pub query_timeout: Duration,
}

impl Default for DbServiceConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/apex/databases"),
            postgres: PostgresConfig::default(),
            redis: RedisConfig::default(),
            query_timeout: Duration::from_secs(30),
        }
    }
}

/// Provisions and serves managed databases.
pub struct ManagedDbService {
    config: DbServiceConfig,
    secrets: Arc<SecretsManager>,
    records: RwLock<HashMap<i64, ManagedDatabase>>,
    next_id: AtomicI64,
    admin_pool: Mutex<Option<PgPool>>,
    sqlite_pools: Mutex<HashMap<i64, SqlitePool>>,
    pg_pools: Mutex<HashMap<i64, PgPool>>,
    redis_conn: Mutex<Option<ConnectionManager>>,
    metrics: SharedMetrics,
    audit: SharedAudit,
}

impl ManagedDbService {
    /// Prepare the base directory and build the service.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the base directory cannot be created;
    /// this is fatal at startup.
    pub fn new(
        config: DbServiceConfig,
        secrets: Arc<SecretsManager>,
        metrics: SharedMetrics,
        audit: SharedAudit,
    ) -> Result<Self, DbError> {
        std::fs::create_dir_all(&config.base_dir)?;
        set_directory_mode(&config.base_dir)?;

        Ok(Self {
            config,
            secrets,
            records: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            admin_pool: Mutex::new(None),
            sqlite_pools: Mutex::new(HashMap::new()),
            pg_pools: Mutex::new(HashMap::new()),
            redis_conn: Mutex::new(None),
            metrics,
            audit,
        })
    }

    /// Provision a database instance for a project.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidIdentifier`] for unsafe names and backend
    /// errors for failed provisioning. An unreachable relational admin
    /// endpoint is not an error: the instance degrades to embedded.
    pub async fn create_database(
        &self,
        project_id: i64,
        owner_id: u64,
        kind: DbKind,
        name: &str,
        quotas: Option<DbQuotas>,
    ) -> Result<ManagedDatabase, DbError> {
        identifier::validate_identifier(&name.to_lowercase())?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let mut record = ManagedDatabase {
            id,
            project_id,
            owner_id,
            kind,
            name: name.to_string(),
            username: None,
            password: None,
            database_name: None,
            namespace: None,
            file_path: None,
            state: DbState::Provisioning,
            quotas: quotas.unwrap_or_default(),
            usage: DbUsage::default(),
            created_at: now,
            updated_at: now,
        };
        self.records.write().insert(id, record.clone());

        let outcome = match kind {
            DbKind::Embedded => self.provision_embedded(&mut record).await,
            DbKind::Relational => self.provision_relational(&mut record).await,
            DbKind::Kv => self.provision_kv(&mut record).await,
        };

        match outcome {
            Ok(()) => {
                record.state = DbState::Active;
                record.updated_at = Utc::now();
                self.records.write().insert(id, record.clone());
                self.audit.record(
                    SecurityEvent::new("database_provisioned", Severity::Info, owner_id.to_string())
                        .with_detail("database_id", id)
                        .with_detail("project_id", project_id),
                );
                Ok(record)
            }
            Err(e) => {
                record.state = DbState::Error;
                record.updated_at = Utc::now();
                self.records.write().insert(id, record);
                Err(e)
            }
        }
    }

    /// Provision the default relational database for a new project from its
    /// human name.
    pub async fn auto_provision(
        &self,
        project_id: i64,
        owner_id: u64,
        project_name: &str,
    ) -> Result<ManagedDatabase, DbError> {
        let name = identifier::sanitize_database_name(project_name);
        self.create_database(project_id, owner_id, DbKind::Relational, &name, None)
            .await
    }

    /// Tear down an instance: drop server-side objects (relational), remove
    /// the file (embedded) or clear namespaced keys (kv). Missing targets
    /// are not errors.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for unknown ids and backend errors for
    /// failed teardown.
    pub async fn delete_database(&self, id: i64) -> Result<(), DbError> {
        let record = self.transition(id, DbState::Deleting)?;

        match record.kind {
            DbKind::Embedded => {
                if let Some(pool) = self.sqlite_pools.lock().await.remove(&id) {
                    pool.close().await;
                }
                if let Some(path) = &record.file_path {
                    match tokio::fs::remove_file(path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            DbKind::Relational => {
                if let Some(pool) = self.pg_pools.lock().await.remove(&id) {
                    pool.close().await;
                }
                let admin = self.admin_pool().await?;
                if let (Some(database), Some(username)) =
                    (record.database_name.as_deref(), record.username.as_deref())
                {
                    relational::drop_database(&admin, database, username).await?;
                }
            }
            DbKind::Kv => {
                if let Some(namespace) = record.namespace.as_deref() {
                    let conn = self.redis().await?;
                    kv::delete_namespace(&conn, namespace).await?;
                }
            }
        }

        self.records.write().remove(&id);
        self.audit.record(
            SecurityEvent::new(
                "database_deleted",
                Severity::Info,
                record.owner_id.to_string(),
            )
            .with_detail("database_id", id),
        );
        Ok(())
    }

    /// Mint a new password. Relational backends get an `ALTER USER`; for kv
    /// and embedded backends the operation is a metadata-only update.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for unknown ids.
    pub async fn reset_credentials(&self, id: i64) -> Result<ManagedDatabase, DbError> {
        let mut record = self.get(id).ok_or(DbError::NotFound(id))?;

        if record.kind == DbKind::Relational {
            let username = record
                .username
                .clone()
                .ok_or_else(|| DbError::Unsupported("no minted user".to_string()))?;
            let password = mint_password();
            let admin = self.admin_pool().await?;
            relational::alter_password(&admin, &username, &password).await?;
            record.password = Some(self.secrets.encrypt(record.owner_id, password.as_bytes())?);
            // The cached pool still authenticates with the old password.
            if let Some(pool) = self.pg_pools.lock().await.remove(&id) {
                pool.close().await;
            }
        }

        record.updated_at = Utc::now();
        self.records.write().insert(id, record.clone());
        Ok(record)
    }

    /// Execute one statement against an instance. Query-time failures are
    /// embedded in the result; only setup failures return `Err`.
    pub async fn execute_query(&self, id: i64, sql: &str) -> Result<QueryResult, DbError> {
        let record = self.get(id).ok_or(DbError::NotFound(id))?;
        self.metrics.incr_counter(DB_QUERY_TOTAL, 1);

        if record.state == DbState::Suspended {
            return Ok(QueryResult::failure("database is suspended", 0));
        }

        let deadline = self.config.query_timeout;
        let result = match record.kind {
            DbKind::Embedded => {
                let pool = self.sqlite_pool(&record).await?;
                embedded::run_query(&pool, sql, deadline).await
            }
            DbKind::Relational => {
                let pool = self.pg_pool(&record).await?;
                relational::run_query(&pool, sql, deadline).await
            }
            DbKind::Kv => QueryResult::failure(
                "query operations are not supported for key-value databases",
                0,
            ),
        };

        if let Some(stored) = self.records.write().get_mut(&id) {
            stored.usage.queries_total += 1;
            stored.usage.last_query_at = Some(Utc::now());
        }
        Ok(result)
    }

    /// Tables with row counts.
    pub async fn get_tables(&self, id: i64) -> Result<Vec<TableInfo>, DbError> {
        let record = self.get(id).ok_or(DbError::NotFound(id))?;
        match record.kind {
            DbKind::Embedded => {
                let pool = self.sqlite_pool(&record).await?;
                embedded::get_tables(&pool).await
            }
            DbKind::Relational => {
                let pool = self.pg_pool(&record).await?;
                relational::get_tables(&pool).await
            }
            DbKind::Kv => Err(DbError::Unsupported(
                "key-value databases have no tables".to_string(),
            )),
        }
    }

    /// Column metadata for one table.
    pub async fn get_table_schema(&self, id: i64, table: &str) -> Result<Vec<ColumnInfo>, DbError> {
        let record = self.get(id).ok_or(DbError::NotFound(id))?;
        match record.kind {
            DbKind::Embedded => {
                let pool = self.sqlite_pool(&record).await?;
                embedded::get_table_schema(&pool, table).await
            }
            DbKind::Relational => {
                let pool = self.pg_pool(&record).await?;
                relational::get_table_schema(&pool, table).await
            }
            DbKind::Kv => Err(DbError::Unsupported(
                "key-value databases have no schema".to_string(),
            )),
        }
    }

    /// Copy of one record.
    pub fn get(&self, id: i64) -> Option<ManagedDatabase> {
        self.records.read().get(&id).cloned()
    }

    /// Copies of every record belonging to a project.
    pub fn list_project(&self, project_id: i64) -> Vec<ManagedDatabase> {
        let mut records: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Connection URL with the decrypted password substituted in. The URL
    /// is handed to the caller and never logged.
    pub fn connection_url(&self, id: i64) -> Result<String, DbError> {
        let record = self.get(id).ok_or(DbError::NotFound(id))?;
        match record.kind {
            DbKind::Relational => {
                let (username, payload, database) = match (
                    record.username.as_deref(),
                    record.password.as_ref(),
                    record.database_name.as_deref(),
                ) {
                    (Some(u), Some(p), Some(d)) => (u, p, d),
                    _ => return Err(DbError::Unsupported("incomplete relational record".to_string())),
                };
                let password = self
                    .secrets
                    .decrypt(record.owner_id, &payload.ciphertext, &payload.salt)?;
                Ok(self.config.postgres.url(
                    username,
                    &String::from_utf8_lossy(&password),
                    database,
                ))
            }
            DbKind::Kv => {
                let namespace = record
                    .namespace
                    .as_deref()
                    .ok_or_else(|| DbError::Unsupported("no namespace recorded".to_string()))?;
                Ok(format!("{}#{namespace}", self.config.redis.url()))
            }
            DbKind::Embedded => {
                let path = record
                    .file_path
                    .as_ref()
                    .ok_or_else(|| DbError::Unsupported("no file path recorded".to_string()))?;
                Ok(format!("sqlite://{}", path.display()))
            }
        }
    }

    /// Bytes currently stored by an instance. Embedded databases report the
    /// file size, relational ones ask the catalog; key-value namespaces have
    /// no server-side size accounting.
    pub async fn database_size_bytes(&self, id: i64) -> Result<u64, DbError> {
        let record = self.get(id).ok_or(DbError::NotFound(id))?;
        match record.kind {
            DbKind::Embedded => {
                let path = record
                    .file_path
                    .as_ref()
                    .ok_or_else(|| DbError::Unsupported("no file path recorded".to_string()))?;
                match tokio::fs::metadata(path).await {
                    Ok(meta) => Ok(meta.len()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
                    Err(e) => Err(e.into()),
                }
            }
            DbKind::Relational => {
                let database = record
                    .database_name
                    .as_deref()
                    .ok_or_else(|| DbError::Unsupported("no database recorded".to_string()))?;
                let admin = self.admin_pool().await?;
                let size: i64 = sqlx::query_scalar("SELECT pg_database_size($1)")
                    .bind(database)
                    .fetch_one(&admin)
                    .await?;
                Ok(size.max(0) as u64)
            }
            DbKind::Kv => Err(DbError::Unsupported(
                "size reporting not available for key-value namespaces".to_string(),
            )),
        }
    }

    /// Whether an instance currently exceeds its storage quota. Instances
    /// without size accounting never report over-quota.
    pub async fn over_storage_quota(&self, id: i64) -> Result<bool, DbError> {
        let record = self.get(id).ok_or(DbError::NotFound(id))?;
        let cap_bytes = u64::from(record.quotas.storage_mb) * 1024 * 1024;
        match self.database_size_bytes(id).await {
            Ok(size) => Ok(size > cap_bytes),
            Err(DbError::Unsupported(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Pause an active instance.
    pub fn suspend(&self, id: i64) -> Result<ManagedDatabase, DbError> {
        self.transition(id, DbState::Suspended)
    }

    /// Resume a suspended instance.
    pub fn resume(&self, id: i64) -> Result<ManagedDatabase, DbError> {
        self.transition(id, DbState::Active)
    }

    /// Close every pooled connection.
    pub async fn shutdown(&self) {
        for (_, pool) in self.sqlite_pools.lock().await.drain() {
            pool.close().await;
        }
        for (_, pool) in self.pg_pools.lock().await.drain() {
            pool.close().await;
        }
        if let Some(pool) = self.admin_pool.lock().await.take() {
            pool.close().await;
        }
        self.redis_conn.lock().await.take();
    }

    fn transition(&self, id: i64, to: DbState) -> Result<ManagedDatabase, DbError> {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(DbError::NotFound(id))?;
        if !record.state.can_transition(to) {
            return Err(DbError::InvalidTransition {
                from: record.state,
                to,
            });
        }
        record.state = to;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn provision_embedded(&self, record: &mut ManagedDatabase) -> Result<(), DbError> {
        let dir = env::project_dir(&self.config.base_dir, record.project_id);
        tokio::fs::create_dir_all(&dir).await?;
        set_directory_mode(&dir)?;

        let path = env::embedded_db_path(&self.config.base_dir, record.project_id, &record.name);
        let pool = embedded::open_pool(&path).await?;
        self.sqlite_pools.lock().await.insert(record.id, pool);

        record.file_path = Some(path);
        Ok(())
    }

    async fn provision_relational(&self, record: &mut ManagedDatabase) -> Result<(), DbError> {
        let admin = match self.admin_pool().await {
            Ok(pool) => pool,
            Err(e) => {
                warn!(
                    database_id = record.id,
                    error = %e,
                    "relational admin endpoint unreachable, degrading to embedded"
                );
                record.kind = DbKind::Embedded;
                return self.provision_embedded(record).await;
            }
        };

        let username = env::managed_username(record.project_id);
        let database = env::managed_database_name(record.project_id, &record.name);
        let password = mint_password();

        relational::provision(&admin, &database, &username, &password).await?;

        record.password = Some(self.secrets.encrypt(record.owner_id, password.as_bytes())?);
        record.username = Some(username);
        record.database_name = Some(database);
        Ok(())
    }

    async fn provision_kv(&self, record: &mut ManagedDatabase) -> Result<(), DbError> {
        let conn = self.redis().await?;
        kv::ping(&conn).await?;
        record.namespace = Some(env::kv_namespace(record.project_id, &record.name));
        info!(namespace = ?record.namespace, "key-value namespace recorded");
        Ok(())
    }

    async fn admin_pool(&self) -> Result<PgPool, DbError> {
        let mut guard = self.admin_pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        let pool = relational::connect_admin(&self.config.postgres).await?;
        *guard = Some(pool.clone());
        Ok(pool)
    }

    async fn redis(&self) -> Result<ConnectionManager, DbError> {
        let mut guard = self.redis_conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = kv::connect(&self.config.redis).await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn sqlite_pool(&self, record: &ManagedDatabase) -> Result<SqlitePool, DbError> {
        let mut pools = self.sqlite_pools.lock().await;
        if let Some(pool) = pools.get(&record.id) {
            return Ok(pool.clone());
        }
        let path = record
            .file_path
            .as_ref()
            .ok_or_else(|| DbError::Unsupported("no file path recorded".to_string()))?;
        let pool = embedded::open_pool(path).await?;
        pools.insert(record.id, pool.clone());
        Ok(pool)
    }

    async fn pg_pool(&self, record: &ManagedDatabase) -> Result<PgPool, DbError> {
        let mut pools = self.pg_pools.lock().await;
        if let Some(pool) = pools.get(&record.id) {
            return Ok(pool.clone());
        }
        let (username, payload, database) = match (
            record.username.as_deref(),
            record.password.as_ref(),
            record.database_name.as_deref(),
        ) {
            (Some(u), Some(p), Some(d)) => (u, p, d),
            _ => return Err(DbError::Unsupported("incomplete relational record".to_string())),
        };
        let password = self
            .secrets
            .decrypt(record.owner_id, &payload.ciphertext, &payload.salt)?;
        let pool = relational::connect_database(
            &self.config.postgres,
            username,
            &String::from_utf8_lossy(&password),
            database,
            record.quotas.max_connections,
        )
        .await?;
        pools.insert(record.id, pool.clone());
        Ok(pool)
    }
}

#[cfg(unix)]
fn set_directory_mode(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_directory_mode(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{SecretsConfig, SecretsManager};
    use crate::{audit, metrics};

    fn service_with(base_dir: PathBuf, postgres: PostgresConfig) -> ManagedDbService {
        let secrets = Arc::new(
            SecretsManager::new(
                SecretsConfig {
                    master_key: SecretsManager::generate_master_key(),
                    iterations: 100_000,
                },
                audit::noop(),
            )
            .unwrap(),
        );
        ManagedDbService::new(
            DbServiceConfig {
                base_dir,
                postgres,
                ..Default::default()
            },
            secrets,
            metrics::noop(),
            audit::noop(),
        )
        .unwrap()
    }

    fn unreachable_postgres() -> PostgresConfig {
        PostgresConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    #[test]
    fn test_is_row_statement() {
        assert!(is_row_statement("SELECT 1"));
        assert!(is_row_statement("  explain select 1"));
        assert!(is_row_statement("SHOW tables"));
        assert!(!is_row_statement("INSERT INTO t VALUES (1)"));
        assert!(!is_row_statement("CREATE TABLE t (id int)"));
    }

    #[test]
    fn test_mint_password_shape() {
        let password = mint_password();
        assert_eq!(password.len(), env::db::PASSWORD_LENGTH);
        assert!(password.bytes().all(|b| env::db::PASSWORD_ALPHABET.contains(&b)));
        assert_ne!(mint_password(), mint_password());
    }

    #[tokio::test]
    async fn test_embedded_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(dir.path().to_path_buf(), unreachable_postgres());

        let db = service
            .create_database(7, 1, DbKind::Embedded, "notes", None)
            .await
            .unwrap();
        assert_eq!(db.state, DbState::Active);
        let path = db.file_path.clone().unwrap();
        assert!(path.ends_with("project_7/notes.db"));
        assert!(path.exists());

        let create = service
            .execute_query(db.id, "CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .await
            .unwrap();
        assert!(create.is_ok(), "{}", create.error);

        let url = service.connection_url(db.id).unwrap();
        assert!(url.starts_with("sqlite://"));

        service.delete_database(db.id).await.unwrap();
        assert!(!path.exists());
        assert!(service.get(db.id).is_none());
    }

    #[tokio::test]
    async fn test_relational_degrades_to_embedded() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(dir.path().to_path_buf(), unreachable_postgres());

        let db = service
            .create_database(42, 1, DbKind::Relational, "main", None)
            .await
            .unwrap();
        assert_eq!(db.kind, DbKind::Embedded);
        assert_eq!(db.state, DbState::Active);
        assert!(db.file_path.unwrap().ends_with("project_42/main.db"));
        assert!(db.username.is_none());
    }

    #[tokio::test]
    async fn test_unsafe_name_rejected_before_any_work() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(dir.path().to_path_buf(), unreachable_postgres());

        let err = service
            .create_database(1, 1, DbKind::Embedded, "bad name; --", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidIdentifier(_)));
        assert!(service.list_project(1).is_empty());
    }

    #[tokio::test]
    async fn test_suspend_blocks_queries() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(dir.path().to_path_buf(), unreachable_postgres());

        let db = service
            .create_database(3, 1, DbKind::Embedded, "store", None)
            .await
            .unwrap();

        service.suspend(db.id).unwrap();
        let result = service.execute_query(db.id, "SELECT 1").await.unwrap();
        assert!(result.error.contains("suspended"));

        service.resume(db.id).unwrap();
        let result = service.execute_query(db.id, "SELECT 1").await.unwrap();
        assert!(result.is_ok(), "{}", result.error);

        // Resuming an active database is an invalid transition.
        assert!(matches!(
            service.resume(db.id),
            Err(DbError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_credentials_metadata_only_for_embedded() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(dir.path().to_path_buf(), unreachable_postgres());

        let db = service
            .create_database(3, 1, DbKind::Embedded, "store", None)
            .await
            .unwrap();
        let before = db.updated_at;
        let after = service.reset_credentials(db.id).await.unwrap();
        assert!(after.updated_at >= before);
        assert!(after.password.is_none());
    }

    #[tokio::test]
    async fn test_storage_size_and_quota() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(dir.path().to_path_buf(), unreachable_postgres());

        let db = service
            .create_database(4, 1, DbKind::Embedded, "blob", None)
            .await
            .unwrap();
        service
            .execute_query(db.id, "CREATE TABLE filler (payload TEXT)")
            .await
            .unwrap();

        let size = service.database_size_bytes(db.id).await.unwrap();
        assert!(size > 0);
        // Default quota is 1 GiB; a fresh sqlite file is nowhere near it.
        assert!(!service.over_storage_quota(db.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_auto_provision_sanitizes_name() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(dir.path().to_path_buf(), unreachable_postgres());

        let db = service.auto_provision(9, 2, "My Cool App!").await.unwrap();
        assert_eq!(db.name, "mycoolapp");
        // Admin endpoint is unreachable in tests, so the instance lands on
        // the embedded backend.
        assert_eq!(db.kind, DbKind::Embedded);
    }
}
