//! Key-value database backend (redis namespaces).
//!
//! A "database" here is a logical namespace `apex:project_<id>:<name>`; no
//! schema is created. Provisioning verifies the server answers a ping;
//! deletion removes every namespaced key.

use super::types::DbError;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::debug;

/// Keys deleted per DEL batch during namespace teardown.
const DELETE_BATCH: usize = 512;

/// Redis endpoint settings.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/0", self.host, self.port)
    }
}

/// Connect with an auto-reconnecting manager.
///
/// # Errors
///
/// Returns redis errors when the server is unreachable.
pub(crate) async fn connect(config: &RedisConfig) -> Result<ConnectionManager, DbError> {
    let client = redis::Client::open(config.url().as_str())?;
    let manager = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
        .await
        .map_err(|_| {
            redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connect timed out",
            ))
        })??;
    debug!(host = %config.host, port = config.port, "connected to key-value endpoint");
    Ok(manager)
}

/// Verify the server answers.
pub(crate) async fn ping(conn: &ConnectionManager) -> Result<(), DbError> {
    let mut conn = conn.clone();
    redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
    Ok(())
}

/// Delete every key under `namespace`. Returns the number of keys removed;
/// an empty namespace is not an error.
pub(crate) async fn delete_namespace(
    conn: &ConnectionManager,
    namespace: &str,
) -> Result<u64, DbError> {
    let mut conn = conn.clone();
    let keys: Vec<String> = conn.keys(format!("{namespace}:*")).await?;
    let mut removed = 0u64;
    for batch in keys.chunks(DELETE_BATCH) {
        removed += conn.del::<_, u64>(batch.to_vec()).await?;
    }
    debug!(namespace, removed, "key-value namespace cleared");
    Ok(removed)
}
