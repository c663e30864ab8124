//! Managed-database data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::secrets::{EncryptedSecret, SecretsError};

/// Backend kind of a managed database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    /// Server-hosted relational database (postgres)
    Relational,
    /// Redis namespace
    Kv,
    /// Sqlite file under the project directory
    Embedded,
}

/// Lifecycle state. Transitions are monotonic except suspended↔active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbState {
    Provisioning,
    Active,
    Suspended,
    Error,
    Deleting,
}

impl DbState {
    /// Whether a transition to `next` is allowed.
    pub fn can_transition(self, next: DbState) -> bool {
        use DbState::*;
        match (self, next) {
            (Provisioning, Active) | (Provisioning, Error) => true,
            (Active, Suspended) | (Suspended, Active) => true,
            (Provisioning, Deleting) => true,
            (Active, Deleting) | (Suspended, Deleting) | (Error, Deleting) => true,
            (Active, Error) | (Suspended, Error) => true,
            _ => false,
        }
    }
}

/// Quota caps applied at provisioning time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DbQuotas {
    pub storage_mb: u32,
    pub max_connections: u32,
}

impl Default for DbQuotas {
    fn default() -> Self {
        Self {
            storage_mb: 1024,
            max_connections: 10,
        }
    }
}

/// Usage counters maintained by the service.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DbUsage {
    pub queries_total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_query_at: Option<DateTime<Utc>>,
}

/// One provisioned database instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedDatabase {
    pub id: i64,
    pub project_id: i64,
    pub owner_id: u64,
    pub kind: DbKind,
    /// Human-chosen name
    pub name: String,
    /// Minted username (relational only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Encrypted password handle; plaintext never persists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<EncryptedSecret>,
    /// Server-side database name (relational only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    /// Logical namespace (kv only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// On-disk path (embedded only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    pub state: DbState,
    pub quotas: DbQuotas,
    pub usage: DbUsage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of one query. Query-time failures are embedded in `error`; the
/// call itself only fails for setup problems.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    /// For non-SELECT statements
    pub affected_rows: u64,
    pub duration_ms: u64,
    /// Empty on success
    pub error: String,
}

impl QueryResult {
    pub fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            error: error.into(),
            duration_ms,
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

/// One table surfaced by introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub row_count: i64,
}

/// One column surfaced by schema introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// Errors from the managed-database layer. Per the propagation policy,
/// these cover setup and teardown; query-time failures ride inside
/// [`QueryResult::error`].
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Identifier failed validation before any SQL was assembled
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("managed database {0} not found")]
    NotFound(i64),

    /// Lifecycle transition not allowed
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: DbState, to: DbState },

    /// Operation does not apply to this database kind
    #[error("operation not supported for this database kind: {0}")]
    Unsupported(String),

    #[error("driver error: {0}")]
    Driver(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("secrets error: {0}")]
    Secrets(#[from] SecretsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions_monotonic_except_suspend() {
        use DbState::*;
        assert!(Provisioning.can_transition(Active));
        assert!(Active.can_transition(Suspended));
        assert!(Suspended.can_transition(Active));
        assert!(Active.can_transition(Deleting));

        assert!(!Active.can_transition(Provisioning));
        assert!(!Deleting.can_transition(Active));
        assert!(!Error.can_transition(Active));
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(serde_json::to_string(&DbKind::Kv).unwrap(), "\"kv\"");
        assert_eq!(
            serde_json::to_string(&DbKind::Relational).unwrap(),
            "\"relational\""
        );
        assert_eq!(
            serde_json::to_string(&DbKind::Embedded).unwrap(),
            "\"embedded\""
        );
    }
}
