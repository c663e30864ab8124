//! Configuration discovery and loading.
//!
//! The discovery hierarchy:
//! 1. Current directory: ./apex.toml or ./.apex/config.toml
//! 2. User config: ~/.apex/config.toml
//! 3. System config: /etc/apex/config.toml
//! 4. Built-in defaults
//!
//! Environment variables override file values for the settings an operator
//! most often injects (master key, endpoints).

use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::alwayson::AlwaysOnConfig;
use crate::cache::CacheConfig;
use crate::db::{DbServiceConfig, PostgresConfig, RedisConfig};
use crate::env;
use crate::secrets::SecretsConfig;
use crate::sandbox::{ProcessBackendConfig, SandboxPolicy, SandboxServiceConfig};

/// Errors from configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Top-level configuration file shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sandbox: SandboxSection,
    pub db: DbSection,
    pub cache: CacheSection,
    pub secrets: SecretsSection,
    pub always_on: AlwaysOnSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub prefer_container: bool,
    pub require_container: bool,
    /// Wall clock cap per execution
    pub default_timeout_ms: u64,
    /// Per-execution memory cap
    pub memory_limit_bytes: u64,
    /// Global in-flight cap
    pub max_concurrent: usize,
    /// Delay between soft termination and hard kill
    pub grace_period_ms: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            prefer_container: true,
            require_container: false,
            default_timeout_ms: 30_000,
            memory_limit_bytes: 512 * 1024 * 1024,
            max_concurrent: 32,
            grace_period_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbSection {
    /// Embedded-file root
    pub base_dir: PathBuf,
    pub postgres: PostgresSection,
    pub redis: RedisSection,
    pub query_timeout_ms: u64,
}

impl Default for DbSection {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/apex/databases"),
            postgres: PostgresSection::default(),
            redis: RedisSection::default(),
            query_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresSection {
    pub host: String,
    pub port: u16,
    pub admin_user: String,
    pub admin_password: String,
    pub sslmode: String,
    pub connect_timeout_ms: u64,
}

impl Default for PostgresSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            admin_user: "postgres".to_string(),
            admin_password: String::new(),
            sslmode: "disable".to_string(),
            connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    pub host: String,
    pub port: u16,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Fallback TTL when the caller passes zero
    pub default_ttl_secs: u64,
    /// In-memory capacity bound
    pub max_memory_items: usize,
    /// Remote tier URL; unset disables the remote tier
    pub redis_url: Option<String>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            max_memory_items: 10_000,
            redis_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsSection {
    /// Base secret key, base64-encoded
    pub master_key: String,
    /// PBKDF2 rounds, ≥100,000
    pub iterations: u32,
}

impl Default for SecretsSection {
    fn default() -> Self {
        Self {
            master_key: String::new(),
            iterations: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlwaysOnSection {
    /// Reconcile tick
    pub interval_secs: u64,
    pub default_keepalive_secs: u32,
    /// Semaphore width
    pub max_concurrent: usize,
}

impl Default for AlwaysOnSection {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            default_keepalive_secs: 300,
            max_concurrent: 4,
        }
    }
}

impl AppConfig {
    /// Load from a specific TOML file.
    ///
    /// # Errors
    ///
    /// Returns read and parse errors with the offending path attached.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: AppConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Discover and load configuration using the hierarchy, falling back to
    /// defaults when no file exists.
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(path) = Self::find_config_file() {
            info!(path = %path.display(), "loading configuration");
            return Self::from_toml_file(path);
        }
        info!("no configuration file found, using defaults");
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// First existing candidate in the discovery hierarchy.
    pub fn find_config_file() -> Option<PathBuf> {
        for candidate in Self::config_candidates() {
            debug!(path = %candidate.display(), "checking for config file");
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    fn config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(current_dir.join("apex.toml"));
            candidates.push(env::local_config_file_path(&current_dir));
        }

        if let Some(home) = std_env::var_os("HOME").map(PathBuf::from) {
            candidates.push(env::user_config_file_path(&home));
        }

        #[cfg(unix)]
        candidates.push(PathBuf::from("/etc/apex/config.toml"));

        candidates
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std_env::var("APEX_MASTER_KEY") {
            self.secrets.master_key = key;
        }
        if let Ok(dir) = std_env::var("APEX_DB_BASE_DIR") {
            self.db.base_dir = PathBuf::from(dir);
        }
        if let Ok(host) = std_env::var("APEX_POSTGRES_HOST") {
            self.db.postgres.host = host;
        }
        if let Ok(port) = std_env::var("APEX_POSTGRES_PORT") {
            if let Ok(port) = port.parse() {
                self.db.postgres.port = port;
            }
        }
        if let Ok(password) = std_env::var("APEX_POSTGRES_ADMIN_PASSWORD") {
            self.db.postgres.admin_password = password;
        }
        if let Ok(host) = std_env::var("APEX_REDIS_HOST") {
            self.db.redis.host = host;
        }
        if let Ok(url) = std_env::var("APEX_CACHE_REDIS_URL") {
            self.cache.redis_url = Some(url);
        }
    }

    /// Lower into the sandbox façade configuration.
    pub fn sandbox_config(&self) -> SandboxServiceConfig {
        let process = ProcessBackendConfig {
            default_timeout: Duration::from_millis(self.sandbox.default_timeout_ms),
            memory_limit_bytes: self.sandbox.memory_limit_bytes,
            grace_period: Duration::from_millis(self.sandbox.grace_period_ms),
            ..Default::default()
        };

        SandboxServiceConfig {
            policy: SandboxPolicy {
                prefer_container: self.sandbox.prefer_container,
                require_container: self.sandbox.require_container,
            },
            max_concurrent: self.sandbox.max_concurrent,
            process,
            #[cfg(feature = "containers")]
            container: crate::sandbox::ContainerBackendConfig {
                default_timeout: Duration::from_millis(self.sandbox.default_timeout_ms),
                memory_limit_bytes: self.sandbox.memory_limit_bytes,
                ..Default::default()
            },
        }
    }

    /// Lower into the managed-database configuration.
    pub fn db_config(&self) -> DbServiceConfig {
        DbServiceConfig {
            base_dir: self.db.base_dir.clone(),
            postgres: PostgresConfig {
                host: self.db.postgres.host.clone(),
                port: self.db.postgres.port,
                admin_user: self.db.postgres.admin_user.clone(),
                admin_password: self.db.postgres.admin_password.clone(),
                sslmode: self.db.postgres.sslmode.clone(),
                connect_timeout: Duration::from_millis(self.db.postgres.connect_timeout_ms),
            },
            redis: RedisConfig {
                host: self.db.redis.host.clone(),
                port: self.db.redis.port,
                ..Default::default()
            },
            query_timeout: Duration::from_millis(self.db.query_timeout_ms),
        }
    }

    /// Lower into the cache configuration.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_secs(self.cache.default_ttl_secs),
            max_memory_items: self.cache.max_memory_items,
            ..Default::default()
        }
    }

    /// Lower into the secrets configuration.
    pub fn secrets_config(&self) -> SecretsConfig {
        SecretsConfig {
            master_key: self.secrets.master_key.clone(),
            iterations: self.secrets.iterations,
        }
    }

    /// Lower into the always-on controller configuration.
    pub fn always_on_config(&self) -> AlwaysOnConfig {
        AlwaysOnConfig {
            reconcile_interval: Duration::from_secs(self.always_on.interval_secs),
            default_keepalive_secs: self.always_on.default_keepalive_secs,
            max_concurrent: self.always_on.max_concurrent,
            ..Default::default()
        }
    }
}
