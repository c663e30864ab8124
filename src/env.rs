//! Environment constants and path utilities for the Apex execution core.
//!
//! This module centralizes the hardcoded names, prefixes and on-disk layouts
//! used throughout the crate, making them easier to maintain and modify.

/// Main application directory name (hidden directory like .git, .vscode)
pub const APEX_DIR_NAME: &str = ".apex";

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Prefix for per-execution scratch directories
pub const SCRATCH_DIR_PREFIX: &str = "apex-exec-";

/// Prefix for sandbox containers
pub const CONTAINER_NAME_PREFIX: &str = "apex-sandbox";

/// Sandbox-related constants
pub mod sandbox {
    /// Marker appended when captured output exceeds its cap
    pub const OUTPUT_TRUNCATED_MARKER: &str = "\n...[output truncated]";

    /// Stdin payloads below this size are written in full before capture
    /// begins; larger payloads are streamed while output is drained.
    pub const STDIN_STREAM_THRESHOLD: usize = 64 * 1024;

    /// Mount point for the scratch directory inside sandbox containers
    pub const CONTAINER_WORKSPACE: &str = "/workspace";
}

/// Managed-database naming constants
pub mod db {
    /// Prefix for minted relational usernames
    pub const USERNAME_PREFIX: &str = "apex_p";

    /// Prefix for relational database names
    pub const DATABASE_PREFIX: &str = "apex_project_";

    /// Alphabet minted passwords are drawn from
    pub const PASSWORD_ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    /// Length of minted passwords
    pub const PASSWORD_LENGTH: usize = 24;
}

use std::path::{Path, PathBuf};

/// Build the per-project directory for embedded database files
pub fn project_dir(base_dir: &Path, project_id: i64) -> PathBuf {
    base_dir.join(format!("project_{project_id}"))
}

/// Build the on-disk path of an embedded database file
pub fn embedded_db_path(base_dir: &Path, project_id: i64, name: &str) -> PathBuf {
    project_dir(base_dir, project_id).join(format!("{name}.db"))
}

/// Build the minted username for a project's relational database
pub fn managed_username(project_id: i64) -> String {
    format!("{}{project_id}", db::USERNAME_PREFIX)
}

/// Build the server-side name of a project's relational database
pub fn managed_database_name(project_id: i64, name: &str) -> String {
    format!("{}{project_id}_{}", db::DATABASE_PREFIX, name.to_lowercase())
}

/// Build the logical namespace of a project's key-value database
pub fn kv_namespace(project_id: i64, name: &str) -> String {
    format!("apex:project_{project_id}:{name}")
}

/// Build config file path in the user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    home_dir.join(APEX_DIR_NAME).join(CONFIG_FILE_NAME)
}

/// Build local config file path in the current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(APEX_DIR_NAME).join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_embedded_layout() {
        let base = Path::new("/var/lib/apex/databases");

        assert_eq!(
            project_dir(base, 42),
            Path::new("/var/lib/apex/databases/project_42")
        );
        assert_eq!(
            embedded_db_path(base, 42, "main"),
            Path::new("/var/lib/apex/databases/project_42/main.db")
        );
    }

    #[test]
    fn test_managed_names() {
        assert_eq!(managed_username(7), "apex_p7");
        assert_eq!(managed_database_name(7, "Main"), "apex_project_7_main");
        assert_eq!(kv_namespace(7, "sessions"), "apex:project_7:sessions");
    }

    #[test]
    fn test_config_paths() {
        assert_eq!(
            user_config_file_path(Path::new("/home/user")),
            Path::new("/home/user/.apex/config.toml")
        );
        assert_eq!(
            local_config_file_path(Path::new("/srv/project")),
            Path::new("/srv/project/.apex/config.toml")
        );
    }
}
