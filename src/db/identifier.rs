//! Identifier sanitization chokepoint.
//!
//! Every SQL identifier and string literal the provisioner assembles goes
//! through this module; no other path may concatenate user-provided names
//! into SQL. Identifiers must match `^[A-Za-z_][A-Za-z0-9_]*$` and are
//! wrapped in double quotes with internal quotes doubled; string literals
//! have single quotes and backslashes doubled.

use super::types::DbError;
use regex::Regex;
use std::sync::OnceLock;

/// Maximum length of a sanitized project database name.
const MAX_NAME_LEN: usize = 32;

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

/// Validate an identifier before it goes anywhere near SQL.
///
/// # Errors
///
/// Returns [`DbError::InvalidIdentifier`] for anything outside
/// `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(name: &str) -> Result<&str, DbError> {
    if identifier_regex().is_match(name) {
        Ok(name)
    } else {
        Err(DbError::InvalidIdentifier(name.to_string()))
    }
}

/// Quote a previously validated identifier for interpolation into DDL.
/// Internal double quotes are doubled even though validation excludes them.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Validate and quote in one step.
///
/// # Errors
///
/// Same as [`validate_identifier`].
pub fn quoted_identifier(name: &str) -> Result<String, DbError> {
    validate_identifier(name).map(quote_identifier)
}

/// Escape a string literal (passwords in `CREATE USER ... WITH PASSWORD`).
/// Single quotes and backslashes are doubled.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// Sanitize a human project name into a database name: lowercase,
/// `[a-z0-9_]` only, `db_` prefix when digit-led, at most 32 characters,
/// `main` when nothing survives.
pub fn sanitize_database_name(project_name: &str) -> String {
    let mut name: String = project_name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
        .collect();

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "db_");
    }
    name.truncate(MAX_NAME_LEN);

    if name.is_empty() { "main".to_string() } else { name }
}
