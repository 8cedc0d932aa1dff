// crates/strict-txn-config/src/lib.rs
// ============================================================================
// Module: Strict Transaction Config
// Description: TOML configuration model, loader, and backend wiring.
// Purpose: Load fail-closed configuration and open ledger sessions from it.
// Dependencies: strict-txn-core, strict-txn-sqlite, strict-txn-postgres, serde, toml
// ============================================================================

//! ## Overview
//! [`StrictTxnConfig`] is read from `strict-txn.toml`. The path comes from an
//! explicit argument, then the `STRICT_TXN_CONFIG` environment variable, then
//! the default file name. Loading is bounded (path length, file size, UTF-8)
//! and every loaded config is validated before it is returned.
//!
//! Invariants:
//! - Unknown keys are rejected.
//! - A config that passes [`StrictTxnConfig::validate`] yields a valid
//!   [`TableReference`], [`JobSettings`], and backend configuration.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use strict_txn_core::DEFAULT_LEDGER_TABLE;
use strict_txn_core::DEFAULT_MAX_CLAIM_ATTEMPTS;
use strict_txn_core::JobSettings;
use strict_txn_core::LedgerObserver;
use strict_txn_core::LedgerSession;
use strict_txn_core::RetryPolicy;
use strict_txn_core::StrictTransaction;
use strict_txn_core::TableReference;
use strict_txn_postgres::PostgresLedger;
use strict_txn_postgres::PostgresLedgerConfig;
use strict_txn_sqlite::SqliteLedgerConfig;
use strict_txn_sqlite::SqliteLedgerSession;
use thiserror::Error;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Default config filename.
pub const DEFAULT_CONFIG_NAME: &str = "strict-txn.toml";
/// Environment variable override for the config path.
pub const CONFIG_ENV_VAR: &str = "STRICT_TXN_CONFIG";
/// Maximum allowed config file size in bytes.
const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum total path length for the config path.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Default ledger retention (24 hours).
const DEFAULT_CLEANUP_RETENTION_SECS: u64 = 86_400;
/// The only schema name `SQLite` ledgers accept.
const SQLITE_MAIN_SCHEMA: &str = "main";

/// Ledger session opened from configuration.
pub type BoxedLedgerSession = Box<dyn LedgerSession + Send>;

// ============================================================================
// SECTION: Config Model
// ============================================================================

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrictTxnConfig {
    /// Target database.
    pub database: DatabaseConfig,
    /// Ledger table and cleanup settings.
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Caller-side retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Database backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatabaseConfig {
    /// `SQLite` database file.
    Sqlite(SqliteLedgerConfig),
    /// Postgres server.
    Postgres(PostgresLedgerConfig),
}

impl DatabaseConfig {
    /// Returns the backend label used in diagnostics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Postgres(_) => "postgres",
        }
    }
}

/// Ledger table configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// Optional schema holding the ledger table.
    #[serde(default)]
    pub schema: Option<String>,
    /// Ledger table name.
    #[serde(default = "default_table")]
    pub table: String,
    /// Completed rows older than this are pruned.
    #[serde(default = "default_cleanup_retention_secs")]
    pub cleanup_retention_secs: u64,
    /// Bound on claim attempts within one protocol call.
    #[serde(default = "default_max_claim_attempts")]
    pub max_claim_attempts: u32,
    /// Whether strict runs prune the ledger afterwards.
    #[serde(default = "default_cleanup_after_run")]
    pub cleanup_after_run: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            schema: None,
            table: default_table(),
            cleanup_retention_secs: DEFAULT_CLEANUP_RETENTION_SECS,
            max_claim_attempts: DEFAULT_MAX_CLAIM_ATTEMPTS,
            cleanup_after_run: true,
        }
    }
}

/// Returns the default ledger table name.
fn default_table() -> String {
    DEFAULT_LEDGER_TABLE.to_string()
}

/// Returns the default ledger retention in seconds.
const fn default_cleanup_retention_secs() -> u64 {
    DEFAULT_CLEANUP_RETENTION_SECS
}

/// Returns the default claim attempt bound.
const fn default_max_claim_attempts() -> u32 {
    DEFAULT_MAX_CLAIM_ATTEMPTS
}

/// Returns the default post-run cleanup switch.
const fn default_cleanup_after_run() -> bool {
    true
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Config errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// I/O error.
    #[error("config io error: {0}")]
    Io(String),
    /// Parse error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration.
    #[error("config invalid: {0}")]
    Invalid(String),
    /// Backend could not be opened.
    #[error("ledger storage error: {0}")]
    Storage(String),
}

// ============================================================================
// SECTION: Loading
// ============================================================================

impl StrictTxnConfig {
    /// Loads configuration from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading, parsing, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path, env::var(CONFIG_ENV_VAR).ok())?;
        validate_path(&resolved)?;
        let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::from_toml_str(content)
    }

    /// Parses and validates configuration text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a field is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.database {
            DatabaseConfig::Sqlite(sqlite) => {
                sqlite.validate().map_err(|err| ConfigError::Invalid(err.to_string()))?;
                if let Some(schema) = &self.ledger.schema
                    && schema != SQLITE_MAIN_SCHEMA
                {
                    return Err(ConfigError::Invalid(format!(
                        "sqlite ledger schema must be {SQLITE_MAIN_SCHEMA} or unset"
                    )));
                }
            }
            DatabaseConfig::Postgres(postgres) => {
                postgres.validate().map_err(|err| ConfigError::Invalid(err.to_string()))?;
            }
        }
        self.table_reference()?;
        if self.ledger.cleanup_retention_secs == 0 {
            return Err(ConfigError::Invalid(
                "ledger.cleanup_retention_secs must be greater than zero".to_string(),
            ));
        }
        if self.ledger.max_claim_attempts == 0 {
            return Err(ConfigError::Invalid(
                "ledger.max_claim_attempts must be greater than zero".to_string(),
            ));
        }
        validate_retry(&self.retry)
    }

    // ========================================================================
    // SECTION: Wiring
    // ========================================================================

    /// Returns the configured ledger table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when an identifier is invalid.
    pub fn table_reference(&self) -> Result<TableReference, ConfigError> {
        TableReference::new(self.ledger.schema.as_deref(), &self.ledger.table)
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    /// Returns the configured ledger retention.
    #[must_use]
    pub const fn cleanup_retention(&self) -> Duration {
        Duration::from_secs(self.ledger.cleanup_retention_secs)
    }

    /// Returns operator settings derived from the config.
    #[must_use]
    pub const fn job_settings(&self) -> JobSettings {
        JobSettings {
            retention: self.cleanup_retention(),
            retry: self.retry,
            cleanup_after_run: self.ledger.cleanup_after_run,
        }
    }

    /// Opens a ledger session on the configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Storage`] when the backend cannot be opened.
    pub fn open_session(&self) -> Result<BoxedLedgerSession, ConfigError> {
        let table = self.table_reference()?;
        match &self.database {
            DatabaseConfig::Sqlite(sqlite) => {
                let session = SqliteLedgerSession::open(sqlite, table)
                    .map_err(|err| ConfigError::Storage(err.to_string()))?;
                Ok(Box::new(session))
            }
            DatabaseConfig::Postgres(postgres) => {
                let ledger = PostgresLedger::connect(postgres, table)
                    .map_err(|err| ConfigError::Storage(err.to_string()))?;
                let session =
                    ledger.session().map_err(|err| ConfigError::Storage(err.to_string()))?;
                Ok(Box::new(session))
            }
        }
    }

    /// Opens a session and wraps it in a configured [`StrictTransaction`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Storage`] when the backend cannot be opened.
    pub fn strict_transaction(
        &self,
        observer: Arc<dyn LedgerObserver>,
    ) -> Result<StrictTransaction<BoxedLedgerSession>, ConfigError> {
        let session = self.open_session()?;
        Ok(StrictTransaction::new(session)
            .with_observer(observer)
            .with_max_claim_attempts(self.ledger.max_claim_attempts))
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Validates retry bounds.
fn validate_retry(retry: &RetryPolicy) -> Result<(), ConfigError> {
    if retry.max_attempts == 0 {
        return Err(ConfigError::Invalid("retry.max_attempts must be greater than zero".to_string()));
    }
    if retry.max_backoff_ms < retry.initial_backoff_ms {
        return Err(ConfigError::Invalid(
            "retry.max_backoff_ms must be at least retry.initial_backoff_ms".to_string(),
        ));
    }
    Ok(())
}

/// Resolves the config path from explicit input or environment.
fn resolve_path(path: Option<&Path>, env_path: Option<String>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Some(env_path) = env_path {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates the config file path length and components.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("config path component too long".to_string()));
        }
    }
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
