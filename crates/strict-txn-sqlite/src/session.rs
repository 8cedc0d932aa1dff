// crates/strict-txn-sqlite/src/session.rs
// ============================================================================
// Module: SQLite Ledger Session
// Description: LedgerSession over rusqlite with database-level write locking.
// Purpose: Run the exactly-once protocol against a SQLite file.
// Dependencies: strict-txn-core, rusqlite, serde, thiserror
// ============================================================================

//! ## Overview
//! Each [`SqliteLedgerSession`] owns one connection. Ledger transactions use
//! `BEGIN IMMEDIATE` as the row lock substitute: the whole database is the
//! lock scope, so sessions for different query ids also serialize. Timestamps
//! are stored as `INTEGER` unix milliseconds.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde::Deserialize;
use strict_txn_core::ConflictClassifier;
use strict_txn_core::ConflictKind;
use strict_txn_core::ConflictRule;
use strict_txn_core::DbError;
use strict_txn_core::LedgerSession;
use strict_txn_core::QueryId;
use strict_txn_core::StatementExecutor;
use strict_txn_core::StatusRow;
use strict_txn_core::StoredRow;
use strict_txn_core::TableReference;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Only schema name `SQLite` resolves without `ATTACH`.
const MAIN_SCHEMA: &str = "main";

/// `SQLite` extended result codes and their protocol meaning.
pub const SQLITE_CONFLICT_CODES: &[(&str, ConflictKind)] = &[
    // SQLITE_CONSTRAINT_UNIQUE / SQLITE_CONSTRAINT_PRIMARYKEY
    ("2067", ConflictKind::UniqueViolation),
    ("1555", ConflictKind::UniqueViolation),
    // SQLITE_BUSY and its extended forms
    ("5", ConflictKind::LockConflict),
    ("261", ConflictKind::LockConflict),
    ("517", ConflictKind::LockConflict),
    ("773", ConflictKind::LockConflict),
    // SQLITE_LOCKED and SQLITE_LOCKED_SHAREDCACHE
    ("6", ConflictKind::LockConflict),
    ("262", ConflictKind::LockConflict),
];

/// `SQLITE_ERROR`, shared by every generic failure including a missing table.
const SQLITE_ERROR_CODE: &str = "1";
/// Message prefix `SQLite` reports for an unknown table.
const NO_SUCH_TABLE: &str = "no such table";

/// Returns the classifier for `SQLite` extended result codes.
#[must_use]
pub fn sqlite_classifier() -> ConflictClassifier {
    ConflictClassifier::from_table(SQLITE_CONFLICT_CODES).with_rule(ConflictRule::code_with_message(
        SQLITE_ERROR_CODE,
        NO_SUCH_TABLE,
        ConflictKind::MissingLedger,
    ))
}

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteJournalMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteJournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `synchronous` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for a `SQLite` ledger session.
///
/// # Invariants
/// - `path` must resolve to a file path (not a directory).
/// - `busy_timeout_ms` bounds every lock wait and must be greater than zero.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteLedgerConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteJournalMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl SqliteLedgerConfig {
    /// Creates a configuration with default timeouts and pragmas.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteJournalMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteLedgerError::Invalid`] when the path or timeout is unusable.
    pub fn validate(&self) -> Result<(), SqliteLedgerError> {
        validate_ledger_path(&self.path)?;
        if self.busy_timeout_ms == 0 {
            return Err(SqliteLedgerError::Invalid(
                "busy_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` ledger construction errors.
///
/// # Invariants
/// - Error messages avoid embedding caller SQL text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SqliteLedgerError {
    /// Filesystem error while preparing the database path.
    #[error("sqlite ledger io error: {0}")]
    Io(String),
    /// `SQLite` engine error while opening the connection.
    #[error("sqlite ledger db error: {0}")]
    Db(String),
    /// Invalid configuration.
    #[error("sqlite ledger invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: SQL Text
// ============================================================================

/// Ledger statements rendered once for a table.
#[derive(Debug, Clone)]
struct LedgerSql {
    /// Create-if-absent statement.
    create: String,
    /// Lock-and-read statement (the lock comes from `BEGIN IMMEDIATE`).
    lock: String,
    /// Claim insert.
    insert: String,
    /// Completion update guarded on `completed_at IS NULL`.
    complete: String,
    /// Unlocked full-row read.
    read: String,
    /// Retention delete.
    delete: String,
}

impl LedgerSql {
    /// Renders statements for `table`.
    fn new(table: &TableReference) -> Self {
        let name = table.quoted();
        Self {
            create: format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    query_id TEXT NOT NULL PRIMARY KEY,
                    created_at INTEGER NOT NULL,
                    completed_at INTEGER
                )"
            ),
            lock: format!("SELECT completed_at FROM {name} WHERE query_id = ?1"),
            insert: format!(
                "INSERT INTO {name} (query_id, created_at, completed_at) VALUES (?1, ?2, NULL)"
            ),
            complete: format!(
                "UPDATE {name} SET completed_at = ?1 WHERE query_id = ?2 AND completed_at IS NULL"
            ),
            read: format!(
                "SELECT query_id, created_at, completed_at FROM {name} WHERE query_id = ?1"
            ),
            delete: format!(
                "DELETE FROM {name} WHERE completed_at IS NOT NULL AND completed_at < ?1"
            ),
        }
    }
}

// ============================================================================
// SECTION: Session
// ============================================================================

/// `SQLite`-backed ledger session.
///
/// # Invariants
/// - At most one transaction is open at a time on the owned connection.
pub struct SqliteLedgerSession {
    /// Owned connection.
    connection: Connection,
    /// Ledger table reference.
    table: TableReference,
    /// Rendered ledger statements.
    sql: LedgerSql,
    /// Extended result code classifier.
    classifier: ConflictClassifier,
}

impl SqliteLedgerSession {
    /// Opens a session on the configured database file.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteLedgerError`] when the path, table, or connection is invalid.
    pub fn open(
        config: &SqliteLedgerConfig,
        table: TableReference,
    ) -> Result<Self, SqliteLedgerError> {
        config.validate()?;
        validate_table(&table)?;
        ensure_parent_dir(&config.path)?;
        let connection = open_connection(config)?;
        Ok(Self::with_connection(connection, table))
    }

    /// Wraps an already configured connection.
    #[must_use]
    pub fn with_connection(connection: Connection, table: TableReference) -> Self {
        let sql = LedgerSql::new(&table);
        Self {
            connection,
            table,
            sql,
            classifier: sqlite_classifier(),
        }
    }

    /// Returns the underlying connection.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl StatementExecutor for SqliteLedgerSession {
    fn execute_statement(&mut self, sql: &str) -> Result<(), DbError> {
        self.connection.execute_batch(sql).map_err(|err| db_error(&err))
    }
}

impl LedgerSession for SqliteLedgerSession {
    fn conflict_classifier(&self) -> &ConflictClassifier {
        &self.classifier
    }

    fn table(&self) -> &TableReference {
        &self.table
    }

    fn create_ledger_if_absent(&mut self) -> Result<(), DbError> {
        self.connection.execute_batch(&self.sql.create).map_err(|err| db_error(&err))
    }

    fn begin(&mut self) -> Result<(), DbError> {
        self.connection.execute_batch("BEGIN IMMEDIATE").map_err(|err| db_error(&err))
    }

    fn lock_row(&mut self, query_id: &QueryId) -> Result<StatusRow, DbError> {
        let completed: Option<Option<i64>> = self
            .connection
            .query_row(&self.sql.lock, params![query_id.as_str()], |row| row.get(0))
            .optional()
            .map_err(|err| db_error(&err))?;
        Ok(match completed {
            None => StatusRow::Absent,
            Some(None) => StatusRow::Pending,
            Some(Some(completed_at_ms)) => StatusRow::Completed {
                completed_at_ms,
            },
        })
    }

    fn insert_row(&mut self, query_id: &QueryId, created_at_ms: i64) -> Result<(), DbError> {
        self.connection
            .execute(&self.sql.insert, params![query_id.as_str(), created_at_ms])
            .map(|_| ())
            .map_err(|err| db_error(&err))
    }

    fn mark_completed(
        &mut self,
        query_id: &QueryId,
        completed_at_ms: i64,
    ) -> Result<u64, DbError> {
        let updated = self
            .connection
            .execute(&self.sql.complete, params![completed_at_ms, query_id.as_str()])
            .map_err(|err| db_error(&err))?;
        Ok(row_count(updated))
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.connection.execute_batch("COMMIT").map_err(|err| db_error(&err))
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        if self.connection.is_autocommit() {
            return Ok(());
        }
        self.connection.execute_batch("ROLLBACK").map_err(|err| db_error(&err))
    }

    fn read_row(&mut self, query_id: &QueryId) -> Result<Option<StoredRow>, DbError> {
        self.connection
            .query_row(&self.sql.read, params![query_id.as_str()], |row| {
                Ok(StoredRow {
                    query_id: row.get(0)?,
                    created_at_ms: row.get(1)?,
                    completed_at_ms: row.get(2)?,
                })
            })
            .optional()
            .map_err(|err| db_error(&err))
    }

    fn delete_completed_before(&mut self, cutoff_ms: i64) -> Result<u64, DbError> {
        let deleted = self
            .connection
            .execute(&self.sql.delete, params![cutoff_ms])
            .map_err(|err| db_error(&err))?;
        Ok(row_count(deleted))
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Converts a rusqlite error into a coded [`DbError`].
fn db_error(err: &rusqlite::Error) -> DbError {
    match (err, err.sqlite_error()) {
        (rusqlite::Error::SqliteFailure(_, Some(message)), Some(code)) => {
            DbError::with_code(code.extended_code.to_string(), message.clone())
        }
        (_, Some(code)) => DbError::with_code(code.extended_code.to_string(), code.to_string()),
        (_, None) => DbError::uncoded(err.to_string()),
    }
}

/// Converts an affected-row count to `u64`.
fn row_count(count: usize) -> u64 {
    u64::try_from(count).unwrap_or(u64::MAX)
}

/// Rejects schema-qualified tables other than `main`.
fn validate_table(table: &TableReference) -> Result<(), SqliteLedgerError> {
    match table.schema() {
        None | Some(MAIN_SCHEMA) => Ok(()),
        Some(other) => Err(SqliteLedgerError::Invalid(format!(
            "sqlite ledger schema must be `{MAIN_SCHEMA}` or unset, got `{other}`"
        ))),
    }
}

/// Ensures the parent directory for the database exists.
fn ensure_parent_dir(path: &Path) -> Result<(), SqliteLedgerError> {
    let Some(parent) = path.parent() else {
        return Err(SqliteLedgerError::Io("ledger path missing parent directory".to_string()));
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).map_err(|err| SqliteLedgerError::Io(err.to_string()))
}

/// Validates ledger paths for safety limits.
fn validate_ledger_path(path: &Path) -> Result<(), SqliteLedgerError> {
    if path.as_os_str().is_empty() {
        return Err(SqliteLedgerError::Invalid("ledger path must not be empty".to_string()));
    }
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SqliteLedgerError::Invalid("ledger path exceeds length limit".to_string()));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(SqliteLedgerError::Invalid(
                "ledger path contains an overlong component".to_string(),
            ));
        }
    }
    if path.is_dir() {
        return Err(SqliteLedgerError::Invalid(
            "ledger path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Opens an `SQLite` connection with the configured pragmas.
fn open_connection(config: &SqliteLedgerConfig) -> Result<Connection, SqliteLedgerError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags)
        .map_err(|err| SqliteLedgerError::Db(err.to_string()))?;
    connection
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .map_err(|err| SqliteLedgerError::Db(err.to_string()))?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))
        .map_err(|err| SqliteLedgerError::Db(err.to_string()))?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))
        .map_err(|err| SqliteLedgerError::Db(err.to_string()))?;
    Ok(connection)
}

// ============================================================================
// SECTION: Tests
// ============================================================================
