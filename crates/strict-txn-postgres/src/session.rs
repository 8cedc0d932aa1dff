// crates/strict-txn-postgres/src/session.rs
// ============================================================================
// Module: Postgres Ledger Session
// Description: LedgerSession over a pooled Postgres connection.
// Purpose: Lock ledger rows with SELECT ... FOR UPDATE.
// Dependencies: strict-txn-core, postgres, r2d2, r2d2_postgres
// ============================================================================

//! ## Overview
//! Transactions are driven with plain `BEGIN` / `COMMIT` / `ROLLBACK` so the
//! protocol controls their boundaries across trait calls. Timestamps are
//! stored as `BIGINT` unix milliseconds.

// ============================================================================
// SECTION: Imports
// ============================================================================

use postgres::NoTls;
use r2d2::PooledConnection;
use r2d2_postgres::PostgresConnectionManager;
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

// ============================================================================
// SECTION: Classification
// ============================================================================

/// Exact SQLSTATE codes and their protocol meaning.
pub const POSTGRES_CONFLICT_CODES: &[(&str, ConflictKind)] = &[
    // unique_violation
    ("23505", ConflictKind::UniqueViolation),
    // lock_not_available (lock_timeout)
    ("55P03", ConflictKind::LockConflict),
    // query_canceled (statement_timeout)
    ("57014", ConflictKind::LockConflict),
    // undefined_table
    ("42P01", ConflictKind::MissingLedger),
];

/// SQLSTATE class for transaction rollback (serialization failure, deadlock).
const TRANSACTION_ROLLBACK_CLASS: &str = "40";

/// Returns the classifier for Postgres SQLSTATE codes.
#[must_use]
pub fn postgres_classifier() -> ConflictClassifier {
    ConflictClassifier::from_table(POSTGRES_CONFLICT_CODES)
        .with_rule(ConflictRule::prefix(TRANSACTION_ROLLBACK_CLASS, ConflictKind::LockConflict))
}

// ============================================================================
// SECTION: SQL Text
// ============================================================================

/// Ledger statements rendered once for a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSql {
    /// Create-if-absent statement.
    pub create: String,
    /// Lock-and-read statement.
    pub lock: String,
    /// Claim insert.
    pub insert: String,
    /// Completion update guarded on `completed_at IS NULL`.
    pub complete: String,
    /// Unlocked full-row read.
    pub read: String,
    /// Retention delete.
    pub delete: String,
}

impl LedgerSql {
    /// Renders statements for `table`.
    #[must_use]
    pub fn new(table: &TableReference) -> Self {
        let name = table.quoted();
        Self {
            create: format!(
                "CREATE TABLE IF NOT EXISTS {name} (query_id TEXT NOT NULL PRIMARY KEY, \
                 created_at BIGINT NOT NULL, completed_at BIGINT)"
            ),
            lock: format!("SELECT completed_at FROM {name} WHERE query_id = $1 FOR UPDATE"),
            insert: format!(
                "INSERT INTO {name} (query_id, created_at, completed_at) VALUES ($1, $2, NULL)"
            ),
            complete: format!(
                "UPDATE {name} SET completed_at = $1 WHERE query_id = $2 AND completed_at IS NULL"
            ),
            read: format!(
                "SELECT query_id, created_at, completed_at FROM {name} WHERE query_id = $1"
            ),
            delete: format!(
                "DELETE FROM {name} WHERE completed_at IS NOT NULL AND completed_at < $1"
            ),
        }
    }
}

// ============================================================================
// SECTION: Session
// ============================================================================

/// Pooled connection type used by sessions.
type PooledClient = PooledConnection<PostgresConnectionManager<NoTls>>;

/// Postgres-backed ledger session.
pub struct PostgresLedgerSession {
    /// Pooled client.
    client: PooledClient,
    /// Ledger table reference.
    table: TableReference,
    /// Rendered ledger statements.
    sql: LedgerSql,
    /// SQLSTATE classifier.
    classifier: ConflictClassifier,
}

impl PostgresLedgerSession {
    /// Wraps a pooled connection.
    pub(crate) fn new(client: PooledClient, table: TableReference) -> Self {
        let sql = LedgerSql::new(&table);
        Self {
            client,
            table,
            sql,
            classifier: postgres_classifier(),
        }
    }

    /// Returns the underlying client.
    pub fn client_mut(&mut self) -> &mut postgres::Client {
        &mut self.client
    }
}

impl StatementExecutor for PostgresLedgerSession {
    fn execute_statement(&mut self, sql: &str) -> Result<(), DbError> {
        self.client.batch_execute(sql).map_err(|err| db_error(&err))
    }
}

impl LedgerSession for PostgresLedgerSession {
    fn conflict_classifier(&self) -> &ConflictClassifier {
        &self.classifier
    }

    fn table(&self) -> &TableReference {
        &self.table
    }

    fn create_ledger_if_absent(&mut self) -> Result<(), DbError> {
        self.client.batch_execute(&self.sql.create).map_err(|err| db_error(&err))
    }

    fn begin(&mut self) -> Result<(), DbError> {
        self.client.batch_execute("BEGIN").map_err(|err| db_error(&err))
    }

    fn lock_row(&mut self, query_id: &QueryId) -> Result<StatusRow, DbError> {
        let row = self
            .client
            .query_opt(&self.sql.lock, &[&query_id.as_str()])
            .map_err(|err| db_error(&err))?;
        let Some(row) = row else {
            return Ok(StatusRow::Absent);
        };
        let completed: Option<i64> = row.try_get(0).map_err(|err| db_error(&err))?;
        Ok(completed.map_or(StatusRow::Pending, |completed_at_ms| StatusRow::Completed {
            completed_at_ms,
        }))
    }

    fn insert_row(&mut self, query_id: &QueryId, created_at_ms: i64) -> Result<(), DbError> {
        self.client
            .execute(&self.sql.insert, &[&query_id.as_str(), &created_at_ms])
            .map(|_| ())
            .map_err(|err| db_error(&err))
    }

    fn mark_completed(
        &mut self,
        query_id: &QueryId,
        completed_at_ms: i64,
    ) -> Result<u64, DbError> {
        self.client
            .execute(&self.sql.complete, &[&completed_at_ms, &query_id.as_str()])
            .map_err(|err| db_error(&err))
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.client.batch_execute("COMMIT").map_err(|err| db_error(&err))
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.client.batch_execute("ROLLBACK").map_err(|err| db_error(&err))
    }

    fn read_row(&mut self, query_id: &QueryId) -> Result<Option<StoredRow>, DbError> {
        let row = self
            .client
            .query_opt(&self.sql.read, &[&query_id.as_str()])
            .map_err(|err| db_error(&err))?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(StoredRow {
            query_id: row.try_get(0).map_err(|err| db_error(&err))?,
            created_at_ms: row.try_get(1).map_err(|err| db_error(&err))?,
            completed_at_ms: row.try_get(2).map_err(|err| db_error(&err))?,
        }))
    }

    fn delete_completed_before(&mut self, cutoff_ms: i64) -> Result<u64, DbError> {
        self.client.execute(&self.sql.delete, &[&cutoff_ms]).map_err(|err| db_error(&err))
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Converts a postgres error into a coded [`DbError`].
///
/// Server errors keep their SQLSTATE and primary message only.
fn db_error(err: &postgres::Error) -> DbError {
    match (err.code(), err.as_db_error()) {
        (Some(state), Some(server)) => DbError::with_code(state.code(), server.message()),
        (Some(state), None) => DbError::with_code(state.code(), err.to_string()),
        (None, _) => DbError::uncoded(err.to_string()),
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
