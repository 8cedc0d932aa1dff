// crates/strict-txn-core/src/session.rs
// ============================================================================
// Module: Ledger Session Interface
// Description: Narrow per-database capability interface used by the protocol.
// Purpose: Express dialect differences as one implementation per database.
// Dependencies: crate::classifier, crate::ledger
// ============================================================================

//! ## Overview
//! A [`LedgerSession`] wraps one database connection. The protocol drives it
//! through begin / lock-and-read / insert-or-conflict / update-timestamp /
//! commit / rollback and never inspects vendor details itself.
//!
//! ## Invariants
//! - `lock_row` must block concurrent `lock_row` calls for the same query id
//!   until the holding transaction commits or rolls back (or fail with a code
//!   the classifier maps to [`crate::ConflictKind::LockConflict`]).
//! - `mark_completed` only updates rows whose `completed_at` is null.
//! - Statements run through [`StatementExecutor`] join the open transaction.

// ============================================================================
// SECTION: Imports
// ============================================================================

use crate::classifier::ConflictClassifier;
use crate::classifier::DbError;
use crate::ledger::LedgerRow;
use crate::ledger::QueryId;
use crate::ledger::StatusRow;
use crate::ledger::TableReference;

// ============================================================================
// SECTION: Statement Execution
// ============================================================================

/// Executes caller SQL on the session's connection.
pub trait StatementExecutor {
    /// Executes one or more SQL statements.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the database rejects the statements.
    fn execute_statement(&mut self, sql: &str) -> Result<(), DbError>;
}

// ============================================================================
// SECTION: Ledger Session
// ============================================================================

/// Per-database capability interface for the status ledger.
pub trait LedgerSession: StatementExecutor {
    /// Returns the vendor error mapping for this backend.
    fn conflict_classifier(&self) -> &ConflictClassifier;

    /// Returns the ledger table this session operates on.
    fn table(&self) -> &TableReference;

    /// Creates the ledger table when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the table cannot be created.
    fn create_ledger_if_absent(&mut self) -> Result<(), DbError>;

    /// Begins a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the transaction cannot be started.
    fn begin(&mut self) -> Result<(), DbError>;

    /// Reads the ledger row for `query_id` under a blocking row lock.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on lock timeout or read failure.
    fn lock_row(&mut self, query_id: &QueryId) -> Result<StatusRow, DbError>;

    /// Inserts a pending ledger row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] (a unique violation when the row already exists).
    fn insert_row(&mut self, query_id: &QueryId, created_at_ms: i64) -> Result<(), DbError>;

    /// Sets `completed_at` on a pending row, returning the affected row count.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the update fails.
    fn mark_completed(&mut self, query_id: &QueryId, completed_at_ms: i64)
    -> Result<u64, DbError>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the commit fails.
    fn commit(&mut self) -> Result<(), DbError>;

    /// Rolls back the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the rollback fails.
    fn rollback(&mut self) -> Result<(), DbError>;

    /// Reads the ledger row without taking a lock.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the read fails.
    fn read_row(&mut self, query_id: &QueryId) -> Result<Option<StoredRow>, DbError>;

    /// Deletes completed rows with `completed_at < cutoff_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the delete fails.
    fn delete_completed_before(&mut self, cutoff_ms: i64) -> Result<u64, DbError>;
}

/// Raw ledger columns as stored by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Stored query identifier.
    pub query_id: String,
    /// Stored creation time in unix milliseconds.
    pub created_at_ms: i64,
    /// Stored completion time in unix milliseconds.
    pub completed_at_ms: Option<i64>,
}

impl StoredRow {
    /// Converts the stored columns into a validated [`LedgerRow`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::StrictTxnError::Corrupt`] when stored values are invalid.
    pub fn into_ledger_row(self) -> Result<LedgerRow, crate::StrictTxnError> {
        LedgerRow::from_stored(self.query_id, self.created_at_ms, self.completed_at_ms)
    }
}

// ============================================================================
// SECTION: Boxed Sessions
// ============================================================================

impl<S: StatementExecutor + ?Sized> StatementExecutor for Box<S> {
    fn execute_statement(&mut self, sql: &str) -> Result<(), DbError> {
        (**self).execute_statement(sql)
    }
}

impl<S: LedgerSession + ?Sized> LedgerSession for Box<S> {
    fn conflict_classifier(&self) -> &ConflictClassifier {
        (**self).conflict_classifier()
    }

    fn table(&self) -> &TableReference {
        (**self).table()
    }

    fn create_ledger_if_absent(&mut self) -> Result<(), DbError> {
        (**self).create_ledger_if_absent()
    }

    fn begin(&mut self) -> Result<(), DbError> {
        (**self).begin()
    }

    fn lock_row(&mut self, query_id: &QueryId) -> Result<StatusRow, DbError> {
        (**self).lock_row(query_id)
    }

    fn insert_row(&mut self, query_id: &QueryId, created_at_ms: i64) -> Result<(), DbError> {
        (**self).insert_row(query_id, created_at_ms)
    }

    fn mark_completed(
        &mut self,
        query_id: &QueryId,
        completed_at_ms: i64,
    ) -> Result<u64, DbError> {
        (**self).mark_completed(query_id, completed_at_ms)
    }

    fn commit(&mut self) -> Result<(), DbError> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        (**self).rollback()
    }

    fn read_row(&mut self, query_id: &QueryId) -> Result<Option<StoredRow>, DbError> {
        (**self).read_row(query_id)
    }

    fn delete_completed_before(&mut self, cutoff_ms: i64) -> Result<u64, DbError> {
        (**self).delete_completed_before(cutoff_ms)
    }
}
