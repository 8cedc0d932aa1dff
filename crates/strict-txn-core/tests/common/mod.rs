// crates/strict-txn-core/tests/common/mod.rs
// ============================================================================
// Module: Common Test Utilities
// Description: Scripted in-memory ledger session for protocol tests.
// Purpose: Inject unique violations, lock conflicts, and failures on demand.
// Dependencies: strict-txn-core
// ============================================================================

//! ## Overview
//! [`ScriptedSession`] implements [`LedgerSession`] over an in-memory ledger
//! with snapshot transactions. Tests queue faults per operation and can make
//! a competing writer commit a row right before the next claim insert.

#![allow(dead_code, reason = "Shared test helpers may be unused in some cases.")]
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::unwrap_in_result,
    reason = "Test-only helpers may panic on poisoned state."
)]

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use strict_txn_core::ConflictClassifier;
use strict_txn_core::ConflictKind;
use strict_txn_core::DbError;
use strict_txn_core::LedgerSession;
use strict_txn_core::QueryId;
use strict_txn_core::StatementExecutor;
use strict_txn_core::StatusRow;
use strict_txn_core::StoredRow;
use strict_txn_core::TableReference;

// ============================================================================
// SECTION: Codes
// ============================================================================

/// Code the scripted classifier maps to a unique violation.
pub const UNIQUE: &str = "UNIQUE";
/// Code the scripted classifier maps to a lock conflict.
pub const LOCKED: &str = "LOCKED";
/// Code the scripted classifier maps to a missing ledger table.
pub const NO_TABLE: &str = "NO_TABLE";
/// Code with no classifier rule.
pub const BROKEN: &str = "BROKEN";

/// Returns a unique violation error.
pub fn unique_error() -> DbError {
    DbError::with_code(UNIQUE, "duplicate key")
}

/// Returns a lock conflict error.
pub fn lock_error() -> DbError {
    DbError::with_code(LOCKED, "lock wait timed out")
}

/// Returns a missing ledger table error.
pub fn missing_table_error() -> DbError {
    DbError::with_code(NO_TABLE, "relation does not exist")
}

/// Returns an unclassified error.
pub fn broken_error() -> DbError {
    DbError::with_code(BROKEN, "disk I/O error")
}

// ============================================================================
// SECTION: Shared Ledger
// ============================================================================

/// Session operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `create_ledger_if_absent`.
    Create,
    /// `begin`.
    Begin,
    /// `lock_row`.
    LockRow,
    /// `insert_row`.
    Insert,
    /// `mark_completed`.
    MarkCompleted,
    /// `commit`.
    Commit,
    /// `rollback`.
    Rollback,
    /// `execute_statement`.
    Execute,
    /// `delete_completed_before`.
    Delete,
}

/// Committed ledger state visible across sessions.
#[derive(Debug, Default)]
pub struct Ledger {
    /// Committed rows keyed by query id: (`created_at_ms`, `completed_at_ms`).
    pub rows: BTreeMap<String, (i64, Option<i64>)>,
    /// Committed caller statements in commit order.
    pub statements: Vec<String>,
    /// Cutoffs passed to delete calls.
    pub cutoffs: Vec<i64>,
    /// Whether the ledger table exists.
    pub created: bool,
}

/// Cloneable view of the committed ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerHandle(Arc<Mutex<Ledger>>);

impl LedgerHandle {
    /// Returns the committed row for `query_id`.
    pub fn row(&self, query_id: &str) -> Option<(i64, Option<i64>)> {
        self.0.lock().unwrap().rows.get(query_id).copied()
    }

    /// Inserts a committed row directly.
    pub fn seed(&self, query_id: &str, created_at_ms: i64, completed_at_ms: Option<i64>) {
        self.0.lock().unwrap().rows.insert(query_id.to_string(), (created_at_ms, completed_at_ms));
    }

    /// Returns committed caller statements.
    pub fn statements(&self) -> Vec<String> {
        self.0.lock().unwrap().statements.clone()
    }

    /// Returns cutoffs passed to delete calls.
    pub fn cutoffs(&self) -> Vec<i64> {
        self.0.lock().unwrap().cutoffs.clone()
    }

    /// Returns whether the ledger table was created.
    pub fn created(&self) -> bool {
        self.0.lock().unwrap().created
    }
}

// ============================================================================
// SECTION: Scripted Session
// ============================================================================

/// Open transaction snapshot.
#[derive(Debug, Clone)]
struct Snapshot {
    /// Rows as seen by the transaction.
    rows: BTreeMap<String, (i64, Option<i64>)>,
    /// Statements executed in the transaction.
    statements: Vec<String>,
}

/// In-memory ledger session with scripted faults.
pub struct ScriptedSession {
    /// Classifier mapping the scripted codes.
    classifier: ConflictClassifier,
    /// Ledger table reference.
    table: TableReference,
    /// Committed state.
    ledger: LedgerHandle,
    /// Open transaction, if any.
    tx: Option<Snapshot>,
    /// Queued faults, consumed in order when the operation matches.
    faults: VecDeque<(Op, DbError)>,
    /// Competing row committed right before the next insert.
    competitor: Option<Option<i64>>,
    /// Row count reported by the next `mark_completed`, overriding the real count.
    forced_updates: Option<u64>,
    /// Operations invoked, in order.
    calls: Vec<Op>,
}

impl Default for ScriptedSession {
    fn default() -> Self {
        Self::new(LedgerHandle::default())
    }
}

impl ScriptedSession {
    /// Creates a session over a shared ledger.
    pub fn new(ledger: LedgerHandle) -> Self {
        Self {
            classifier: ConflictClassifier::from_table(&[
                (UNIQUE, ConflictKind::UniqueViolation),
                (LOCKED, ConflictKind::LockConflict),
                (NO_TABLE, ConflictKind::MissingLedger),
            ]),
            table: TableReference::default(),
            ledger,
            tx: None,
            faults: VecDeque::new(),
            competitor: None,
            forced_updates: None,
            calls: Vec::new(),
        }
    }

    /// Returns the shared ledger handle.
    pub fn ledger(&self) -> LedgerHandle {
        self.ledger.clone()
    }

    /// Queues a failure for the next call of `op`.
    pub fn fail_on(&mut self, op: Op, error: DbError) {
        self.faults.push_back((op, error));
    }

    /// Makes another writer commit a row just before the next insert.
    pub fn competitor_before_insert(&mut self, completed_at_ms: Option<i64>) {
        self.competitor = Some(completed_at_ms);
    }

    /// Forces the row count reported by the next `mark_completed`.
    pub fn force_updated_rows(&mut self, rows: u64) {
        self.forced_updates = Some(rows);
    }

    /// Returns operations invoked so far.
    pub fn calls(&self) -> &[Op] {
        &self.calls
    }

    /// Returns whether a transaction is open.
    pub const fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Records the call and returns a queued fault for it.
    fn enter(&mut self, op: Op) -> Result<(), DbError> {
        self.calls.push(op);
        if self.faults.front().is_some_and(|(faulted, _)| *faulted == op)
            && let Some((_, error)) = self.faults.pop_front()
        {
            return Err(error);
        }
        Ok(())
    }

    /// Returns the open transaction.
    fn tx_mut(&mut self) -> Result<&mut Snapshot, DbError> {
        self.tx.as_mut().ok_or_else(|| DbError::uncoded("no transaction is active"))
    }
}

impl StatementExecutor for ScriptedSession {
    fn execute_statement(&mut self, sql: &str) -> Result<(), DbError> {
        self.enter(Op::Execute)?;
        self.tx_mut()?.statements.push(sql.to_string());
        Ok(())
    }
}

impl LedgerSession for ScriptedSession {
    fn conflict_classifier(&self) -> &ConflictClassifier {
        &self.classifier
    }

    fn table(&self) -> &TableReference {
        &self.table
    }

    fn create_ledger_if_absent(&mut self) -> Result<(), DbError> {
        self.enter(Op::Create)?;
        self.ledger.0.lock().unwrap().created = true;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), DbError> {
        self.enter(Op::Begin)?;
        if self.tx.is_some() {
            return Err(DbError::uncoded("transaction already active"));
        }
        let rows = self.ledger.0.lock().unwrap().rows.clone();
        self.tx = Some(Snapshot {
            rows,
            statements: Vec::new(),
        });
        Ok(())
    }

    fn lock_row(&mut self, query_id: &QueryId) -> Result<StatusRow, DbError> {
        self.enter(Op::LockRow)?;
        let row = self.tx_mut()?.rows.get(query_id.as_str()).copied();
        Ok(match row {
            None => StatusRow::Absent,
            Some((_, None)) => StatusRow::Pending,
            Some((_, Some(completed_at_ms))) => StatusRow::Completed {
                completed_at_ms,
            },
        })
    }

    fn insert_row(&mut self, query_id: &QueryId, created_at_ms: i64) -> Result<(), DbError> {
        self.enter(Op::Insert)?;
        if let Some(completed) = self.competitor.take() {
            self.ledger.seed(query_id.as_str(), created_at_ms - 1, completed);
        }
        let exists = self.ledger.row(query_id.as_str()).is_some();
        let tx = self.tx_mut()?;
        if exists || tx.rows.contains_key(query_id.as_str()) {
            return Err(unique_error());
        }
        tx.rows.insert(query_id.to_string(), (created_at_ms, None));
        Ok(())
    }

    fn mark_completed(
        &mut self,
        query_id: &QueryId,
        completed_at_ms: i64,
    ) -> Result<u64, DbError> {
        self.enter(Op::MarkCompleted)?;
        let forced = self.forced_updates.take();
        let tx = self.tx_mut()?;
        let mut updated = 0;
        if let Some(row) = tx.rows.get_mut(query_id.as_str())
            && row.1.is_none()
        {
            row.1 = Some(completed_at_ms);
            updated = 1;
        }
        Ok(forced.unwrap_or(updated))
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.enter(Op::Commit)?;
        let tx = self.tx.take().ok_or_else(|| DbError::uncoded("no transaction is active"))?;
        let mut ledger = self.ledger.0.lock().unwrap();
        for (query_id, row) in tx.rows {
            ledger.rows.insert(query_id, row);
        }
        ledger.statements.extend(tx.statements);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.enter(Op::Rollback)?;
        self.tx = None;
        Ok(())
    }

    fn read_row(&mut self, query_id: &QueryId) -> Result<Option<StoredRow>, DbError> {
        Ok(self.ledger.row(query_id.as_str()).map(|(created_at_ms, completed_at_ms)| StoredRow {
            query_id: query_id.to_string(),
            created_at_ms,
            completed_at_ms,
        }))
    }

    fn delete_completed_before(&mut self, cutoff_ms: i64) -> Result<u64, DbError> {
        self.enter(Op::Delete)?;
        let mut ledger = self.ledger.0.lock().unwrap();
        ledger.cutoffs.push(cutoff_ms);
        let before = ledger.rows.len();
        ledger.rows.retain(|_, (_, completed)| completed.is_none_or(|at| at >= cutoff_ms));
        Ok((before - ledger.rows.len()) as u64)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Parses a query id.
pub fn qid(value: &str) -> QueryId {
    QueryId::new(value).expect("valid query id")
}

/// Shared sleep recorder for operator tests.
#[derive(Debug, Clone, Default)]
pub struct SleepLog(Arc<Mutex<Vec<Duration>>>);

impl SleepLog {
    /// Returns a sleeper recording into this log.
    pub fn sleeper(&self) -> Box<dyn Fn(Duration) + Send + Sync> {
        let log = Arc::clone(&self.0);
        Box::new(move |delay| log.lock().unwrap().push(delay))
    }

    /// Returns recorded delays.
    pub fn delays(&self) -> Vec<Duration> {
        self.0.lock().unwrap().clone()
    }
}
