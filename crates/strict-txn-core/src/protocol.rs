// crates/strict-txn-core/src/protocol.rs
// ============================================================================
// Module: Row Lock Protocol
// Description: Exactly-once state machine over the status ledger.
// Purpose: Decide run-or-skip per query id using only database transactions.
// Dependencies: crate::session, crate::classifier, crate::execution
// ============================================================================

//! ## Overview
//! [`StrictTransaction`] runs a caller action at most once per
//! [`QueryId`] to completion. Each attempt:
//! 1. begins a transaction and reads the ledger row under a blocking lock;
//! 2. if the row is complete, rolls back and reports [`RunOutcome::Skipped`];
//! 3. if the row is absent, inserts a pending row, commits it to publish the
//!    claim, and starts over from step 1 (a unique violation here means
//!    another writer claimed first and is absorbed the same way);
//! 4. if the row is pending, the lock is held by this transaction, so the
//!    action runs through the execution wrapper and completion commits
//!    together with the action's statements.
//!
//! ## Invariants
//! - Completion is recorded at most once per query id.
//! - A failed action never records completion.
//! - Unique violations on the claim insert never reach the caller.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::classifier::ConflictClassifier;
use crate::classifier::ConflictKind;
use crate::classifier::DbError;
use crate::clock::LedgerClock;
use crate::clock::SystemClock;
use crate::cleanup::cleanup_expired;
use crate::error::ActionError;
use crate::error::StrictTxnError;
use crate::events::LedgerEvent;
use crate::events::LedgerObserver;
use crate::events::NoopObserver;
use crate::execution::ExecutionWrapper;
use crate::ledger::LedgerRow;
use crate::ledger::QueryId;
use crate::ledger::StatusRow;
use crate::session::LedgerSession;
use crate::session::StatementExecutor;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default bound on claim attempts per call.
pub const DEFAULT_MAX_CLAIM_ATTEMPTS: u32 = 16;

// ============================================================================
// SECTION: Outcomes
// ============================================================================

/// Result of an exactly-once call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The action ran and completion was committed by this call.
    Ran,
    /// A prior call already completed the action.
    Skipped,
}

/// Decision reached while holding the row lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockedStatus {
    /// Row is complete; nothing to do.
    Completed {
        /// Recorded completion time in unix milliseconds.
        completed_at_ms: i64,
    },
    /// Row is pending and locked by the open transaction.
    Pending,
}

// ============================================================================
// SECTION: Strict Transaction
// ============================================================================

/// Exactly-once executor bound to one ledger session.
///
/// # Invariants
/// - All ledger mutation goes through the owned session; no state is cached.
pub struct StrictTransaction<S: LedgerSession> {
    /// Database session used for every ledger operation.
    session: S,
    /// Time source for ledger timestamps.
    clock: Arc<dyn LedgerClock>,
    /// Event sink.
    observer: Arc<dyn LedgerObserver>,
    /// Upper bound on claim attempts per call.
    max_claim_attempts: u32,
}

impl<S: LedgerSession> StrictTransaction<S> {
    /// Creates a strict transaction helper with the system clock and no-op observer.
    pub fn new(session: S) -> Self {
        Self {
            session,
            clock: Arc::new(SystemClock),
            observer: Arc::new(NoopObserver),
            max_claim_attempts: DEFAULT_MAX_CLAIM_ATTEMPTS,
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn LedgerClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the event observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn LedgerObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Sets the claim attempt bound (minimum 1).
    #[must_use]
    pub fn with_max_claim_attempts(mut self, attempts: u32) -> Self {
        self.max_claim_attempts = attempts.max(1);
        self
    }

    /// Returns the underlying session.
    pub const fn session(&self) -> &S {
        &self.session
    }

    /// Returns the underlying session mutably.
    pub const fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Consumes the helper and returns the session.
    pub fn into_session(self) -> S {
        self.session
    }

    /// Returns the configured observer.
    #[must_use]
    pub fn observer(&self) -> Arc<dyn LedgerObserver> {
        Arc::clone(&self.observer)
    }

    /// Returns the configured clock.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn LedgerClock> {
        Arc::clone(&self.clock)
    }

    /// Ensures the ledger table exists.
    ///
    /// # Errors
    ///
    /// - [`StrictTxnError::LockConflict`] when the create waits out its lock timeout.
    /// - [`StrictTxnError::Schema`] when the table cannot be created.
    pub fn prepare(&mut self) -> Result<(), StrictTxnError> {
        let table = self.session.table().clone();
        if let Err(err) = self.session.create_ledger_if_absent() {
            match self.session.conflict_classifier().classify(&err) {
                // Concurrent create-if-absent from another process.
                ConflictKind::UniqueViolation => {}
                ConflictKind::LockConflict => {
                    return Err(surface_error(
                        self.session.conflict_classifier(),
                        self.observer.as_ref(),
                        "",
                        err,
                    ));
                }
                ConflictKind::MissingLedger | ConflictKind::Other => {
                    return Err(StrictTxnError::Schema(format!(
                        "failed to create ledger table {table}: {err}. hint: if this user \
                         cannot create tables, ask an administrator to create {table} \
                         (query_id text primary key, created_at bigint not null, completed_at \
                         bigint) with SELECT/INSERT/UPDATE/DELETE granted, or configure a \
                         ledger schema this user may create tables in"
                    )));
                }
            }
        }
        self.observer.record(&LedgerEvent::LedgerPrepared {
            table: table.to_string(),
        });
        Ok(())
    }

    /// Runs `action` unless a previous call already completed it for `query_id`.
    ///
    /// The action receives the session's statement executor; its statements
    /// commit atomically with the completion record.
    ///
    /// # Errors
    ///
    /// - [`StrictTxnError::LockConflict`] when a lock wait times out.
    /// - [`StrictTxnError::ActionFailure`] when the action fails.
    /// - [`StrictTxnError::ClaimRetriesExhausted`] when claims keep racing.
    /// - [`StrictTxnError::Schema`] when the ledger table does not exist.
    /// - [`StrictTxnError::Database`] / [`StrictTxnError::Corrupt`] otherwise.
    pub fn run_exactly_once<F>(
        &mut self,
        query_id: &QueryId,
        action: F,
    ) -> Result<RunOutcome, StrictTxnError>
    where
        F: FnOnce(&mut dyn StatementExecutor) -> Result<(), ActionError>,
    {
        match self.begin_and_lock(query_id)? {
            LockedStatus::Completed {
                completed_at_ms,
            } => {
                if let Err(err) = self.session.rollback() {
                    return Err(surface_error(
                        self.session.conflict_classifier(),
                        self.observer.as_ref(),
                        query_id.as_str(),
                        err,
                    ));
                }
                self.observer.record(&LedgerEvent::AlreadyCompleted {
                    query_id: query_id.to_string(),
                    completed_at_ms,
                });
                Ok(RunOutcome::Skipped)
            }
            LockedStatus::Pending => {
                ExecutionWrapper::new(
                    &mut self.session,
                    self.clock.as_ref(),
                    self.observer.as_ref(),
                )
                .execute(query_id, action)?;
                Ok(RunOutcome::Ran)
            }
        }
    }

    /// Deletes completed rows older than `retention`.
    ///
    /// # Errors
    ///
    /// Returns [`StrictTxnError`] when the delete fails.
    pub fn cleanup(&mut self, retention: Duration) -> Result<u64, StrictTxnError> {
        cleanup_expired(&mut self.session, self.clock.as_ref(), self.observer.as_ref(), retention)
    }

    /// Runs cleanup, logging failures instead of returning them.
    pub fn cleanup_logged(&mut self, retention: Duration) -> Option<u64> {
        match self.cleanup(retention) {
            Ok(deleted) => Some(deleted),
            Err(err) => {
                self.observer.record(&LedgerEvent::CleanupFailed {
                    message: err.to_string(),
                });
                None
            }
        }
    }

    /// Reads the ledger row for `query_id` without locking it.
    ///
    /// # Errors
    ///
    /// Returns [`StrictTxnError`] when the read fails or the row is corrupt.
    pub fn status(&mut self, query_id: &QueryId) -> Result<Option<LedgerRow>, StrictTxnError> {
        let stored = self.session.read_row(query_id).map_err(|err| {
            surface_error(
                self.session.conflict_classifier(),
                self.observer.as_ref(),
                query_id.as_str(),
                err,
            )
        })?;
        stored.map(crate::session::StoredRow::into_ledger_row).transpose()
    }

    /// Begins a transaction and locks the ledger row, claiming it when absent.
    fn begin_and_lock(&mut self, query_id: &QueryId) -> Result<LockedStatus, StrictTxnError> {
        for attempt in 1 ..= self.max_claim_attempts {
            if let Err(err) = self.session.begin() {
                return Err(self.fail(query_id, err));
            }
            let status = match self.session.lock_row(query_id) {
                Ok(status) => status,
                Err(err) => {
                    rollback_after_failure(
                        &mut self.session,
                        self.observer.as_ref(),
                        query_id.as_str(),
                    );
                    return Err(self.fail(query_id, err));
                }
            };
            match status {
                StatusRow::Completed {
                    completed_at_ms,
                } => {
                    return Ok(LockedStatus::Completed {
                        completed_at_ms,
                    });
                }
                StatusRow::Pending => return Ok(LockedStatus::Pending),
                StatusRow::Absent => self.claim(query_id, attempt)?,
            }
        }
        Err(StrictTxnError::ClaimRetriesExhausted {
            query_id: query_id.to_string(),
            attempts: self.max_claim_attempts,
        })
    }

    /// Inserts and commits a pending row inside the open transaction.
    fn claim(&mut self, query_id: &QueryId, attempt: u32) -> Result<(), StrictTxnError> {
        let created_at_ms = self.clock.now_ms();
        let result = self
            .session
            .insert_row(query_id, created_at_ms)
            .and_then(|()| self.session.commit());
        match result {
            Ok(()) => {
                self.observer.record(&LedgerEvent::ClaimInserted {
                    query_id: query_id.to_string(),
                    attempt,
                });
                Ok(())
            }
            Err(err) => {
                rollback_after_failure(&mut self.session, self.observer.as_ref(), query_id.as_str());
                if self.session.conflict_classifier().classify(&err) == ConflictKind::UniqueViolation
                {
                    self.observer.record(&LedgerEvent::ClaimRaced {
                        query_id: query_id.to_string(),
                        attempt,
                    });
                    return Ok(());
                }
                Err(self.fail(query_id, err))
            }
        }
    }

    /// Converts a database error into a surfaced protocol error.
    fn fail(&self, query_id: &QueryId, err: DbError) -> StrictTxnError {
        surface_error(
            self.session.conflict_classifier(),
            self.observer.as_ref(),
            query_id.as_str(),
            err,
        )
    }
}

// ============================================================================
// SECTION: Shared Helpers
// ============================================================================

/// Maps a database error to the surfaced protocol error, logging lock conflicts.
pub(crate) fn surface_error(
    classifier: &ConflictClassifier,
    observer: &dyn LedgerObserver,
    query_id: &str,
    err: DbError,
) -> StrictTxnError {
    match classifier.classify(&err) {
        ConflictKind::LockConflict => {
            observer.record(&LedgerEvent::LockConflict {
                query_id: query_id.to_string(),
                message: err.to_string(),
            });
            StrictTxnError::LockConflict {
                query_id: query_id.to_string(),
                source: err,
            }
        }
        ConflictKind::MissingLedger => StrictTxnError::Schema(format!(
            "ledger table is missing, run prepare before running queries: {err}"
        )),
        ConflictKind::UniqueViolation | ConflictKind::Other => StrictTxnError::Database(err),
    }
}

/// Rolls back after a failure; a failed rollback is logged, never surfaced.
pub(crate) fn rollback_after_failure<S: LedgerSession + ?Sized>(
    session: &mut S,
    observer: &dyn LedgerObserver,
    query_id: &str,
) {
    if let Err(err) = session.rollback() {
        observer.record(&LedgerEvent::RollbackFailed {
            query_id: query_id.to_string(),
            message: err.to_string(),
        });
    }
}
