// crates/strict-txn-core/src/execution.rs
// ============================================================================
// Module: Execution Wrapper
// Description: Runs the caller action inside the locked ledger transaction.
// Purpose: Commit the action and its completion record as one unit.
// Dependencies: crate::session, crate::protocol
// ============================================================================

//! ## Overview
//! The wrapper is entered only while the current transaction holds the row
//! lock on a pending ledger row. The action runs first; on success the row's
//! `completed_at` is set and the transaction commits. On failure the
//! transaction rolls back, leaving the row pending for a later retry.

// ============================================================================
// SECTION: Imports
// ============================================================================

use crate::classifier::DbError;
use crate::clock::LedgerClock;
use crate::error::ActionError;
use crate::error::StrictTxnError;
use crate::events::LedgerEvent;
use crate::events::LedgerObserver;
use crate::ledger::QueryId;
use crate::protocol::rollback_after_failure;
use crate::protocol::surface_error;
use crate::session::LedgerSession;
use crate::session::StatementExecutor;

// ============================================================================
// SECTION: Wrapper
// ============================================================================

/// Borrowed execution context for one locked pending row.
pub(crate) struct ExecutionWrapper<'a, S: LedgerSession> {
    /// Session holding the row lock.
    session: &'a mut S,
    /// Time source for the completion stamp.
    clock: &'a dyn LedgerClock,
    /// Event sink.
    observer: &'a dyn LedgerObserver,
}

impl<'a, S: LedgerSession> ExecutionWrapper<'a, S> {
    /// Creates a wrapper over a session that holds the row lock.
    pub(crate) fn new(
        session: &'a mut S,
        clock: &'a dyn LedgerClock,
        observer: &'a dyn LedgerObserver,
    ) -> Self {
        Self {
            session,
            clock,
            observer,
        }
    }

    /// Runs the action, records completion, and commits.
    ///
    /// Returns the recorded completion time in unix milliseconds.
    pub(crate) fn execute<F>(mut self, query_id: &QueryId, action: F) -> Result<i64, StrictTxnError>
    where
        F: FnOnce(&mut dyn StatementExecutor) -> Result<(), ActionError>,
    {
        self.observer.record(&LedgerEvent::ActionStarted {
            query_id: query_id.to_string(),
        });
        if let Err(source) = action(&mut *self.session) {
            rollback_after_failure(&mut *self.session, self.observer, query_id.as_str());
            self.observer.record(&LedgerEvent::ActionFailed {
                query_id: query_id.to_string(),
                message: source.to_string(),
            });
            return Err(StrictTxnError::ActionFailure {
                query_id: query_id.to_string(),
                source,
            });
        }

        let completed_at_ms = self.clock.now_ms();
        let updated = match self.session.mark_completed(query_id, completed_at_ms) {
            Ok(updated) => updated,
            Err(err) => return Err(self.abort(query_id, err)),
        };
        if updated != 1 {
            rollback_after_failure(&mut *self.session, self.observer, query_id.as_str());
            return Err(StrictTxnError::Corrupt(format!(
                "completion of query {query_id} updated {updated} ledger rows instead of one"
            )));
        }
        if let Err(err) = self.session.commit() {
            return Err(self.abort(query_id, err));
        }

        self.observer.record(&LedgerEvent::ActionCompleted {
            query_id: query_id.to_string(),
            completed_at_ms,
        });
        Ok(completed_at_ms)
    }

    /// Rolls back and converts a completion-phase database error.
    fn abort(&mut self, query_id: &QueryId, err: DbError) -> StrictTxnError {
        rollback_after_failure(&mut *self.session, self.observer, query_id.as_str());
        surface_error(self.session.conflict_classifier(), self.observer, query_id.as_str(), err)
    }
}
