// crates/strict-txn-core/src/events.rs
// ============================================================================
// Module: Ledger Events
// Description: Structured protocol events and observer sinks.
// Purpose: Provide audit-grade logging hooks without a logging framework.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! The protocol reports every decision it takes as a [`LedgerEvent`] to a
//! [`LedgerObserver`]. Hosts choose the sink: [`NoopObserver`] discards,
//! [`JsonLineObserver`] writes one JSON object per line, and
//! [`CollectingObserver`] keeps events in memory.
//!
//! ## Invariants
//! - Events never carry caller SQL text.
//! - Observers must not fail the protocol; write errors are swallowed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Serialize;

// ============================================================================
// SECTION: Events
// ============================================================================

/// Structured protocol event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// Ledger table exists (created or already present).
    LedgerPrepared {
        /// Ledger table name.
        table: String,
    },
    /// A pending ledger row was inserted and committed.
    ClaimInserted {
        /// Query identifier.
        query_id: String,
        /// Claim attempt number (1-based).
        attempt: u32,
    },
    /// Another writer inserted the row first; the read is retried.
    ClaimRaced {
        /// Query identifier.
        query_id: String,
        /// Claim attempt number (1-based).
        attempt: u32,
    },
    /// The row was already complete; the action was skipped.
    AlreadyCompleted {
        /// Query identifier.
        query_id: String,
        /// Recorded completion time in unix milliseconds.
        completed_at_ms: i64,
    },
    /// The action is about to run under the row lock.
    ActionStarted {
        /// Query identifier.
        query_id: String,
    },
    /// The action ran and completion was committed.
    ActionCompleted {
        /// Query identifier.
        query_id: String,
        /// Completion time in unix milliseconds.
        completed_at_ms: i64,
    },
    /// The action failed; no completion was recorded.
    ActionFailed {
        /// Query identifier.
        query_id: String,
        /// Failure message.
        message: String,
    },
    /// A lock wait timed out or a conflicting holder aborted the transaction.
    LockConflict {
        /// Query identifier.
        query_id: String,
        /// Database error message.
        message: String,
    },
    /// Rollback after a failure did not succeed.
    RollbackFailed {
        /// Query identifier (empty for table-level work).
        query_id: String,
        /// Database error message.
        message: String,
    },
    /// Cleanup deleted expired rows.
    CleanupCompleted {
        /// Number of rows deleted.
        deleted: u64,
        /// Cutoff time in unix milliseconds.
        cutoff_ms: i64,
    },
    /// Cleanup failed; the failure is not propagated.
    CleanupFailed {
        /// Failure message.
        message: String,
    },
    /// The caller's retry policy scheduled another attempt.
    RetryScheduled {
        /// Query identifier.
        query_id: String,
        /// Attempt that failed (1-based).
        attempt: u32,
        /// Delay before the next attempt in milliseconds.
        delay_ms: u64,
        /// Error kind label.
        error_kind: String,
    },
}

// ============================================================================
// SECTION: Observer Trait
// ============================================================================

/// Sink for protocol events.
pub trait LedgerObserver: Send + Sync {
    /// Records a protocol event.
    fn record(&self, event: &LedgerEvent);
}

/// Observer that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl LedgerObserver for NoopObserver {
    fn record(&self, _event: &LedgerEvent) {}
}

// ============================================================================
// SECTION: JSON Line Observer
// ============================================================================

/// Observer that writes each event as one JSON line.
pub struct JsonLineObserver<W: Write + Send> {
    /// Output writer for event records.
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLineObserver<W> {
    /// Creates an observer writing to `writer`.
    pub const fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consumes the observer and returns the writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> LedgerObserver for JsonLineObserver<W> {
    fn record(&self, event: &LedgerEvent) {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if serde_json::to_writer(&mut *guard, event).is_ok() {
            let _ = guard.write_all(b"\n");
            let _ = guard.flush();
        }
    }
}

// ============================================================================
// SECTION: Collecting Observer
// ============================================================================

/// Observer that keeps events in memory.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    /// Recorded events in arrival order.
    events: Mutex<Vec<LedgerEvent>>,
}

impl CollectingObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<LedgerEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns how many recorded events satisfy `predicate`.
    pub fn count(&self, predicate: impl Fn(&LedgerEvent) -> bool) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).iter().filter(|e| predicate(e)).count()
    }
}

impl LedgerObserver for CollectingObserver {
    fn record(&self, event: &LedgerEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event.clone());
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
