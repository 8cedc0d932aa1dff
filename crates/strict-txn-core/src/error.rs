// crates/strict-txn-core/src/error.rs
// ============================================================================
// Module: Strict Transaction Errors
// Description: Error taxonomy surfaced by the exactly-once protocol.
// Purpose: Separate retryable contention from action and schema failures.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! Unique violations on the claim insert are absorbed by the protocol and
//! never appear here. Everything else is surfaced with enough structure for
//! the caller's retry policy to decide whether to re-invoke.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::classifier::DbError;

// ============================================================================
// SECTION: Action Errors
// ============================================================================

/// Failure of the caller-supplied action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// A statement executed by the action failed.
    #[error("statement failed: {0}")]
    Statement(#[from] DbError),
    /// The action reported a failure of its own.
    #[error("action failed: {0}")]
    Failed(String),
}

// ============================================================================
// SECTION: Protocol Errors
// ============================================================================

/// Errors surfaced by the strict transaction protocol.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
/// - No variant leaves a completion record behind for a failed action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrictTxnError {
    /// Lock wait timed out or a conflicting holder aborted this transaction.
    #[error("ledger lock conflict for query {query_id}: {source}")]
    LockConflict {
        /// Query identifier being processed (empty for table-level work).
        query_id: String,
        /// Underlying database error.
        source: DbError,
    },
    /// The wrapped action failed; the ledger row stays incomplete.
    #[error("action failed for query {query_id}: {source}")]
    ActionFailure {
        /// Query identifier being processed.
        query_id: String,
        /// Action failure.
        source: ActionError,
    },
    /// Ledger table is missing or could not be created.
    #[error("ledger schema error: {0}")]
    Schema(String),
    /// Non-retryable database failure.
    #[error("ledger database error: {0}")]
    Database(#[source] DbError),
    /// Claim insert kept racing with other writers.
    #[error("query {query_id} claim did not settle after {attempts} attempts")]
    ClaimRetriesExhausted {
        /// Query identifier being claimed.
        query_id: String,
        /// Number of claim attempts made.
        attempts: u32,
    },
    /// Ledger contents violate an invariant.
    #[error("ledger corruption: {0}")]
    Corrupt(String),
    /// Invalid input supplied by the caller.
    #[error("invalid input: {0}")]
    Invalid(String),
}

impl StrictTxnError {
    /// Returns true when re-invoking the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockConflict { .. } | Self::ClaimRetriesExhausted { .. })
    }

    /// Returns a stable label for logs and exit reporting.
    #[must_use]
    pub const fn kind_label(&self) -> &'static str {
        match self {
            Self::LockConflict { .. } => "lock_conflict",
            Self::ActionFailure { .. } => "action_failure",
            Self::Schema(_) => "schema",
            Self::Database(_) => "database",
            Self::ClaimRetriesExhausted { .. } => "claim_retries_exhausted",
            Self::Corrupt(_) => "corrupt",
            Self::Invalid(_) => "invalid",
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
