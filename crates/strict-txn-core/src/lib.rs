// crates/strict-txn-core/src/lib.rs
// ============================================================================
// Module: Strict Transaction Core Library
// Description: Exactly-once SQL execution over a database-resident ledger.
// Purpose: Provide the ledger protocol independent of any database driver.
// Dependencies: serde, serde_json, thiserror, time, uuid
// ============================================================================

//! ## Overview
//! Strict Transaction Core runs a caller action at most once to completion
//! per logical query identifier, using a small status ledger table inside
//! the target database as the only coordination point.
//!
//! - [`StrictTransaction`] implements the row lock protocol.
//! - [`LedgerSession`] is the per-database capability interface.
//! - [`ConflictClassifier`] maps vendor error codes to protocol outcomes.
//! - [`SqlJobOperator`] adds modes, outer retry, and post-run cleanup.
//!
//! Invariants:
//! - Completion is recorded at most once per query id and never reset.
//! - A failed action leaves its ledger row pending and safe to retry.
//! - Pending rows are never removed by cleanup.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod classifier;
pub mod cleanup;
pub mod clock;
pub mod error;
pub mod events;
mod execution;
pub mod ledger;
pub mod operator;
pub mod protocol;
pub mod session;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use classifier::CodePattern;
pub use classifier::ConflictClassifier;
pub use classifier::ConflictKind;
pub use classifier::ConflictRule;
pub use classifier::DbError;
pub use cleanup::CleanupHandle;
pub use cleanup::CleanupSchedule;
pub use cleanup::CleanupWorker;
pub use cleanup::cleanup_expired;
pub use clock::FixedClock;
pub use clock::LedgerClock;
pub use clock::SystemClock;
pub use error::ActionError;
pub use error::StrictTxnError;
pub use events::CollectingObserver;
pub use events::JsonLineObserver;
pub use events::LedgerEvent;
pub use events::LedgerObserver;
pub use events::NoopObserver;
pub use ledger::DEFAULT_LEDGER_TABLE;
pub use ledger::LedgerRow;
pub use ledger::QueryId;
pub use ledger::StatusRow;
pub use ledger::TableReference;
pub use operator::JobReport;
pub use operator::JobSettings;
pub use operator::RetryPolicy;
pub use operator::SqlJob;
pub use operator::SqlJobOperator;
pub use operator::TransactionMode;
pub use protocol::DEFAULT_MAX_CLAIM_ATTEMPTS;
pub use protocol::RunOutcome;
pub use protocol::StrictTransaction;
pub use session::LedgerSession;
pub use session::StatementExecutor;
pub use session::StoredRow;
