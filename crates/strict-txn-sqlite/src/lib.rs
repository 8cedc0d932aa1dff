// crates/strict-txn-sqlite/src/lib.rs
// ============================================================================
// Module: Strict Transaction SQLite Library
// Description: SQLite ledger backend for the exactly-once protocol.
// Purpose: Provide a LedgerSession over a local SQLite database file.
// Dependencies: strict-txn-core, rusqlite, serde, thiserror
// ============================================================================

//! ## Overview
//! `SQLite` has no `SELECT ... FOR UPDATE`. [`SqliteLedgerSession`] starts every
//! ledger transaction with `BEGIN IMMEDIATE`, which takes the database write
//! lock up front and blocks other ledger writers until commit or rollback.
//! Waiters give up after `busy_timeout_ms` with `SQLITE_BUSY`, which the
//! [`sqlite_classifier`] maps to a lock conflict.
//!
//! Invariants:
//! - The write lock is held from lock-and-read until the final commit.
//! - Error messages never embed caller SQL text.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod session;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use session::SQLITE_CONFLICT_CODES;
pub use session::SqliteJournalMode;
pub use session::SqliteLedgerConfig;
pub use session::SqliteLedgerError;
pub use session::SqliteLedgerSession;
pub use session::SqliteSyncMode;
pub use session::sqlite_classifier;
