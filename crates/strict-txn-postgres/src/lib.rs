// crates/strict-txn-postgres/src/lib.rs
// ============================================================================
// Module: Strict Transaction Postgres Library
// Description: Postgres ledger backend for the exactly-once protocol.
// Purpose: Provide pooled LedgerSessions using native row locks.
// Dependencies: strict-txn-core, postgres, r2d2, r2d2_postgres, serde, thiserror
// ============================================================================

//! ## Overview
//! [`PostgresLedger`] owns an r2d2 connection pool and hands out
//! [`PostgresLedgerSession`]s. Sessions lock ledger rows with
//! `SELECT ... FOR UPDATE`, so callers for different query ids never block
//! each other. Lock waits are bounded by the connection's `lock_timeout`; a
//! timeout surfaces as SQLSTATE `55P03`, which [`postgres_classifier`] maps to
//! a lock conflict.
//!
//! Invariants:
//! - Each session holds one pooled connection for its lifetime.
//! - Error messages never embed caller SQL text.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod ledger;
pub mod session;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use ledger::PostgresLedger;
pub use ledger::PostgresLedgerConfig;
pub use ledger::PostgresLedgerError;
pub use session::POSTGRES_CONFLICT_CODES;
pub use session::PostgresLedgerSession;
pub use session::postgres_classifier;
