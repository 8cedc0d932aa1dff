// crates/strict-txn-core/src/clock.rs
// ============================================================================
// Module: Ledger Clock
// Description: Clock abstraction and unix millisecond conversions.
// Purpose: Keep ledger timestamps explicit and replaceable in tests.
// Dependencies: time
// ============================================================================

//! ## Overview
//! The protocol never reads wall-clock time directly; it asks a
//! [`LedgerClock`]. Ledger columns store signed unix milliseconds so every
//! backend compares timestamps the same way.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use time::OffsetDateTime;

use crate::error::StrictTxnError;

// ============================================================================
// SECTION: Clock
// ============================================================================

/// Source of the current time for ledger writes and cleanup cutoffs.
pub trait LedgerClock: Send + Sync {
    /// Returns the current time in unix milliseconds.
    fn now_ms(&self) -> i64;
}

/// Wall-clock time source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl LedgerClock for SystemClock {
    fn now_ms(&self) -> i64 {
        unix_millis(OffsetDateTime::now_utc())
    }
}

/// Manually controlled clock.
///
/// # Invariants
/// - Time only moves when [`FixedClock::set`] or [`FixedClock::advance`] is called.
#[derive(Debug, Default)]
pub struct FixedClock {
    /// Current time in unix milliseconds.
    now_ms: AtomicI64,
}

impl FixedClock {
    /// Creates a clock frozen at `now_ms`.
    #[must_use]
    pub const fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    /// Sets the current time.
    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.now_ms.fetch_add(duration_millis(delta), Ordering::SeqCst);
    }
}

impl LedgerClock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

// ============================================================================
// SECTION: Conversions
// ============================================================================

/// Converts a timestamp to unix milliseconds, saturating at the `i64` range.
#[must_use]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    let millis = value.unix_timestamp_nanos() / 1_000_000;
    i64::try_from(millis).unwrap_or(if millis < 0 { i64::MIN } else { i64::MAX })
}

/// Converts stored unix milliseconds back into a timestamp.
///
/// # Errors
///
/// Returns [`StrictTxnError::Corrupt`] when the value is outside the
/// representable date range.
pub fn from_unix_millis(millis: i64) -> Result<OffsetDateTime, StrictTxnError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| StrictTxnError::Corrupt(format!("stored timestamp out of range: {err}")))
}

/// Returns `duration` in whole milliseconds, saturating at `i64::MAX`.
#[must_use]
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// ============================================================================
// SECTION: Tests
// ============================================================================
