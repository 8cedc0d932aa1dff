// crates/strict-txn-core/src/cleanup.rs
// ============================================================================
// Module: Ledger Cleanup
// Description: Retention-based deletion of completed ledger rows.
// Purpose: Bound ledger growth without touching pending rows.
// Dependencies: crate::session, crate::clock
// ============================================================================

//! ## Overview
//! Cleanup deletes rows whose `completed_at` is older than `now - retention`.
//! Rows without a completion time are never deleted: they may belong to an
//! in-flight or crashed execution that still needs to be retried.
//!
//! [`cleanup_expired`] runs one pass. [`CleanupWorker`] runs passes on a
//! background thread until its [`CleanupHandle`] is stopped.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::clock::LedgerClock;
use crate::clock::duration_millis;
use crate::error::StrictTxnError;
use crate::events::LedgerEvent;
use crate::events::LedgerObserver;
use crate::protocol::surface_error;
use crate::session::LedgerSession;

// ============================================================================
// SECTION: One-Shot Cleanup
// ============================================================================

/// Deletes completed ledger rows older than `retention`.
///
/// # Errors
///
/// Returns [`StrictTxnError::LockConflict`] when the table is locked,
/// [`StrictTxnError::Schema`] when it does not exist, and
/// [`StrictTxnError::Database`] for other delete failures.
pub fn cleanup_expired<S: LedgerSession + ?Sized>(
    session: &mut S,
    clock: &dyn LedgerClock,
    observer: &dyn LedgerObserver,
    retention: Duration,
) -> Result<u64, StrictTxnError> {
    let cutoff_ms = clock.now_ms().saturating_sub(duration_millis(retention));
    match session.delete_completed_before(cutoff_ms) {
        Ok(deleted) => {
            observer.record(&LedgerEvent::CleanupCompleted {
                deleted,
                cutoff_ms,
            });
            Ok(deleted)
        }
        Err(err) => Err(surface_error(
            session.conflict_classifier(),
            observer,
            "",
            err,
        )),
    }
}

// ============================================================================
// SECTION: Background Worker
// ============================================================================

/// Schedule for periodic cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupSchedule {
    /// Delay between passes.
    pub interval: Duration,
    /// Retention applied on each pass.
    pub retention: Duration,
}

/// Spawns periodic cleanup on a dedicated thread.
pub struct CleanupWorker;

impl CleanupWorker {
    /// Starts the worker. The first pass runs immediately.
    ///
    /// Pass failures are reported as [`LedgerEvent::CleanupFailed`] and do
    /// not stop the worker.
    ///
    /// # Errors
    ///
    /// Returns [`std::io::Error`] when the thread cannot be spawned.
    pub fn spawn<S>(
        mut session: S,
        schedule: CleanupSchedule,
        clock: Arc<dyn LedgerClock>,
        observer: Arc<dyn LedgerObserver>,
    ) -> std::io::Result<CleanupHandle>
    where
        S: LedgerSession + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = thread::Builder::new().name("strict-txn-cleanup".to_string()).spawn(
            move || {
                let mut passes = 0_u64;
                loop {
                    if let Err(err) = cleanup_expired(
                        &mut session,
                        clock.as_ref(),
                        observer.as_ref(),
                        schedule.retention,
                    ) {
                        observer.record(&LedgerEvent::CleanupFailed {
                            message: err.to_string(),
                        });
                    }
                    passes += 1;
                    match stop_rx.recv_timeout(schedule.interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                passes
            },
        )?;
        Ok(CleanupHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// Handle controlling a running [`CleanupWorker`].
pub struct CleanupHandle {
    /// Stop signal sender.
    stop_tx: Option<mpsc::Sender<()>>,
    /// Worker thread.
    thread: Option<JoinHandle<u64>>,
}

impl CleanupHandle {
    /// Stops the worker and returns the number of completed passes.
    #[must_use]
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    /// Signals the worker and joins it.
    fn shutdown(&mut self) -> u64 {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.thread.take().map_or(0, |thread| thread.join().unwrap_or(0))
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
