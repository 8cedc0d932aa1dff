// crates/strict-txn-core/src/operator.rs
// ============================================================================
// Module: SQL Job Operator
// Description: Job-level wrapper running SQL text exactly once with retries.
// Purpose: Compose prepare, the exactly-once protocol, retry, and cleanup.
// Dependencies: crate::protocol, serde
// ============================================================================

//! ## Overview
//! [`SqlJobOperator`] is the orchestration-facing surface. A [`SqlJob`] names
//! a query id, the SQL to run, and a [`TransactionMode`]. Strict jobs ensure
//! the ledger exists, run through [`StrictTransaction::run_exactly_once`], and
//! prune old ledger rows afterwards. Plain jobs run the SQL in a single
//! transaction with no ledger bookkeeping.
//!
//! Retry is owned here, not by the protocol: the [`RetryPolicy`] decides
//! which surfaced errors re-invoke the whole call, with capped exponential
//! backoff between attempts.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ActionError;
use crate::error::StrictTxnError;
use crate::events::LedgerEvent;
use crate::events::LedgerObserver;
use crate::ledger::QueryId;
use crate::protocol::RunOutcome;
use crate::protocol::StrictTransaction;
use crate::protocol::rollback_after_failure;
use crate::protocol::surface_error;
use crate::session::LedgerSession;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default retention applied by post-run cleanup.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// SECTION: Job Types
// ============================================================================

/// Transaction handling for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Exactly-once execution through the status ledger.
    #[default]
    Strict,
    /// Single transaction, no ledger; re-runs execute again.
    Plain,
}

/// Unit of work submitted to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlJob {
    /// Stable identifier of this logical execution.
    pub query_id: QueryId,
    /// SQL text to execute.
    pub sql: String,
    /// Transaction handling.
    pub mode: TransactionMode,
}

/// Summary of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    /// Query identifier.
    pub query_id: QueryId,
    /// Transaction handling used.
    pub mode: TransactionMode,
    /// Whether the SQL ran or was skipped.
    pub outcome: RunOutcome,
    /// Number of attempts made (1-based).
    pub attempts: u32,
    /// Rows removed by post-run cleanup; `None` when cleanup did not run or failed.
    pub cleaned_up: Option<u64>,
}

// ============================================================================
// SECTION: Retry Policy
// ============================================================================

/// Caller-side retry policy for surfaced errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1).
    pub max_attempts: u32,
    /// Delay before the second attempt in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Whether action failures are retried in addition to contention errors.
    pub retry_action_failures: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            retry_action_failures: false,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            retry_action_failures: false,
        }
    }

    /// Returns the delay after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let factor = 1_u64 << shift;
        let delay = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    /// Returns true when `error` after attempt `attempt` should be retried.
    #[must_use]
    pub const fn should_retry(&self, error: &StrictTxnError, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        error.is_retryable()
            || (self.retry_action_failures && matches!(error, StrictTxnError::ActionFailure { .. }))
    }
}

// ============================================================================
// SECTION: Job Settings
// ============================================================================

/// Operator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSettings {
    /// Retention for post-run cleanup.
    pub retention: Duration,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Whether strict jobs prune the ledger after running.
    pub cleanup_after_run: bool,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            retry: RetryPolicy::default(),
            cleanup_after_run: true,
        }
    }
}

// ============================================================================
// SECTION: Operator
// ============================================================================

/// Function used to wait between attempts.
pub type Sleeper = Box<dyn Fn(Duration) + Send + Sync>;

/// Runs [`SqlJob`]s against one ledger session.
pub struct SqlJobOperator<S: LedgerSession> {
    /// Exactly-once helper owning the session.
    transaction: StrictTransaction<S>,
    /// Operator settings.
    settings: JobSettings,
    /// Backoff wait implementation.
    sleeper: Sleeper,
}

impl<S: LedgerSession> SqlJobOperator<S> {
    /// Creates an operator that sleeps on the current thread between attempts.
    pub fn new(transaction: StrictTransaction<S>, settings: JobSettings) -> Self {
        Self {
            transaction,
            settings,
            sleeper: Box::new(std::thread::sleep),
        }
    }

    /// Replaces the backoff wait implementation.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Returns the operator settings.
    pub const fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Returns the strict transaction helper.
    pub const fn transaction_mut(&mut self) -> &mut StrictTransaction<S> {
        &mut self.transaction
    }

    /// Consumes the operator and returns the strict transaction helper.
    pub fn into_transaction(self) -> StrictTransaction<S> {
        self.transaction
    }

    /// Runs `job`, retrying per policy.
    ///
    /// # Errors
    ///
    /// Returns [`StrictTxnError::Invalid`] for empty SQL and the last surfaced
    /// error once retries are exhausted or the error is not retryable.
    pub fn run(&mut self, job: &SqlJob) -> Result<JobReport, StrictTxnError> {
        if job.sql.trim().is_empty() {
            return Err(StrictTxnError::Invalid("sql must not be empty".to_string()));
        }
        let observer: Arc<dyn LedgerObserver> = self.transaction.observer();
        let mut attempt = 0_u32;
        let outcome = loop {
            attempt += 1;
            match self.run_once(job) {
                Ok(outcome) => break outcome,
                Err(err) if self.settings.retry.should_retry(&err, attempt) => {
                    let delay = self.settings.retry.backoff_for(attempt);
                    observer.record(&LedgerEvent::RetryScheduled {
                        query_id: job.query_id.to_string(),
                        attempt,
                        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error_kind: err.kind_label().to_string(),
                    });
                    (self.sleeper)(delay);
                }
                Err(err) => return Err(err),
            }
        };
        let cleaned_up = if job.mode == TransactionMode::Strict && self.settings.cleanup_after_run {
            self.transaction.cleanup_logged(self.settings.retention)
        } else {
            None
        };
        Ok(JobReport {
            query_id: job.query_id.clone(),
            mode: job.mode,
            outcome,
            attempts: attempt,
            cleaned_up,
        })
    }

    /// Runs one attempt of `job`.
    fn run_once(&mut self, job: &SqlJob) -> Result<RunOutcome, StrictTxnError> {
        let sql = job.sql.as_str();
        match job.mode {
            TransactionMode::Strict => {
                self.transaction.prepare()?;
                self.transaction.run_exactly_once(&job.query_id, |executor| {
                    executor.execute_statement(sql).map_err(ActionError::from)
                })
            }
            TransactionMode::Plain => self.run_plain(&job.query_id, sql),
        }
    }

    /// Runs `sql` in one transaction without touching the ledger.
    fn run_plain(&mut self, query_id: &QueryId, sql: &str) -> Result<RunOutcome, StrictTxnError> {
        let observer: Arc<dyn LedgerObserver> = self.transaction.observer();
        let session = self.transaction.session_mut();
        if let Err(err) = session.begin() {
            return Err(surface_error(
                session.conflict_classifier(),
                observer.as_ref(),
                query_id.as_str(),
                err,
            ));
        }
        if let Err(err) = session.execute_statement(sql) {
            rollback_after_failure(session, observer.as_ref(), query_id.as_str());
            return Err(StrictTxnError::ActionFailure {
                query_id: query_id.to_string(),
                source: ActionError::Statement(err),
            });
        }
        if let Err(err) = session.commit() {
            rollback_after_failure(session, observer.as_ref(), query_id.as_str());
            return Err(surface_error(
                session.conflict_classifier(),
                observer.as_ref(),
                query_id.as_str(),
                err,
            ));
        }
        Ok(RunOutcome::Ran)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
