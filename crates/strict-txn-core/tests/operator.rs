// crates/strict-txn-core/tests/operator.rs
// ============================================================================
// Module: SQL Job Operator Tests
// Description: Modes, outer retry, and post-run cleanup of SQL jobs.
// Purpose: Validate job-level orchestration over a scripted session.
// ============================================================================

//! ## Overview
//! Exercises [`SqlJobOperator`] with an injected sleeper so retry backoff is
//! observed without waiting.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions and helpers are permitted."
)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Op;
use common::ScriptedSession;
use common::SleepLog;
use common::broken_error;
use common::lock_error;
use common::qid;
use strict_txn_core::CollectingObserver;
use strict_txn_core::FixedClock;
use strict_txn_core::JobSettings;
use strict_txn_core::LedgerEvent;
use strict_txn_core::RetryPolicy;
use strict_txn_core::RunOutcome;
use strict_txn_core::SqlJob;
use strict_txn_core::SqlJobOperator;
use strict_txn_core::StrictTransaction;
use strict_txn_core::StrictTxnError;
use strict_txn_core::TransactionMode;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

const NOW_MS: i64 = 1_700_000_000_000;

struct Harness {
    operator: SqlJobOperator<ScriptedSession>,
    observer: Arc<CollectingObserver>,
    sleeps: SleepLog,
}

fn harness(session: ScriptedSession, settings: JobSettings) -> Harness {
    let observer = Arc::new(CollectingObserver::new());
    let sleeps = SleepLog::default();
    let txn = StrictTransaction::new(session)
        .with_clock(Arc::new(FixedClock::new(NOW_MS)))
        .with_observer(observer.clone());
    let operator = SqlJobOperator::new(txn, settings).with_sleeper(sleeps.sleeper());
    Harness {
        operator,
        observer,
        sleeps,
    }
}

fn job(query_id: &str, mode: TransactionMode) -> SqlJob {
    SqlJob {
        query_id: qid(query_id),
        sql: "UPDATE counter SET n = n + 1".to_string(),
        mode,
    }
}

// ============================================================================
// SECTION: Strict Mode
// ============================================================================

#[test]
fn strict_job_runs_once_then_skips() {
    let mut h = harness(ScriptedSession::default(), JobSettings::default());
    let ledger = h.operator.transaction_mut().session().ledger();

    let first = h.operator.run(&job("a1b2", TransactionMode::Strict)).unwrap();
    let second = h.operator.run(&job("a1b2", TransactionMode::Strict)).unwrap();

    assert_eq!(first.outcome, RunOutcome::Ran);
    assert_eq!(first.attempts, 1);
    assert_eq!(first.cleaned_up, Some(0));
    assert_eq!(second.outcome, RunOutcome::Skipped);
    assert!(ledger.created());
    assert_eq!(ledger.statements().len(), 1);
    assert_eq!(ledger.cutoffs(), vec![NOW_MS - 86_400_000, NOW_MS - 86_400_000]);
}

#[test]
fn lock_conflicts_are_retried_with_backoff() {
    let mut session = ScriptedSession::default();
    session.fail_on(Op::LockRow, lock_error());
    session.fail_on(Op::LockRow, lock_error());
    let mut h = harness(session, JobSettings::default());

    let report = h.operator.run(&job("busy", TransactionMode::Strict)).unwrap();

    assert_eq!(report.outcome, RunOutcome::Ran);
    assert_eq!(report.attempts, 3);
    assert_eq!(h.sleeps.delays(), vec![Duration::from_millis(200), Duration::from_millis(400)]);
    assert_eq!(
        h.observer.count(|event| matches!(
            event,
            LedgerEvent::RetryScheduled { error_kind, .. } if error_kind == "lock_conflict"
        )),
        2
    );
}

#[test]
fn retries_stop_at_max_attempts() {
    let mut session = ScriptedSession::default();
    for _ in 0 .. 3 {
        session.fail_on(Op::LockRow, lock_error());
    }
    let settings = JobSettings {
        retry: RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        },
        ..JobSettings::default()
    };
    let mut h = harness(session, settings);

    let err = h.operator.run(&job("busy", TransactionMode::Strict)).unwrap_err();

    assert!(matches!(err, StrictTxnError::LockConflict { .. }));
    assert_eq!(h.sleeps.delays().len(), 1);
}

#[test]
fn action_failures_are_not_retried_by_default() {
    let mut session = ScriptedSession::default();
    session.fail_on(Op::Execute, broken_error());
    let mut h = harness(session, JobSettings::default());

    let err = h.operator.run(&job("bad", TransactionMode::Strict)).unwrap_err();

    assert!(matches!(err, StrictTxnError::ActionFailure { .. }));
    assert!(h.sleeps.delays().is_empty());
}

#[test]
fn action_failures_retry_when_enabled() {
    let mut session = ScriptedSession::default();
    session.fail_on(Op::Execute, broken_error());
    let settings = JobSettings {
        retry: RetryPolicy {
            retry_action_failures: true,
            ..RetryPolicy::default()
        },
        ..JobSettings::default()
    };
    let mut h = harness(session, settings);
    let ledger = h.operator.transaction_mut().session().ledger();

    let report = h.operator.run(&job("flaky", TransactionMode::Strict)).unwrap();

    assert_eq!(report.outcome, RunOutcome::Ran);
    assert_eq!(report.attempts, 2);
    assert_eq!(ledger.statements().len(), 1);
}

#[test]
fn schema_errors_are_returned_immediately() {
    let mut session = ScriptedSession::default();
    session.fail_on(Op::Create, broken_error());
    let mut h = harness(session, JobSettings::default());

    let err = h.operator.run(&job("q", TransactionMode::Strict)).unwrap_err();

    assert!(matches!(err, StrictTxnError::Schema(_)));
    assert!(h.sleeps.delays().is_empty());
}

#[test]
fn cleanup_failure_does_not_fail_the_job() {
    let mut session = ScriptedSession::default();
    session.fail_on(Op::Delete, broken_error());
    let mut h = harness(session, JobSettings::default());

    let report = h.operator.run(&job("q", TransactionMode::Strict)).unwrap();

    assert_eq!(report.outcome, RunOutcome::Ran);
    assert_eq!(report.cleaned_up, None);
    assert_eq!(h.observer.count(|event| matches!(event, LedgerEvent::CleanupFailed { .. })), 1);
}

#[test]
fn cleanup_can_be_disabled() {
    let settings = JobSettings {
        cleanup_after_run: false,
        ..JobSettings::default()
    };
    let mut h = harness(ScriptedSession::default(), settings);
    let ledger = h.operator.transaction_mut().session().ledger();

    let report = h.operator.run(&job("q", TransactionMode::Strict)).unwrap();

    assert_eq!(report.cleaned_up, None);
    assert!(ledger.cutoffs().is_empty());
}

// ============================================================================
// SECTION: Plain Mode And Validation
// ============================================================================

#[test]
fn plain_jobs_run_every_time_without_ledger() {
    let mut h = harness(ScriptedSession::default(), JobSettings::default());
    let ledger = h.operator.transaction_mut().session().ledger();

    for _ in 0 .. 2 {
        let report = h.operator.run(&job("plain", TransactionMode::Plain)).unwrap();
        assert_eq!(report.outcome, RunOutcome::Ran);
        assert_eq!(report.mode, TransactionMode::Plain);
        assert_eq!(report.cleaned_up, None);
    }

    assert_eq!(ledger.statements().len(), 2);
    assert_eq!(ledger.row("plain"), None);
    assert!(!ledger.created());
}

#[test]
fn plain_statement_failure_rolls_back() {
    let mut session = ScriptedSession::default();
    session.fail_on(Op::Execute, broken_error());
    let mut h = harness(session, JobSettings::default());

    let err = h.operator.run(&job("plain", TransactionMode::Plain)).unwrap_err();

    assert!(matches!(err, StrictTxnError::ActionFailure { .. }));
    let session = h.operator.into_transaction().into_session();
    assert_eq!(session.calls(), &[Op::Begin, Op::Execute, Op::Rollback]);
}

#[test]
fn empty_sql_is_rejected() {
    let mut h = harness(ScriptedSession::default(), JobSettings::default());
    let mut empty = job("q", TransactionMode::Strict);
    empty.sql = "   ".to_string();

    let err = h.operator.run(&empty).unwrap_err();

    assert!(matches!(err, StrictTxnError::Invalid(_)));
    assert!(h.operator.transaction_mut().session().calls().is_empty());
}

#[test]
fn job_report_serializes_for_cli_output() {
    let mut h = harness(ScriptedSession::default(), JobSettings::default());
    let report = h.operator.run(&job("a1b2", TransactionMode::Strict)).unwrap();

    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["query_id"], "a1b2");
    assert_eq!(json["mode"], "strict");
    assert_eq!(json["outcome"], "ran");
    assert_eq!(json["attempts"], 1);
}
