// crates/strict-txn-postgres/tests/postgres_ledger.rs
// ============================================================================
// Module: Postgres Ledger Tests
// Description: Configuration, SQL text, and live protocol tests for Postgres.
// Purpose: Validate the backend offline and against a live server when set.
// ============================================================================

//! ## Overview
//! Offline tests cover configuration validation, connection options, and
//! rendered SQL. Live tests run only when `STRICT_TXN_POSTGRES_URL` names a
//! reachable server; each test uses its own ledger table.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::print_stderr,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::sync::Arc;
use std::sync::Barrier;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use strict_txn_core::ActionError;
use strict_txn_core::FixedClock;
use strict_txn_core::LedgerSession;
use strict_txn_core::QueryId;
use strict_txn_core::RunOutcome;
use strict_txn_core::StatementExecutor;
use strict_txn_core::StrictTransaction;
use strict_txn_core::StrictTxnError;
use strict_txn_core::TableReference;
use strict_txn_postgres::PostgresLedger;
use strict_txn_postgres::PostgresLedgerConfig;
use strict_txn_postgres::PostgresLedgerError;
use strict_txn_postgres::session::LedgerSql;

// ============================================================================
// SECTION: Offline Tests
// ============================================================================

#[test]
fn default_config_is_valid() {
    PostgresLedgerConfig::default().validate().unwrap();
}

#[test]
fn invalid_configs_are_rejected() {
    let cases = [
        PostgresLedgerConfig {
            connection: "  ".to_string(),
            ..PostgresLedgerConfig::default()
        },
        PostgresLedgerConfig {
            max_connections: 0,
            ..PostgresLedgerConfig::default()
        },
        PostgresLedgerConfig {
            connect_timeout_ms: 0,
            ..PostgresLedgerConfig::default()
        },
        PostgresLedgerConfig {
            lock_timeout_ms: 0,
            ..PostgresLedgerConfig::default()
        },
    ];
    for config in cases {
        assert!(matches!(config.validate(), Err(PostgresLedgerError::Invalid(_))), "{config:?}");
    }
}

#[test]
fn zero_statement_timeout_is_allowed() {
    let config = PostgresLedgerConfig {
        statement_timeout_ms: 0,
        ..PostgresLedgerConfig::default()
    };
    config.validate().unwrap();
}

#[test]
fn server_options_carry_both_timeouts() {
    let config = PostgresLedgerConfig {
        lock_timeout_ms: 1_500,
        statement_timeout_ms: 60_000,
        ..PostgresLedgerConfig::default()
    };
    assert_eq!(config.server_options(), "-c lock_timeout=1500 -c statement_timeout=60000");
    let client = config.client_config().unwrap();
    assert_eq!(client.get_options(), Some("-c lock_timeout=1500 -c statement_timeout=60000"));
    assert_eq!(client.get_connect_timeout(), Some(&Duration::from_millis(5_000)));
}

#[test]
fn malformed_connection_string_fails_before_connecting() {
    let config = PostgresLedgerConfig {
        connection: "postgres://user@host:notaport/db".to_string(),
        ..PostgresLedgerConfig::default()
    };
    let Err(err) = PostgresLedger::connect(&config, TableReference::default()) else {
        panic!("malformed connection string accepted");
    };
    assert!(matches!(err, PostgresLedgerError::Invalid(_)));
}

#[test]
fn rendered_sql_targets_the_configured_table() {
    let sql = LedgerSql::new(&TableReference::default());
    assert_eq!(
        sql.insert,
        "INSERT INTO \"__strict_txn_status\" (query_id, created_at, completed_at) VALUES ($1, \
         $2, NULL)"
    );
    assert!(sql.complete.ends_with("WHERE query_id = $2 AND completed_at IS NULL"));
    assert!(sql.delete.contains("completed_at IS NOT NULL AND completed_at < $1"));
}

// ============================================================================
// SECTION: Live Fixtures
// ============================================================================

/// Environment variable naming a live Postgres server for integration tests.
const POSTGRES_URL_ENV: &str = "STRICT_TXN_POSTGRES_URL";

static TABLE_COUNTER: AtomicU32 = AtomicU32::new(0);

struct LiveLedger {
    ledger: PostgresLedger,
    counter_table: String,
}

fn live_ledger(lock_timeout_ms: u64) -> Option<LiveLedger> {
    let Ok(url) = std::env::var(POSTGRES_URL_ENV) else {
        eprintln!("skipping live postgres test: {POSTGRES_URL_ENV} not set");
        return None;
    };
    let suffix = format!(
        "{}_{}",
        std::process::id(),
        TABLE_COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    let table = TableReference::new(None, &format!("strict_txn_ledger_{suffix}")).unwrap();
    let config = PostgresLedgerConfig {
        connection: url,
        max_connections: 8,
        lock_timeout_ms,
        ..PostgresLedgerConfig::default()
    };
    let ledger = PostgresLedger::connect(&config, table).unwrap();
    let counter_table = format!("strict_txn_counter_{suffix}");
    let mut session = ledger.session().unwrap();
    session
        .execute_statement(&format!(
            "DROP TABLE IF EXISTS {counter_table}; CREATE TABLE {counter_table} (n BIGINT NOT \
             NULL); INSERT INTO {counter_table} (n) VALUES (0);"
        ))
        .unwrap();
    StrictTransaction::new(session).prepare().unwrap();
    Some(LiveLedger {
        ledger,
        counter_table,
    })
}

impl LiveLedger {
    fn counter(&self) -> i64 {
        let mut session = self.ledger.session().unwrap();
        let row = session
            .client_mut()
            .query_one(&format!("SELECT n FROM {}", self.counter_table), &[])
            .unwrap();
        row.get(0)
    }

    fn increment_sql(&self) -> String {
        format!("UPDATE {} SET n = n + 1", self.counter_table)
    }
}

impl Drop for LiveLedger {
    fn drop(&mut self) {
        if let Ok(mut session) = self.ledger.session() {
            let _ = session.execute_statement(&format!(
                "DROP TABLE IF EXISTS {}; DROP TABLE IF EXISTS {}",
                self.counter_table,
                self.ledger.table().quoted()
            ));
        }
    }
}

fn qid(value: &str) -> QueryId {
    QueryId::new(value).unwrap()
}

// ============================================================================
// SECTION: Live Tests
// ============================================================================

#[test]
fn live_counter_scenario_runs_once_per_query_id() {
    let Some(live) = live_ledger(5_000) else {
        return;
    };
    let sql = live.increment_sql();
    let increment = |executor: &mut dyn StatementExecutor| -> Result<(), ActionError> {
        executor.execute_statement(&sql)?;
        Ok(())
    };
    let mut txn = StrictTransaction::new(live.ledger.session().unwrap());

    assert_eq!(txn.run_exactly_once(&qid("a1b2"), increment).unwrap(), RunOutcome::Ran);
    assert_eq!(txn.run_exactly_once(&qid("a1b2"), increment).unwrap(), RunOutcome::Skipped);
    assert_eq!(txn.run_exactly_once(&qid("c3d4"), increment).unwrap(), RunOutcome::Ran);
    drop(txn);
    assert_eq!(live.counter(), 2);
}

#[test]
fn live_concurrent_callers_run_once() {
    let Some(live) = live_ledger(30_000) else {
        return;
    };
    let live = Arc::new(live);
    let workers = 6;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0 .. workers)
        .map(|_| {
            let live = Arc::clone(&live);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let sql = live.increment_sql();
                let mut txn = StrictTransaction::new(live.ledger.session().unwrap());
                barrier.wait();
                txn.run_exactly_once(&qid("x"), |executor| {
                    thread::sleep(Duration::from_millis(200));
                    executor.execute_statement(&sql)?;
                    Ok(())
                })
                .unwrap()
            })
        })
        .collect();
    let outcomes: Vec<RunOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(outcomes.iter().filter(|o| **o == RunOutcome::Ran).count(), 1);
    assert_eq!(live.counter(), 1);
}

#[test]
fn live_lock_timeout_is_a_lock_conflict() {
    let Some(live) = live_ledger(200) else {
        return;
    };
    let mut holder = live.ledger.session().unwrap();
    holder.begin().unwrap();
    holder.insert_row(&qid("held"), 1).unwrap();
    holder.commit().unwrap();
    holder.begin().unwrap();
    holder.lock_row(&qid("held")).unwrap();

    let sql = live.increment_sql();
    let mut txn = StrictTransaction::new(live.ledger.session().unwrap());
    let err = txn
        .run_exactly_once(&qid("held"), |executor| {
            executor.execute_statement(&sql)?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, StrictTxnError::LockConflict { .. }));

    holder.rollback().unwrap();
    drop(holder);
    drop(txn);
    assert_eq!(live.counter(), 0);
}

#[test]
fn live_cleanup_keeps_pending_rows() {
    let Some(live) = live_ledger(5_000) else {
        return;
    };
    let now_ms = 1_700_000_000_000;
    let mut session = live.ledger.session().unwrap();
    session.begin().unwrap();
    session.insert_row(&qid("done-old"), 0).unwrap();
    session.mark_completed(&qid("done-old"), now_ms - 7_200_000).unwrap();
    session.insert_row(&qid("pending-old"), 0).unwrap();
    session.commit().unwrap();

    let mut txn = StrictTransaction::new(session).with_clock(Arc::new(FixedClock::new(now_ms)));
    assert_eq!(txn.cleanup(Duration::from_secs(3_600)).unwrap(), 1);
    assert!(txn.status(&qid("pending-old")).unwrap().is_some());
}
