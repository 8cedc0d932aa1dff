// crates/strict-txn-cli/src/main.rs
// ============================================================================
// Module: Strict Transaction CLI Entry Point
// Description: Command dispatcher for ledger administration and SQL jobs.
// Purpose: Run SQL exactly once from schedulers and scripts.
// Dependencies: clap, serde, serde_json, strict-txn-config, strict-txn-core, thiserror, time
// ============================================================================

//! ## Overview
//! `strict-txn` loads `strict-txn.toml`, opens a ledger session on the
//! configured database, and runs one command. Results are written to stdout
//! as single-line JSON. Protocol events go to stderr as JSON lines when
//! `--log json` is set.
//!
//! Exit codes: `0` on success, `1` on failure, `75` when the final error is
//! retryable so host schedulers can re-invoke the same job.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod state;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::ArgAction;
use clap::ArgGroup;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use serde::Serialize;
use strict_txn_config::BoxedLedgerSession;
use strict_txn_config::StrictTxnConfig;
use strict_txn_core::JsonLineObserver;
use strict_txn_core::LedgerObserver;
use strict_txn_core::LedgerRow;
use strict_txn_core::LedgerSession;
use strict_txn_core::NoopObserver;
use strict_txn_core::QueryId;
use strict_txn_core::SqlJob;
use strict_txn_core::SqlJobOperator;
use strict_txn_core::StrictTransaction;
use strict_txn_core::StrictTxnError;
use strict_txn_core::TransactionMode;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum size of a SQL input file.
const MAX_SQL_BYTES: usize = 1024 * 1024;
/// Exit code for failures a scheduler should retry (`EX_TEMPFAIL`).
const EXIT_TEMPFAIL: u8 = 75;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "strict-txn", version, disable_help_subcommand = true)]
struct Cli {
    /// Optional config file path (defaults to strict-txn.toml or `STRICT_TXN_CONFIG`).
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Protocol event logging on stderr.
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = LogFormat::Off, global = true)]
    log: LogFormat,
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Event log output formats.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    /// One JSON object per event on stderr.
    Json,
    /// No event output.
    Off,
}

/// Supported CLI subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the ledger table if it does not exist.
    Prepare,
    /// Run SQL at most once per query id.
    Run(RunCommand),
    /// Delete completed ledger rows older than the retention.
    Cleanup(CleanupCommand),
    /// Show the ledger row for a query id.
    Status(StatusCommand),
    /// Configuration utilities.
    Config {
        /// Selected config subcommand.
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

/// Arguments for the `run` command.
#[derive(Args, Debug)]
#[command(group(ArgGroup::new("identity").required(true).args(["query_id", "state_file"])))]
#[command(group(ArgGroup::new("source").required(true).args(["sql", "file"])))]
struct RunCommand {
    /// Query identifier for this logical execution.
    #[arg(long, value_name = "ID")]
    query_id: Option<String>,
    /// File that persists the query identifier across retries.
    #[arg(long, value_name = "PATH")]
    state_file: Option<PathBuf>,
    /// SQL text to execute.
    #[arg(long, value_name = "SQL")]
    sql: Option<String>,
    /// File containing the SQL to execute.
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
    /// Run in a plain transaction without the ledger.
    #[arg(long, action = ArgAction::SetTrue)]
    no_strict: bool,
}

/// Arguments for the `cleanup` command.
#[derive(Args, Debug)]
struct CleanupCommand {
    /// Retention in seconds (defaults to `ledger.cleanup_retention_secs`).
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1 ..))]
    retention_secs: Option<u64>,
}

/// Arguments for the `status` command.
#[derive(Args, Debug)]
struct StatusCommand {
    /// Query identifier to inspect.
    #[arg(long, value_name = "ID")]
    query_id: String,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Load and validate the configuration.
    Validate,
}

// ============================================================================
// SECTION: Output Types
// ============================================================================

/// Output of the `prepare` command.
#[derive(Debug, Serialize)]
struct PrepareOutput {
    /// Prepared ledger table.
    table: String,
}

/// Output of the `cleanup` command.
#[derive(Debug, Serialize)]
struct CleanupOutput {
    /// Rows deleted.
    deleted: u64,
}

/// Ledger row rendered for the `status` command.
#[derive(Debug, Serialize)]
struct StatusOutput {
    /// Query identifier.
    query_id: String,
    /// Row insertion time (RFC 3339).
    created_at: String,
    /// Completion time (RFC 3339), when completed.
    completed_at: Option<String>,
}

/// Output of the `config validate` command.
#[derive(Debug, Serialize)]
struct ValidateOutput {
    /// Always true when printed.
    valid: bool,
    /// Configured backend.
    database: &'static str,
    /// Configured ledger table.
    table: String,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI error carrying the message and whether a retry may succeed.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
    /// Whether the failure is transient.
    retryable: bool,
}

impl CliError {
    /// Constructs a non-retryable error.
    const fn new(message: String) -> Self {
        Self {
            message,
            retryable: false,
        }
    }

    /// Maps a protocol error, keeping its retryability.
    fn from_protocol(context: &str, err: &StrictTxnError) -> Self {
        Self {
            message: format!("{context}: {err}"),
            retryable: err.is_retryable(),
        }
    }

    /// Returns the numeric exit status for this error.
    const fn exit_status(&self) -> u8 {
        if self.retryable { EXIT_TEMPFAIL } else { 1 }
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => emit_error(&err),
    }
}

/// Executes the CLI command dispatcher.
fn run(cli: Cli) -> CliResult<ExitCode> {
    let config = StrictTxnConfig::load(cli.config.as_deref())
        .map_err(|err| CliError::new(format!("failed to load config: {err}")))?;
    let observer = build_observer(cli.log);
    match cli.command {
        Commands::Prepare => command_prepare(&config, observer),
        Commands::Run(command) => command_run(&config, observer, &command),
        Commands::Cleanup(command) => command_cleanup(&config, observer, &command),
        Commands::Status(command) => command_status(&config, observer, &command),
        Commands::Config {
            command: ConfigCommand::Validate,
        } => command_config_validate(&config),
    }
}

/// Builds the event observer for the selected log format.
fn build_observer(format: LogFormat) -> Arc<dyn LedgerObserver> {
    match format {
        LogFormat::Json => Arc::new(JsonLineObserver::new(std::io::stderr())),
        LogFormat::Off => Arc::new(NoopObserver),
    }
}

/// Opens a configured transaction helper.
fn open_transaction(
    config: &StrictTxnConfig,
    observer: Arc<dyn LedgerObserver>,
) -> CliResult<StrictTransaction<BoxedLedgerSession>> {
    config
        .strict_transaction(observer)
        .map_err(|err| CliError::new(format!("failed to open ledger: {err}")))
}

// ============================================================================
// SECTION: Commands
// ============================================================================

/// Executes the `prepare` command.
fn command_prepare(
    config: &StrictTxnConfig,
    observer: Arc<dyn LedgerObserver>,
) -> CliResult<ExitCode> {
    let mut txn = open_transaction(config, observer)?;
    txn.prepare().map_err(|err| CliError::from_protocol("prepare failed", &err))?;
    write_json(&PrepareOutput {
        table: txn.session().table().to_string(),
    })?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `run` command.
fn command_run(
    config: &StrictTxnConfig,
    observer: Arc<dyn LedgerObserver>,
    command: &RunCommand,
) -> CliResult<ExitCode> {
    let sql = resolve_sql(command)?;
    let query_id = resolve_query_id(command)?;
    let mode = if command.no_strict { TransactionMode::Plain } else { TransactionMode::Strict };
    let txn = open_transaction(config, observer)?;
    let mut operator = SqlJobOperator::new(txn, config.job_settings());
    let report = operator
        .run(&SqlJob {
            query_id,
            sql,
            mode,
        })
        .map_err(|err| CliError::from_protocol("run failed", &err))?;
    write_json(&report)?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `cleanup` command.
fn command_cleanup(
    config: &StrictTxnConfig,
    observer: Arc<dyn LedgerObserver>,
    command: &CleanupCommand,
) -> CliResult<ExitCode> {
    let retention =
        command.retention_secs.map_or_else(|| config.cleanup_retention(), Duration::from_secs);
    let mut txn = open_transaction(config, observer)?;
    let deleted =
        txn.cleanup(retention).map_err(|err| CliError::from_protocol("cleanup failed", &err))?;
    write_json(&CleanupOutput {
        deleted,
    })?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `status` command.
fn command_status(
    config: &StrictTxnConfig,
    observer: Arc<dyn LedgerObserver>,
    command: &StatusCommand,
) -> CliResult<ExitCode> {
    let query_id = parse_query_id(&command.query_id)?;
    let mut txn = open_transaction(config, observer)?;
    let row =
        txn.status(&query_id).map_err(|err| CliError::from_protocol("status failed", &err))?;
    let output = row.as_ref().map(status_output).transpose()?;
    write_json(&output)?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `config validate` command.
fn command_config_validate(config: &StrictTxnConfig) -> CliResult<ExitCode> {
    let table = config
        .table_reference()
        .map_err(|err| CliError::new(format!("failed to load config: {err}")))?;
    write_json(&ValidateOutput {
        valid: true,
        database: config.database.label(),
        table: table.to_string(),
    })?;
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Input Helpers
// ============================================================================

/// Parses a query identifier argument.
fn parse_query_id(value: &str) -> CliResult<QueryId> {
    QueryId::new(value).map_err(|err| CliError::new(format!("invalid query id: {err}")))
}

/// Resolves the query identifier from `--query-id` or `--state-file`.
fn resolve_query_id(command: &RunCommand) -> CliResult<QueryId> {
    match (&command.query_id, &command.state_file) {
        (Some(value), _) => parse_query_id(value),
        (None, Some(path)) => state::load_or_create(path)
            .map_err(|err| CliError::new(format!("query id state file: {err}"))),
        (None, None) => {
            Err(CliError::new("one of --query-id or --state-file is required".to_string()))
        }
    }
}

/// Resolves SQL text from `--sql` or `--file`.
fn resolve_sql(command: &RunCommand) -> CliResult<String> {
    if let Some(sql) = &command.sql {
        return Ok(sql.clone());
    }
    let Some(path) = &command.file else {
        return Err(CliError::new("one of --sql or --file is required".to_string()));
    };
    let bytes = read_bytes_with_limit(path, MAX_SQL_BYTES).map_err(|err| match err {
        ReadLimitError::Io(error) => CliError::new(format!("failed to read sql file: {error}")),
        ReadLimitError::TooLarge {
            size,
            limit,
        } => CliError::new(format!("sql file is {size} bytes, limit is {limit}")),
    })?;
    String::from_utf8(bytes).map_err(|_| CliError::new("sql file must be utf-8".to_string()))
}

/// Errors produced while reading bounded input files.
#[derive(Debug)]
enum ReadLimitError {
    /// File I/O failure.
    Io(std::io::Error),
    /// File size exceeds the configured limit.
    TooLarge {
        /// Actual size in bytes.
        size: u64,
        /// Allowed limit in bytes.
        limit: usize,
    },
}

/// Reads a file from disk while enforcing a hard size limit.
fn read_bytes_with_limit(path: &Path, max_bytes: usize) -> Result<Vec<u8>, ReadLimitError> {
    let file = File::open(path).map_err(ReadLimitError::Io)?;
    let size = file.metadata().map_err(ReadLimitError::Io)?.len();
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX);
    if size > limit {
        return Err(ReadLimitError::TooLarge {
            size,
            limit: max_bytes,
        });
    }
    let mut bytes = Vec::new();
    file.take(limit.saturating_add(1)).read_to_end(&mut bytes).map_err(ReadLimitError::Io)?;
    if bytes.len() > max_bytes {
        return Err(ReadLimitError::TooLarge {
            size: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
            limit: max_bytes,
        });
    }
    Ok(bytes)
}

// ============================================================================
// SECTION: Output Helpers
// ============================================================================

/// Renders a ledger row with RFC 3339 timestamps.
fn status_output(row: &LedgerRow) -> CliResult<StatusOutput> {
    let render = |value: time::OffsetDateTime| {
        value
            .format(&Rfc3339)
            .map_err(|err| CliError::new(format!("failed to format timestamp: {err}")))
    };
    Ok(StatusOutput {
        query_id: row.query_id.to_string(),
        created_at: render(row.created_at)?,
        completed_at: row.completed_at.map(render).transpose()?,
    })
}

/// Writes a value as one JSON line on stdout.
fn write_json<T: Serialize>(value: &T) -> CliResult<()> {
    let line = serde_json::to_string(value)
        .map_err(|err| CliError::new(format!("failed to encode output: {err}")))?;
    write_stdout_line(&line)
        .map_err(|err| CliError::new(format!("failed to write stdout: {err}")))
}

/// Writes a line to stdout.
fn write_stdout_line(message: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(&mut stdout, "{message}")
}

/// Writes a line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr().lock();
    writeln!(&mut stderr, "{message}")
}

/// Emits an error message to stderr and returns its exit code.
fn emit_error(err: &CliError) -> ExitCode {
    let _ = write_stderr_line(&err.to_string());
    ExitCode::from(err.exit_status())
}
