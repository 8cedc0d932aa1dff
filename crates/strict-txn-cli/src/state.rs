// crates/strict-txn-cli/src/state.rs
// ============================================================================
// Module: Query Id State File
// Description: Persists the generated query id between job attempts.
// Purpose: Let scheduler retries of one job reuse the same query id.
// Dependencies: serde, serde_json, strict-txn-core, thiserror
// ============================================================================

//! ## Overview
//! The state file holds `{"query_id": "..."}`. An existing file is reused; a
//! missing file gets a freshly generated id, written to a unique temporary
//! sibling and hard-linked into place before the job runs. The link fails if
//! another process published first, in which case that process's id wins.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;
use strict_txn_core::QueryId;
use thiserror::Error;

use crate::ReadLimitError;
use crate::read_bytes_with_limit;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Maximum size of a state file.
const MAX_STATE_FILE_BYTES: usize = 4 * 1024;
/// Attempts to allocate a unique temporary file name.
const TEMP_ATTEMPTS: usize = 16;
/// Per-process counter for temporary file names.
static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Serialized state file contents.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueryState {
    /// Persisted query identifier.
    query_id: QueryId,
}

/// State file errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(String),
    /// State file exceeds the size limit.
    #[error("state file exceeds {0} bytes")]
    TooLarge(usize),
    /// State file contents are not a valid query state.
    #[error("malformed state file: {0}")]
    Malformed(String),
}

// ============================================================================
// SECTION: Operations
// ============================================================================

/// Returns the persisted query id, creating the state file when absent.
///
/// # Errors
///
/// Returns [`StateError`] when the file cannot be read, parsed, or written.
pub fn load_or_create(path: &Path) -> Result<QueryId, StateError> {
    if path.exists() {
        return load(path);
    }
    let query_id = QueryId::generate();
    if publish(path, &query_id)? { Ok(query_id) } else { load(path) }
}

/// Reads the query id from an existing state file.
fn load(path: &Path) -> Result<QueryId, StateError> {
    let bytes = read_bytes_with_limit(path, MAX_STATE_FILE_BYTES).map_err(|err| match err {
        ReadLimitError::Io(error) => StateError::Io(error.to_string()),
        ReadLimitError::TooLarge {
            limit, ..
        } => StateError::TooLarge(limit),
    })?;
    let state: QueryState =
        serde_json::from_slice(&bytes).map_err(|err| StateError::Malformed(err.to_string()))?;
    Ok(state.query_id)
}

/// Publishes the query id unless a state file already exists.
///
/// Returns `false` when another writer published first.
fn publish(path: &Path, query_id: &QueryId) -> Result<bool, StateError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|err| StateError::Io(err.to_string()))?;
    }
    let bytes = serde_json::to_vec(&QueryState {
        query_id: query_id.clone(),
    })
    .map_err(|err| StateError::Malformed(err.to_string()))?;
    let (temp, mut file) = create_temp(path)?;
    let written = file.write_all(&bytes).and_then(|()| file.sync_all());
    drop(file);
    let linked = written.and_then(|()| fs::hard_link(&temp, path));
    let _ = fs::remove_file(&temp);
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(StateError::Io(err.to_string())),
    }
}

/// Creates a unique temporary sibling of `path`.
fn create_temp(path: &Path) -> Result<(PathBuf, fs::File), StateError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| StateError::Io("state path does not include a file name".to_string()))?;
    for _ in 0 .. TEMP_ATTEMPTS {
        let attempt = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp = path.with_file_name(format!(
            ".{file_name}.tmp.{}.{attempt}",
            std::process::id()
        ));
        match OpenOptions::new().write(true).create_new(true).open(&temp) {
            Ok(file) => return Ok((temp, file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => return Err(StateError::Io(err.to_string())),
        }
    }
    Err(StateError::Io("failed to allocate a temporary state file".to_string()))
}
