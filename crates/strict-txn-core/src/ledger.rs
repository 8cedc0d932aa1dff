// crates/strict-txn-core/src/ledger.rs
// ============================================================================
// Module: Status Ledger Schema
// Description: Logical shape of the auxiliary status table and its keys.
// Purpose: Provide validated query identifiers, table references, and row views.
// Dependencies: serde, time, uuid
// ============================================================================

//! ## Overview
//! The status ledger holds one row per logical query identifier:
//! `(query_id, created_at, completed_at)`. A null `completed_at` means the
//! wrapped action has not been confirmed complete. Backends own the SQL text;
//! this module only defines the logical shape shared by every backend.
//!
//! ## Invariants
//! - At most one row exists per `query_id` (primary key in every backend).
//! - `completed_at`, once set, never changes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::StrictTxnError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum query identifier length in bytes (matches a `varchar(50)` column).
pub const MAX_QUERY_ID_LENGTH: usize = 50;
/// Maximum length of a single SQL identifier.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;
/// Default ledger table name.
pub const DEFAULT_LEDGER_TABLE: &str = "__strict_txn_status";

// ============================================================================
// SECTION: Query Identifier
// ============================================================================

/// Logical query identifier supplied once per logical task attempt.
///
/// # Invariants
/// - Non-empty, at most [`MAX_QUERY_ID_LENGTH`] bytes, no control characters.
/// - Opaque: no normalization is applied beyond validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct QueryId(String);

impl QueryId {
    /// Creates a validated query identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StrictTxnError::Invalid`] when the identifier is empty, too
    /// long, or contains control characters.
    pub fn new(id: impl Into<String>) -> Result<Self, StrictTxnError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(StrictTxnError::Invalid("query_id must be non-empty".to_string()));
        }
        if id.len() > MAX_QUERY_ID_LENGTH {
            return Err(StrictTxnError::Invalid(format!(
                "query_id exceeds {MAX_QUERY_ID_LENGTH} bytes"
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(StrictTxnError::Invalid(
                "query_id must not contain control characters".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generates a fresh random identifier (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for QueryId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// SECTION: Table Reference
// ============================================================================

/// Reference to the ledger table, optionally schema-qualified.
///
/// # Invariants
/// - Both parts pass [`validate_identifier`]; rendering never needs escaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReference {
    /// Optional schema (or attached database) name.
    schema: Option<String>,
    /// Table name.
    name: String,
}

impl TableReference {
    /// Creates a validated table reference.
    ///
    /// # Errors
    ///
    /// Returns [`StrictTxnError::Invalid`] when either identifier is invalid.
    pub fn new(schema: Option<&str>, name: &str) -> Result<Self, StrictTxnError> {
        if let Some(schema) = schema {
            validate_identifier("ledger schema", schema)?;
        }
        validate_identifier("ledger table", name)?;
        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    /// Returns the schema part, when present.
    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Returns the table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renders the reference as a double-quoted SQL identifier.
    #[must_use]
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{schema}\".\"{}\"", self.name),
            None => format!("\"{}\"", self.name),
        }
    }
}

impl Default for TableReference {
    fn default() -> Self {
        Self {
            schema: None,
            name: DEFAULT_LEDGER_TABLE.to_string(),
        }
    }
}

impl fmt::Display for TableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Validates a bare SQL identifier.
///
/// Accepts ASCII letters, digits, and underscores; the first character must
/// not be a digit.
///
/// # Errors
///
/// Returns [`StrictTxnError::Invalid`] naming `field` when the identifier is
/// rejected.
pub fn validate_identifier(field: &str, value: &str) -> Result<(), StrictTxnError> {
    let Some(first) = value.chars().next() else {
        return Err(StrictTxnError::Invalid(format!("{field} must be non-empty")));
    };
    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Err(StrictTxnError::Invalid(format!(
            "{field} exceeds {MAX_IDENTIFIER_LENGTH} bytes"
        )));
    }
    if first.is_ascii_digit() {
        return Err(StrictTxnError::Invalid(format!("{field} must not start with a digit")));
    }
    if !value.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Err(StrictTxnError::Invalid(format!(
            "{field} may only contain ASCII letters, digits, and underscores"
        )));
    }
    Ok(())
}

// ============================================================================
// SECTION: Row Views
// ============================================================================

/// Status observed while holding the ledger row lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRow {
    /// No row exists for the query identifier.
    Absent,
    /// Row exists and `completed_at` is null.
    Pending,
    /// Row exists and the action completed at the given unix milliseconds.
    Completed {
        /// Completion time in unix milliseconds.
        completed_at_ms: i64,
    },
}

/// Full ledger row used for read-only inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    /// Query identifier.
    pub query_id: QueryId,
    /// Row insertion time.
    pub created_at: OffsetDateTime,
    /// Completion time, when the wrapped action finished.
    pub completed_at: Option<OffsetDateTime>,
}

impl LedgerRow {
    /// Builds a row view from stored unix millisecond columns.
    ///
    /// # Errors
    ///
    /// Returns [`StrictTxnError::Corrupt`] when the stored values are out of
    /// range or the identifier fails validation.
    pub fn from_stored(
        query_id: String,
        created_at_ms: i64,
        completed_at_ms: Option<i64>,
    ) -> Result<Self, StrictTxnError> {
        let query_id = QueryId::new(query_id)
            .map_err(|err| StrictTxnError::Corrupt(format!("stored query_id invalid: {err}")))?;
        let created_at = crate::clock::from_unix_millis(created_at_ms)?;
        let completed_at = completed_at_ms.map(crate::clock::from_unix_millis).transpose()?;
        Ok(Self {
            query_id,
            created_at,
            completed_at,
        })
    }

    /// Returns true when the wrapped action is recorded as complete.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
