// crates/strict-txn-core/src/classifier.rs
// ============================================================================
// Module: Conflict Classifier
// Description: Table-driven mapping from vendor error codes to protocol outcomes.
// Purpose: Keep all database-specific error knowledge out of the protocol.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! Backends report driver failures as [`DbError`] values carrying the raw
//! vendor code (a `SQLite` extended result code or a Postgres SQLSTATE). The
//! [`ConflictClassifier`] maps those codes to a [`ConflictKind`] using an
//! ordered rule table. Adding a backend means supplying a table, never
//! branching the protocol.
//!
//! ## Invariants
//! - Rules are evaluated in order; the first match wins.
//! - Errors without a code, or with an unmatched code, classify as
//!   [`ConflictKind::Other`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Raw Database Errors
// ============================================================================

/// Raw database failure reported by a ledger backend.
///
/// # Invariants
/// - `code` is the vendor code exactly as reported by the driver.
/// - `message` never embeds caller SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {})", .code.as_deref().unwrap_or("none"))]
pub struct DbError {
    /// Vendor error code, when the driver reported one.
    pub code: Option<String>,
    /// Driver error message.
    pub message: String,
}

impl DbError {
    /// Creates a database error with a vendor code.
    #[must_use]
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Creates a database error without a vendor code.
    #[must_use]
    pub fn uncoded(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

// ============================================================================
// SECTION: Classification
// ============================================================================

/// Protocol-level meaning of a database failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Another process inserted the same ledger row first; always retried.
    UniqueViolation,
    /// A lock holder did not release in time; retryable by the caller.
    LockConflict,
    /// The ledger table does not exist; `prepare` has not run.
    MissingLedger,
    /// Any other failure; fatal for the current call.
    Other,
}

/// Matching strategy for a vendor code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodePattern {
    /// Code must match exactly.
    Exact(String),
    /// Code must start with the given prefix (for example a SQLSTATE class).
    Prefix(String),
    /// Code must match exactly and the message must start with `prefix`.
    ///
    /// For vendors that report unrelated failures under one generic code.
    CodeWithMessage {
        /// Exact vendor code.
        code: String,
        /// Required message prefix.
        prefix: String,
    },
}

impl CodePattern {
    /// Returns true when `code` and `message` match this pattern.
    #[must_use]
    pub fn matches(&self, code: &str, message: &str) -> bool {
        match self {
            Self::Exact(expected) => code == expected,
            Self::Prefix(prefix) => code.starts_with(prefix.as_str()),
            Self::CodeWithMessage {
                code: expected,
                prefix,
            } => code == expected && message.starts_with(prefix.as_str()),
        }
    }
}

/// Single classification rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRule {
    /// Code pattern to match.
    pub pattern: CodePattern,
    /// Outcome assigned on match.
    pub kind: ConflictKind,
}

impl ConflictRule {
    /// Creates an exact-match rule.
    #[must_use]
    pub fn exact(code: &str, kind: ConflictKind) -> Self {
        Self {
            pattern: CodePattern::Exact(code.to_string()),
            kind,
        }
    }

    /// Creates a prefix-match rule.
    #[must_use]
    pub fn prefix(prefix: &str, kind: ConflictKind) -> Self {
        Self {
            pattern: CodePattern::Prefix(prefix.to_string()),
            kind,
        }
    }

    /// Creates a rule matching an exact code plus a message prefix.
    #[must_use]
    pub fn code_with_message(code: &str, prefix: &str, kind: ConflictKind) -> Self {
        Self {
            pattern: CodePattern::CodeWithMessage {
                code: code.to_string(),
                prefix: prefix.to_string(),
            },
            kind,
        }
    }
}

/// Ordered rule table mapping vendor codes to [`ConflictKind`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictClassifier {
    /// Rules evaluated in insertion order.
    rules: Vec<ConflictRule>,
}

impl ConflictClassifier {
    /// Creates a classifier from an ordered rule list.
    #[must_use]
    pub fn new(rules: impl IntoIterator<Item = ConflictRule>) -> Self {
        Self {
            rules: rules.into_iter().collect(),
        }
    }

    /// Creates a classifier from a static table of exact codes.
    #[must_use]
    pub fn from_table(table: &[(&str, ConflictKind)]) -> Self {
        Self::new(table.iter().map(|(code, kind)| ConflictRule::exact(code, *kind)))
    }

    /// Appends a rule and returns the extended classifier.
    #[must_use]
    pub fn with_rule(mut self, rule: ConflictRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Classifies a raw database error.
    #[must_use]
    pub fn classify(&self, error: &DbError) -> ConflictKind {
        let Some(code) = error.code.as_deref() else {
            return ConflictKind::Other;
        };
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(code, &error.message))
            .map_or(ConflictKind::Other, |rule| rule.kind)
    }

    /// Returns the configured rules.
    #[must_use]
    pub fn rules(&self) -> &[ConflictRule] {
        &self.rules
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
