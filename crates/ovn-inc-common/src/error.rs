//! Error types for engine passes.
//!
//! Recoverable conditions (key conflicts, exhausted key ranges, malformed
//! options) are logged and handled where they occur. Only conditions that
//! make the current pass meaningless are represented here.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that abort the current engine pass.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// A lookup that must always succeed did not.
    #[error("Invariant violation in {node}: {message}")]
    InvariantViolation {
        /// The node that detected the violation.
        node: String,
        /// Description of the broken invariant.
        message: String,
    },

    /// A row that a node holds a reference to is gone.
    #[error("Row {row} missing from table {table}")]
    MissingRow {
        /// The table name.
        table: String,
        /// The row identity.
        row: Uuid,
    },

    /// A database transaction was misused (nested begin, commit without
    /// begin).
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },
}

impl EngineError {
    /// Creates an invariant violation error.
    pub fn invariant(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Creates a missing row error.
    pub fn missing_row(table: impl Into<String>, row: Uuid) -> Self {
        Self::MissingRow {
            table: table.into(),
            row,
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a transaction error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction(message.into())
    }

    /// Returns true if this error is a programming error rather than bad
    /// input.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            EngineError::InvariantViolation { .. } | EngineError::MissingRow { .. }
        )
    }
}
