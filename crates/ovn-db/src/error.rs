//! Error types for database operations.

use ovn_inc_common::EngineError;
use thiserror::Error;

use crate::RowId;

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors returned by the in-memory databases.
#[derive(Debug, Error)]
pub enum DbError {
    /// A row referenced by id does not exist.
    #[error("Row {row} not found in table {table}")]
    MissingRow {
        /// The table name.
        table: &'static str,
        /// The row id.
        row: RowId,
    },

    /// A row with the same id already exists.
    #[error("Row {row} already exists in table {table}")]
    DuplicateRow {
        /// The table name.
        table: &'static str,
        /// The row id.
        row: RowId,
    },

    /// `begin` was called while a transaction is open.
    #[error("Transaction already in progress")]
    TransactionInProgress,

    /// `commit` or `abort` was called without an open transaction.
    #[error("No transaction in progress")]
    NoTransaction,

    /// A snapshot could not be parsed or rendered.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl DbError {
    /// Creates a missing row error.
    pub fn missing_row(table: &'static str, row: RowId) -> Self {
        Self::MissingRow { table, row }
    }
}

impl From<DbError> for EngineError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::MissingRow { table, row } => EngineError::missing_row(table, row),
            DbError::TransactionInProgress | DbError::NoTransaction => {
                EngineError::transaction(err.to_string())
            }
            DbError::DuplicateRow { table, .. } => EngineError::invariant(table, err.to_string()),
            DbError::Snapshot(e) => EngineError::invalid_config("snapshot", e.to_string()),
        }
    }
}
