//! Error types for storage operations.

use flexsync_protocol::ProtocolError;
use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another process holds the database file lock.
    #[error("database is locked by another process")]
    DatabaseLocked,

    /// The database file could not be decoded.
    #[error("database file corrupted: {0}")]
    Corrupted(String),

    /// A changeset could not be read.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The table does not exist.
    #[error("no such table '{0}'")]
    NoSuchTable(String),

    /// The table exists with a different definition.
    #[error("table '{0}' already exists with a different type")]
    TableMismatch(String),

    /// The column does not exist.
    #[error("no such column '{column}' in table '{table}'")]
    NoSuchColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// The column exists with a different definition.
    #[error("column '{column}' in table '{table}' already exists with a different type")]
    ColumnMismatch {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// The object does not exist.
    #[error("no such object {key} in table '{table}'")]
    NoSuchObject {
        /// Table name.
        table: String,
        /// Object key, formatted.
        key: String,
    },

    /// A list index is out of bounds.
    #[error("index {index} out of bounds for collection of size {size}")]
    IndexOutOfBounds {
        /// Requested index.
        index: u32,
        /// Collection size.
        size: usize,
    },

    /// A path does not lead to a value of the expected shape.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A value cannot be stored where it was requested.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// A replication override issued by another database was used.
    #[error("replication override belongs to a different database")]
    ForeignOverride,
}

impl StorageError {
    /// Creates an invalid path error.
    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::InvalidPath(message.into())
    }

    /// Creates an invalid value error.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue(message.into())
    }

    /// Creates a missing column error.
    pub fn no_such_column(table: &str, column: &str) -> Self {
        Self::NoSuchColumn {
            table: table.to_string(),
            column: column.to_string(),
        }
    }

    /// Returns true if the error was caused by malformed changeset content
    /// rather than by the environment.
    pub fn is_bad_changeset(&self) -> bool {
        !matches!(
            self,
            Self::Io(_) | Self::DatabaseLocked | Self::Corrupted(_) | Self::ForeignOverride
        )
    }
}
