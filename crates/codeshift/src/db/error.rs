//! Errors raised by the persistence layer.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Cannot prepare database location '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration v{version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// A stored value could not be decoded back into its domain type.
    #[error("Corrupt {column} value '{value}'")]
    Corrupt { column: &'static str, value: String },

    #[error("Database connection lock poisoned")]
    LockPoisoned,
}
