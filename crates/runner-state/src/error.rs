//! Error types for runner-state

use thiserror::Error;

/// Errors raised while connecting to or migrating the backing database.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by [`crate::RunnerStore`] implementations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A runner key was not a 64-character hex digest.
    #[error("invalid runner key: {key}")]
    InvalidKey { key: String },

    /// A persisted row carried a state this version does not know.
    #[error("unknown runner state: {state}")]
    UnknownState { state: String },

    /// The backing store failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
