//! Runner-State: persistence for the Autodeploy runner pool
//!
//! The runner pool keeps one record per canonical runner specification.
//! This crate owns how those records are stored; the pool owns when and
//! why they change.
//!
//! ## Key Components
//!
//! - `RunnerStore`: async keyed table of `RunnerRecord`s
//! - `MemoryRunnerStore`: process-local store (tests, single-process pools)
//! - `SurrealRunnerStore`: SurrealDB store that survives restarts

mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use fakes::MemoryRunnerStore;
pub use schema::RunnerRow;
pub use storage_traits::{
    MachineId, RunnerKey, RunnerRecord, RunnerState, RunnerStore, StorageResult,
};
pub use surreal_store::{StoreConfig, StoreCredentials, SurrealRunnerStore};

/// Result type for runner-state connection and migration operations
pub type Result<T> = std::result::Result<T, StateError>;
