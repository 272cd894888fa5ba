//! In-memory fakes for storage traits
//!
//! `MemoryRunnerStore` satisfies the `RunnerStore` contract without any
//! external dependencies. It is also the default store for a process-local
//! runner pool.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryRunnerStore
// ---------------------------------------------------------------------------

/// In-memory runner table backed by a `BTreeMap<RunnerKey, RunnerRecord>`.
#[derive(Debug, Default)]
pub struct MemoryRunnerStore {
    records: Mutex<BTreeMap<RunnerKey, RunnerRecord>>,
}

impl MemoryRunnerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> StorageResult<MutexGuard<'_, BTreeMap<RunnerKey, RunnerRecord>>> {
        self.records
            .lock()
            .map_err(|_| StorageError::Backend("runner table lock poisoned".to_string()))
    }
}

#[async_trait]
impl RunnerStore for MemoryRunnerStore {
    async fn put(&self, record: &RunnerRecord) -> StorageResult<()> {
        self.table()?.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, key: &RunnerKey) -> StorageResult<Option<RunnerRecord>> {
        Ok(self.table()?.get(key).cloned())
    }

    async fn remove(&self, key: &RunnerKey) -> StorageResult<()> {
        self.table()?.remove(key);
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<RunnerRecord>> {
        Ok(self.table()?.values().cloned().collect())
    }
}
