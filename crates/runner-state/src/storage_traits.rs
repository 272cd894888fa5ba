//! Storage trait definitions for runner records
//!
//! - `RunnerKey`: SHA-256 of a canonical runner specification
//! - `RunnerRecord`: one provisioned (or provisioning) build machine
//! - `RunnerStore`: keyed persistence of runner records
//!
//! The trait is async and backend-agnostic. An in-memory fake lives in the
//! `fakes` module; a SurrealDB backend lives in `surreal_store`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Keys and identifiers
// ---------------------------------------------------------------------------

/// Pool key for a canonical runner specification (SHA-256 hex string).
///
/// The inner field is private so a key is always lowercase hex produced by
/// `from_canonical` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunnerKey(String);

impl RunnerKey {
    /// Hash the canonical encoding of a runner specification.
    pub fn from_canonical(encoding: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(encoding);
        RunnerKey(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for RunnerKey {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidKey { key: s });
        }
        Ok(RunnerKey(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for RunnerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a provisioned build machine, assigned by the provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId(pub String);

impl std::fmt::Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RunnerRecord
// ---------------------------------------------------------------------------

/// Lifecycle state of a runner record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Provisioning,
    Ready,
    Busy,
    Retiring,
}

impl RunnerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerState::Provisioning => "provisioning",
            RunnerState::Ready => "ready",
            RunnerState::Busy => "busy",
            RunnerState::Retiring => "retiring",
        }
    }
}

impl std::str::FromStr for RunnerState {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(RunnerState::Provisioning),
            "ready" => Ok(RunnerState::Ready),
            "busy" => Ok(RunnerState::Busy),
            "retiring" => Ok(RunnerState::Retiring),
            other => Err(StorageError::UnknownState {
                state: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the runner table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerRecord {
    /// Canonical spec key
    pub key: RunnerKey,
    /// Machine handle; `None` while the machine is still being provisioned
    pub machine_id: Option<MachineId>,
    /// Human-readable spec, e.g. `codebuild/arm64/large/20 minutes`
    pub descriptor: String,
    pub state: RunnerState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl RunnerRecord {
    /// A fresh record for a machine that is about to be provisioned.
    pub fn provisioning(key: RunnerKey, descriptor: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            key,
            machine_id: None,
            descriptor: descriptor.into(),
            state: RunnerState::Provisioning,
            created_at: now,
            last_used_at: now,
        }
    }

    /// Whether the record has been unused for strictly longer than `threshold`.
    pub fn is_idle(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_used_at) > threshold
    }
}

// ---------------------------------------------------------------------------
// RunnerStore
// ---------------------------------------------------------------------------

/// Keyed runner-record table.
///
/// Guarantees:
/// - At most one record per `RunnerKey` (`put` replaces).
/// - `get` of an absent key is `Ok(None)`, `remove` of an absent key is a no-op.
///
/// Callers serialize writes per key; stores need not provide compare-and-swap.
#[async_trait]
pub trait RunnerStore: Send + Sync {
    /// Insert or replace the record for `record.key`.
    async fn put(&self, record: &RunnerRecord) -> StorageResult<()>;

    /// Fetch the record for a key.
    async fn get(&self, key: &RunnerKey) -> StorageResult<Option<RunnerRecord>>;

    /// Delete the record for a key.
    async fn remove(&self, key: &RunnerKey) -> StorageResult<()>;

    /// List all records, ordered by key.
    async fn list(&self) -> StorageResult<Vec<RunnerRecord>>;
}
