//! SurrealDB row shapes for the runner table
//!
//! Rows keep plain strings for keys and states; conversion to the typed
//! `storage_traits` records happens at the store boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{MachineId, RunnerKey, RunnerRecord, RunnerState};

/// Serializes chrono timestamps as native SurrealDB datetimes.
pub(crate) mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// One row of the `runners` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    /// Canonical spec key (SHA-256 hex, unique)
    pub key: String,
    /// Machine handle, absent while provisioning
    pub machine_id: Option<String>,
    pub descriptor: String,
    /// "provisioning" | "ready" | "busy" | "retiring"
    pub state: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub last_used_at: DateTime<Utc>,
}

impl From<&RunnerRecord> for RunnerRow {
    fn from(record: &RunnerRecord) -> Self {
        RunnerRow {
            id: None,
            key: record.key.as_str().to_string(),
            machine_id: record.machine_id.as_ref().map(|m| m.0.clone()),
            descriptor: record.descriptor.clone(),
            state: record.state.as_str().to_string(),
            created_at: record.created_at,
            last_used_at: record.last_used_at,
        }
    }
}

impl TryFrom<RunnerRow> for RunnerRecord {
    type Error = StorageError;

    fn try_from(row: RunnerRow) -> Result<Self, Self::Error> {
        Ok(RunnerRecord {
            key: RunnerKey::try_from(row.key)?,
            machine_id: row.machine_id.map(MachineId),
            descriptor: row.descriptor,
            state: row.state.parse::<RunnerState>()?,
            created_at: row.created_at,
            last_used_at: row.last_used_at,
        })
    }
}
