//! SurrealDB schema migrations and initialization

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all runner-state tables.
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing runner-state schema");
    init_runners_table(db).await?;
    Ok(())
}

/// Initialize the `runners` table
///
/// Schema:
/// ```text
/// TABLE runners {
///   key:           STRING (unique)
///   machine_id:    STRING?
///   descriptor:    STRING
///   state:         STRING (enum: provisioning | ready | busy | retiring)
///   created_at:    DATETIME
///   last_used_at:  DATETIME (indexed, drives idle reaping)
/// }
/// ```
///
/// State transitions are enforced by the runner pool, not the database.
async fn init_runners_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing runners table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS runners SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_runner_key ON TABLE runners COLUMNS key UNIQUE;

        DEFINE INDEX IF NOT EXISTS idx_runner_state_last_used ON TABLE runners COLUMNS state, last_used_at;
    "#;

    db.query(sql)
        .await?
        .check()
        .map_err(|e| crate::StateError::SchemaSetup(e.to_string()))?;
    info!("runners table initialized");
    Ok(())
}
