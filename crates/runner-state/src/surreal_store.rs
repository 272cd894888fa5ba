//! SurrealDB-backed RunnerStore implementation
//!
//! Uses `schema::RunnerRow` for persistence, converting to/from
//! `storage_traits::RunnerRecord` at the boundary. This is the store to use
//! when runners must be reused across process restarts.

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::RunnerRow;
use crate::storage_traits::{RunnerKey, RunnerRecord, RunnerStore, StorageResult};

/// Default namespace for runner-state tables
pub const DEFAULT_NAMESPACE: &str = "autodeploy";
/// Default database for runner-state tables
pub const DEFAULT_DATABASE: &str = "runners";

/// Credentials for a remote SurrealDB endpoint
#[derive(Debug, Clone)]
pub struct StoreCredentials {
    pub username: String,
    pub password: String,
    /// Root user (true) or database user (false)
    pub is_root: bool,
}

/// Connection settings for [`SurrealRunnerStore`]
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// `mem://`, `surrealkv://<dir>`, `ws://host:port`, `wss://...`
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub credentials: Option<StoreCredentials>,
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            credentials: None,
        }
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_credentials(mut self, credentials: StoreCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - AUTODEPLOY_STORE_URL (optional, default: `surrealkv://.autodeploy/db`)
    /// - AUTODEPLOY_STORE_NAMESPACE (optional, default: "autodeploy")
    /// - AUTODEPLOY_STORE_DATABASE (optional, default: "runners")
    /// - AUTODEPLOY_STORE_USERNAME / AUTODEPLOY_STORE_PASSWORD (optional, both or neither)
    /// - AUTODEPLOY_STORE_ROOT (optional, default: "false")
    pub fn from_env() -> Self {
        let url = std::env::var("AUTODEPLOY_STORE_URL")
            .unwrap_or_else(|_| "surrealkv://.autodeploy/db".to_string());
        let namespace = std::env::var("AUTODEPLOY_STORE_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database = std::env::var("AUTODEPLOY_STORE_DATABASE")
            .unwrap_or_else(|_| DEFAULT_DATABASE.to_string());

        let credentials = match (
            std::env::var("AUTODEPLOY_STORE_USERNAME"),
            std::env::var("AUTODEPLOY_STORE_PASSWORD"),
        ) {
            (Ok(username), Ok(password)) => Some(StoreCredentials {
                username,
                password,
                is_root: std::env::var("AUTODEPLOY_STORE_ROOT")
                    .map(|v| v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            }),
            _ => None,
        };

        Self {
            url,
            namespace,
            database,
            credentials,
        }
    }
}

/// SurrealDB-backed implementation of [`RunnerStore`].
pub struct SurrealRunnerStore {
    db: Surreal<Any>,
}

impl SurrealRunnerStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect(&StoreConfig::new("mem://")).await
    }

    /// Connect, authenticate if credentials are given, select ns/db and run migrations.
    #[instrument(skip(config), fields(url = %config.url, namespace = %config.namespace, database = %config.database))]
    pub async fn connect(config: &StoreConfig) -> crate::Result<Self> {
        if let Some(path) = config.url.strip_prefix("surrealkv://") {
            std::fs::create_dir_all(path).map_err(|e| {
                StateError::Connection(format!(
                    "Failed to create database directory {}: {}",
                    path, e
                ))
            })?;
        }

        let db = surrealdb::engine::any::connect(config.url.as_str())
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to connect to {}: {}", config.url, e))
            })?;

        if let Some(creds) = &config.credentials {
            if creds.is_root {
                db.signin(Root {
                    username: &creds.username,
                    password: &creds.password,
                })
                .await
                .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
            } else {
                db.signin(Database {
                    namespace: &config.namespace,
                    database: &config.database,
                    username: &creds.username,
                    password: &creds.password,
                })
                .await
                .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
            }
        }

        db.use_ns(config.namespace.as_str())
            .use_db(config.database.as_str())
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!("SurrealRunnerStore connected");
        Ok(Self { db })
    }
}

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[async_trait]
impl RunnerStore for SurrealRunnerStore {
    async fn put(&self, record: &RunnerRecord) -> StorageResult<()> {
        let row = RunnerRow::from(record);
        let key = row.key.clone();
        debug!(key = %record.key.short(), state = %record.state, "storing runner record");

        self.db
            .query(
                "BEGIN TRANSACTION; \
                 DELETE runners WHERE key = $key; \
                 CREATE runners CONTENT $row; \
                 COMMIT TRANSACTION;",
            )
            .bind(("key", key))
            .bind(("row", row))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;

        Ok(())
    }

    async fn get(&self, key: &RunnerKey) -> StorageResult<Option<RunnerRecord>> {
        let key_owned = key.as_str().to_string();
        let mut res = self
            .db
            .query("SELECT * FROM runners WHERE key = $key")
            .bind(("key", key_owned))
            .await
            .map_err(backend)?;

        let rows: Vec<RunnerRow> = res.take(0).map_err(backend)?;
        rows.into_iter().next().map(RunnerRecord::try_from).transpose()
    }

    async fn remove(&self, key: &RunnerKey) -> StorageResult<()> {
        let key_owned = key.as_str().to_string();
        self.db
            .query("DELETE runners WHERE key = $key")
            .bind(("key", key_owned))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<RunnerRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM runners ORDER BY key ASC")
            .await
            .map_err(backend)?;
        let rows: Vec<RunnerRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(RunnerRecord::try_from).collect()
    }
}
