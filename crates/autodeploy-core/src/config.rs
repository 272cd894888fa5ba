//! Autodeploy configuration.
//!
//! Loaded from a TOML file, then overridden from the environment, then
//! validated. Every field has a default so an empty file is valid.
//!
//! ```toml
//! resolution_timeout_secs = 30
//! idle_threshold_days = 7
//! reap_interval_secs = 3600
//!
//! [store]
//! url = "surrealkv://.autodeploy/db"
//!
//! [[rules]]
//! event = "push"
//! branch = "main"
//! stage = "production"
//!
//! [runner]
//! compute = "small"
//!
//! [runners.production]
//! architecture = "arm64"
//! compute = "large"
//! timeout = "20 minutes"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use runner_state::StoreConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{AutodeployError, Result, RunnerSpecInput};
use crate::rules::{StageRunners, TargetRule, TargetRules};

mod defaults {
    pub fn resolution_timeout_secs() -> u64 {
        30
    }
    pub fn idle_threshold_days() -> u32 {
        7
    }
    pub fn reap_interval_secs() -> u64 {
        3600
    }
    pub fn store_url() -> String {
        "surrealkv://.autodeploy/db".to_string()
    }
    pub fn store_namespace() -> String {
        runner_state::surreal_store::DEFAULT_NAMESPACE.to_string()
    }
    pub fn store_database() -> String {
        runner_state::surreal_store::DEFAULT_DATABASE.to_string()
    }
}

/// Where runner records are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSettings {
    /// `mem://`, `surrealkv://<dir>` or a remote SurrealDB endpoint.
    #[serde(default = "defaults::store_url")]
    pub url: String,
    #[serde(default = "defaults::store_namespace")]
    pub namespace: String,
    #[serde(default = "defaults::store_database")]
    pub database: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: defaults::store_url(),
            namespace: defaults::store_namespace(),
            database: defaults::store_database(),
        }
    }
}

impl StoreSettings {
    /// Connection settings; credentials still come from `AUTODEPLOY_STORE_USERNAME`
    /// / `AUTODEPLOY_STORE_PASSWORD`.
    pub fn to_store_config(&self) -> StoreConfig {
        let mut config = StoreConfig::new(&self.url)
            .with_namespace(&self.namespace)
            .with_database(&self.database);
        config.credentials = StoreConfig::from_env().credentials;
        config
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutodeployConfig {
    /// Upper bound on each user-function call.
    #[serde(default = "defaults::resolution_timeout_secs")]
    pub resolution_timeout_secs: u64,
    /// Ready runners unused for longer than this are torn down.
    #[serde(default = "defaults::idle_threshold_days")]
    pub idle_threshold_days: u32,
    #[serde(default = "defaults::reap_interval_secs")]
    pub reap_interval_secs: u64,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub rules: Vec<TargetRule>,
    /// Runner input used for every stage without its own entry.
    #[serde(default)]
    pub runner: RunnerSpecInput,
    #[serde(default)]
    pub runners: BTreeMap<String, RunnerSpecInput>,
}

impl Default for AutodeployConfig {
    fn default() -> Self {
        Self {
            resolution_timeout_secs: defaults::resolution_timeout_secs(),
            idle_threshold_days: defaults::idle_threshold_days(),
            reap_interval_secs: defaults::reap_interval_secs(),
            store: StoreSettings::default(),
            rules: Vec::new(),
            runner: RunnerSpecInput::default(),
            runners: BTreeMap::new(),
        }
    }
}

impl AutodeployConfig {
    /// Read, apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AutodeployError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        debug!(path = %path.display(), rules = config.rules.len(), "configuration loaded");
        Ok(config)
    }

    /// Parse without environment overrides or validation.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| AutodeployError::Configuration(e.to_string()))
    }

    /// Apply `AUTODEPLOY_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("AUTODEPLOY_RESOLUTION_TIMEOUT_SECS") {
            self.resolution_timeout_secs = parse_env("AUTODEPLOY_RESOLUTION_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("AUTODEPLOY_IDLE_THRESHOLD_DAYS") {
            self.idle_threshold_days = parse_env("AUTODEPLOY_IDLE_THRESHOLD_DAYS", &v)?;
        }
        if let Some(v) = lookup("AUTODEPLOY_REAP_INTERVAL_SECS") {
            self.reap_interval_secs = parse_env("AUTODEPLOY_REAP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("AUTODEPLOY_STORE_URL") {
            self.store.url = v;
        }
        Ok(())
    }

    /// Reject zero durations, bad rules and invalid runner inputs.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("resolution_timeout_secs", self.resolution_timeout_secs),
            ("idle_threshold_days", u64::from(self.idle_threshold_days)),
            ("reap_interval_secs", self.reap_interval_secs),
        ] {
            if value == 0 {
                return Err(AutodeployError::Configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.store.url.trim().is_empty() {
            return Err(AutodeployError::Configuration(
                "store.url must not be empty".to_string(),
            ));
        }

        TargetRules::new(self.rules.clone())?;
        let runners = self.stage_runners();
        self.runner.canonicalize().map_err(|e| {
            AutodeployError::Configuration(format!("runner: {e}"))
        })?;
        for stage in self.runners.keys() {
            runners.input_for(stage).canonicalize().map_err(|e| {
                AutodeployError::Configuration(format!("runners.{stage}: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn resolution_timeout(&self) -> Duration {
        Duration::from_secs(self.resolution_timeout_secs)
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.idle_threshold_days))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn target_rules(&self) -> Result<TargetRules> {
        TargetRules::new(self.rules.clone())
    }

    pub fn stage_runners(&self) -> StageRunners {
        StageRunners::new(self.runner.clone(), self.runners.clone())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        AutodeployError::Configuration(format!("invalid {name}=`{value}`: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Architecture, EventType};
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = AutodeployConfig::from_toml("").unwrap();
        assert_eq!(config, AutodeployConfig::default());
        assert_eq!(config.resolution_timeout(), Duration::from_secs(30));
        assert_eq!(config.idle_threshold(), chrono::Duration::days(7));
        assert_eq!(config.store.namespace, "autodeploy");
        config.validate().unwrap();
    }

    #[test]
    fn test_load_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
resolution_timeout_secs = 5
idle_threshold_days = 3

[store]
url = "mem://"

[[rules]]
event = "push"
branch = "main"
stage = "production"

[[rules]]
event = "pull_request"
stage = "pr-{{number}}"

[runners.production]
architecture = "arm64"
compute = "large"
timeout = "20 minutes"
"#
        )
        .unwrap();

        let config = AutodeployConfig::load(file.path()).unwrap();
        assert_eq!(config.resolution_timeout_secs, 5);
        assert_eq!(config.idle_threshold_days, 3);
        assert_eq!(config.store.url, "mem://");
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[1].event, EventType::PullRequest);
        assert_eq!(
            config.runners["production"].architecture,
            Some(Architecture::Arm64)
        );
        assert_eq!(config.reap_interval_secs, 3600);
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = AutodeployConfig::load("/nonexistent/autodeploy.toml").unwrap_err();
        assert!(matches!(err, AutodeployError::Configuration(_)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(AutodeployConfig::from_toml("idle_days = 3").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("AUTODEPLOY_IDLE_THRESHOLD_DAYS", "14"),
            ("AUTODEPLOY_STORE_URL", "mem://"),
        ]);
        let mut config = AutodeployConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.idle_threshold_days, 14);
        assert_eq!(config.store.url, "mem://");
        assert_eq!(config.resolution_timeout_secs, 30);
    }

    #[test]
    fn test_bad_env_override_rejected() {
        let mut config = AutodeployConfig::default();
        let err = config
            .apply_overrides(|name| {
                (name == "AUTODEPLOY_REAP_INTERVAL_SECS").then(|| "hourly".to_string())
            })
            .unwrap_err();
        assert!(err.to_string().contains("AUTODEPLOY_REAP_INTERVAL_SECS"));
    }

    #[test]
    fn test_validate_rejects_zero_and_bad_runner() {
        let config = AutodeployConfig {
            reap_interval_secs: 0,
            ..AutodeployConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AutodeployConfig::from_toml(
            r#"
[runners.production]
architecture = "arm64"
compute = "medium"
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("runners.production"));
    }
}
