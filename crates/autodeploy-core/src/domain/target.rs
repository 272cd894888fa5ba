//! Deployment target produced by the user's target function.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::ValidationError;

/// Stage the app will be deployed to, plus environment variables for the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub stage: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl Target {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            env: BTreeMap::new(),
        }
    }

    /// Add one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Stage names must be non-blank and free of whitespace.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.stage.is_empty() || self.stage.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidStage {
                stage: self.stage.clone(),
            });
        }
        Ok(())
    }
}
