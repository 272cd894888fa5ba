//! Build-runner specification and its canonical form.
//!
//! The user's runner function returns a [`RunnerSpecInput`] with optional
//! fields. [`RunnerSpecInput::canonicalize`] fills defaults and validates it
//! into a [`RunnerSpec`], whose [`RunnerSpec::key`] identifies a pooled
//! machine. Equivalent inputs (`"60 minutes"` and `"1 hour"`) share a key.

use std::time::Duration;

use runner_state::RunnerKey;
use serde::{Deserialize, Serialize};

use super::error::ValidationError;

/// Service that runs the build. Only AWS CodeBuild is supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Codebuild,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Codebuild => "codebuild",
        }
    }

    /// Longest build the engine accepts.
    pub fn timeout_ceiling(&self) -> BuildTimeout {
        match self {
            Engine::Codebuild => BuildTimeout::from_hours(8),
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU architecture of the build environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[default]
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
        }
    }

    /// arm64 environments only come in `small` and `large`.
    pub fn supports(&self, compute: ComputeSize) -> bool {
        match self {
            Architecture::X86_64 => true,
            Architecture::Arm64 => matches!(compute, ComputeSize::Small | ComputeSize::Large),
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute class of the build environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeSize {
    #[default]
    Small,
    Medium,
    Large,
    Xlarge,
}

impl ComputeSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeSize::Small => "small",
            ComputeSize::Medium => "medium",
            ComputeSize::Large => "large",
            ComputeSize::Xlarge => "xlarge",
        }
    }

    /// Memory and vCPUs of this size on `architecture`, or `None` if unsupported.
    pub fn resources(&self, architecture: Architecture) -> Option<MachineResources> {
        let (memory_gb, vcpus) = match (architecture, self) {
            (Architecture::X86_64, ComputeSize::Small) => (3, 2),
            (Architecture::X86_64, ComputeSize::Medium) => (7, 4),
            (Architecture::X86_64, ComputeSize::Large) => (15, 8),
            (Architecture::X86_64, ComputeSize::Xlarge) => (30, 16),
            (Architecture::Arm64, ComputeSize::Small) => (4, 2),
            (Architecture::Arm64, ComputeSize::Large) => (8, 4),
            (Architecture::Arm64, _) => return None,
        };
        Some(MachineResources { memory_gb, vcpus })
    }
}

impl std::fmt::Display for ComputeSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory and CPU of a build environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineResources {
    pub memory_gb: u32,
    pub vcpus: u32,
}

// ---------------------------------------------------------------------------
// BuildTimeout
// ---------------------------------------------------------------------------

/// Build timeout with minute granularity.
///
/// Written as `<integer> minute|minutes|hour|hours`; displayed in hours when
/// it is a whole number of hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BuildTimeout {
    minutes: u32,
}

impl BuildTimeout {
    pub const fn from_minutes(minutes: u32) -> Self {
        Self { minutes }
    }

    pub const fn from_hours(hours: u32) -> Self {
        Self {
            minutes: hours * 60,
        }
    }

    pub fn minutes(&self) -> u32 {
        self.minutes
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.minutes) * 60)
    }

    /// Parse `<integer> minute|minutes|hour|hours`. Zero is rejected.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidTimeout {
            value: value.to_string(),
        };

        let mut parts = value.split_whitespace();
        let (Some(amount), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };
        if !amount.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let amount: u32 = amount.parse().map_err(|_| invalid())?;
        let minutes = match unit {
            "minute" | "minutes" => Some(amount),
            "hour" | "hours" => amount.checked_mul(60),
            _ => None,
        }
        .ok_or_else(invalid)?;

        if minutes == 0 {
            return Err(invalid());
        }
        Ok(Self { minutes })
    }
}

impl Default for BuildTimeout {
    fn default() -> Self {
        BuildTimeout::from_hours(1)
    }
}

impl std::str::FromStr for BuildTimeout {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuildTimeout::parse(s)
    }
}

impl TryFrom<String> for BuildTimeout {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        BuildTimeout::parse(&s)
    }
}

impl From<BuildTimeout> for String {
    fn from(t: BuildTimeout) -> Self {
        t.to_string()
    }
}

impl std::fmt::Display for BuildTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (amount, unit) = if self.minutes % 60 == 0 {
            (self.minutes / 60, "hour")
        } else {
            (self.minutes, "minute")
        };
        let plural = if amount == 1 { "" } else { "s" };
        write!(f, "{amount} {unit}{plural}")
    }
}

// ---------------------------------------------------------------------------
// Runner specs
// ---------------------------------------------------------------------------

/// What the user's runner function returns. Unset fields take defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerSpecInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<Engine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<Architecture>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<ComputeSize>,
    /// Raw timeout text, validated during canonicalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl RunnerSpecInput {
    pub fn architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = Some(architecture);
        self
    }

    pub fn compute(mut self, compute: ComputeSize) -> Self {
        self.compute = Some(compute);
        self
    }

    pub fn timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    /// Fill defaults and validate.
    ///
    /// Incompatible architecture/compute pairs are rejected rather than
    /// coerced, and a timeout above the engine ceiling is an error rather
    /// than clamped.
    pub fn canonicalize(&self) -> Result<RunnerSpec, ValidationError> {
        let engine = self.engine.unwrap_or_default();
        let architecture = self.architecture.unwrap_or_default();
        let compute = self.compute.unwrap_or_default();

        if !architecture.supports(compute) {
            return Err(ValidationError::IncompatibleArchCompute {
                architecture,
                compute,
            });
        }

        let timeout = match &self.timeout {
            Some(raw) => BuildTimeout::parse(raw)?,
            None => BuildTimeout::default(),
        };
        let ceiling = engine.timeout_ceiling();
        if timeout > ceiling {
            return Err(ValidationError::TimeoutExceedsCeiling {
                requested: timeout,
                ceiling,
            });
        }

        Ok(RunnerSpec {
            engine,
            architecture,
            compute,
            timeout,
        })
    }
}

/// Canonical runner specification. Every field is set and valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunnerSpec {
    pub engine: Engine,
    pub architecture: Architecture,
    pub compute: ComputeSize,
    pub timeout: BuildTimeout,
}

impl RunnerSpec {
    /// Stable byte encoding hashed into the pool key.
    fn canonical_encoding(&self) -> String {
        format!(
            "engine={}\narchitecture={}\ncompute={}\ntimeout_minutes={}\n",
            self.engine,
            self.architecture,
            self.compute,
            self.timeout.minutes()
        )
    }

    /// Pool key of this spec.
    pub fn key(&self) -> RunnerKey {
        RunnerKey::from_canonical(self.canonical_encoding().as_bytes())
    }

    /// `codebuild/arm64/large/20 minutes`
    pub fn descriptor(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.engine, self.architecture, self.compute, self.timeout
        )
    }

    pub fn resources(&self) -> Option<MachineResources> {
        self.compute.resources(self.architecture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_canonicalizes_to_defaults() {
        let spec = RunnerSpecInput::default().canonicalize().expect("defaults");
        assert_eq!(spec.engine, Engine::Codebuild);
        assert_eq!(spec.architecture, Architecture::X86_64);
        assert_eq!(spec.compute, ComputeSize::Small);
        assert_eq!(spec.timeout.to_string(), "1 hour");
        assert_eq!(spec, RunnerSpec::default());
    }

    #[test]
    fn test_default_spec_serializes_to_wire_names() {
        let value = serde_json::to_value(RunnerSpec::default()).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "engine": "codebuild",
                "architecture": "x86_64",
                "compute": "small",
                "timeout": "1 hour",
            })
        );
    }

    #[test]
    fn test_arm64_medium_rejected() {
        let err = RunnerSpecInput::default()
            .architecture(Architecture::Arm64)
            .compute(ComputeSize::Medium)
            .canonicalize()
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::IncompatibleArchCompute {
                architecture: Architecture::Arm64,
                compute: ComputeSize::Medium,
            }
        );
    }

    #[test]
    fn test_arm64_xlarge_rejected_and_large_accepted() {
        assert!(RunnerSpecInput::default()
            .architecture(Architecture::Arm64)
            .compute(ComputeSize::Xlarge)
            .canonicalize()
            .is_err());

        let spec = RunnerSpecInput::default()
            .architecture(Architecture::Arm64)
            .compute(ComputeSize::Large)
            .timeout("20 minutes")
            .canonicalize()
            .expect("arm64 large");
        assert_eq!(spec.descriptor(), "codebuild/arm64/large/20 minutes");
        assert_eq!(
            spec.resources(),
            Some(MachineResources {
                memory_gb: 8,
                vcpus: 4
            })
        );
    }

    #[test]
    fn test_timeout_parse_units() {
        assert_eq!(BuildTimeout::parse("1 minute").unwrap().minutes(), 1);
        assert_eq!(BuildTimeout::parse("45 minutes").unwrap().minutes(), 45);
        assert_eq!(BuildTimeout::parse("1 hour").unwrap().minutes(), 60);
        assert_eq!(BuildTimeout::parse("8 hours").unwrap().minutes(), 480);
    }

    #[test]
    fn test_timeout_parse_rejects_garbage() {
        for raw in [
            "", "hour", "1", "1 day", "1.5 hours", "-1 hours", "0 minutes", "1 hour extra",
            "99999999999 hours",
        ] {
            assert!(
                matches!(
                    BuildTimeout::parse(raw),
                    Err(ValidationError::InvalidTimeout { .. })
                ),
                "expected `{raw}` to be rejected"
            );
        }
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(BuildTimeout::from_minutes(1).to_string(), "1 minute");
        assert_eq!(BuildTimeout::from_minutes(90).to_string(), "90 minutes");
        assert_eq!(BuildTimeout::from_minutes(120).to_string(), "2 hours");
    }

    #[test]
    fn test_timeout_above_ceiling_is_error_not_clamped() {
        let err = RunnerSpecInput::default()
            .timeout("9 hours")
            .canonicalize()
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::TimeoutExceedsCeiling {
                requested: BuildTimeout::from_hours(9),
                ceiling: BuildTimeout::from_hours(8),
            }
        );

        let at_ceiling = RunnerSpecInput::default()
            .timeout("480 minutes")
            .canonicalize()
            .expect("exactly 8 hours");
        assert_eq!(at_ceiling.timeout, BuildTimeout::from_hours(8));
    }

    #[test]
    fn test_equivalent_inputs_share_key() {
        let a = RunnerSpecInput::default()
            .timeout("60 minutes")
            .canonicalize()
            .unwrap();
        let b = RunnerSpecInput {
            engine: Some(Engine::Codebuild),
            architecture: Some(Architecture::X86_64),
            compute: Some(ComputeSize::Small),
            timeout: Some("1 hour".to_string()),
        }
        .canonicalize()
        .unwrap();
        assert_eq!(a.key(), b.key());

        let c = RunnerSpecInput::default()
            .compute(ComputeSize::Large)
            .canonicalize()
            .unwrap();
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_input_rejects_unknown_fields() {
        let err = serde_json::from_str::<RunnerSpecInput>(r#"{"engine":"codebuild","memory":"8gb"}"#);
        assert!(err.is_err());
    }
}
