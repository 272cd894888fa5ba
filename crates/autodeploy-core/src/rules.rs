//! Declarative target and runner functions loaded from configuration.
//!
//! [`TargetRules`] is an ordered list of [`TargetRule`]s; the first rule
//! whose event type and branch pattern match wins and its stage template is
//! rendered against the event. [`StageRunners`] maps stages to runner inputs
//! layered over a default.

use std::collections::BTreeMap;

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::domain::{AutodeployError, EventType, GitEvent, Result, RunnerSpecInput, Target};
use crate::resolve::{RunnerFn, RunnerInput, TargetFn};

/// One `[[rules]]` entry.
///
/// ```toml
/// [[rules]]
/// event = "pull_request"
/// base = "main"
/// stage = "pr-{number}"
/// env = { PREVIEW = "true" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetRule {
    pub event: EventType,
    /// Branch pattern for `push` rules; `*` matches any run of characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Base-branch pattern for `pull_request` rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    /// Stage template: `{branch}`, `{number}`, `{base}`, `{head}`, `{owner}`,
    /// `{repo}`, `{sender}`.
    pub stage: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

const PUSH_PLACEHOLDERS: &[&str] = &["branch", "owner", "repo", "sender"];
const PULL_REQUEST_PLACEHOLDERS: &[&str] = &["number", "base", "head", "owner", "repo", "sender"];

struct CompiledRule {
    rule: TargetRule,
    pattern: Option<Regex>,
    placeholder: Regex,
}

impl CompiledRule {
    fn compile(index: usize, rule: TargetRule, placeholder: &Regex) -> Result<Self> {
        let invalid = |reason: String| {
            AutodeployError::Configuration(format!("rules[{index}]: {reason}"))
        };

        let (pattern, allowed) = match rule.event {
            EventType::Push => {
                if rule.base.is_some() {
                    return Err(invalid("`base` only applies to pull_request rules".into()));
                }
                (rule.branch.as_deref(), PUSH_PLACEHOLDERS)
            }
            EventType::PullRequest => {
                if rule.branch.is_some() {
                    return Err(invalid(
                        "`branch` only applies to push rules; use `base`".into(),
                    ));
                }
                (rule.base.as_deref(), PULL_REQUEST_PLACEHOLDERS)
            }
        };

        if rule.stage.trim().is_empty() {
            return Err(invalid("empty stage template".into()));
        }
        for name in placeholder
            .captures_iter(&rule.stage)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
        {
            if !allowed.contains(&name) {
                return Err(invalid(format!(
                    "placeholder `{{{name}}}` is not available for {} events",
                    rule.event
                )));
            }
        }

        let pattern = pattern
            .map(glob_to_regex)
            .transpose()
            .map_err(|e| invalid(format!("invalid branch pattern: {e}")))?;
        Ok(Self {
            rule,
            pattern,
            placeholder: placeholder.clone(),
        })
    }

    fn render(&self, event: &GitEvent) -> Option<Target> {
        let mut values: Vec<(&str, String)> = vec![
            ("owner", event.repo().owner.clone()),
            ("repo", event.repo().name.clone()),
            ("sender", event.sender().username.clone()),
        ];
        let branch = match (self.rule.event, event) {
            (EventType::Push, GitEvent::Push(push)) => {
                values.push(("branch", push.branch.clone()));
                &push.branch
            }
            (EventType::PullRequest, GitEvent::PullRequest(pr)) => {
                values.push(("number", pr.number.to_string()));
                values.push(("base", pr.base.clone()));
                values.push(("head", pr.head.clone()));
                &pr.base
            }
            _ => return None,
        };
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(branch) {
                return None;
            }
        }

        // One pass, so substituted values are never expanded again.
        let stage = self
            .placeholder
            .replace_all(&self.rule.stage, |caps: &Captures<'_>| {
                values
                    .iter()
                    .find(|(name, _)| *name == &caps[1])
                    .map_or_else(|| caps[0].to_string(), |(_, value)| value.clone())
            })
            .into_owned();
        Some(Target {
            stage,
            env: self.rule.env.clone(),
        })
    }
}

fn glob_to_regex(glob: &str) -> std::result::Result<Regex, regex::Error> {
    let body = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$"))
}

/// Ordered, first-match-wins target rules.
pub struct TargetRules {
    rules: Vec<CompiledRule>,
}

impl TargetRules {
    /// Compile rules, rejecting bad patterns and placeholders up front.
    pub fn new(rules: Vec<TargetRule>) -> Result<Self> {
        let placeholder = Regex::new(r"\{([A-Za-z_]+)\}")
            .map_err(|e| AutodeployError::Configuration(e.to_string()))?;
        let rules = rules
            .into_iter()
            .enumerate()
            .map(|(i, rule)| CompiledRule::compile(i, rule, &placeholder))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Target of the first matching rule.
    pub fn evaluate(&self, event: &GitEvent) -> Option<Target> {
        self.rules.iter().find_map(|rule| rule.render(event))
    }
}

#[async_trait]
impl TargetFn for TargetRules {
    async fn target(&self, event: &GitEvent) -> anyhow::Result<Option<Target>> {
        Ok(self.evaluate(event))
    }
}

/// Runner inputs per stage, each layered over a shared default.
#[derive(Debug, Clone, Default)]
pub struct StageRunners {
    default: RunnerSpecInput,
    stages: BTreeMap<String, RunnerSpecInput>,
}

impl StageRunners {
    pub fn new(default: RunnerSpecInput, stages: BTreeMap<String, RunnerSpecInput>) -> Self {
        Self { default, stages }
    }

    /// Input for `stage`: the stage's fields where set, the default's otherwise.
    pub fn input_for(&self, stage: &str) -> RunnerSpecInput {
        let Some(overrides) = self.stages.get(stage) else {
            return self.default.clone();
        };
        RunnerSpecInput {
            engine: overrides.engine.or(self.default.engine),
            architecture: overrides.architecture.or(self.default.architecture),
            compute: overrides.compute.or(self.default.compute),
            timeout: overrides
                .timeout
                .clone()
                .or_else(|| self.default.timeout.clone()),
        }
    }
}

#[async_trait]
impl RunnerFn for StageRunners {
    async fn runner(&self, input: &RunnerInput) -> anyhow::Result<RunnerSpecInput> {
        Ok(self.input_for(&input.stage))
    }
}
