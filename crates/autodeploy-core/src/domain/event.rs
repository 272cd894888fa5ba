//! Normalized git events handed to the user's target function.
//!
//! The JSON shape is fixed: `type` selects the variant and the repository
//! name is carried as `repo.repo`.

use serde::{Deserialize, Serialize};

/// Repository an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub id: u64,
    pub owner: String,
    #[serde(rename = "repo")]
    pub name: String,
}

impl Repo {
    /// `owner/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Head commit of the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub message: String,
}

impl Commit {
    /// First seven characters of the SHA.
    pub fn short_id(&self) -> &str {
        self.id.get(..7).unwrap_or(&self.id)
    }
}

/// User that triggered the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: u64,
    pub username: String,
}

/// Code pushed to a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub repo: Repo,
    pub branch: String,
    pub commit: Commit,
    pub sender: Sender,
}

/// A pull request was opened or its head was updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestEvent {
    pub repo: Repo,
    pub number: u64,
    pub base: String,
    pub head: String,
    pub commit: Commit,
    pub sender: Sender,
}

/// Closed set of events Autodeploy reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GitEvent {
    Push(PushEvent),
    PullRequest(PullRequestEvent),
}

/// Discriminant of [`GitEvent`], as it appears in `type` and in delivery headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Push,
    PullRequest,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Push => "push",
            EventType::PullRequest => "pull_request",
        }
    }

    /// Parse a wire name; `None` for anything Autodeploy does not handle.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "push" => Some(EventType::Push),
            "pull_request" => Some(EventType::PullRequest),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GitEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            GitEvent::Push(_) => EventType::Push,
            GitEvent::PullRequest(_) => EventType::PullRequest,
        }
    }

    pub fn repo(&self) -> &Repo {
        match self {
            GitEvent::Push(e) => &e.repo,
            GitEvent::PullRequest(e) => &e.repo,
        }
    }

    pub fn commit(&self) -> &Commit {
        match self {
            GitEvent::Push(e) => &e.commit,
            GitEvent::PullRequest(e) => &e.commit,
        }
    }

    pub fn sender(&self) -> &Sender {
        match self {
            GitEvent::Push(e) => &e.sender,
            GitEvent::PullRequest(e) => &e.sender,
        }
    }
}
