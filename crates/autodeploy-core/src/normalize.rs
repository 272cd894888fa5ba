//! Webhook payload normalization.
//!
//! Turns a raw JSON payload plus the delivery's event-type hint into a
//! typed [`GitEvent`]. Validation is field-by-field so a malformed payload
//! reports the exact dotted path that was wrong (`repo.id`, `commit.message`).
//! Pure: no I/O, no logging side effects beyond `debug!`.

use serde_json::{Map, Value};
use tracing::debug;

use crate::domain::{
    Commit, EventType, GitEvent, NormalizationError, PullRequestEvent, PushEvent, Repo, Sender,
};

type Result<T> = std::result::Result<T, NormalizationError>;

/// Stateless payload normalizer.
pub struct EventNormalizer;

impl EventNormalizer {
    /// Normalize raw bytes. Non-JSON input is `MalformedPayload { field: "$" }`.
    pub fn normalize_bytes(raw: &[u8], hint: Option<&str>) -> Result<GitEvent> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| NormalizationError::malformed("$", format!("invalid JSON: {e}")))?;
        Self::normalize(&value, hint)
    }

    /// Normalize a parsed payload.
    ///
    /// `hint` is the event type announced by the delivery (e.g. an
    /// `X-GitHub-Event` header). When both the hint and the payload's `type`
    /// are present they must agree.
    pub fn normalize(raw: &Value, hint: Option<&str>) -> Result<GitEvent> {
        let obj = raw
            .as_object()
            .ok_or_else(|| NormalizationError::malformed("$", "expected a JSON object"))?;

        let declared = match obj.get("type") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.as_str()),
            Some(_) => return Err(NormalizationError::malformed("type", "expected a string")),
        };

        let name = match (hint, declared) {
            (Some(h), Some(d)) if h != d => {
                return Err(NormalizationError::malformed(
                    "type",
                    format!("payload type `{d}` does not match delivery type `{h}`"),
                ))
            }
            (Some(h), _) => h,
            (None, Some(d)) => d,
            (None, None) => {
                return Err(NormalizationError::malformed(
                    "type",
                    "missing event type and no delivery hint",
                ))
            }
        };

        let event_type =
            EventType::from_wire(name).ok_or_else(|| NormalizationError::UnsupportedEvent {
                event_type: name.to_string(),
            })?;

        let fields = Fields::root(obj);
        let event = match event_type {
            EventType::Push => GitEvent::Push(PushEvent {
                repo: repo(&fields)?,
                branch: fields.non_empty_string("branch")?,
                commit: commit(&fields)?,
                sender: sender(&fields)?,
            }),
            EventType::PullRequest => {
                let number = fields.uint("number")?;
                if number == 0 {
                    return Err(NormalizationError::malformed(
                        "number",
                        "expected a positive integer",
                    ));
                }
                GitEvent::PullRequest(PullRequestEvent {
                    repo: repo(&fields)?,
                    number,
                    base: fields.non_empty_string("base")?,
                    head: fields.non_empty_string("head")?,
                    commit: commit(&fields)?,
                    sender: sender(&fields)?,
                })
            }
        };

        debug!(event_type = %event_type, repo = %event.repo().full_name(), "normalized webhook payload");
        Ok(event)
    }
}

fn repo(fields: &Fields<'_>) -> Result<Repo> {
    let repo = fields.object("repo")?;
    Ok(Repo {
        id: repo.uint("id")?,
        owner: repo.non_empty_string("owner")?,
        name: repo.non_empty_string("repo")?,
    })
}

fn commit(fields: &Fields<'_>) -> Result<Commit> {
    let commit = fields.object("commit")?;
    Ok(Commit {
        id: commit.non_empty_string("id")?,
        message: commit.string("message")?,
    })
}

fn sender(fields: &Fields<'_>) -> Result<Sender> {
    let sender = fields.object("sender")?;
    Ok(Sender {
        id: sender.uint("id")?,
        username: sender.non_empty_string("username")?,
    })
}

/// A JSON object plus the dotted path it was reached by.
struct Fields<'a> {
    obj: &'a Map<String, Value>,
    path: String,
}

impl<'a> Fields<'a> {
    fn root(obj: &'a Map<String, Value>) -> Self {
        Self {
            obj,
            path: String::new(),
        }
    }

    fn path_of(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.path, name)
        }
    }

    fn get(&self, name: &str) -> Result<&'a Value> {
        match self.obj.get(name) {
            None | Some(Value::Null) => Err(NormalizationError::malformed(
                self.path_of(name),
                "missing required field",
            )),
            Some(v) => Ok(v),
        }
    }

    fn object(&self, name: &str) -> Result<Fields<'a>> {
        let obj = self.get(name)?.as_object().ok_or_else(|| {
            NormalizationError::malformed(self.path_of(name), "expected an object")
        })?;
        Ok(Fields {
            obj,
            path: self.path_of(name),
        })
    }

    fn string(&self, name: &str) -> Result<String> {
        self.get(name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| NormalizationError::malformed(self.path_of(name), "expected a string"))
    }

    fn non_empty_string(&self, name: &str) -> Result<String> {
        let s = self.string(name)?;
        if s.trim().is_empty() {
            return Err(NormalizationError::malformed(
                self.path_of(name),
                "must not be empty",
            ));
        }
        Ok(s)
    }

    fn uint(&self, name: &str) -> Result<u64> {
        self.get(name)?.as_u64().ok_or_else(|| {
            NormalizationError::malformed(self.path_of(name), "expected a non-negative integer")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push_payload() -> Value {
        json!({
            "type": "push",
            "repo": { "id": 1296269, "owner": "octocat", "repo": "Hello-World" },
            "branch": "main",
            "commit": {
                "id": "b7e7c4c559e0e5b4bc6f8d98e0e5e5e5e5e5e5e5",
                "message": "Update the README with new information"
            },
            "sender": { "id": 1, "username": "octocat" }
        })
    }

    fn pr_payload() -> Value {
        json!({
            "type": "pull_request",
            "repo": { "id": 1296269, "owner": "octocat", "repo": "Hello-World" },
            "number": 1347,
            "base": "main",
            "head": "changes",
            "commit": { "id": "b7e7c4c5", "message": "" },
            "sender": { "id": 1, "username": "octocat" }
        })
    }

    fn malformed_field(err: NormalizationError) -> String {
        match err {
            NormalizationError::MalformedPayload { field, .. } => field,
            other => panic!("expected MalformedPayload, got {other:?}"),
        }
    }

    #[test]
    fn test_push_normalizes() {
        let event = EventNormalizer::normalize(&push_payload(), Some("push")).unwrap();
        let GitEvent::Push(push) = event else {
            panic!("expected push");
        };
        assert_eq!(push.branch, "main");
        assert_eq!(push.repo.name, "Hello-World");
        assert_eq!(push.sender.username, "octocat");
    }

    #[test]
    fn test_pull_request_normalizes_with_empty_commit_message() {
        let event = EventNormalizer::normalize(&pr_payload(), None).unwrap();
        let GitEvent::PullRequest(pr) = event else {
            panic!("expected pull request");
        };
        assert_eq!(pr.number, 1347);
        assert_eq!(pr.base, "main");
        assert_eq!(pr.commit.message, "");
    }

    #[test]
    fn test_hint_alone_selects_variant() {
        let mut payload = push_payload();
        payload.as_object_mut().unwrap().remove("type");
        let event = EventNormalizer::normalize(&payload, Some("push")).unwrap();
        assert_eq!(event.event_type(), EventType::Push);
    }

    #[test]
    fn test_unknown_event_type_is_unsupported() {
        let err = EventNormalizer::normalize(&json!({ "action": "opened" }), Some("issues"))
            .unwrap_err();
        assert_eq!(
            err,
            NormalizationError::UnsupportedEvent {
                event_type: "issues".to_string()
            }
        );
    }

    #[test]
    fn test_hint_and_payload_type_must_agree() {
        let err = EventNormalizer::normalize(&push_payload(), Some("pull_request")).unwrap_err();
        assert_eq!(malformed_field(err), "type");
    }

    #[test]
    fn test_missing_type_without_hint() {
        let mut payload = push_payload();
        payload.as_object_mut().unwrap().remove("type");
        let err = EventNormalizer::normalize(&payload, None).unwrap_err();
        assert_eq!(malformed_field(err), "type");
    }

    #[test]
    fn test_missing_nested_field_reports_dotted_path() {
        let mut payload = push_payload();
        payload["repo"].as_object_mut().unwrap().remove("id");
        let err = EventNormalizer::normalize(&payload, None).unwrap_err();
        assert_eq!(malformed_field(err), "repo.id");
    }

    #[test]
    fn test_wrong_type_reports_field() {
        let mut payload = push_payload();
        payload["sender"]["id"] = json!("one");
        let err = EventNormalizer::normalize(&payload, None).unwrap_err();
        assert_eq!(malformed_field(err), "sender.id");
    }

    #[test]
    fn test_empty_branch_rejected() {
        let mut payload = push_payload();
        payload["branch"] = json!("");
        let err = EventNormalizer::normalize(&payload, None).unwrap_err();
        assert_eq!(malformed_field(err), "branch");
    }

    #[test]
    fn test_pull_request_number_must_be_positive() {
        let mut payload = pr_payload();
        payload["number"] = json!(0);
        assert_eq!(
            malformed_field(EventNormalizer::normalize(&payload, None).unwrap_err()),
            "number"
        );

        payload["number"] = json!(-3);
        assert_eq!(
            malformed_field(EventNormalizer::normalize(&payload, None).unwrap_err()),
            "number"
        );
    }

    #[test]
    fn test_non_json_bytes() {
        let err = EventNormalizer::normalize_bytes(b"not json", Some("push")).unwrap_err();
        assert_eq!(malformed_field(err), "$");
    }

    #[test]
    fn test_non_object_payload() {
        let err = EventNormalizer::normalize(&json!([1, 2, 3]), Some("push")).unwrap_err();
        assert_eq!(malformed_field(err), "$");
    }

    #[test]
    fn test_normalized_event_round_trips_to_wire_shape() {
        let event = EventNormalizer::normalize(&push_payload(), None).unwrap();
        assert_eq!(serde_json::to_value(&event).unwrap(), push_payload());
    }
}
