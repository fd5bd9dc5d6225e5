//! Event Normalizer (`spec.md` §4.1): pure transformation from a
//! verified, parsed forge payload to a `NormalizedEvent`. No I/O.
//!
//! Grounded on `buildit_core::repository::PushEvent::from_github_payload`'s
//! payload-walking style, generalized to a `ForgeKind`-dispatched entry
//! point per `spec.md` §9 Design Notes (a `match`, not runtime reflection).

use serde_json::Value;

use cinch_core::event::{
    EventKind, NormalizeError, NormalizedEvent, PrAction, PullRequestEvent, PushEvent,
};
use cinch_core::repository::ForgeKind;

pub fn normalize(
    forge: ForgeKind,
    event_type: &str,
    payload: &Value,
) -> Result<NormalizedEvent, NormalizeError> {
    match forge {
        ForgeKind::Github => normalize_github(event_type, payload),
        other => Err(NormalizeError::UnsupportedEvent(format!(
            "normalizer for forge {other} is not implemented"
        ))),
    }
}

fn normalize_github(event_type: &str, payload: &Value) -> Result<NormalizedEvent, NormalizeError> {
    let repository_full_name = payload
        .get("repository")
        .and_then(|r| r.get("full_name"))
        .and_then(|n| n.as_str())
        .ok_or_else(|| NormalizeError::InvalidPayload("missing repository.full_name".to_string()))?
        .to_string();

    let sender = payload
        .get("sender")
        .ok_or_else(|| NormalizeError::InvalidPayload("missing sender".to_string()))?;
    let sender_login = sender
        .get("login")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NormalizeError::InvalidPayload("missing sender.login".to_string()))?
        .to_string();
    let sender_stable_id = sender
        .get("id")
        .map(|v| v.to_string())
        .ok_or_else(|| NormalizeError::InvalidPayload("missing sender.id".to_string()))?;

    let kind = match event_type {
        "push" => EventKind::Push(parse_github_push(payload)?),
        "pull_request" => EventKind::PullRequest(parse_github_pull_request(payload)?),
        "ping" => {
            return Err(NormalizeError::UnsupportedEvent(
                "ping carries no dispatchable event".to_string(),
            ))
        }
        other => return Err(NormalizeError::UnsupportedEvent(other.to_string())),
    };

    Ok(NormalizedEvent {
        forge: ForgeKind::Github,
        repository_full_name,
        kind,
        sender_login,
        sender_stable_id,
    })
}

fn parse_github_push(payload: &Value) -> Result<PushEvent, NormalizeError> {
    let commit_sha = payload
        .get("after")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NormalizeError::InvalidPayload("missing after".to_string()))?
        .to_string();
    let git_ref = payload
        .get("ref")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NormalizeError::InvalidPayload("missing ref".to_string()))?;

    let (branch, tag) = if let Some(name) = git_ref.strip_prefix("refs/heads/") {
        (Some(name.to_string()), None)
    } else if let Some(name) = git_ref.strip_prefix("refs/tags/") {
        (None, Some(name.to_string()))
    } else {
        (None, None)
    };

    Ok(PushEvent {
        commit_sha,
        branch,
        tag,
    })
}

fn parse_github_pull_request(payload: &Value) -> Result<PullRequestEvent, NormalizeError> {
    let action = match payload.get("action").and_then(|v| v.as_str()) {
        Some("opened") => PrAction::Opened,
        Some("reopened") => PrAction::Reopened,
        Some("synchronize") => PrAction::Synchronize,
        Some(_) | None => PrAction::Other,
    };

    let pr = payload
        .get("pull_request")
        .ok_or_else(|| NormalizeError::InvalidPayload("missing pull_request".to_string()))?;
    let head_sha = pr
        .get("head")
        .and_then(|h| h.get("sha"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| NormalizeError::InvalidPayload("missing pull_request.head.sha".to_string()))?
        .to_string();
    let base_branch = pr
        .get("base")
        .and_then(|b| b.get("ref"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| NormalizeError::InvalidPayload("missing pull_request.base.ref".to_string()))?
        .to_string();
    let head_is_fork = pr
        .get("head")
        .and_then(|h| h.get("repo"))
        .and_then(|r| r.get("fork"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let pr_number = payload
        .get("number")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| NormalizeError::InvalidPayload("missing number".to_string()))?;

    Ok(PullRequestEvent {
        action,
        head_sha,
        base_branch,
        head_is_fork,
        pr_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_to_branch_extracts_branch_not_tag() {
        let payload = serde_json::json!({
            "after": "abc1234",
            "ref": "refs/heads/main",
            "repository": { "full_name": "acme/app" },
            "sender": { "login": "alice", "id": 1 },
        });
        let event = normalize(ForgeKind::Github, "push", &payload).unwrap();
        match event.kind {
            EventKind::Push(p) => {
                assert_eq!(p.branch.as_deref(), Some("main"));
                assert!(p.tag.is_none());
            }
            _ => panic!("expected push"),
        }
    }

    #[test]
    fn missing_sender_is_invalid_payload() {
        let payload = serde_json::json!({
            "after": "abc1234",
            "ref": "refs/heads/main",
            "repository": { "full_name": "acme/app" },
        });
        let err = normalize(ForgeKind::Github, "push", &payload).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidPayload(_)));
    }

    #[test]
    fn unrecognized_event_type_is_unsupported() {
        let payload = serde_json::json!({
            "repository": { "full_name": "acme/app" },
            "sender": { "login": "alice", "id": 1 },
        });
        let err = normalize(ForgeKind::Github, "star", &payload).unwrap_err();
        assert!(matches!(err, NormalizeError::UnsupportedEvent(_)));
    }
}
