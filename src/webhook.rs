//! Webhook authentication and payload parsing.
//!
//! Signatures are HMAC-SHA256 over the raw request body, hex encoded, with
//! or without a `sha256=` prefix (`X-Hub-Signature-256` style). Comparison
//! is constant time.
//!
//! Two payload shapes are understood:
//!
//! - **Push** payloads carrying `repository.full_name` and a `commits`
//!   array with `added` / `modified` / `removed` / `renamed` paths. A
//!   payload with `"deleted": true` (branch or repository removal) becomes a
//!   single scope-wide `deleted` event.
//! - **Generic** payloads: `{ "scope", "kind", "path"?, "previous_path"? }`
//!   or `{ "events": [ ... ] }` of the same.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashSet;

use crate::error::SyncError;
use crate::models::{ChangeEvent, ChangeKind, ChangeOrigin};

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `body`, as an upstream would put in its signature header.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify `header` against the HMAC of `body`. A missing, malformed, or
/// mismatching signature is rejected.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> Result<(), SyncError> {
    let header = header.ok_or(SyncError::InvalidWebhookSignature)?.trim();
    let hex_sig = header.strip_prefix("sha256=").unwrap_or(header);
    let expected = hex::decode(hex_sig).map_err(|_| SyncError::InvalidWebhookSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SyncError::InvalidWebhookSignature)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SyncError::InvalidWebhookSignature)
}

#[derive(Deserialize)]
struct PushPayload {
    repository: Repository,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    commits: Vec<Commit>,
}

#[derive(Deserialize)]
struct Repository {
    full_name: String,
}

#[derive(Deserialize)]
struct Commit {
    #[serde(default)]
    added: Vec<String>,
    #[serde(default)]
    modified: Vec<String>,
    #[serde(default)]
    removed: Vec<String>,
    #[serde(default)]
    renamed: Vec<Rename>,
}

#[derive(Deserialize)]
struct Rename {
    from: String,
    to: String,
}

#[derive(Deserialize)]
struct GenericEvent {
    scope: String,
    kind: ChangeKind,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    previous_path: Option<String>,
}

#[derive(Deserialize)]
struct GenericBatch {
    events: Vec<GenericEvent>,
}

/// Parse an authenticated body into change events. Duplicate events within
/// one payload are collapsed; an empty list is a valid result.
pub fn parse_payload(body: &[u8]) -> Result<Vec<ChangeEvent>, SyncError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| SyncError::MalformedPayload(e.to_string()))?;

    let events = if value.get("repository").is_some() {
        let push: PushPayload = serde_json::from_value(value)
            .map_err(|e| SyncError::MalformedPayload(format!("push payload: {}", e)))?;
        push_events(push)
    } else if value.get("events").is_some() {
        let batch: GenericBatch = serde_json::from_value(value)
            .map_err(|e| SyncError::MalformedPayload(format!("event batch: {}", e)))?;
        batch.events.into_iter().map(generic_event).collect()
    } else if value.get("scope").is_some() {
        let event: GenericEvent = serde_json::from_value(value)
            .map_err(|e| SyncError::MalformedPayload(format!("event: {}", e)))?;
        vec![generic_event(event)]
    } else {
        return Err(SyncError::MalformedPayload(
            "expected a push payload, an event, or an events list".to_string(),
        ));
    };

    Ok(dedup(events))
}

fn push_events(push: PushPayload) -> Vec<ChangeEvent> {
    let scope = push.repository.full_name;
    if push.deleted {
        return vec![ChangeEvent::new(scope, ChangeKind::Deleted, None, ChangeOrigin::Webhook)];
    }
    if push.commits.is_empty() {
        return vec![ChangeEvent::new(scope, ChangeKind::Updated, None, ChangeOrigin::Webhook)];
    }

    let mut events = Vec::new();
    for commit in push.commits {
        let path_event = |kind, path: String| {
            ChangeEvent::new(scope.as_str(), kind, Some(path), ChangeOrigin::Webhook)
        };
        events.extend(commit.added.into_iter().map(|p| path_event(ChangeKind::Created, p)));
        events.extend(commit.modified.into_iter().map(|p| path_event(ChangeKind::Updated, p)));
        events.extend(commit.removed.into_iter().map(|p| path_event(ChangeKind::Deleted, p)));
        for rename in commit.renamed {
            let mut event = path_event(ChangeKind::Renamed, rename.to);
            event.previous_path = Some(rename.from);
            events.push(event);
        }
    }
    events
}

fn generic_event(e: GenericEvent) -> ChangeEvent {
    let mut event = ChangeEvent::new(e.scope, e.kind, e.path, ChangeOrigin::Webhook);
    event.previous_path = e.previous_path;
    event
}

fn dedup(events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter(|e| {
            seen.insert((
                e.source_scope.clone(),
                e.kind,
                e.path.clone(),
                e.previous_path.clone(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "It's a Secret to Everybody";

    #[test]
    fn known_signature_vector() {
        // Published example from the GitHub webhook documentation.
        let sig = sign(SECRET, b"Hello, World!");
        assert_eq!(
            sig,
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        );
        assert!(verify_signature(SECRET, b"Hello, World!", Some(&sig)).is_ok());
    }

    #[test]
    fn accepts_bare_hex() {
        let sig = sign(SECRET, b"body");
        let bare = sig.trim_start_matches("sha256=");
        assert!(verify_signature(SECRET, b"body", Some(bare)).is_ok());
    }

    #[test]
    fn rejects_bad_signatures() {
        let sig = sign(SECRET, b"body");
        for header in [None, Some("sha256=zz"), Some("sha256=00ff"), Some(sig.as_str())] {
            let body: &[u8] = if header == Some(sig.as_str()) { b"tampered" } else { b"body" };
            assert!(matches!(
                verify_signature(SECRET, body, header),
                Err(SyncError::InvalidWebhookSignature)
            ));
        }
        assert!(verify_signature("other-secret", b"body", Some(&sig)).is_err());
    }

    #[test]
    fn parses_push_payload() {
        let body = br#"{
            "ref": "refs/heads/main",
            "repository": { "full_name": "acme/platform-docs" },
            "commits": [
                { "added": ["runbooks/db.md"], "modified": ["README.md"], "removed": [] },
                { "added": [], "modified": ["README.md"], "removed": ["old.md"],
                  "renamed": [{ "from": "a.md", "to": "b.md" }] }
            ]
        }"#;
        let events = parse_payload(body).unwrap();
        assert_eq!(events.len(), 4, "README.md update is collapsed");
        assert!(events.iter().all(|e| e.source_scope == "acme/platform-docs"));
        assert!(events.iter().all(|e| e.origin == ChangeOrigin::Webhook));
        assert_eq!(events[0].kind, ChangeKind::Created);
        assert_eq!(events[0].path.as_deref(), Some("runbooks/db.md"));
        let rename = events.iter().find(|e| e.kind == ChangeKind::Renamed).unwrap();
        assert_eq!(rename.path.as_deref(), Some("b.md"));
        assert_eq!(rename.previous_path.as_deref(), Some("a.md"));
    }

    #[test]
    fn deleted_ref_is_scope_wide() {
        let body = br#"{ "deleted": true, "repository": { "full_name": "acme/wiki" }, "commits": [] }"#;
        let events = parse_payload(body).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Deleted);
        assert_eq!(events[0].path, None);
    }

    #[test]
    fn parses_generic_payloads() {
        let single = br#"{ "scope": "confluence:OPS", "kind": "updated", "path": "pages/42" }"#;
        let events = parse_payload(single).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path.as_deref(), Some("pages/42"));

        let batch = br#"{ "events": [
            { "scope": "db:runbooks", "kind": "created", "path": "r/1" },
            { "scope": "db:runbooks", "kind": "deleted" }
        ] }"#;
        let events = parse_payload(batch).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, ChangeKind::Deleted);
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(parse_payload(b"not json"), Err(SyncError::MalformedPayload(_))));
        assert!(matches!(parse_payload(b"{}"), Err(SyncError::MalformedPayload(_))));
        assert!(matches!(
            parse_payload(br#"{ "scope": "x", "kind": "exploded" }"#),
            Err(SyncError::MalformedPayload(_))
        ));
    }
}
