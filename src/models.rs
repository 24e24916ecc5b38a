//! Core data models shared by the executor, cache, and synchronizer.
//!
//! These types describe requests flowing out to upstream sources, the
//! responses and outcomes coming back, the normalized change notifications
//! produced by webhooks and polling, and the canonical documents adapters
//! store in the cache.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};

/// A fully resolved outbound request.
///
/// `timeout` and `max_retries` override the endpoint's configured values
/// when set.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            timeout: None,
            max_retries: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

/// An upstream response. Header names are stored lowercased.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    /// HTTP validators carried by this response.
    pub fn validators(&self) -> Validators {
        Validators {
            etag: self.header("etag").map(str::to_string),
            last_modified: self.header("last-modified").map(str::to_string),
        }
    }
}

/// HTTP cache validators (`ETag` / `Last-Modified`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// The result of one logical `execute` call. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub success: bool,
    pub latency_ms: u64,
    pub http_status: Option<u16>,
    pub retries_used: u32,
}

/// What happened upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    Renamed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Renamed => "renamed",
        };
        f.write_str(s)
    }
}

/// Which detection path observed a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    Webhook,
    Poll,
}

/// A normalized upstream change notification.
///
/// Delivery is at-least-once; consumers must be idempotent. For renames,
/// `path` is the new location and `previous_path` the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source_scope: String,
    pub kind: ChangeKind,
    pub path: Option<String>,
    pub previous_path: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub origin: ChangeOrigin,
}

impl ChangeEvent {
    pub fn new(
        source_scope: impl Into<String>,
        kind: ChangeKind,
        path: Option<String>,
        origin: ChangeOrigin,
    ) -> Self {
        Self {
            source_scope: source_scope.into(),
            kind,
            path,
            previous_path: None,
            observed_at: Utc::now(),
            origin,
        }
    }
}

/// Canonical document produced by a content transformer and cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Source label, e.g. `"github:platform-docs"`.
    pub source: String,
    /// Stable identifier within the source (path, page id, row key).
    pub source_id: String,
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub content_type: String,
    pub body: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}
