//! Source adapters: the cached read path.
//!
//! An adapter turns a path within its source into canonical
//! [`Document`]s:
//!
//! ```text
//! cache_key(label, path) ─▶ CacheManager::get ──hit──▶ documents
//!                                 │ miss
//!                                 ▼
//!              RequestExecutor::execute ─▶ ContentTransformer ─▶ CacheManager::set
//! ```
//!
//! Response validators (`ETag`, `Last-Modified`) are stored with the entry
//! so [`HttpSourceAdapter::revalidate`] can issue a conditional request; a
//! `304 Not Modified` restarts the entry's TTL without re-transforming.
//!
//! [`fetch_all`] reads from many adapters concurrently and keeps going when
//! some of them fail, returning whatever the healthy sources produced.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{cache_key, CacheManager, SetOptions};
use crate::error::AdapterError;
use crate::executor::RequestExecutor;
use crate::models::{ChangeEvent, ChangeKind, Document, RequestSpec, Response, Validators};
use crate::sync::ChangeHandler;

/// Converts a raw upstream response into documents. Must be pure.
pub trait ContentTransformer: Send + Sync {
    fn transform(&self, source: &str, path: &str, url: &str, response: &Response)
        -> Result<Vec<Document>>;
}

/// Wraps the body verbatim as a single document.
pub struct PassthroughTransformer;

impl ContentTransformer for PassthroughTransformer {
    fn transform(
        &self,
        source: &str,
        path: &str,
        url: &str,
        response: &Response,
    ) -> Result<Vec<Document>> {
        let updated_at = response
            .header("last-modified")
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let content_type = response
            .header("content-type")
            .and_then(|v| v.split(';').next())
            .unwrap_or("text/plain")
            .trim()
            .to_string();
        let mut metadata = BTreeMap::new();
        if let Some(etag) = response.header("etag") {
            metadata.insert("etag".to_string(), etag.to_string());
        }

        Ok(vec![Document {
            source: source.to_string(),
            source_id: path.to_string(),
            source_url: Some(url.to_string()),
            title: path.rsplit('/').next().map(str::to_string),
            updated_at,
            content_type,
            body: response.text(),
            metadata,
        }])
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Source label; also the cache scope for this adapter's entries.
    fn label(&self) -> &str;

    async fn fetch(&self, path: &str, deadline: Option<Instant>)
        -> Result<Vec<Document>, AdapterError>;
}

pub struct HttpSourceAdapter {
    label: String,
    endpoint_key: String,
    base_url: String,
    executor: Arc<RequestExecutor>,
    cache: Arc<CacheManager<Vec<Document>>>,
    transformer: Arc<dyn ContentTransformer>,
    ttl: Option<Duration>,
    tags: BTreeSet<String>,
}

impl HttpSourceAdapter {
    pub fn new(
        label: impl Into<String>,
        base_url: impl Into<String>,
        executor: Arc<RequestExecutor>,
        cache: Arc<CacheManager<Vec<Document>>>,
    ) -> Self {
        let label = label.into();
        Self {
            endpoint_key: label.clone(),
            label,
            base_url: base_url.into(),
            executor,
            cache,
            transformer: Arc::new(PassthroughTransformer),
            ttl: None,
            tags: BTreeSet::new(),
        }
    }

    /// Breaker and rate-limit key; defaults to the label.
    pub fn endpoint_key(mut self, key: impl Into<String>) -> Self {
        self.endpoint_key = key.into();
        self
    }

    pub fn transformer(mut self, transformer: Arc<dyn ContentTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Fetch from upstream, bypassing the cache, and store the result.
    pub async fn refresh(
        &self,
        path: &str,
        deadline: Option<Instant>,
    ) -> Result<Vec<Document>, AdapterError> {
        let url = self.url_for(path);
        let resp = self
            .executor
            .execute(&self.endpoint_key, &RequestSpec::get(url.clone()), deadline)
            .await?;
        self.store(path, &url, &resp).await
    }

    /// Conditional re-fetch using the validators stored with the cached
    /// entry. Without a live entry this is a plain [`refresh`](Self::refresh).
    pub async fn revalidate(
        &self,
        path: &str,
        deadline: Option<Instant>,
    ) -> Result<Vec<Document>, AdapterError> {
        let key = cache_key(&self.label, path);
        let validators = match self.cache.validators(&key) {
            Some(v) if !v.is_empty() => v,
            _ => return self.refresh(path, deadline).await,
        };

        let url = self.url_for(path);
        let mut spec = RequestSpec::get(url.clone());
        if let Some(etag) = &validators.etag {
            spec = spec.header("If-None-Match", etag.as_str());
        }
        if let Some(last_modified) = &validators.last_modified {
            spec = spec.header("If-Modified-Since", last_modified.as_str());
        }

        let resp = self
            .executor
            .execute(&self.endpoint_key, &spec, deadline)
            .await?;

        if resp.is_not_modified() {
            self.cache.mark_fresh(&key);
            if let Some(docs) = self.cache.get(&key).await {
                debug!(source = %self.label, path, "not modified");
                return Ok(docs);
            }
            return self.refresh(path, deadline).await;
        }

        let current = resp.validators();
        if !current.is_empty() && self.cache.is_valid_for_headers(&key, &current) {
            self.cache.mark_fresh(&key);
            if let Some(docs) = self.cache.get(&key).await {
                return Ok(docs);
            }
        }
        self.store(path, &url, &resp).await
    }

    async fn store(
        &self,
        path: &str,
        url: &str,
        resp: &Response,
    ) -> Result<Vec<Document>, AdapterError> {
        let docs = self
            .transformer
            .transform(&self.label, path, url, resp)
            .map_err(|e| AdapterError::Transform {
                source_label: self.label.clone(),
                message: e.to_string(),
            })?;

        let options = SetOptions {
            ttl: self.ttl,
            tags: self.tags.clone(),
            scope: Some(self.label.clone()),
            validators: resp.validators(),
        };
        let key = cache_key(&self.label, path);
        if let Err(e) = self.cache.set(&key, docs.clone(), options).await {
            warn!(source = %self.label, path, error = %e, "result not cached");
        }
        Ok(docs)
    }

    pub fn validators(&self, path: &str) -> Option<Validators> {
        self.cache.validators(&cache_key(&self.label, path))
    }
}

#[async_trait]
impl SourceAdapter for HttpSourceAdapter {
    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch(
        &self,
        path: &str,
        deadline: Option<Instant>,
    ) -> Result<Vec<Document>, AdapterError> {
        if let Some(docs) = self.cache.get(&cache_key(&self.label, path)).await {
            return Ok(docs);
        }
        self.refresh(path, deadline).await
    }
}

/// Re-fetches changed paths of one adapter after they are invalidated.
/// Register after the cache invalidation handler.
pub struct EagerRefresh {
    adapter: Arc<HttpSourceAdapter>,
}

impl EagerRefresh {
    pub fn new(adapter: Arc<HttpSourceAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl ChangeHandler for EagerRefresh {
    async fn handle(&self, event: ChangeEvent) -> Result<()> {
        if event.source_scope != self.adapter.label() || event.kind == ChangeKind::Deleted {
            return Ok(());
        }
        let Some(path) = &event.path else {
            return Ok(());
        };
        self.adapter.refresh(path, None).await?;
        debug!(scope = %event.source_scope, path = %path, "eagerly refreshed");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub path: String,
    pub error: String,
    /// Temporary unavailability (breaker open, retries exhausted, timeout)
    /// as opposed to a bad request or transform error.
    pub unavailable: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PartialResults {
    pub documents: Vec<Document>,
    pub failures: Vec<SourceFailure>,
}

impl PartialResults {
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Fetch every `(adapter, path)` pair concurrently. Failed sources are
/// reported in `failures`; documents from the rest are returned in request
/// order.
pub async fn fetch_all(
    requests: Vec<(Arc<dyn SourceAdapter>, String)>,
    deadline: Option<Instant>,
) -> PartialResults {
    let mut set = JoinSet::new();
    for (index, (adapter, path)) in requests.into_iter().enumerate() {
        set.spawn(async move {
            let result = adapter.fetch(&path, deadline).await;
            (index, adapter.label().to_string(), path, result)
        });
    }

    let mut slots = Vec::new();
    let mut failures = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, _, _, Ok(docs))) => slots.push((index, docs)),
            Ok((_, source, path, Err(e))) => {
                warn!(source = %source, path = %path, error = %e, "source unavailable, returning partial results");
                failures.push(SourceFailure {
                    unavailable: e.is_unavailable(),
                    error: e.to_string(),
                    source,
                    path,
                });
            }
            Err(e) => {
                warn!(error = %e, "fetch task failed");
                failures.push(SourceFailure {
                    source: "unknown".to_string(),
                    path: String::new(),
                    error: e.to_string(),
                    unavailable: false,
                });
            }
        }
    }

    slots.sort_by_key(|(index, _)| *index);
    PartialResults {
        documents: slots.into_iter().flat_map(|(_, docs)| docs).collect(),
        failures,
    }
}
