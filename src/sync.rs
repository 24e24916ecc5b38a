//! Change synchronizer.
//!
//! Detects upstream mutations through two paths and fans the resulting
//! [`ChangeEvent`]s out to registered [`ChangeHandler`]s in registration
//! order:
//!
//! - **Webhook**: [`ChangeSynchronizer::process_webhook_payload`] verifies
//!   the HMAC signature, parses the body, drops events for paths outside the
//!   configured `include_globs`, and dispatches.
//! - **Poll**: a background loop asks a [`RevisionSource`] for each watched
//!   scope's revision marker every interval. The first observation only
//!   seeds the baseline; any later change emits `updated` for the scope.
//!
//! Delivery is at-least-once, so handlers must be idempotent. Failures are
//! isolated: one scope failing to poll or register, or one handler failing,
//! never affects the others. Only a poll cycle where every scope fails is
//! reported as [`SyncError::UpstreamUnavailable`].
//!
//! Lifecycle: `stopped → starting → running → stopping → stopped`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::{cache_key, CacheManager};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::executor::RequestExecutor;
use crate::lock;
use crate::models::{ChangeEvent, ChangeKind, ChangeOrigin, RequestSpec};
use crate::webhook::{parse_payload, verify_signature};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorState::Stopped => "stopped",
            MonitorState::Starting => "starting",
            MonitorState::Running => "running",
            MonitorState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Consumer of change events.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(&self, event: ChangeEvent) -> Result<()>;
}

/// Reports the current revision marker (commit SHA, `updated_at`, ...) of a
/// watched scope.
#[async_trait]
pub trait RevisionSource: Send + Sync {
    async fn revision(&self, scope: &str) -> Result<String>;
}

/// Registers upstream webhooks for a scope, where the platform supports it.
#[async_trait]
pub trait WebhookRegistrar: Send + Sync {
    async fn register(&self, scope: &str) -> Result<()>;
    async fn deregister(&self, scope: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ScopeStatus {
    pub scope: String,
    pub last_revision: Option<String>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub webhook_registered: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncStatus {
    pub state: MonitorState,
    pub scopes: Vec<ScopeStatus>,
    pub webhook_events: u64,
    pub poll_events: u64,
    pub webhook_rejections: u64,
    pub poll_cycles: u64,
    pub handler_errors: u64,
    pub last_error: Option<String>,
}

struct SyncState {
    lifecycle: MonitorState,
    scopes: BTreeMap<String, ScopeStatus>,
    webhook_events: u64,
    poll_events: u64,
    webhook_rejections: u64,
    poll_cycles: u64,
    handler_errors: u64,
    last_error: Option<String>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            lifecycle: MonitorState::Stopped,
            scopes: BTreeMap::new(),
            webhook_events: 0,
            poll_events: 0,
            webhook_rejections: 0,
            poll_cycles: 0,
            handler_errors: 0,
            last_error: None,
        }
    }
}

struct PollTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChangeSynchronizer {
    secret: Option<String>,
    include: Option<GlobSet>,
    revisions: Option<Arc<dyn RevisionSource>>,
    registrar: Option<Arc<dyn WebhookRegistrar>>,
    handlers: Arc<RwLock<Vec<Arc<dyn ChangeHandler>>>>,
    state: Arc<Mutex<SyncState>>,
    task: Arc<Mutex<Option<PollTask>>>,
}

impl ChangeSynchronizer {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret,
            include: None,
            revisions: None,
            registrar: None,
            handlers: Arc::new(RwLock::new(Vec::new())),
            state: Arc::new(Mutex::new(SyncState::default())),
            task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Self::new(config.resolved_webhook_secret()).with_include_globs(&config.include_globs)
    }

    /// Only dispatch webhook events whose path matches one of `patterns`.
    /// Scope-wide events (no path) always pass.
    pub fn with_include_globs(mut self, patterns: &[String]) -> Result<Self> {
        self.include = if patterns.is_empty() {
            None
        } else {
            Some(build_globset(patterns)?)
        };
        Ok(self)
    }

    pub fn with_revision_source(mut self, source: Arc<dyn RevisionSource>) -> Self {
        self.revisions = Some(source);
        self
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn WebhookRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Subscribe a handler. Handlers run in registration order.
    pub fn on_change(&self, handler: Arc<dyn ChangeHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handler);
    }

    pub fn state(&self) -> MonitorState {
        lock(&self.state).lifecycle
    }

    /// Set the watched scopes without starting the poll loop. Known scopes
    /// keep their baselines.
    pub fn watch(&self, scopes: &[String]) {
        let mut state = lock(&self.state);
        state.scopes.retain(|k, _| scopes.contains(k));
        for scope in scopes {
            state
                .scopes
                .entry(scope.clone())
                .or_insert_with(|| ScopeStatus {
                    scope: scope.clone(),
                    ..Default::default()
                });
        }
    }

    /// Register webhooks for `scopes` and launch the poll loop. Calling this
    /// while not stopped logs a warning and does nothing.
    pub async fn start(&self, scopes: &[String], poll_interval: Duration) {
        {
            let mut state = lock(&self.state);
            if state.lifecycle != MonitorState::Stopped {
                warn!(state = %state.lifecycle, "change monitoring already started");
                return;
            }
            state.lifecycle = MonitorState::Starting;
        }
        self.watch(scopes);

        if let Some(registrar) = &self.registrar {
            for scope in scopes {
                let result = registrar.register(scope).await;
                let mut state = lock(&self.state);
                let Some(status) = state.scopes.get_mut(scope) else {
                    continue;
                };
                match result {
                    Ok(()) => {
                        status.webhook_registered = true;
                        debug!(scope = %scope, "webhook registered");
                    }
                    Err(e) => {
                        warn!(scope = %scope, error = %e, "webhook registration failed; relying on polling");
                        status.last_error = Some(format!("webhook registration: {}", e));
                    }
                }
            }
        }

        if self.revisions.is_some() {
            let (shutdown, mut stopped) = watch::channel(false);
            let this = self.clone();
            let interval = poll_interval.max(Duration::from_secs(1));
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = this.poll_once().await {
                                error!(error = %e, "poll cycle failed");
                            }
                        }
                        _ = stopped.changed() => break,
                    }
                }
            });
            *lock(&self.task) = Some(PollTask { shutdown, handle });
        }

        lock(&self.state).lifecycle = MonitorState::Running;
        info!(
            scopes = scopes.len(),
            interval_secs = poll_interval.as_secs(),
            "change monitoring started"
        );
    }

    /// Cancel the poll loop and deregister webhooks. No-op when stopped.
    pub async fn stop(&self) {
        {
            let mut state = lock(&self.state);
            if state.lifecycle != MonitorState::Running {
                debug!(state = %state.lifecycle, "stop ignored");
                return;
            }
            state.lifecycle = MonitorState::Stopping;
        }

        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "poll loop ended abnormally");
            }
        }

        if let Some(registrar) = &self.registrar {
            let registered: Vec<String> = lock(&self.state)
                .scopes
                .values()
                .filter(|s| s.webhook_registered)
                .map(|s| s.scope.clone())
                .collect();
            for scope in registered {
                if let Err(e) = registrar.deregister(&scope).await {
                    warn!(scope = %scope, error = %e, "webhook deregistration failed");
                }
                if let Some(status) = lock(&self.state).scopes.get_mut(&scope) {
                    status.webhook_registered = false;
                }
            }
        }

        lock(&self.state).lifecycle = MonitorState::Stopped;
        info!("change monitoring stopped");
    }

    /// Run one poll cycle over the watched scopes and dispatch any
    /// resulting events.
    pub async fn poll_once(&self) -> Result<Vec<ChangeEvent>, SyncError> {
        let Some(source) = &self.revisions else {
            return Ok(Vec::new());
        };
        let scopes: Vec<String> = lock(&self.state).scopes.keys().cloned().collect();
        if scopes.is_empty() {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        let mut failed = 0;
        for scope in &scopes {
            let result = source.revision(scope).await;
            let mut state = lock(&self.state);
            let Some(status) = state.scopes.get_mut(scope) else {
                continue;
            };
            status.last_polled_at = Some(Utc::now());
            match result {
                Ok(revision) => {
                    status.last_error = None;
                    let previous = status.last_revision.replace(revision.clone());
                    match previous {
                        Some(prev) if prev != revision => {
                            debug!(scope = %scope, from = %prev, to = %revision, "revision advanced");
                            events.push(ChangeEvent::new(
                                scope.as_str(),
                                ChangeKind::Updated,
                                None,
                                ChangeOrigin::Poll,
                            ));
                        }
                        Some(_) => {}
                        None => debug!(scope = %scope, revision = %revision, "baseline recorded"),
                    }
                }
                Err(e) => {
                    failed += 1;
                    let err = SyncError::SyncScope {
                        scope: scope.clone(),
                        message: e.to_string(),
                    };
                    warn!(error = %err, "scope poll failed");
                    status.last_error = Some(e.to_string());
                }
            }
        }

        {
            let mut state = lock(&self.state);
            state.poll_cycles += 1;
            state.poll_events += events.len() as u64;
            if failed == scopes.len() {
                let err = SyncError::UpstreamUnavailable { failed };
                state.last_error = Some(err.to_string());
                return Err(err);
            }
        }

        self.dispatch(&events).await;
        Ok(events)
    }

    /// Authenticate, parse, filter, and dispatch one webhook delivery.
    /// A rejected payload mutates nothing.
    pub async fn process_webhook_payload(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<Vec<ChangeEvent>, SyncError> {
        let parsed = match &self.secret {
            None => Err(SyncError::WebhookSecretMissing),
            Some(secret) => {
                verify_signature(secret, body, signature).and_then(|()| parse_payload(body))
            }
        };
        let events = match parsed {
            Ok(events) => events,
            Err(e) => {
                lock(&self.state).webhook_rejections += 1;
                warn!(error = %e, "webhook rejected");
                return Err(e);
            }
        };

        let events: Vec<ChangeEvent> = events
            .into_iter()
            .filter(|e| self.is_included(e))
            .collect();
        lock(&self.state).webhook_events += events.len() as u64;
        self.dispatch(&events).await;
        Ok(events)
    }

    fn is_included(&self, event: &ChangeEvent) -> bool {
        let Some(include) = &self.include else {
            return true;
        };
        match (&event.path, &event.previous_path) {
            (None, None) => true,
            (path, previous) => {
                path.as_deref().is_some_and(|p| include.is_match(p))
                    || previous.as_deref().is_some_and(|p| include.is_match(p))
            }
        }
    }

    async fn dispatch(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        let handlers: Vec<Arc<dyn ChangeHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();

        for event in events {
            for handler in &handlers {
                if let Err(e) = handler.handle(event.clone()).await {
                    lock(&self.state).handler_errors += 1;
                    warn!(
                        scope = %event.source_scope,
                        kind = %event.kind,
                        error = %e,
                        "change handler failed"
                    );
                }
            }
        }
    }

    pub fn status(&self) -> SyncStatus {
        let state = lock(&self.state);
        SyncStatus {
            state: state.lifecycle,
            scopes: state.scopes.values().cloned().collect(),
            webhook_events: state.webhook_events,
            poll_events: state.poll_events,
            webhook_rejections: state.webhook_rejections,
            poll_cycles: state.poll_cycles,
            handler_errors: state.handler_errors,
            last_error: state.last_error.clone(),
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Invalidates the cache for every event: the whole scope, then the exact
/// path keys. Idempotent.
pub struct CacheInvalidation<T> {
    cache: Arc<CacheManager<T>>,
}

impl<T> CacheInvalidation<T> {
    pub fn new(cache: Arc<CacheManager<T>>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl<T> ChangeHandler for CacheInvalidation<T>
where
    T: Clone + Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    async fn handle(&self, event: ChangeEvent) -> Result<()> {
        let removed = self.cache.invalidate_by_scope(&event.source_scope).await;
        for path in [&event.path, &event.previous_path].into_iter().flatten() {
            self.cache.delete(&cache_key(&event.source_scope, path)).await;
        }
        debug!(
            scope = %event.source_scope,
            kind = %event.kind,
            origin = ?event.origin,
            removed,
            "cache invalidated"
        );
        Ok(())
    }
}

/// Polls `url_template` (with `{scope}` substituted) through the executor.
///
/// The marker is the JSON value at `pointer`; failing that the `ETag`
/// header; failing that a SHA-256 of the body.
pub struct HttpRevisionSource {
    executor: Arc<RequestExecutor>,
    url_template: String,
    pointer: String,
}

impl HttpRevisionSource {
    pub fn new(
        executor: Arc<RequestExecutor>,
        url_template: impl Into<String>,
        pointer: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            url_template: url_template.into(),
            pointer: pointer.into(),
        }
    }
}

#[async_trait]
impl RevisionSource for HttpRevisionSource {
    async fn revision(&self, scope: &str) -> Result<String> {
        let url = self.url_template.replace("{scope}", scope);
        let endpoint_key = format!("sync:{}", scope);
        let resp = self
            .executor
            .execute(&endpoint_key, &RequestSpec::get(url), None)
            .await?;

        if let Ok(json) = resp.json::<serde_json::Value>() {
            if let Some(marker) = json.pointer(&self.pointer) {
                return Ok(match marker {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            }
        }
        if let Some(etag) = resp.header("etag") {
            return Ok(etag.to_string());
        }
        Ok(hex::encode(Sha256::digest(&resp.body)))
    }
}
