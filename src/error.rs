//! Error taxonomy for the connector runtime.
//!
//! Each component surfaces a typed error so that adapters can decide how to
//! degrade: a [`ExecutionError::CircuitOpen`] is a temporary unavailability,
//! not a data error, while [`SyncError::InvalidWebhookSignature`] means the
//! payload was rejected before any state changed.
//!
//! Application glue (config loading, CLI, server startup) uses `anyhow`.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The pipeline stage an execution was in when its deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for the rate-limit window to reset.
    RateLimited,
    /// Waiting in the FIFO concurrency queue.
    Queued,
    /// Network call in flight.
    InFlight,
    /// Between attempts; the next attempt would not fit the remaining budget.
    Backoff,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::RateLimited => "rate limited",
            Stage::Queued => "queued",
            Stage::InFlight => "in flight",
            Stage::Backoff => "backing off",
        };
        f.write_str(s)
    }
}

/// Connection-level failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// DNS, TCP connect, or TLS handshake failure.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The per-attempt timeout elapsed before a response arrived.
    #[error("request timed out after {0:?}")]
    TimedOut(Duration),

    /// Any other transport failure (malformed request, body read error).
    #[error("{0}")]
    Other(String),
}

/// Errors returned by [`RequestExecutor::execute`](crate::executor::RequestExecutor::execute).
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The breaker for this endpoint is open; no network call was issued.
    #[error("circuit open for {endpoint}, next probe in {retry_in:?}")]
    CircuitOpen { endpoint: String, retry_in: Duration },

    /// Waiting for rate-limit quota would exceed the caller's ceiling.
    #[error("rate limit wait of {wait:?} for {endpoint} exceeds ceiling of {ceiling:?}")]
    RateLimitTimeout {
        endpoint: String,
        wait: Duration,
        ceiling: Duration,
    },

    /// Transient failures persisted past the retry budget.
    #[error("{endpoint}: retries exhausted after {attempts} attempts: {source}")]
    ExhaustedRetries {
        endpoint: String,
        attempts: u32,
        source: Box<ExecutionError>,
    },

    /// Connection-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The caller's deadline expired.
    #[error("{endpoint}: deadline exceeded while {stage}")]
    Timeout { endpoint: String, stage: Stage },

    /// Upstream answered with a 4xx (other than 429); never retried.
    #[error("{endpoint}: client error {status}")]
    Client {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// Upstream answered with a 5xx or 429; retried until the budget runs out.
    #[error("{endpoint}: server error {status}")]
    Server {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The auth collaborator could not produce request headers.
    #[error("auth headers unavailable: {0}")]
    Auth(String),
}

impl ExecutionError {
    /// HTTP status carried by this error, if any (unwrapping retry exhaustion).
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ExecutionError::Client { status, .. } | ExecutionError::Server { status, .. } => {
                Some(*status)
            }
            ExecutionError::ExhaustedRetries { source, .. } => source.http_status(),
            _ => None,
        }
    }

    /// Whether the error means "source temporarily unavailable" rather than
    /// "the request itself was wrong".
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ExecutionError::CircuitOpen { .. }
                | ExecutionError::ExhaustedRetries { .. }
                | ExecutionError::RateLimitTimeout { .. }
                | ExecutionError::Timeout { .. }
                | ExecutionError::Transport(_)
        )
    }
}

/// Local cache tier failures. These indicate caller bugs and are propagated.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to serialize cache value for {key}: {source}")]
    Serialize {
        key: String,
        source: serde_json::Error,
    },

    #[error("cache entry {key} is {size} bytes, larger than the {max} byte budget")]
    EntryTooLarge { key: String, size: usize, max: usize },
}

/// Distributed tier failures. Recorded and absorbed, never surfaced by
/// [`CacheManager`](crate::cache::CacheManager) reads or writes.
#[derive(Error, Debug, Clone)]
pub enum CacheTierError {
    #[error("distributed cache tier unavailable: {0}")]
    CacheTierUnavailable(String),

    #[error("distributed cache tier returned a corrupt entry for {0}")]
    Corrupt(String),
}

/// Errors raised by the change synchronizer.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Signature missing or not matching the HMAC of the raw body.
    #[error("webhook signature rejected")]
    InvalidWebhookSignature,

    /// No shared secret configured, so no payload can be authenticated.
    #[error("webhook secret not configured")]
    WebhookSecretMissing,

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    /// One scope failed to poll; isolated from the others.
    #[error("scope {scope}: {message}")]
    SyncScope { scope: String, message: String },

    /// Every watched scope failed in the same poll cycle.
    #[error("upstream unavailable: all {failed} watched scopes failed to poll")]
    UpstreamUnavailable { failed: usize },
}

/// Errors surfaced by a [`SourceAdapter`](crate::adapter::SourceAdapter) read.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("transform failed for {source_label}: {message}")]
    Transform {
        source_label: String,
        message: String,
    },
}

impl AdapterError {
    pub fn is_unavailable(&self) -> bool {
        match self {
            AdapterError::Execution(e) => e.is_unavailable(),
            AdapterError::Transform { .. } => false,
        }
    }
}
