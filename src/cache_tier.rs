//! Distributed (shared) cache tier.
//!
//! The tier is an external service as far as the cache is concerned: every
//! call may fail, and failures must never reach the caller of
//! [`CacheManager::get`](crate::cache::CacheManager::get) or `set`. The
//! [`GuardedTier`] wrapper puts a circuit breaker in front of the tier so a
//! dead tier costs one fast check per operation instead of a timeout.
//!
//! Keys follow `<namespace>:<scope>:<logical-key>` so scope invalidation can
//! be expressed as a prefix scan.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::circuit_breaker::{Admission, BreakerSettings, CircuitBreakerState, CircuitState};
use crate::error::CacheTierError;
use crate::lock;

#[async_trait]
pub trait DistributedTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheTierError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheTierError>;
    async fn delete(&self, key: &str) -> Result<(), CacheTierError>;
    /// List keys starting with `prefix`. Best effort; not atomic with writes.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheTierError>;
}

/// An in-process tier shared by cloning. Lets several runtimes in one process
/// (or one runtime across restarts of its local tier) share cached results.
#[derive(Clone, Default)]
pub struct SharedMemoryTier {
    entries: Arc<Mutex<HashMap<String, (Vec<u8>, Instant)>>>,
}

impl SharedMemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock(&self.entries)
            .values()
            .filter(|(_, expires)| *expires > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DistributedTier for SharedMemoryTier {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheTierError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            None => return Ok(None),
            Some((value, expires)) if *expires > now => return Ok(Some(value.clone())),
            Some(_) => {}
        }
        entries.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheTierError> {
        lock(&self.entries).insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheTierError> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheTierError> {
        let mut keys: Vec<String> = lock(&self.entries)
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TierStats {
    pub state: CircuitState,
    pub hits: u64,
    pub errors: u64,
    pub skipped: u64,
}

/// Breaker-guarded access to a [`DistributedTier`]. All methods absorb
/// failures: reads degrade to a miss, writes and deletes to a no-op.
pub struct GuardedTier {
    tier: Arc<dyn DistributedTier>,
    breaker: Mutex<CircuitBreakerState>,
    settings: BreakerSettings,
    hits: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
}

impl GuardedTier {
    pub fn new(tier: Arc<dyn DistributedTier>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            tier,
            breaker: Mutex::new(CircuitBreakerState::default()),
            settings: BreakerSettings {
                failure_threshold,
                recovery_timeout: reset_timeout,
                half_open_max_calls: 1,
            },
            hits: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    fn admit(&self) -> Option<Admission> {
        let admission = lock(&self.breaker).try_acquire(Instant::now(), &self.settings);
        match admission {
            Admission::Rejected { .. } => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                None
            }
            other => Some(other),
        }
    }

    fn record<T>(&self, op: &str, result: &Result<T, CacheTierError>) {
        let mut breaker = lock(&self.breaker);
        match result {
            Ok(_) => {
                if breaker.on_success() {
                    info!("distributed cache tier recovered");
                }
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(op, error = %e, "distributed cache tier error");
                if breaker.on_failure(Instant::now(), &self.settings) {
                    warn!(
                        reset_ms = self.settings.recovery_timeout.as_millis() as u64,
                        "distributed cache tier disabled until reset"
                    );
                }
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.admit()?;
        let result = self.tier.get(key).await;
        self.record("get", &result);
        let value = result.ok().flatten();
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        if self.admit().is_none() {
            return;
        }
        let result = self.tier.set(key, value, ttl).await;
        self.record("set", &result);
    }

    pub async fn delete(&self, key: &str) {
        if self.admit().is_none() {
            return;
        }
        let result = self.tier.delete(key).await;
        self.record("delete", &result);
    }

    /// Drop an entry that came back unusable. Counted as a tier error but
    /// not fed to the breaker, since the tier itself answered.
    pub async fn discard(&self, key: &str, err: CacheTierError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        warn!(key, error = %err, "discarding distributed cache entry");
        self.delete(key).await;
    }

    pub async fn scan_prefix(&self, prefix: &str) -> Vec<String> {
        if self.admit().is_none() {
            return Vec::new();
        }
        let result = self.tier.scan_prefix(prefix).await;
        self.record("scan", &result);
        result.unwrap_or_default()
    }

    /// Whether the tier may currently be attempted.
    pub fn is_available(&self) -> bool {
        let breaker = lock(&self.breaker);
        match breaker.state {
            CircuitState::Open => breaker
                .next_retry_at
                .map(|at| Instant::now() >= at)
                .unwrap_or(true),
            _ => true,
        }
    }

    pub fn stats(&self) -> TierStats {
        TierStats {
            state: lock(&self.breaker).state,
            hits: self.hits.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}
