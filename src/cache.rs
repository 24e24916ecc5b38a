//! Tiered cache.
//!
//! A fast local tier (bounded by entry count and by estimated byte size,
//! evicting least-recently-used entries) in front of an optional shared
//! distributed tier.
//!
//! # Reads
//!
//! Local tier first. On a local miss the distributed tier is consulted (if
//! configured and its breaker admits the call); a distributed hit is
//! backfilled into the local tier. A full miss returns `None` and the caller
//! populates the cache with [`CacheManager::set`] after fetching.
//!
//! # Freshness
//!
//! An entry is valid while `now − created_at < effective_ttl`. With adaptive
//! TTL enabled, entries read more than `adaptive_threshold` times live for
//! `ttl × (1 + ln(hit_count) / 10)`. Expiry is lazy: an expired entry is
//! removed when a read finds it.
//!
//! # Invalidation
//!
//! Local invalidation is synchronous. Distributed invalidation is a best
//! effort prefix scan followed by deletes; it is not atomic with concurrent
//! writers. Tag invalidation walks every entry, which is fine at the
//! hundreds-to-low-thousands sizes this cache is configured for.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::cache_tier::{GuardedTier, TierStats};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheTierError};
use crate::lock;
use crate::models::Validators;

/// Build a composite cache key: `<scope>:<path>`.
///
/// Keys built this way land in the distributed tier as
/// `<namespace>:<scope>:<path>` and are reachable by scope prefix scans.
pub fn cache_key(scope: &str, path: &str) -> String {
    format!("{}:{}", scope, path)
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub default_ttl: Duration,
    pub max_entries: usize,
    pub max_bytes: usize,
    pub adaptive_ttl: bool,
    pub adaptive_threshold: u64,
    pub namespace: String,
}

impl CacheSettings {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            default_ttl: Duration::from_millis(config.default_ttl_ms),
            max_entries: config.max_entries,
            max_bytes: config.max_bytes,
            adaptive_ttl: config.adaptive_ttl,
            adaptive_threshold: config.adaptive_threshold,
            namespace: config.namespace.clone(),
        }
    }
}

/// Optional metadata for [`CacheManager::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub tags: BTreeSet<String>,
    pub scope: Option<String>,
    pub validators: Validators,
}

impl SetOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn validators(mut self, validators: Validators) -> Self {
        self.validators = validators;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub created_at: Instant,
    pub ttl: Duration,
    pub hit_count: u64,
    pub tags: BTreeSet<String>,
    pub scope: Option<String>,
    pub validators: Validators,
    size: usize,
    last_access: u64,
}

impl<T> CacheEntry<T> {
    pub fn effective_ttl(&self, settings: &CacheSettings) -> Duration {
        if settings.adaptive_ttl && self.hit_count > settings.adaptive_threshold {
            let factor = 1.0 + (self.hit_count as f64).ln() / 10.0;
            self.ttl.mul_f64(factor)
        } else {
            self.ttl
        }
    }

    pub fn is_valid(&self, now: Instant, settings: &CacheSettings) -> bool {
        now.saturating_duration_since(self.created_at) < self.effective_ttl(settings)
    }

    fn in_scope(&self, scope: &str) -> bool {
        self.scope.as_deref() == Some(scope)
            || self
                .key
                .strip_prefix(scope)
                .is_some_and(|rest| rest.starts_with(':'))
    }
}

enum Lookup<T> {
    Hit(T),
    Expired,
    Miss,
}

/// Local tier: entries plus a last-access index for LRU ordering.
struct LocalTier<T> {
    entries: HashMap<String, CacheEntry<T>>,
    recency: BTreeMap<u64, String>,
    tick: u64,
    bytes: usize,
}

impl<T: Clone> LocalTier<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
            bytes: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn lookup(&mut self, key: &str, now: Instant, settings: &CacheSettings) -> Lookup<T> {
        let valid = match self.entries.get(key) {
            None => return Lookup::Miss,
            Some(entry) => entry.is_valid(now, settings),
        };
        if !valid {
            self.remove(key);
            return Lookup::Expired;
        }

        let tick = self.next_tick();
        let Some(entry) = self.entries.get_mut(key) else {
            return Lookup::Miss;
        };
        self.recency.remove(&entry.last_access);
        entry.last_access = tick;
        entry.hit_count = entry.hit_count.saturating_add(1);
        self.recency.insert(tick, key.to_string());
        Lookup::Hit(entry.value.clone())
    }

    /// Insert (replacing any existing entry), evicting LRU entries until both
    /// bounds hold. Returns the number of evictions.
    fn insert(&mut self, mut entry: CacheEntry<T>, settings: &CacheSettings) -> usize {
        self.remove(&entry.key);

        let mut evicted = 0;
        while !self.entries.is_empty()
            && (self.entries.len() + 1 > settings.max_entries
                || self.bytes + entry.size > settings.max_bytes)
        {
            let Some((_, victim)) = self.recency.pop_first() else {
                break;
            };
            if let Some(old) = self.entries.remove(&victim) {
                self.bytes -= old.size;
                evicted += 1;
                debug!(key = %victim, "evicted least recently used cache entry");
            }
        }

        entry.last_access = self.next_tick();
        self.recency.insert(entry.last_access, entry.key.clone());
        self.bytes += entry.size;
        self.entries.insert(entry.key.clone(), entry);
        evicted
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(old) => {
                self.recency.remove(&old.last_access);
                self.bytes -= old.size;
                true
            }
            None => false,
        }
    }

    fn remove_where(&mut self, pred: impl Fn(&CacheEntry<T>) -> bool) -> Vec<String> {
        let keys: Vec<String> = self
            .entries
            .values()
            .filter(|e| pred(e))
            .map(|e| e.key.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys
    }

    fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        self.recency.clear();
        self.bytes = 0;
        n
    }
}

/// Serialized length of a value, the unit of the local byte budget.
fn encoded_len<T: Serialize>(value: &T) -> Result<usize, serde_json::Error> {
    serde_json::to_vec(value).map(|bytes| bytes.len())
}

#[derive(Serialize)]
struct EnvelopeOut<'a, T> {
    value: &'a T,
    tags: &'a BTreeSet<String>,
    scope: Option<&'a str>,
    validators: &'a Validators,
    expires_at_ms: i64,
}

#[derive(Deserialize)]
struct EnvelopeIn<T> {
    value: T,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    validators: Validators,
    expires_at_ms: i64,
}

/// Just the invalidation metadata of a stored envelope.
#[derive(Deserialize)]
struct EnvelopeMeta {
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Counter snapshot for health checks.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub bytes: usize,
    pub hit_rate: f64,
    pub distributed: Option<TierStats>,
}

pub struct CacheManager<T> {
    settings: CacheSettings,
    local: Mutex<LocalTier<T>>,
    distributed: Option<GuardedTier>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<T> CacheManager<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            local: Mutex::new(LocalTier::new()),
            distributed: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn with_distributed(mut self, tier: GuardedTier) -> Self {
        self.distributed = Some(tier);
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    fn distributed_key(&self, key: &str) -> String {
        format!("{}:{}", self.settings.namespace, key)
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        let lookup = lock(&self.local).lookup(key, Instant::now(), &self.settings);
        match lookup {
            Lookup::Hit(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
            Lookup::Expired => {
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
            Lookup::Miss => {}
        }

        if let Some(value) = self.get_distributed(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn get_distributed(&self, key: &str) -> Option<T> {
        let tier = self.distributed.as_ref()?;
        let bytes = tier.get(&self.distributed_key(key)).await?;
        let dkey = self.distributed_key(key);
        let envelope: EnvelopeIn<T> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(key, error = %e, "undecodable distributed cache entry");
                tier.discard(&dkey, CacheTierError::Corrupt(key.to_string())).await;
                return None;
            }
        };

        let remaining_ms = envelope.expires_at_ms - chrono::Utc::now().timestamp_millis();
        if remaining_ms <= 0 {
            return None;
        }

        let size = encoded_len(&envelope.value).unwrap_or(usize::MAX);
        if size <= self.settings.max_bytes {
            let entry = CacheEntry {
                key: key.to_string(),
                value: envelope.value.clone(),
                created_at: Instant::now(),
                ttl: Duration::from_millis(remaining_ms as u64),
                hit_count: 0,
                tags: envelope.tags,
                scope: envelope.scope,
                validators: envelope.validators,
                size,
                last_access: 0,
            };
            let evicted = lock(&self.local).insert(entry, &self.settings);
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        Some(envelope.value)
    }

    pub async fn set(&self, key: &str, value: T, options: SetOptions) -> Result<(), CacheError> {
        let size = encoded_len(&value).map_err(|source| CacheError::Serialize {
            key: key.to_string(),
            source,
        })?;
        if size > self.settings.max_bytes {
            return Err(CacheError::EntryTooLarge {
                key: key.to_string(),
                size,
                max: self.settings.max_bytes,
            });
        }
        let ttl = options.ttl.unwrap_or(self.settings.default_ttl);

        let envelope = match &self.distributed {
            Some(tier) if tier.is_available() => {
                let expires_at_ms =
                    chrono::Utc::now().timestamp_millis() + ttl.as_millis() as i64;
                let out = EnvelopeOut {
                    value: &value,
                    tags: &options.tags,
                    scope: options.scope.as_deref(),
                    validators: &options.validators,
                    expires_at_ms,
                };
                Some(
                    serde_json::to_vec(&out).map_err(|source| CacheError::Serialize {
                        key: key.to_string(),
                        source,
                    })?,
                )
            }
            _ => None,
        };

        let entry = CacheEntry {
            key: key.to_string(),
            value,
            created_at: Instant::now(),
            ttl,
            hit_count: 0,
            tags: options.tags,
            scope: options.scope,
            validators: options.validators,
            size,
            last_access: 0,
        };
        let evicted = lock(&self.local).insert(entry, &self.settings);
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);

        if let (Some(tier), Some(bytes)) = (&self.distributed, envelope) {
            tier.set(&self.distributed_key(key), bytes, ttl).await;
        }
        Ok(())
    }

    /// Remove one key from both tiers. Returns whether the local tier held it.
    pub async fn delete(&self, key: &str) -> bool {
        let removed = lock(&self.local).remove(key);
        if let Some(tier) = &self.distributed {
            tier.delete(&self.distributed_key(key)).await;
        }
        removed
    }

    /// Remove every entry whose tag set intersects `tags`. Returns the number
    /// of local entries removed.
    pub async fn invalidate_by_tag<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let wanted: BTreeSet<&str> = tags.iter().map(|t| t.as_ref()).collect();
        if wanted.is_empty() {
            return 0;
        }
        let removed =
            lock(&self.local).remove_where(|e| e.tags.iter().any(|t| wanted.contains(t.as_str())));

        if let Some(tier) = &self.distributed {
            for key in &removed {
                tier.delete(&self.distributed_key(key)).await;
            }
            let prefix = format!("{}:", self.settings.namespace);
            for dkey in tier.scan_prefix(&prefix).await {
                let Some(bytes) = tier.get(&dkey).await else {
                    continue;
                };
                let matches = serde_json::from_slice::<EnvelopeMeta>(&bytes)
                    .map(|e| e.tags.iter().any(|t| wanted.contains(t.as_str())))
                    .unwrap_or(false);
                if matches {
                    tier.delete(&dkey).await;
                }
            }
        }

        debug!(tags = ?wanted, removed = removed.len(), "invalidated cache by tag");
        removed.len()
    }

    /// Remove every entry belonging to `scope`: entries stored with that
    /// scope and entries whose key is `<scope>:...`. Idempotent.
    ///
    /// The distributed tier is scanned as well, so entries this process has
    /// already evicted locally (or never held) are removed too.
    pub async fn invalidate_by_scope(&self, scope: &str) -> usize {
        let removed = lock(&self.local).remove_where(|e| e.in_scope(scope));

        if let Some(tier) = &self.distributed {
            for key in &removed {
                tier.delete(&self.distributed_key(key)).await;
            }
            let namespace = format!("{}:", self.settings.namespace);
            let scoped = format!("{}{}:", namespace, scope);
            for dkey in tier.scan_prefix(&namespace).await {
                let matches = if dkey.starts_with(&scoped) {
                    true
                } else {
                    match tier.get(&dkey).await {
                        Some(bytes) => serde_json::from_slice::<EnvelopeMeta>(&bytes)
                            .map(|e| e.scope.as_deref() == Some(scope))
                            .unwrap_or(false),
                        None => false,
                    }
                };
                if matches {
                    tier.delete(&dkey).await;
                }
            }
        }

        debug!(scope, removed = removed.len(), "invalidated cache scope");
        removed.len()
    }

    pub async fn clear(&self) {
        let n = lock(&self.local).clear();
        if let Some(tier) = &self.distributed {
            let prefix = format!("{}:", self.settings.namespace);
            for dkey in tier.scan_prefix(&prefix).await {
                tier.delete(&dkey).await;
            }
        }
        debug!(entries = n, "cache cleared");
    }

    /// Validators stored with a live entry, for building conditional requests.
    pub fn validators(&self, key: &str) -> Option<Validators> {
        let local = lock(&self.local);
        let entry = local.entries.get(key)?;
        if entry.is_valid(Instant::now(), &self.settings) {
            Some(entry.validators.clone())
        } else {
            None
        }
    }

    /// Whether the live entry for `key` still matches the validators an
    /// upstream just reported. `false` forces a re-fetch.
    pub fn is_valid_for_headers(&self, key: &str, headers: &Validators) -> bool {
        let local = lock(&self.local);
        let Some(entry) = local.entries.get(key) else {
            return false;
        };
        if !entry.is_valid(Instant::now(), &self.settings) {
            return false;
        }

        if let Some(etag) = &headers.etag {
            if entry.validators.etag.as_deref() != Some(etag.as_str()) {
                return false;
            }
        }
        if let Some(supplied) = &headers.last_modified {
            match &entry.validators.last_modified {
                Some(stored) => {
                    if is_newer_http_date(supplied, stored) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }

    /// Restart the TTL clock of a live entry (e.g. after `304 Not Modified`).
    pub fn mark_fresh(&self, key: &str) -> bool {
        let mut local = lock(&self.local);
        match local.entries.get_mut(key) {
            Some(entry) => {
                entry.created_at = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.local).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let (size, bytes) = {
            let local = lock(&self.local);
            (local.entries.len(), local.bytes)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            size,
            bytes,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            distributed: self.distributed.as_ref().map(GuardedTier::stats),
        }
    }
}

/// `supplied` is strictly newer than `stored`. Unparseable dates compare by
/// inequality so a changed header still forces a re-fetch.
fn is_newer_http_date(supplied: &str, stored: &str) -> bool {
    let parse = |s: &str| chrono::DateTime::parse_from_rfc2822(s).ok();
    match (parse(supplied), parse(stored)) {
        (Some(a), Some(b)) => a > b,
        _ => supplied != stored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_tier::{DistributedTier, SharedMemoryTier};
    use crate::error::CacheTierError;
    use async_trait::async_trait;
    use std::sync::Arc;

    fn settings(max_entries: usize) -> CacheSettings {
        CacheSettings {
            default_ttl: Duration::from_secs(60),
            max_entries,
            max_bytes: 1024 * 1024,
            adaptive_ttl: false,
            adaptive_threshold: 10,
            namespace: "crt".to_string(),
        }
    }

    fn cache(max_entries: usize) -> CacheManager<String> {
        CacheManager::new(settings(max_entries))
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_round_trip() {
        let c = cache(10);
        c.set("k", "v".to_string(), SetOptions::default().ttl(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(c.get("k").await.as_deref(), Some("v"));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(c.get("k").await, None);
        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_accessed() {
        let c = cache(3);
        for k in ["a", "b", "c"] {
            c.set(k, k.to_string(), SetOptions::default()).await.unwrap();
        }
        c.set("d", "d".to_string(), SetOptions::default()).await.unwrap();
        assert_eq!(c.get("a").await, None);
        assert!(c.get("b").await.is_some());
        assert_eq!(c.stats().evictions, 1);
    }

    #[tokio::test]
    async fn get_protects_from_eviction() {
        let c = cache(3);
        for k in ["a", "b", "c"] {
            c.set(k, k.to_string(), SetOptions::default()).await.unwrap();
        }
        assert!(c.get("a").await.is_some());
        c.set("d", "d".to_string(), SetOptions::default()).await.unwrap();
        assert!(c.get("a").await.is_some());
        assert_eq!(c.get("b").await, None);
        assert!(c.get("c").await.is_some());
        assert!(c.get("d").await.is_some());
    }

    #[tokio::test]
    async fn replacing_a_key_does_not_evict() {
        let c = cache(2);
        c.set("a", "1".to_string(), SetOptions::default()).await.unwrap();
        c.set("b", "2".to_string(), SetOptions::default()).await.unwrap();
        c.set("a", "3".to_string(), SetOptions::default()).await.unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.get("a").await.as_deref(), Some("3"));
        assert_eq!(c.stats().evictions, 0);
    }

    #[tokio::test]
    async fn byte_budget_evicts() {
        let mut s = settings(100);
        // "xxxxxxxx" serializes to 10 bytes with quotes.
        s.max_bytes = 25;
        let c: CacheManager<String> = CacheManager::new(s);
        c.set("a", "x".repeat(8), SetOptions::default()).await.unwrap();
        c.set("b", "x".repeat(8), SetOptions::default()).await.unwrap();
        c.set("c", "x".repeat(8), SetOptions::default()).await.unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.stats().bytes, 20);
        assert_eq!(c.get("a").await, None);

        let err = c
            .set("huge", "x".repeat(100), SetOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::EntryTooLarge { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_ttl_extends_hot_entries() {
        let mut s = settings(10);
        s.adaptive_ttl = true;
        s.adaptive_threshold = 2;
        let c: CacheManager<String> = CacheManager::new(s);
        c.set("hot", "v".to_string(), SetOptions::default().ttl(Duration::from_secs(100)))
            .await
            .unwrap();
        c.set("cold", "v".to_string(), SetOptions::default().ttl(Duration::from_secs(100)))
            .await
            .unwrap();
        for _ in 0..20 {
            assert!(c.get("hot").await.is_some());
        }
        // 20 hits: ttl × (1 + ln(20)/10) ≈ 130s
        tokio::time::advance(Duration::from_secs(110)).await;
        assert!(c.get("hot").await.is_some());
        assert_eq!(c.get("cold").await, None);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(c.get("hot").await, None);
    }

    #[tokio::test]
    async fn tag_invalidation() {
        let c = cache(10);
        c.set("a", "1".to_string(), SetOptions::default().tag("runbook").tag("k8s"))
            .await
            .unwrap();
        c.set("b", "2".to_string(), SetOptions::default().tag("k8s"))
            .await
            .unwrap();
        c.set("c", "3".to_string(), SetOptions::default().tag("db"))
            .await
            .unwrap();
        assert_eq!(c.invalidate_by_tag(&["runbook", "nope"]).await, 1);
        assert_eq!(c.invalidate_by_tag(&["k8s"]).await, 1);
        assert!(c.get("c").await.is_some());
        assert_eq!(c.len(), 1);
    }

    #[tokio::test]
    async fn scope_invalidation_is_idempotent() {
        let c = cache(10);
        c.set(&cache_key("repo-a", "README.md"), "1".to_string(), SetOptions::default())
            .await
            .unwrap();
        c.set("listing", "2".to_string(), SetOptions::default().scope("repo-a"))
            .await
            .unwrap();
        c.set(&cache_key("repo-ab", "x"), "3".to_string(), SetOptions::default())
            .await
            .unwrap();
        assert_eq!(c.invalidate_by_scope("repo-a").await, 2);
        assert_eq!(c.invalidate_by_scope("repo-a").await, 0);
        assert_eq!(c.len(), 1, "repo-ab is a different scope");
    }

    #[tokio::test]
    async fn validators_drive_freshness() {
        let c = cache(10);
        let stored = Validators {
            etag: Some("\"v1\"".to_string()),
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
        };
        c.set("k", "v".to_string(), SetOptions::default().validators(stored.clone()))
            .await
            .unwrap();

        assert!(c.is_valid_for_headers("k", &stored));
        assert!(c.is_valid_for_headers("k", &Validators::default()));
        assert!(!c.is_valid_for_headers(
            "k",
            &Validators {
                etag: Some("\"v2\"".to_string()),
                last_modified: None,
            }
        ));
        assert!(!c.is_valid_for_headers(
            "k",
            &Validators {
                etag: None,
                last_modified: Some("Thu, 22 Oct 2015 07:28:00 GMT".to_string()),
            }
        ));
        assert!(c.is_valid_for_headers(
            "k",
            &Validators {
                etag: None,
                last_modified: Some("Tue, 20 Oct 2015 07:28:00 GMT".to_string()),
            }
        ));
        assert!(!c.is_valid_for_headers("missing", &stored));
        assert_eq!(c.validators("k"), Some(stored));
    }

    #[tokio::test]
    async fn distributed_hit_backfills_local() {
        let shared = SharedMemoryTier::new();
        let guard = |tier: &SharedMemoryTier| {
            GuardedTier::new(Arc::new(tier.clone()), 3, Duration::from_secs(30))
        };
        let writer: CacheManager<String> =
            CacheManager::new(settings(10)).with_distributed(guard(&shared));
        let reader: CacheManager<String> =
            CacheManager::new(settings(10)).with_distributed(guard(&shared));

        writer
            .set(&cache_key("repo", "a.md"), "doc".to_string(), SetOptions::default())
            .await
            .unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(reader.len(), 0);
        assert_eq!(reader.get("repo:a.md").await.as_deref(), Some("doc"));
        assert_eq!(reader.len(), 1);

        writer.invalidate_by_scope("repo").await;
        assert!(shared.is_empty());
    }

    #[tokio::test]
    async fn distributed_tag_invalidation_scans_tier() {
        let shared = SharedMemoryTier::new();
        let writer: CacheManager<String> = CacheManager::new(settings(10)).with_distributed(
            GuardedTier::new(Arc::new(shared.clone()), 3, Duration::from_secs(30)),
        );
        let other: CacheManager<String> = CacheManager::new(settings(10)).with_distributed(
            GuardedTier::new(Arc::new(shared.clone()), 3, Duration::from_secs(30)),
        );
        writer
            .set("s:a", "1".to_string(), SetOptions::default().tag("incident"))
            .await
            .unwrap();
        writer
            .set("s:b", "2".to_string(), SetOptions::default().tag("other"))
            .await
            .unwrap();
        assert_eq!(other.invalidate_by_tag(&["incident"]).await, 0);
        assert_eq!(shared.len(), 1);
    }

    #[tokio::test]
    async fn scope_invalidation_reaches_locally_evicted_entries() {
        let shared = SharedMemoryTier::new();
        let c: CacheManager<String> = CacheManager::new(settings(1)).with_distributed(
            GuardedTier::new(Arc::new(shared.clone()), 3, Duration::from_secs(30)),
        );
        c.set("listing", "stale".to_string(), SetOptions::default().scope("repo-a"))
            .await
            .unwrap();
        c.set("other", "x".to_string(), SetOptions::default())
            .await
            .unwrap();
        assert_eq!(c.stats().evictions, 1);

        c.invalidate_by_scope("repo-a").await;
        assert_eq!(c.get("listing").await, None);
        assert_eq!(shared.len(), 1, "unscoped entry survives");
    }

    #[tokio::test]
    async fn backfill_counts_value_bytes_like_set() {
        let shared = SharedMemoryTier::new();
        let guard = || GuardedTier::new(Arc::new(shared.clone()), 3, Duration::from_secs(30));
        let writer: CacheManager<String> = CacheManager::new(settings(10)).with_distributed(guard());
        let reader: CacheManager<String> = CacheManager::new(settings(10)).with_distributed(guard());

        writer
            .set("k", "doc".to_string(), SetOptions::default().tag("t").scope("s"))
            .await
            .unwrap();
        assert_eq!(reader.get("k").await.as_deref(), Some("doc"));
        assert_eq!(writer.stats().bytes, 5);
        assert_eq!(reader.stats().bytes, 5);
    }

    #[tokio::test]
    async fn corrupt_distributed_entry_is_discarded() {
        let shared = SharedMemoryTier::new();
        shared
            .set("crt:k", b"not json".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let c: CacheManager<String> = CacheManager::new(settings(10)).with_distributed(
            GuardedTier::new(Arc::new(shared.clone()), 3, Duration::from_secs(30)),
        );

        assert_eq!(c.get("k").await, None);
        assert!(shared.is_empty());
        let tier = c.stats().distributed.unwrap();
        assert_eq!(tier.errors, 1);
        assert_eq!(tier.state, crate::circuit_breaker::CircuitState::Closed);
    }

    struct DownTier;

    #[async_trait]
    impl DistributedTier for DownTier {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheTierError> {
            Err(CacheTierError::CacheTierUnavailable("down".into()))
        }
        async fn set(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<(), CacheTierError> {
            Err(CacheTierError::CacheTierUnavailable("down".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheTierError> {
            Err(CacheTierError::CacheTierUnavailable("down".into()))
        }
        async fn scan_prefix(&self, _prefix: &str) -> Result<Vec<String>, CacheTierError> {
            Err(CacheTierError::CacheTierUnavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn distributed_failures_are_absorbed() {
        let c: CacheManager<String> = CacheManager::new(settings(10))
            .with_distributed(GuardedTier::new(Arc::new(DownTier), 2, Duration::from_secs(30)));
        c.set("a", "1".to_string(), SetOptions::default()).await.unwrap();
        assert_eq!(c.get("a").await.as_deref(), Some("1"));
        assert_eq!(c.get("missing").await, None);
        assert_eq!(c.invalidate_by_scope("x").await, 0);
        let tier = c.stats().distributed.unwrap();
        assert_eq!(tier.errors, 2);
        assert_eq!(tier.state, crate::circuit_breaker::CircuitState::Open);
    }

    #[tokio::test]
    async fn clear_empties_both_tiers() {
        let shared = SharedMemoryTier::new();
        let c: CacheManager<String> = CacheManager::new(settings(10)).with_distributed(
            GuardedTier::new(Arc::new(shared.clone()), 3, Duration::from_secs(30)),
        );
        c.set("a", "1".to_string(), SetOptions::default()).await.unwrap();
        c.set("b", "2".to_string(), SetOptions::default()).await.unwrap();
        c.clear().await;
        assert!(c.is_empty());
        assert!(shared.is_empty());
    }

    #[test]
    fn http_date_comparison() {
        assert!(is_newer_http_date(
            "Thu, 22 Oct 2015 07:28:00 GMT",
            "Wed, 21 Oct 2015 07:28:00 GMT"
        ));
        assert!(!is_newer_http_date(
            "Wed, 21 Oct 2015 07:28:00 GMT",
            "Wed, 21 Oct 2015 07:28:00 GMT"
        ));
        assert!(is_newer_http_date("garbage", "other garbage"));
    }
}
