use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Upper bound for every configured duration (30 days). Keeps deadline and
/// reset arithmetic on monotonic instants far from overflow.
pub const MAX_DURATION_MS: u64 = 30 * 24 * 60 * 60 * 1000;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Longest a caller will wait for rate-limit quota. Unbounded when absent.
    #[serde(default)]
    pub rate_limit_timeout_ms: Option<u64>,
    /// Whether 4xx responses (other than 429) count against the breaker.
    #[serde(default)]
    pub client_errors_trip_breaker: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            timeout_ms: default_timeout_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            rate_limit_timeout_ms: None,
            client_errors_trip_breaker: false,
        }
    }
}

fn default_max_concurrent() -> usize {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter_ms() -> u64 {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_ms() -> u64 {
    60_000
}
fn default_half_open_max_calls() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_burst_fraction")]
    pub burst_fraction: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_ms: default_window_ms(),
            burst_fraction: default_burst_fraction(),
        }
    }
}

fn default_limit() -> u32 {
    60
}
fn default_window_ms() -> u64 {
    60_000
}
fn default_burst_fraction() -> f64 {
    0.2
}

/// Per-endpoint overrides, keyed by logical endpoint key (`source:endpoint`).
#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    pub key: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub window_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_true")]
    pub adaptive_ttl: bool,
    #[serde(default = "default_adaptive_threshold")]
    pub adaptive_threshold: u64,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// `"none"` or `"shared-memory"`.
    #[serde(default = "default_distributed")]
    pub distributed: String,
    #[serde(default = "default_failure_threshold")]
    pub distributed_failure_threshold: u32,
    #[serde(default = "default_distributed_reset_ms")]
    pub distributed_reset_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_ttl_ms(),
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            adaptive_ttl: true,
            adaptive_threshold: default_adaptive_threshold(),
            namespace: default_namespace(),
            distributed: default_distributed(),
            distributed_failure_threshold: default_failure_threshold(),
            distributed_reset_timeout_ms: default_distributed_reset_ms(),
        }
    }
}

fn default_ttl_ms() -> u64 {
    300_000
}
fn default_max_entries() -> usize {
    1_000
}
fn default_max_bytes() -> usize {
    50 * 1024 * 1024
}
fn default_true() -> bool {
    true
}
fn default_adaptive_threshold() -> u64 {
    10
}
fn default_namespace() -> String {
    "crt".to_string()
}
fn default_distributed() -> String {
    "none".to_string()
}
fn default_distributed_reset_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_poll_interval_minutes")]
    pub poll_interval_minutes: u64,
    /// Shared webhook secret. Falls back to `CRT_WEBHOOK_SECRET`.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Revision endpoint template; `{scope}` is substituted per scope.
    #[serde(default)]
    pub revision_url: Option<String>,
    #[serde(default = "default_revision_pointer")]
    pub revision_pointer: String,
    #[serde(default)]
    pub include_globs: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_minutes: default_poll_interval_minutes(),
            webhook_secret: None,
            scopes: Vec::new(),
            revision_url: None,
            revision_pointer: default_revision_pointer(),
            include_globs: Vec::new(),
        }
    }
}

fn default_poll_interval_minutes() -> u64 {
    5
}
fn default_revision_pointer() -> String {
    "/sha".to_string()
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_minutes.saturating_mul(60))
    }

    pub fn resolved_webhook_secret(&self) -> Option<String> {
        self.webhook_secret
            .clone()
            .or_else(|| std::env::var("CRT_WEBHOOK_SECRET").ok())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

/// Credentials are never stored in the file; only the scheme is.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// `"none"`, `"bearer"`, `"basic"`, or `"api_key"`.
    #[serde(default = "default_auth_kind")]
    pub kind: String,
    /// Header name for `api_key` auth.
    #[serde(default = "default_api_key_header")]
    pub header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            kind: default_auth_kind(),
            header: default_api_key_header(),
        }
    }
}

fn default_auth_kind() -> String {
    "none".to_string()
}
fn default_api_key_header() -> String {
    "X-Api-Key".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn check_duration(name: &str, ms: u64) -> Result<()> {
    if ms > MAX_DURATION_MS {
        bail!("{} must be <= {} ms (30 days)", name, MAX_DURATION_MS);
    }
    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    check_duration("executor.timeout_ms", config.executor.timeout_ms)?;
    check_duration("executor.max_delay_ms", config.executor.max_delay_ms)?;
    check_duration("executor.jitter_ms", config.executor.jitter_ms)?;
    if let Some(ms) = config.executor.rate_limit_timeout_ms {
        check_duration("executor.rate_limit_timeout_ms", ms)?;
    }
    check_duration(
        "circuit_breaker.recovery_timeout_ms",
        config.circuit_breaker.recovery_timeout_ms,
    )?;
    check_duration("rate_limit.window_ms", config.rate_limit.window_ms)?;
    check_duration("cache.default_ttl_ms", config.cache.default_ttl_ms)?;
    check_duration(
        "cache.distributed_reset_timeout_ms",
        config.cache.distributed_reset_timeout_ms,
    )?;
    check_duration(
        "sync.poll_interval_minutes",
        config.sync.poll_interval_minutes.saturating_mul(60_000),
    )?;
    for endpoint in &config.endpoints {
        if let Some(ms) = endpoint.timeout_ms {
            check_duration("endpoints[].timeout_ms", ms)?;
        }
        if let Some(ms) = endpoint.window_ms {
            check_duration("endpoints[].window_ms", ms)?;
        }
    }

    // Executor
    if config.executor.max_concurrent == 0 {
        bail!("executor.max_concurrent must be > 0");
    }
    if config.executor.timeout_ms == 0 {
        bail!("executor.timeout_ms must be > 0");
    }
    if config.executor.base_delay_ms > config.executor.max_delay_ms {
        bail!("executor.base_delay_ms must be <= executor.max_delay_ms");
    }

    // Circuit breaker
    if config.circuit_breaker.failure_threshold == 0 {
        bail!("circuit_breaker.failure_threshold must be > 0");
    }
    if config.circuit_breaker.half_open_max_calls == 0 {
        bail!("circuit_breaker.half_open_max_calls must be > 0");
    }

    // Rate limit
    if config.rate_limit.limit == 0 {
        bail!("rate_limit.limit must be > 0");
    }
    if config.rate_limit.window_ms == 0 {
        bail!("rate_limit.window_ms must be > 0");
    }
    if !(0.0..=1.0).contains(&config.rate_limit.burst_fraction) {
        bail!("rate_limit.burst_fraction must be in [0.0, 1.0]");
    }

    let mut seen = HashSet::new();
    for endpoint in &config.endpoints {
        if endpoint.key.is_empty() {
            bail!("endpoints[].key must not be empty");
        }
        if !seen.insert(endpoint.key.as_str()) {
            bail!("duplicate endpoint override: '{}'", endpoint.key);
        }
        if endpoint.limit == Some(0) || endpoint.window_ms == Some(0) {
            bail!("endpoint '{}': limit and window_ms must be > 0", endpoint.key);
        }
    }

    // Cache
    if config.cache.max_entries == 0 {
        bail!("cache.max_entries must be > 0");
    }
    if config.cache.max_bytes == 0 {
        bail!("cache.max_bytes must be > 0");
    }
    match config.cache.distributed.as_str() {
        "none" | "shared-memory" => {}
        other => bail!(
            "Unknown cache.distributed tier: '{}'. Must be none or shared-memory.",
            other
        ),
    }

    // Sync
    if config.sync.poll_interval_minutes == 0 {
        bail!("sync.poll_interval_minutes must be > 0");
    }
    if let Some(url) = &config.sync.revision_url {
        if !url.contains("{scope}") {
            bail!("sync.revision_url must contain a {{scope}} placeholder");
        }
    }

    match config.auth.kind.as_str() {
        "none" | "bearer" | "basic" | "api_key" => {}
        other => bail!(
            "Unknown auth kind: '{}'. Must be none, bearer, basic, or api_key.",
            other
        ),
    }

    Ok(())
}
