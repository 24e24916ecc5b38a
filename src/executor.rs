//! Request execution engine.
//!
//! [`RequestExecutor::execute`] issues one logical request to an upstream
//! endpoint through five stages:
//!
//! 1. **Circuit check**: fail fast with [`ExecutionError::CircuitOpen`] while
//!    the endpoint's breaker is open; admit a limited number of probes once
//!    the cooldown has elapsed.
//! 2. **Rate limit**: take quota from the endpoint's fixed window, dipping
//!    into the burst allowance before suspending until the window resets.
//! 3. **Concurrency admission**: at most `max_concurrent` calls in flight
//!    across all endpoints; extra callers wait in a FIFO queue.
//! 4. **Attempt loop**: retry 5xx/429 and transport failures with
//!    exponential backoff plus jitter; 4xx fails immediately.
//! 5. **Outcome recording**: feed the breaker and the aggregate metrics.
//!
//! Breaker and rate-window state are kept per endpoint key behind their own
//! lock, so unrelated endpoints never serialize on each other.
//!
//! # Deadlines
//!
//! Every call may carry a deadline. Running out of time while rate limited,
//! queued, or in flight aborts with [`ExecutionError::Timeout`] and releases
//! any queue slot held. A retry whose backoff alone would overrun the
//! deadline is not started.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::{Admission, BreakerSettings, CircuitBreakerState, CircuitState};
use crate::config::Config;
use crate::error::{ExecutionError, Stage, TransportError};
use crate::lock;
use crate::models::{RequestOutcome, RequestSpec, Response};
use crate::rate_limiter::{Permit, RateLimitSettings, RateLimitWindow};
use crate::transport::{AuthProvider, Transport};

// ═══════════════════════════════════════════════════════════════════════
// Settings
// ═══════════════════════════════════════════════════════════════════════

/// `min(base × 2^attempt, max) + jitter`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        let exp = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        exp + random_jitter(self.jitter)
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let roll = (Uuid::new_v4().as_u128() % (u128::from(max_ms) + 1)) as u64;
    Duration::from_millis(roll)
}

/// Retry and rate-limit settings resolved for one endpoint key.
#[derive(Debug, Clone, Copy)]
pub struct EndpointSettings {
    pub max_retries: u32,
    pub timeout: Duration,
    pub rate_limit: RateLimitSettings,
}

/// Fully resolved executor configuration. Built once at construction.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub max_concurrent: usize,
    pub backoff: BackoffPolicy,
    pub breaker: BreakerSettings,
    pub rate_limit_ceiling: Option<Duration>,
    pub client_errors_trip_breaker: bool,
    pub defaults: EndpointSettings,
    pub endpoints: HashMap<String, EndpointSettings>,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        let exec = &config.executor;
        let defaults = EndpointSettings {
            max_retries: exec.max_retries,
            timeout: Duration::from_millis(exec.timeout_ms),
            rate_limit: RateLimitSettings::from_config(&config.rate_limit, None),
        };
        let endpoints = config
            .endpoints
            .iter()
            .map(|e| {
                let settings = EndpointSettings {
                    max_retries: e.max_retries.unwrap_or(exec.max_retries),
                    timeout: Duration::from_millis(e.timeout_ms.unwrap_or(exec.timeout_ms)),
                    rate_limit: RateLimitSettings::from_config(&config.rate_limit, Some(e)),
                };
                (e.key.clone(), settings)
            })
            .collect();

        Self {
            max_concurrent: exec.max_concurrent,
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(exec.base_delay_ms),
                max_delay: Duration::from_millis(exec.max_delay_ms),
                jitter: Duration::from_millis(exec.jitter_ms),
            },
            breaker: BreakerSettings::from_config(&config.circuit_breaker),
            rate_limit_ceiling: exec.rate_limit_timeout_ms.map(Duration::from_millis),
            client_errors_trip_breaker: exec.client_errors_trip_breaker,
            defaults,
            endpoints,
        }
    }

    pub fn endpoint(&self, key: &str) -> EndpointSettings {
        self.endpoints.get(key).copied().unwrap_or(self.defaults)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Retry state machine
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct RetryState {
    attempt: u32,
    max_retries: u32,
}

impl RetryState {
    fn new(max_retries: u32) -> Self {
        Self {
            attempt: 0,
            max_retries,
        }
    }

    /// Advance to the next attempt, returning the delay to wait first, or
    /// `None` once the budget is spent.
    fn next_delay(&mut self, policy: &BackoffPolicy) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        let delay = policy.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    fn retries_used(&self) -> u32 {
        self.attempt
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Metrics
// ═══════════════════════════════════════════════════════════════════════

/// Weight of the newest sample in the rolling latency average.
const LATENCY_ALPHA: f64 = 0.2;

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    /// Exponentially weighted moving average; `None` until the first call ends.
    latency_ewma_ms: Mutex<Option<f64>>,
    retries: AtomicU64,
    trips: AtomicU64,
    circuit_rejections: AtomicU64,
    rate_limit_hits: AtomicU64,
    burst_requests: AtomicU64,
    active: AtomicUsize,
    queued: AtomicUsize,
    peak: AtomicUsize,
}

/// Snapshot of executor counters for health checks.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ExecutorMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Rolling (exponentially weighted) average over finished calls.
    pub average_latency_ms: f64,
    pub retries: u64,
    pub circuit_breaker_trips: u64,
    pub circuit_rejections: u64,
    pub rate_limit_hits: u64,
    pub burst_requests: u64,
    pub active_requests: usize,
    pub queued_requests: usize,
    pub peak_concurrency: usize,
}

/// Per-endpoint breaker snapshot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub endpoint: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Holds an in-flight slot in the active counter for the life of an attempt loop.
struct ActiveGuard<'a> {
    counters: &'a Counters,
}

impl<'a> ActiveGuard<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now_active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak.fetch_max(now_active, Ordering::SeqCst);
        Self { counters }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Executor
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct EndpointState {
    breaker: CircuitBreakerState,
    window: RateLimitWindow,
}

/// How a finished call should be reported to the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Healthy,
    Failed,
    /// Ended before upstream gave an answer (deadline while waiting locally).
    NoVerdict,
}

pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    auth: Option<Arc<dyn AuthProvider>>,
    settings: ExecutorSettings,
    endpoints: DashMap<String, Arc<Mutex<EndpointState>>>,
    slots: Arc<Semaphore>,
    counters: Counters,
}

impl RequestExecutor {
    pub fn new(settings: ExecutorSettings, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            auth: None,
            slots: Arc::new(Semaphore::new(settings.max_concurrent)),
            settings,
            endpoints: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Execute one logical request against `endpoint_key`.
    pub async fn execute(
        &self,
        endpoint_key: &str,
        spec: &RequestSpec,
        deadline: Option<Instant>,
    ) -> Result<Response, ExecutionError> {
        self.execute_detailed(endpoint_key, spec, deadline).await.0
    }

    /// Like [`execute`](Self::execute), also returning the call's outcome record.
    pub async fn execute_detailed(
        &self,
        endpoint_key: &str,
        spec: &RequestSpec,
        deadline: Option<Instant>,
    ) -> (Result<Response, ExecutionError>, RequestOutcome) {
        let started = Instant::now();
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let state = self.endpoint_state(endpoint_key);

        let admission = lock(&state)
            .breaker
            .try_acquire(Instant::now(), &self.settings.breaker);
        if let Admission::Rejected { retry_in } = admission {
            self.counters
                .circuit_rejections
                .fetch_add(1, Ordering::Relaxed);
            let err = ExecutionError::CircuitOpen {
                endpoint: endpoint_key.to_string(),
                retry_in,
            };
            let outcome = self.record_metrics(started, false, None, 0);
            return (Err(err), outcome);
        }
        if admission == Admission::Probe {
            info!(endpoint = endpoint_key, "circuit half-open, sending probe");
        }

        let (result, retries_used, verdict) = self
            .run_admitted(endpoint_key, &state, spec, deadline)
            .await;

        {
            let mut guard = lock(&state);
            match verdict {
                Verdict::Healthy => {
                    if guard.breaker.on_success() {
                        info!(endpoint = endpoint_key, "circuit closed after successful probe");
                    }
                }
                Verdict::Failed => {
                    if guard
                        .breaker
                        .on_failure(Instant::now(), &self.settings.breaker)
                    {
                        self.counters.trips.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            endpoint = endpoint_key,
                            failures = guard.breaker.consecutive_failures,
                            recovery_ms = self.settings.breaker.recovery_timeout.as_millis() as u64,
                            "circuit opened"
                        );
                    }
                }
                Verdict::NoVerdict => {
                    if admission == Admission::Probe {
                        guard.breaker.release_probe();
                    }
                }
            }
        }

        let status = match &result {
            Ok(resp) => Some(resp.status),
            Err(e) => e.http_status(),
        };
        let outcome = self.record_metrics(started, result.is_ok(), status, retries_used);
        (result, outcome)
    }

    async fn run_admitted(
        &self,
        endpoint_key: &str,
        state: &Mutex<EndpointState>,
        spec: &RequestSpec,
        deadline: Option<Instant>,
    ) -> (Result<Response, ExecutionError>, u32, Verdict) {
        let endpoint = self.settings.endpoint(endpoint_key);

        // Request build: auth failures count against the breaker.
        let mut request = spec.clone();
        if let Some(auth) = &self.auth {
            match auth.auth_headers().await {
                Ok(headers) => {
                    for (name, value) in headers {
                        request.headers.entry(name).or_insert(value);
                    }
                }
                Err(e) => {
                    return (
                        Err(ExecutionError::Auth(e.to_string())),
                        0,
                        Verdict::Failed,
                    )
                }
            }
        }

        if let Err(e) = self
            .wait_for_quota(endpoint_key, state, &endpoint.rate_limit, deadline)
            .await
        {
            return (Err(e), 0, Verdict::NoVerdict);
        }

        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        let acquired = match deadline {
            Some(d) => timeout_at(d, self.slots.clone().acquire_owned()).await,
            None => Ok(self.slots.clone().acquire_owned().await),
        };
        self.counters.queued.fetch_sub(1, Ordering::SeqCst);
        let _permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                let err = TransportError::Other("executor is shut down".to_string());
                return (Err(err.into()), 0, Verdict::NoVerdict);
            }
            Err(_) => {
                let err = ExecutionError::Timeout {
                    endpoint: endpoint_key.to_string(),
                    stage: Stage::Queued,
                };
                return (Err(err), 0, Verdict::NoVerdict);
            }
        };
        let _active = ActiveGuard::enter(&self.counters);

        let timeout = spec.timeout.unwrap_or(endpoint.timeout);
        let mut retry = RetryState::new(spec.max_retries.unwrap_or(endpoint.max_retries));

        loop {
            let attempt = self.attempt_once(endpoint_key, &request, timeout, deadline).await;
            let err = match attempt {
                AttemptResult::Done(resp) => {
                    return (Ok(resp), retry.retries_used(), Verdict::Healthy);
                }
                AttemptResult::Fatal(err) => {
                    let verdict = if self.settings.client_errors_trip_breaker {
                        Verdict::Failed
                    } else {
                        Verdict::Healthy
                    };
                    return (Err(err), retry.retries_used(), verdict);
                }
                AttemptResult::DeadlineExpired => {
                    let err = ExecutionError::Timeout {
                        endpoint: endpoint_key.to_string(),
                        stage: Stage::InFlight,
                    };
                    return (Err(err), retry.retries_used(), Verdict::Failed);
                }
                AttemptResult::Retryable(err) => err,
            };

            let Some(delay) = retry.next_delay(&self.settings.backoff) else {
                let attempts = retry.retries_used() + 1;
                let err = ExecutionError::ExhaustedRetries {
                    endpoint: endpoint_key.to_string(),
                    attempts,
                    source: Box::new(err),
                };
                return (Err(err), retry.retries_used(), Verdict::Failed);
            };

            if let Some(d) = deadline {
                if Instant::now() + delay >= d {
                    let err = ExecutionError::Timeout {
                        endpoint: endpoint_key.to_string(),
                        stage: Stage::Backoff,
                    };
                    return (Err(err), retry.retries_used() - 1, Verdict::Failed);
                }
            }

            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            debug!(
                endpoint = endpoint_key,
                attempt = retry.retries_used(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt_once(
        &self,
        endpoint_key: &str,
        request: &RequestSpec,
        timeout: Duration,
        deadline: Option<Instant>,
    ) -> AttemptResult {
        let sent = match deadline {
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return AttemptResult::DeadlineExpired;
                }
                match timeout_at(d, self.transport.send(request, timeout.min(remaining))).await {
                    Ok(sent) => sent,
                    Err(_) => return AttemptResult::DeadlineExpired,
                }
            }
            None => self.transport.send(request, timeout).await,
        };

        match sent {
            Ok(resp) if resp.status < 400 => AttemptResult::Done(resp),
            Ok(resp) if resp.status == 429 || resp.status >= 500 => {
                AttemptResult::Retryable(ExecutionError::Server {
                    endpoint: endpoint_key.to_string(),
                    status: resp.status,
                    body: resp.text(),
                })
            }
            Ok(resp) => AttemptResult::Fatal(ExecutionError::Client {
                endpoint: endpoint_key.to_string(),
                status: resp.status,
                body: resp.text(),
            }),
            Err(e) => AttemptResult::Retryable(ExecutionError::Transport(e)),
        }
    }

    /// Take quota from the endpoint's window, suspending while both the
    /// window and the burst allowance are spent.
    async fn wait_for_quota(
        &self,
        endpoint_key: &str,
        state: &Mutex<EndpointState>,
        settings: &RateLimitSettings,
        deadline: Option<Instant>,
    ) -> Result<(), ExecutionError> {
        let mut waited = Duration::ZERO;
        let mut counted = false;

        loop {
            let permit = lock(state).window.acquire(Instant::now(), settings);
            let wait = match permit {
                Permit::Normal => return Ok(()),
                Permit::Burst => {
                    self.counters.burst_requests.fetch_add(1, Ordering::Relaxed);
                    if !counted {
                        self.counters.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Permit::Wait(wait) => wait,
            };

            if !counted {
                self.counters.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
                counted = true;
            }
            if let Some(ceiling) = self.settings.rate_limit_ceiling {
                if waited + wait > ceiling {
                    return Err(ExecutionError::RateLimitTimeout {
                        endpoint: endpoint_key.to_string(),
                        wait: waited + wait,
                        ceiling,
                    });
                }
            }
            if let Some(d) = deadline {
                if Instant::now() + wait > d {
                    return Err(ExecutionError::Timeout {
                        endpoint: endpoint_key.to_string(),
                        stage: Stage::RateLimited,
                    });
                }
            }

            debug!(
                endpoint = endpoint_key,
                wait_ms = wait.as_millis() as u64,
                "rate limit window exhausted, waiting for reset"
            );
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    fn endpoint_state(&self, endpoint_key: &str) -> Arc<Mutex<EndpointState>> {
        if let Some(state) = self.endpoints.get(endpoint_key) {
            return state.clone();
        }
        self.endpoints
            .entry(endpoint_key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(EndpointState {
                    breaker: CircuitBreakerState::default(),
                    window: RateLimitWindow::new(Instant::now()),
                }))
            })
            .clone()
    }

    fn record_metrics(
        &self,
        started: Instant,
        success: bool,
        http_status: Option<u16>,
        retries_used: u32,
    ) -> RequestOutcome {
        let latency_ms = started.elapsed().as_millis() as u64;
        if success {
            self.counters.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        {
            let mut ewma = lock(&self.counters.latency_ewma_ms);
            let sample = latency_ms as f64;
            *ewma = Some(match *ewma {
                Some(avg) => avg + LATENCY_ALPHA * (sample - avg),
                None => sample,
            });
        }
        RequestOutcome {
            success,
            latency_ms,
            http_status,
            retries_used,
        }
    }

    pub fn metrics(&self) -> ExecutorMetrics {
        let c = &self.counters;
        let success = c.success.load(Ordering::Relaxed);
        let failed = c.failed.load(Ordering::Relaxed);
        let average_latency_ms = lock(&c.latency_ewma_ms).unwrap_or(0.0);
        ExecutorMetrics {
            total_requests: c.total.load(Ordering::Relaxed),
            successful_requests: success,
            failed_requests: failed,
            average_latency_ms,
            retries: c.retries.load(Ordering::Relaxed),
            circuit_breaker_trips: c.trips.load(Ordering::Relaxed),
            circuit_rejections: c.circuit_rejections.load(Ordering::Relaxed),
            rate_limit_hits: c.rate_limit_hits.load(Ordering::Relaxed),
            burst_requests: c.burst_requests.load(Ordering::Relaxed),
            active_requests: c.active.load(Ordering::SeqCst),
            queued_requests: c.queued.load(Ordering::SeqCst),
            peak_concurrency: c.peak.load(Ordering::SeqCst),
        }
    }

    pub fn breaker_state(&self, endpoint_key: &str) -> Option<BreakerSnapshot> {
        self.endpoints.get(endpoint_key).map(|state| {
            let guard = lock(&state);
            BreakerSnapshot {
                endpoint: endpoint_key.to_string(),
                state: guard.breaker.state,
                consecutive_failures: guard.breaker.consecutive_failures,
            }
        })
    }

    /// Snapshots of every endpoint seen so far, sorted by key.
    pub fn breakers(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<BreakerSnapshot> = self
            .endpoints
            .iter()
            .map(|entry| {
                let guard = lock(entry.value());
                BreakerSnapshot {
                    endpoint: entry.key().clone(),
                    state: guard.breaker.state,
                    consecutive_failures: guard.breaker.consecutive_failures,
                }
            })
            .collect();
        all.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        all
    }

    /// Force an endpoint's breaker back to closed (manual recovery).
    pub fn reset_breaker(&self, endpoint_key: &str) {
        if let Some(state) = self.endpoints.get(endpoint_key) {
            lock(&state).breaker.reset();
        }
    }

    /// Stop admitting new calls. Queued callers fail immediately.
    pub fn close(&self) {
        self.slots.close();
    }
}

enum AttemptResult {
    Done(Response),
    Retryable(ExecutionError),
    Fatal(ExecutionError),
    DeadlineExpired,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Scripted transport: pops responses in order, then falls back to 200.
    /// Tracks calls in arrival order and peak in-flight concurrency.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<Response, TransportError>>>,
        delay: Duration,
        seen: Mutex<Vec<String>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl ScriptedTransport {
        fn with_script(script: Vec<Result<Response, TransportError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            request: &RequestSpec,
            _timeout: Duration,
        ) -> Result<Response, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.seen).push(request.url.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            lock(&self.script)
                .pop_front()
                .unwrap_or_else(|| Ok(Response::new(200, "ok")))
        }
    }

    fn settings() -> ExecutorSettings {
        let mut config = Config::default();
        config.executor.max_retries = 0;
        config.executor.base_delay_ms = 100;
        config.executor.max_delay_ms = 1_000;
        config.executor.jitter_ms = 0;
        config.circuit_breaker.failure_threshold = 3;
        config.circuit_breaker.recovery_timeout_ms = 10_000;
        config.rate_limit.limit = 1_000;
        ExecutorSettings::from_config(&config)
    }

    fn server_error() -> Result<Response, TransportError> {
        Ok(Response::new(500, "boom"))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
        };
        for _ in 0..100 {
            let d = policy.delay_for(0);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_updates_metrics() {
        let transport = Arc::new(ScriptedTransport::default());
        let exec = RequestExecutor::new(settings(), transport.clone());
        let resp = exec
            .execute("github:docs", &RequestSpec::get("http://x/a"), None)
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        let m = exec.metrics();
        assert_eq!(m.total_requests, 1);
        assert_eq!(m.successful_requests, 1);
        assert_eq!(m.failed_requests, 0);
        assert_eq!(m.peak_concurrency, 1);
        assert_eq!(m.active_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_and_fails_fast() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![
            server_error(),
            server_error(),
            server_error(),
        ]));
        let exec = RequestExecutor::new(settings(), transport.clone());
        let spec = RequestSpec::get("http://x/a");

        for _ in 0..3 {
            let err = exec.execute("wiki:pages", &spec, None).await.unwrap_err();
            assert!(matches!(err, ExecutionError::ExhaustedRetries { .. }));
        }
        assert_eq!(transport.calls(), 3);

        let err = exec.execute("wiki:pages", &spec, None).await.unwrap_err();
        assert!(matches!(err, ExecutionError::CircuitOpen { .. }));
        assert_eq!(transport.calls(), 3, "no network call while open");

        // Other endpoints are unaffected.
        exec.execute("wiki:other", &spec, None).await.unwrap();

        assert_eq!(exec.metrics().circuit_breaker_trips, 1);
        assert_eq!(
            exec.breaker_state("wiki:pages").unwrap().state,
            CircuitState::Open
        );
    }

    #[tokio::test(start_paused = true)]
    async fn probe_after_recovery_closes_breaker() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![
            server_error(),
            server_error(),
            server_error(),
        ]));
        let exec = RequestExecutor::new(settings(), transport.clone());
        let spec = RequestSpec::get("http://x/a");
        for _ in 0..3 {
            let _ = exec.execute("db:runbooks", &spec, None).await;
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        exec.execute("db:runbooks", &spec, None).await.unwrap();
        assert_eq!(
            exec.breaker_state("db:runbooks").unwrap().state,
            CircuitState::Closed
        );
        exec.execute("db:runbooks", &spec, None).await.unwrap();
        assert_eq!(transport.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![
            server_error(),
            server_error(),
            server_error(),
            server_error(),
        ]));
        let exec = RequestExecutor::new(settings(), transport.clone());
        let spec = RequestSpec::get("http://x/a");
        for _ in 0..3 {
            let _ = exec.execute("db:runbooks", &spec, None).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(exec.execute("db:runbooks", &spec, None).await.is_err());
        let err = exec.execute("db:runbooks", &spec, None).await.unwrap_err();
        assert!(matches!(err, ExecutionError::CircuitOpen { .. }));
        assert_eq!(exec.metrics().circuit_breaker_trips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![Ok(Response::new(
            404, "nope",
        ))]));
        let exec = RequestExecutor::new(settings(), transport.clone());
        let spec = RequestSpec::get("http://x/a").max_retries(5);
        let err = exec.execute("wiki:pages", &spec, None).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Client { status: 404, .. }));
        assert_eq!(transport.calls(), 1);
        assert_eq!(exec.breaker_state("wiki:pages").unwrap().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_server_errors_with_backoff() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![
            server_error(),
            Ok(Response::new(429, "slow down")),
            Ok(Response::new(200, "done")),
        ]));
        let exec = RequestExecutor::new(settings(), transport.clone());
        let spec = RequestSpec::get("http://x/a").max_retries(3);
        let start = Instant::now();
        let (result, outcome) = exec.execute_detailed("github:docs", &spec, None).await;
        assert_eq!(result.unwrap().text(), "done");
        assert_eq!(outcome.retries_used, 2);
        assert!(outcome.success);
        // 100ms + 200ms of backoff
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(exec.metrics().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_wrap_last_error() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![
            Err(TransportError::Connect("refused".to_string())),
            Err(TransportError::Connect("refused".to_string())),
            Err(TransportError::Connect("refused".to_string())),
        ]));
        let exec = RequestExecutor::new(settings(), transport.clone());
        let spec = RequestSpec::get("http://x/a").max_retries(2);
        let err = exec.execute("github:docs", &spec, None).await.unwrap_err();
        match err {
            ExecutionError::ExhaustedRetries {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, ExecutionError::Transport(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_burst_then_block() {
        let mut config = Config::default();
        config.rate_limit.limit = 10;
        config.rate_limit.burst_fraction = 0.2;
        config.rate_limit.window_ms = 1_000;
        let transport = Arc::new(ScriptedTransport::default());
        let exec = RequestExecutor::new(ExecutorSettings::from_config(&config), transport.clone());
        let spec = RequestSpec::get("http://x/a");

        let start = Instant::now();
        for _ in 0..12 {
            exec.execute("github:docs", &spec, None).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(exec.metrics().burst_requests, 2);

        exec.execute("github:docs", &spec, None).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(transport.calls(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_ceiling() {
        let mut config = Config::default();
        config.rate_limit.limit = 1;
        config.rate_limit.burst_fraction = 0.0;
        config.rate_limit.window_ms = 60_000;
        config.executor.rate_limit_timeout_ms = Some(1_000);
        let exec = RequestExecutor::new(
            ExecutorSettings::from_config(&config),
            Arc::new(ScriptedTransport::default()),
        );
        let spec = RequestSpec::get("http://x/a");
        exec.execute("s", &spec, None).await.unwrap();
        let err = exec.execute("s", &spec, None).await.unwrap_err();
        assert!(matches!(err, ExecutionError::RateLimitTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn average_latency_follows_recent_calls() {
        let exec = RequestExecutor::new(settings(), Arc::new(ScriptedTransport::default()));
        let now = Instant::now();
        exec.record_metrics(now - Duration::from_millis(100), true, Some(200), 0);
        assert_eq!(exec.metrics().average_latency_ms, 100.0);

        exec.record_metrics(now, true, Some(200), 0);
        assert!((exec.metrics().average_latency_ms - 80.0).abs() < 1e-9);

        for _ in 0..30 {
            exec.record_metrics(now, true, Some(200), 0);
        }
        assert!(exec.metrics().average_latency_ms < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_during_rate_limit_wait() {
        let mut config = Config::default();
        config.rate_limit.limit = 1;
        config.rate_limit.burst_fraction = 0.0;
        config.rate_limit.window_ms = 60_000;
        let transport = Arc::new(ScriptedTransport::default());
        let exec = RequestExecutor::new(ExecutorSettings::from_config(&config), transport.clone());
        let spec = RequestSpec::get("http://x/a");
        exec.execute("s", &spec, None).await.unwrap();

        let start = Instant::now();
        let deadline = start + Duration::from_secs(1);
        let err = exec.execute("s", &spec, Some(deadline)).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Timeout {
                stage: Stage::RateLimited,
                ..
            }
        ));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(transport.calls(), 1);
        assert_eq!(exec.breaker_state("s").unwrap().consecutive_failures, 0);
        assert_eq!(exec.metrics().rate_limit_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_releases_in_arrival_order() {
        let mut config = Config::default();
        config.executor.max_concurrent = 1;
        config.rate_limit.limit = 1_000;
        let transport = Arc::new(ScriptedTransport {
            delay: Duration::from_millis(10),
            ..Default::default()
        });
        let exec = Arc::new(RequestExecutor::new(
            ExecutorSettings::from_config(&config),
            transport.clone(),
        ));

        let mut handles = Vec::new();
        let holder = exec.clone();
        handles.push(tokio::spawn(async move {
            holder.execute("a", &RequestSpec::get("http://x/hold"), None).await
        }));
        while exec.metrics().active_requests < 1 {
            tokio::task::yield_now().await;
        }

        // Alternate endpoints so ordering cannot come from per-endpoint state.
        for i in 0..6 {
            let exec_i = exec.clone();
            handles.push(tokio::spawn(async move {
                let spec = RequestSpec::get(format!("http://x/{}", i));
                exec_i.execute(if i % 2 == 0 { "a" } else { "b" }, &spec, None).await
            }));
            while exec.metrics().queued_requests < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let seen = lock(&transport.seen).clone();
        let expected: Vec<String> = std::iter::once("http://x/hold".to_string())
            .chain((0..6).map(|i| format!("http://x/{}", i)))
            .collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let mut config = Config::default();
        config.executor.max_concurrent = 5;
        config.rate_limit.limit = 1_000;
        let transport = Arc::new(ScriptedTransport {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let exec = Arc::new(RequestExecutor::new(
            ExecutorSettings::from_config(&config),
            transport.clone(),
        ));

        let mut set = tokio::task::JoinSet::new();
        for i in 0..20 {
            let exec = exec.clone();
            set.spawn(async move {
                exec.execute(&format!("src:{}", i % 3), &RequestSpec::get("http://x"), None)
                    .await
            });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap().unwrap();
        }
        assert_eq!(transport.calls(), 20);
        assert_eq!(transport.peak_in_flight.load(Ordering::SeqCst), 5);
        assert_eq!(exec.metrics().peak_concurrency, 5);
        assert_eq!(exec.metrics().queued_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_while_queued_releases_slot() {
        let mut config = Config::default();
        config.executor.max_concurrent = 1;
        let transport = Arc::new(ScriptedTransport {
            delay: Duration::from_secs(5),
            ..Default::default()
        });
        let exec = Arc::new(RequestExecutor::new(
            ExecutorSettings::from_config(&config),
            transport.clone(),
        ));

        let busy = {
            let exec = exec.clone();
            tokio::spawn(async move {
                exec.execute("a", &RequestSpec::get("http://x"), None).await
            })
        };
        tokio::task::yield_now().await;

        let deadline = Instant::now() + Duration::from_secs(1);
        let err = exec
            .execute("b", &RequestSpec::get("http://x"), Some(deadline))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Timeout {
                stage: Stage::Queued,
                ..
            }
        ));
        assert_eq!(exec.metrics().queued_requests, 0);

        busy.await.unwrap().unwrap();
        exec.execute("b", &RequestSpec::get("http://x"), None)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_in_flight_counts_as_failure() {
        let transport = Arc::new(ScriptedTransport {
            delay: Duration::from_secs(10),
            ..Default::default()
        });
        let exec = RequestExecutor::new(settings(), transport);
        let deadline = Instant::now() + Duration::from_secs(1);
        let err = exec
            .execute("slow", &RequestSpec::get("http://x"), Some(deadline))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Timeout {
                stage: Stage::InFlight,
                ..
            }
        ));
        assert_eq!(exec.breaker_state("slow").unwrap().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_past_deadline_is_not_started() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![server_error()]));
        let exec = RequestExecutor::new(settings(), transport.clone());
        let deadline = Instant::now() + Duration::from_millis(50);
        let spec = RequestSpec::get("http://x").max_retries(3);
        let err = exec.execute("a", &spec, Some(deadline)).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Timeout {
                stage: Stage::Backoff,
                ..
            }
        ));
        assert_eq!(transport.calls(), 1);
    }

    struct FailingAuth;

    #[async_trait]
    impl AuthProvider for FailingAuth {
        async fn auth_headers(&self) -> anyhow::Result<std::collections::BTreeMap<String, String>> {
            anyhow::bail!("token refresh failed")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_counts_against_breaker() {
        let transport = Arc::new(ScriptedTransport::default());
        let exec =
            RequestExecutor::new(settings(), transport.clone()).with_auth(Arc::new(FailingAuth));
        let err = exec
            .execute("github:docs", &RequestSpec::get("http://x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Auth(_)));
        assert_eq!(transport.calls(), 0);
        assert_eq!(
            exec.breaker_state("github:docs").unwrap().consecutive_failures,
            1
        );
        assert_eq!(exec.metrics().failed_requests, 1);
    }
}
