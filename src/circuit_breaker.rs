//! Per-endpoint circuit breaker.
//!
//! A three-state machine that stops issuing calls to a repeatedly failing
//! target for a cooldown period:
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                                │ now >= next_retry_at
//!     │ probe succeeds                 ▼
//!     └──────────────────────────── HalfOpen ──▶ Open (probe fails)
//! ```
//!
//! The state itself is plain data; callers hold it behind the per-endpoint
//! lock owned by the executor (or the cache's distributed tier guard) so
//! concurrent transitions are applied atomically.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{CircuitBreakerConfig, MAX_DURATION_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Resolved breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl BreakerSettings {
    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout: Duration::from_millis(config.recovery_timeout_ms),
            half_open_max_calls: config.half_open_max_calls,
        }
    }
}

/// Decision for one incoming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed; call proceeds normally.
    Allowed,
    /// Breaker half-open; this call is one of the limited recovery probes.
    Probe,
    /// Breaker open (or all probe slots taken); fail fast.
    Rejected { retry_in: Duration },
}

/// Breaker bookkeeping for one endpoint. Starts `Closed`, never persisted.
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub next_retry_at: Option<Instant>,
    half_open_calls: u32,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            next_retry_at: None,
            half_open_calls: 0,
        }
    }
}

impl CircuitBreakerState {
    /// Decide whether a call may proceed, moving `Open → HalfOpen` once the
    /// cooldown has elapsed.
    pub fn try_acquire(&mut self, now: Instant, settings: &BreakerSettings) -> Admission {
        if self.state == CircuitState::Open {
            match self.next_retry_at {
                Some(at) if now < at => {
                    return Admission::Rejected {
                        retry_in: at - now,
                    }
                }
                _ => {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_calls = 0;
                }
            }
        }

        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen => {
                if self.half_open_calls < settings.half_open_max_calls {
                    self.half_open_calls += 1;
                    Admission::Probe
                } else {
                    Admission::Rejected {
                        retry_in: Duration::ZERO,
                    }
                }
            }
            CircuitState::Open => unreachable!("open state handled above"),
        }
    }

    /// Record a healthy outcome. Returns `true` if this closed a half-open breaker.
    pub fn on_success(&mut self) -> bool {
        let recovered = self.state == CircuitState::HalfOpen;
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.next_retry_at = None;
        self.half_open_calls = 0;
        recovered
    }

    /// Record a failed outcome. Returns `true` if this call tripped the breaker open.
    pub fn on_failure(&mut self, now: Instant, settings: &BreakerSettings) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);

        let trip = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= settings.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            self.state = CircuitState::Open;
            self.next_retry_at = Some(
                now.checked_add(settings.recovery_timeout)
                    .unwrap_or(now + Duration::from_millis(MAX_DURATION_MS)),
            );
            self.half_open_calls = 0;
        }
        trip
    }

    /// Give back a probe slot taken by a call that ended without an upstream
    /// verdict (e.g. its deadline expired while queued).
    pub fn release_probe(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.half_open_calls = self.half_open_calls.saturating_sub(1);
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
