//! Fixed-window rate limiter with a burst allowance.
//!
//! Each endpoint gets `limit` requests per window. Once those are spent, up
//! to `ceil(limit × burst_fraction)` further requests are let through as
//! degraded-but-allowed burst calls. After that the caller must wait for the
//! window to roll over.

use std::time::Duration;
use tokio::time::Instant;

use crate::config::{EndpointConfig, RateLimitConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSettings {
    pub limit: u32,
    pub window: Duration,
    pub burst_fraction: f64,
}

impl RateLimitSettings {
    pub fn from_config(config: &RateLimitConfig, endpoint: Option<&EndpointConfig>) -> Self {
        Self {
            limit: endpoint.and_then(|e| e.limit).unwrap_or(config.limit),
            window: Duration::from_millis(
                endpoint
                    .and_then(|e| e.window_ms)
                    .unwrap_or(config.window_ms),
            ),
            burst_fraction: config.burst_fraction,
        }
    }

    /// Maximum burst calls per window: `ceil(limit × burst_fraction)`.
    pub fn burst_capacity(&self) -> u32 {
        // Guard against float noise turning e.g. 7.000000000000001 into 8.
        let raw = f64::from(self.limit) * self.burst_fraction - 1e-9;
        raw.ceil().max(0.0) as u32
    }
}

/// Result of asking for quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    Burst,
    /// Window and burst both exhausted; retry after this long.
    Wait(Duration),
}

#[derive(Debug, Clone)]
pub struct RateLimitWindow {
    pub window_start: Instant,
    pub requests_in_window: u32,
    pub burst_used: u32,
}

impl RateLimitWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            requests_in_window: 0,
            burst_used: 0,
        }
    }

    pub fn acquire(&mut self, now: Instant, settings: &RateLimitSettings) -> Permit {
        if now.saturating_duration_since(self.window_start) >= settings.window {
            self.window_start = now;
            self.requests_in_window = 0;
            self.burst_used = 0;
        }

        if self.requests_in_window < settings.limit {
            self.requests_in_window += 1;
            return Permit::Normal;
        }
        if self.burst_used < settings.burst_capacity() {
            self.burst_used += 1;
            return Permit::Burst;
        }
        Permit::Wait((self.window_start + settings.window).saturating_duration_since(now))
    }
}
