//! # Connector Runtime
//!
//! Resilient request execution, tiered caching, and change synchronization
//! for documentation source adapters.
//!
//! Every source adapter (web endpoints, source-control platforms, wikis,
//! databases) reads through the same machinery so that slow, flaky, or
//! rate-limited upstreams never take the whole search surface down with them.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!   search ──────▶│ SourceAdapter │───────────────┐
//!                 └──────┬───────┘               │ miss
//!                        │ get / set             ▼
//!                 ┌──────▼───────┐       ┌────────────────┐
//!                 │ CacheManager │       │ RequestExecutor│──▶ upstream
//!                 │ local + dist │       │ CB · RL · queue│
//!                 └──────▲───────┘       └────────────────┘
//!                        │ invalidate
//!                 ┌──────┴────────────┐
//!   webhook ─────▶│ ChangeSynchronizer│◀── poll loop
//!                 └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Requests, responses, change events, documents |
//! | [`circuit_breaker`] | Per-endpoint breaker state machine |
//! | [`rate_limiter`] | Fixed window with burst allowance |
//! | [`transport`] | Network and auth seams |
//! | [`executor`] | Request execution engine |
//! | [`cache`] | Tiered cache |
//! | [`cache_tier`] | Distributed tier abstraction |
//! | [`webhook`] | Webhook verification and parsing |
//! | [`sync`] | Change synchronizer |
//! | [`adapter`] | Source adapter read path |
//! | [`runtime`] | Owned runtime with explicit lifecycle |
//! | [`server`] | HTTP surface for health, stats, and webhooks |

pub mod adapter;
pub mod cache;
pub mod cache_tier;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod models;
pub mod rate_limiter;
pub mod runtime;
pub mod server;
pub mod stats;
pub mod sync;
pub mod transport;
pub mod webhook;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
/// None of the guarded structures are left half-updated across a panic point.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
