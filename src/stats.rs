//! Human-readable rendering of [`RuntimeStats`], printed by `crt fetch --stats`.

use std::fmt::Write;

use crate::runtime::RuntimeStats;

/// Render a counter snapshot as an aligned text report.
pub fn render(stats: &RuntimeStats) -> String {
    let mut out = String::new();
    let e = &stats.executor;
    let c = &stats.cache;
    let s = &stats.sync;

    let _ = writeln!(out, "Connector Runtime v{}: Stats", stats.version);
    let _ = writeln!(out, "==============================");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "  Requests:    {} total, {} ok, {} failed",
        e.total_requests, e.successful_requests, e.failed_requests
    );
    let _ = writeln!(out, "  Latency:     {:.1} ms avg", e.average_latency_ms);
    let _ = writeln!(out, "  Retries:     {}", e.retries);
    let _ = writeln!(
        out,
        "  Rate limit:  {} hits, {} burst",
        e.rate_limit_hits, e.burst_requests
    );
    let _ = writeln!(
        out,
        "  Breakers:    {} trips, {} rejections",
        e.circuit_breaker_trips, e.circuit_rejections
    );
    let _ = writeln!(
        out,
        "  Concurrency: {} active, {} queued, {} peak",
        e.active_requests, e.queued_requests, e.peak_concurrency
    );

    if !stats.breakers.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  {:<32} {:>10} {:>9}", "ENDPOINT", "STATE", "FAILURES");
        for b in &stats.breakers {
            let _ = writeln!(
                out,
                "  {:<32} {:>10} {:>9}",
                b.endpoint,
                b.state.to_string(),
                b.consecutive_failures
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "  Cache:       {} entries, {}",
        c.size,
        format_bytes(c.bytes as u64)
    );
    let _ = writeln!(
        out,
        "  Hit rate:    {:.1}% ({} hits, {} misses)",
        c.hit_rate * 100.0,
        c.hits,
        c.misses
    );
    let _ = writeln!(
        out,
        "  Evicted:     {} (lru), {} (expired)",
        c.evictions, c.expirations
    );
    match &c.distributed {
        Some(tier) => {
            let _ = writeln!(
                out,
                "  Distributed: {} ({} hits, {} errors, {} skipped)",
                tier.state, tier.hits, tier.errors, tier.skipped
            );
        }
        None => {
            let _ = writeln!(out, "  Distributed: disabled");
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "  Sync:        {}", s.state);
    let _ = writeln!(
        out,
        "  Events:      {} webhook, {} poll ({} rejected)",
        s.webhook_events, s.poll_events, s.webhook_rejections
    );
    for scope in &s.scopes {
        let revision = scope.last_revision.as_deref().unwrap_or("-");
        match &scope.last_error {
            Some(err) => {
                let _ = writeln!(out, "    {:<30} {}  error: {}", scope.scope, revision, err);
            }
            None => {
                let _ = writeln!(out, "    {:<30} {}", scope.scope, revision);
            }
        }
    }
    if let Some(err) = &s.last_error {
        let _ = writeln!(out, "  Last error:  {}", err);
    }

    out
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
