//! # Connector Runtime CLI (`crt`)
//!
//! ## Usage
//!
//! ```bash
//! crt --config ./config/crt.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `crt check` | Validate the configuration file |
//! | `crt serve` | Start monitoring and the HTTP server |
//! | `crt fetch <endpoint> <url>` | One request through the executor and cache |
//! | `crt poll` | One poll cycle over the configured scopes |
//!
//! ## Examples
//!
//! ```bash
//! # Validate configuration
//! crt check --config ./config/crt.toml
//!
//! # Fetch a page through the breaker, rate limiter and cache
//! crt fetch github:docs https://api.github.com/repos/acme/docs/readme
//!
//! # Serve webhooks and health checks
//! CRT_WEBHOOK_SECRET=... crt serve
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use connector_runtime::adapter::{ContentTransformer, PassthroughTransformer};
use connector_runtime::cache::{cache_key, SetOptions};
use connector_runtime::config::{self, Config};
use connector_runtime::logging;
use connector_runtime::models::RequestSpec;
use connector_runtime::runtime::ConnectorRuntime;
use connector_runtime::server;
use connector_runtime::stats;

/// Connector Runtime: resilient request execution, tiered caching, and
/// change synchronization for documentation source adapters.
#[derive(Parser)]
#[command(name = "crt", version)]
struct Cli {
    /// Path to configuration file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "./config/crt.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print the resolved settings.
    Check,

    /// Start change monitoring and the HTTP server.
    ///
    /// Binds to `[server].bind`. Stops on ctrl-c.
    Serve,

    /// Issue one GET through the executor, reading through the cache.
    Fetch {
        /// Logical endpoint key (breaker and rate-limit bucket), e.g. `github:docs`.
        endpoint: String,

        /// Absolute URL to fetch.
        url: String,

        /// Deadline for the whole call, in milliseconds.
        #[arg(long)]
        deadline_ms: Option<u64>,

        /// Print the counter report after the body.
        #[arg(long)]
        stats: bool,
    },

    /// Run one poll cycle over `[sync].scopes` and print revisions.
    Poll,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        tracing::warn!(path = %cli.config.display(), "config file not found, using defaults");
        config::parse_config("")?
    };

    match cli.command {
        Commands::Check => run_check(&cfg),
        Commands::Serve => {
            let runtime = Arc::new(ConnectorRuntime::init(cfg)?);
            runtime.start_sync().await;
            server::run_server(runtime).await
        }
        Commands::Fetch {
            endpoint,
            url,
            deadline_ms,
            stats,
        } => run_fetch(cfg, &endpoint, &url, deadline_ms, stats).await,
        Commands::Poll => run_poll(cfg).await,
    }
}

fn run_check(cfg: &Config) -> Result<()> {
    println!("Configuration OK");
    println!();
    println!(
        "  Executor:    {} concurrent, {} retries, {} ms timeout",
        cfg.executor.max_concurrent, cfg.executor.max_retries, cfg.executor.timeout_ms
    );
    println!(
        "  Breaker:     {} failures, {} ms recovery",
        cfg.circuit_breaker.failure_threshold, cfg.circuit_breaker.recovery_timeout_ms
    );
    println!(
        "  Rate limit:  {} / {} ms (+{:.0}% burst)",
        cfg.rate_limit.limit,
        cfg.rate_limit.window_ms,
        cfg.rate_limit.burst_fraction * 100.0
    );
    for endpoint in &cfg.endpoints {
        println!("    override:  {}", endpoint.key);
    }
    println!(
        "  Cache:       {} entries, {} bytes, tier: {}",
        cfg.cache.max_entries, cfg.cache.max_bytes, cfg.cache.distributed
    );
    println!(
        "  Sync:        {} scopes every {} min, webhooks {}",
        cfg.sync.scopes.len(),
        cfg.sync.poll_interval_minutes,
        if cfg.sync.resolved_webhook_secret().is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("  Server:      {}", cfg.server.bind);
    Ok(())
}

async fn run_fetch(
    cfg: Config,
    endpoint: &str,
    url: &str,
    deadline_ms: Option<u64>,
    show_stats: bool,
) -> Result<()> {
    let runtime = ConnectorRuntime::init(cfg)?;
    let deadline = deadline_ms.map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
    let key = cache_key(endpoint, url);

    let body = match runtime.cache().get(&key).await {
        Some(docs) => docs.into_iter().map(|d| d.body).collect::<Vec<_>>().join("\n"),
        None => {
            let resp = runtime
                .executor()
                .execute(endpoint, &RequestSpec::get(url), deadline)
                .await?;
            let docs = PassthroughTransformer.transform(endpoint, url, url, &resp)?;
            let options = SetOptions::default()
                .scope(endpoint)
                .validators(resp.validators());
            runtime.cache().set(&key, docs.clone(), options).await?;
            docs.into_iter().map(|d| d.body).collect::<Vec<_>>().join("\n")
        }
    };

    println!("{}", body);
    if show_stats {
        eprintln!();
        eprint!("{}", stats::render(&runtime.stats()));
    }
    runtime.shutdown().await;
    Ok(())
}

async fn run_poll(cfg: Config) -> Result<()> {
    if cfg.sync.revision_url.is_none() {
        anyhow::bail!("sync.revision_url is not configured");
    }
    if cfg.sync.scopes.is_empty() {
        anyhow::bail!("sync.scopes is empty");
    }

    let runtime = ConnectorRuntime::init(cfg)?;
    runtime.sync().watch(&runtime.config().sync.scopes);
    let result = runtime.sync().poll_once().await;

    let status = runtime.sync().status();
    for scope in &status.scopes {
        match (&scope.last_revision, &scope.last_error) {
            (Some(rev), _) => println!("{:<40} {}", scope.scope, rev),
            (None, Some(err)) => println!("{:<40} error: {}", scope.scope, err),
            (None, None) => println!("{:<40} -", scope.scope),
        }
    }
    if let Ok(events) = &result {
        for event in events {
            println!("changed: {} ({:?})", event.source_scope, event.kind);
        }
    }
    runtime.shutdown().await;
    result.map(|_| ()).map_err(Into::into)
}
