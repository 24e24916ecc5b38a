//! The owned connector runtime.
//!
//! One [`ConnectorRuntime`] per process holds every piece of keyed state
//! (breakers, rate windows, cache, sync state). Adapters receive it, or the
//! `Arc`s it hands out, by reference; nothing is reachable as a global.
//!
//! ```rust,no_run
//! use connector_runtime::config::load_config;
//! use connector_runtime::runtime::ConnectorRuntime;
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let runtime = ConnectorRuntime::init(load_config(Path::new("config/crt.toml"))?)?;
//! runtime.start_sync().await;
//! let docs = runtime
//!     .adapter("web:handbook", "https://handbook.example.com")
//!     .refresh("oncall.md", None)
//!     .await?;
//! println!("{} documents", docs.len());
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::adapter::HttpSourceAdapter;
use crate::cache::{CacheManager, CacheSettings, CacheStats};
use crate::cache_tier::{DistributedTier, GuardedTier, SharedMemoryTier};
use crate::config::Config;
use crate::executor::{BreakerSnapshot, ExecutorMetrics, ExecutorSettings, RequestExecutor};
use crate::models::Document;
use crate::sync::{CacheInvalidation, ChangeSynchronizer, HttpRevisionSource, SyncStatus};
use crate::transport::{ReqwestTransport, StaticAuth, Transport};

pub struct ConnectorRuntime {
    config: Config,
    executor: Arc<RequestExecutor>,
    cache: Arc<CacheManager<Vec<Document>>>,
    sync: ChangeSynchronizer,
}

/// Every component's counters in one snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub version: String,
    pub executor: ExecutorMetrics,
    pub breakers: Vec<BreakerSnapshot>,
    pub cache: CacheStats,
    pub sync: SyncStatus,
}

impl ConnectorRuntime {
    /// Build a runtime with the network transport and the distributed tier
    /// named in `config.cache.distributed`.
    pub fn init(config: Config) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);
        let tier: Option<Arc<dyn DistributedTier>> = match config.cache.distributed.as_str() {
            "shared-memory" => Some(Arc::new(SharedMemoryTier::new())),
            _ => None,
        };
        Self::init_with(config, transport, tier)
    }

    /// Build a runtime from explicit collaborators.
    pub fn init_with(
        config: Config,
        transport: Arc<dyn Transport>,
        tier: Option<Arc<dyn DistributedTier>>,
    ) -> Result<Self> {
        let mut executor = RequestExecutor::new(ExecutorSettings::from_config(&config), transport);
        if config.auth.kind != "none" {
            executor = executor.with_auth(Arc::new(StaticAuth::from_config(&config.auth)?));
        }
        let executor = Arc::new(executor);

        let mut cache = CacheManager::new(CacheSettings::from_config(&config.cache));
        if let Some(tier) = tier {
            cache = cache.with_distributed(GuardedTier::new(
                tier,
                config.cache.distributed_failure_threshold,
                Duration::from_millis(config.cache.distributed_reset_timeout_ms),
            ));
        }
        let cache = Arc::new(cache);

        let mut sync = ChangeSynchronizer::from_config(&config.sync)?;
        if let Some(url) = &config.sync.revision_url {
            sync = sync.with_revision_source(Arc::new(HttpRevisionSource::new(
                executor.clone(),
                url.clone(),
                config.sync.revision_pointer.clone(),
            )));
        }
        sync.on_change(Arc::new(CacheInvalidation::new(cache.clone())));

        info!(
            max_concurrent = config.executor.max_concurrent,
            endpoints = config.endpoints.len(),
            distributed = %config.cache.distributed,
            "connector runtime initialized"
        );

        Ok(Self {
            config,
            executor,
            cache,
            sync,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> &Arc<RequestExecutor> {
        &self.executor
    }

    pub fn cache(&self) -> &Arc<CacheManager<Vec<Document>>> {
        &self.cache
    }

    pub fn sync(&self) -> &ChangeSynchronizer {
        &self.sync
    }

    /// An HTTP adapter sharing this runtime's executor and cache.
    pub fn adapter(&self, label: &str, base_url: &str) -> HttpSourceAdapter {
        HttpSourceAdapter::new(label, base_url, self.executor.clone(), self.cache.clone())
    }

    /// Start change monitoring for the configured scopes.
    pub async fn start_sync(&self) {
        self.sync
            .start(&self.config.sync.scopes, self.config.sync.poll_interval())
            .await;
    }

    /// Stop monitoring and refuse further executions. In-flight calls finish.
    pub async fn shutdown(&self) {
        self.sync.stop().await;
        self.executor.close();
        info!("connector runtime shut down");
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            version: env!("CARGO_PKG_VERSION").to_string(),
            executor: self.executor.metrics(),
            breakers: self.executor.breakers(),
            cache: self.cache.stats(),
            sync: self.sync.status(),
        }
    }
}
