//! Cache Handlers
//!
//! One configured cache backend behind a uniform contract
//! {get, set, delete, flush, stats, type, endpoints}.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          CacheHandler                             │
//! │     identifier │ type │ endpoints │ default expiry window         │
//! ├──────────────────────┬────────────────────┬──────────────────────┤
//! │ DiskCacheHandler     │ PooledHandler      │ ReplicatedHandler    │
//! │ key → nested path    │ pool-routed ops    │ replica read/write/  │
//! │ mtime freshness      │ (memcache)         │ repair (memcached)   │
//! └──────────────────────┴────────────────────┴──────────────────────┘
//! ```
//!
//! Handlers are built by [`CacheHandler::from_config`], which picks the
//! variant from the configured `type`.

mod disk;
mod pooled;
mod replicated;
pub mod repair;

pub use disk::{DiskCacheHandler, CACHE_FILE_SUFFIX};
pub use pooled::PooledHandler;
pub use replicated::ReplicatedHandler;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{HandlerConfig, HandlerType};
use crate::error::{Error, Result};
use crate::health::HandlerHealth;
use crate::metrics::{CacheMetrics, LatencyTracker};
use crate::node::{NodeConnector, NodePool, NodeResult, NodeStats};

/// TTL of the construction-time probe key, in seconds
const PROBE_TTL: u32 = 60;

// =============================================================================
// Stats
// =============================================================================

/// Stats reported by one node of a handler
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatsReport {
    pub endpoint: String,
    pub stats: Option<NodeStats>,
    pub error: Option<String>,
}

impl NodeStatsReport {
    fn from_result(endpoint: String, result: NodeResult<NodeStats>) -> Self {
        match result {
            Ok(stats) => Self {
                endpoint,
                stats: Some(stats),
                error: None,
            },
            Err(e) => Self {
                endpoint,
                stats: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Stats of one handler; disk handlers report no nodes
#[derive(Debug, Clone, Serialize)]
pub struct HandlerStats {
    pub identifier: String,
    pub handler_type: HandlerType,
    pub nodes: Vec<NodeStatsReport>,
    pub collected_at: chrono::DateTime<chrono::Utc>,
}

// =============================================================================
// Handler
// =============================================================================

/// Backend variant of a handler
pub enum HandlerBackend {
    Disk(DiskCacheHandler),
    Memcache(PooledHandler),
    Memcached(ReplicatedHandler),
}

/// A configured cache backend
pub struct CacheHandler {
    identifier: String,
    default_expires: u32,
    backend: HandlerBackend,
}

impl std::fmt::Debug for CacheHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandler")
            .field("identifier", &self.identifier)
            .field("type", &self.handler_type())
            .field("endpoints", &self.endpoints())
            .finish_non_exhaustive()
    }
}

impl CacheHandler {
    /// Wrap a backend under an identifier
    pub fn new(identifier: impl Into<String>, default_expires: u32, backend: HandlerBackend) -> Self {
        Self {
            identifier: identifier.into(),
            default_expires,
            backend,
        }
    }

    /// Build a handler from its configuration entry.
    ///
    /// Validates the entry, connects one node client per server (in
    /// configuration order) and selects the variant from `type`. No probe is
    /// run here; see [`CacheHandler::check_service`].
    pub async fn from_config(
        config: &HandlerConfig,
        connector: &dyn NodeConnector,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let kind = config.handler_type()?;

        let backend = match kind {
            HandlerType::Disk => {
                HandlerBackend::Disk(DiskCacheHandler::open(config.disk_root()?).await?)
            }
            HandlerType::Memcache => HandlerBackend::Memcache(PooledHandler::new(
                config.identifier.clone(),
                build_pool(config, connector)?,
                metrics,
            )),
            HandlerType::Memcached => HandlerBackend::Memcached(ReplicatedHandler::new(
                config.identifier.clone(),
                build_pool(config, connector)?,
                config.replication()?,
                metrics,
            )),
            HandlerType::Redis => {
                return Err(Error::UnsupportedHandlerType {
                    identifier: config.identifier.clone(),
                    kind: kind.to_string(),
                })
            }
        };

        info!(
            identifier = %config.identifier,
            handler_type = %kind,
            servers = config.servers.len(),
            "Cache handler configured"
        );
        Ok(Self::new(
            config.identifier.clone(),
            config.default_expires(kind),
            backend,
        ))
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn handler_type(&self) -> HandlerType {
        match &self.backend {
            HandlerBackend::Disk(_) => HandlerType::Disk,
            HandlerBackend::Memcache(_) => HandlerType::Memcache,
            HandlerBackend::Memcached(_) => HandlerType::Memcached,
        }
    }

    /// `host:port` of every node in configuration order; empty for disk
    pub fn endpoints(&self) -> Vec<String> {
        match &self.backend {
            HandlerBackend::Disk(_) => Vec::new(),
            HandlerBackend::Memcache(h) => h.pool().endpoints(),
            HandlerBackend::Memcached(h) => h.pool().endpoints(),
        }
    }

    /// Expiry window used by [`CacheHandler::get`]
    pub fn default_expires(&self) -> u32 {
        self.default_expires
    }

    pub fn backend(&self) -> &HandlerBackend {
        &self.backend
    }

    /// Read with the handler's default expiry window
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.get_with_expiry(key, self.default_expires).await
    }

    /// Read a key.
    ///
    /// `expires` is the freshness window for disk handlers and the TTL of
    /// repair writes for replicated handlers.
    pub async fn get_with_expiry(&self, key: &str, expires: u32) -> Result<Option<Bytes>> {
        match &self.backend {
            HandlerBackend::Disk(h) => h.get(key, expires).await,
            HandlerBackend::Memcache(h) => Ok(h.get(key).await),
            HandlerBackend::Memcached(h) => Ok(h.get(key, expires).await),
        }
    }

    pub async fn set(&self, key: &str, value: Bytes, expires: u32) -> Result<()> {
        match &self.backend {
            HandlerBackend::Disk(h) => h.set(key, value).await,
            HandlerBackend::Memcache(h) => {
                h.set(key, value, expires).await;
                Ok(())
            }
            HandlerBackend::Memcached(h) => {
                h.set(key, value, expires).await;
                Ok(())
            }
        }
    }

    /// Remove a key; absent keys are not an error
    pub async fn delete(&self, key: &str) -> Result<()> {
        match &self.backend {
            HandlerBackend::Disk(h) => h.delete(key).await,
            HandlerBackend::Memcache(h) => {
                h.delete(key).await;
                Ok(())
            }
            HandlerBackend::Memcached(h) => {
                h.delete(key).await;
                Ok(())
            }
        }
    }

    /// Drop every key regardless of TTL
    pub async fn flush(&self) -> Result<()> {
        match &self.backend {
            HandlerBackend::Disk(h) => h.flush().await,
            HandlerBackend::Memcache(h) => {
                h.flush().await;
                Ok(())
            }
            HandlerBackend::Memcached(h) => {
                h.pooled().flush().await;
                Ok(())
            }
        }
    }

    pub async fn stats(&self) -> HandlerStats {
        let nodes = match &self.backend {
            HandlerBackend::Disk(_) => Vec::new(),
            HandlerBackend::Memcache(h) => h.stats().await,
            HandlerBackend::Memcached(h) => h.pooled().stats().await,
        };
        HandlerStats {
            identifier: self.identifier.clone(),
            handler_type: self.handler_type(),
            nodes,
            collected_at: chrono::Utc::now(),
        }
    }

    /// Reachability of the backend
    pub async fn health(&self) -> HandlerHealth {
        let tracker = LatencyTracker::start();
        let health = match &self.backend {
            HandlerBackend::Disk(h) => HandlerHealth::local(
                &self.identifier,
                HandlerType::Disk,
                h.verify_root().await.err().map(|e| e.to_string()),
            ),
            HandlerBackend::Memcache(h) => {
                HandlerHealth::from_nodes(&self.identifier, HandlerType::Memcache, h.node_health().await)
            }
            HandlerBackend::Memcached(h) => HandlerHealth::from_nodes(
                &self.identifier,
                HandlerType::Memcached,
                h.pooled().node_health().await,
            ),
        };
        health.with_elapsed(tracker.elapsed())
    }

    /// Write-then-read round trip with a sentinel key.
    ///
    /// A missing read-back is retried once with a fresh write. A second miss
    /// fails with [`Error::HealthProbeFailed`].
    pub async fn check_service(&self) -> Result<()> {
        if let HandlerBackend::Disk(h) = &self.backend {
            return h.check_service(&self.identifier).await;
        }

        let key = format!("rivera_probe_{}", uuid::Uuid::new_v4().simple());
        let token = Bytes::from(uuid::Uuid::new_v4().to_string());

        for attempt in 1..=2 {
            self.set(&key, token.clone(), PROBE_TTL).await?;
            if self.get_with_expiry(&key, PROBE_TTL).await?.as_ref() == Some(&token) {
                debug!(identifier = %self.identifier, attempt, "Health probe succeeded");
                if let Err(e) = self.delete(&key).await {
                    debug!(identifier = %self.identifier, error = %e, "Failed to remove probe key");
                }
                return Ok(());
            }
            warn!(identifier = %self.identifier, attempt, "Health probe read-back missed");
        }

        Err(Error::HealthProbeFailed {
            identifier: self.identifier.clone(),
        })
    }
}

fn build_pool(config: &HandlerConfig, connector: &dyn NodeConnector) -> Result<NodePool> {
    let timeout: Duration = config.timeout();
    let mut builder = NodePool::builder().timeout(timeout);
    for endpoint in config.endpoints()? {
        builder = builder.add_server(connector.connect(&endpoint, timeout));
    }
    Ok(builder.build())
}

// =============================================================================
// Tests
// =============================================================================
