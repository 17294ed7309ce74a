//! Cache Service
//!
//! Ordered collection of named handlers behind one get/set/delete/flush
//! surface.
//!
//! ```text
//!          get(k)                       set(k, v) / delete(k) / flush
//!            │                                     │
//!   ┌────────▼────────┐                  ┌─────────┼─────────┐
//!   │ H1 → H2 → H3 …  │                  ▼         ▼         ▼
//!   │ first hit wins  │                 H1        H2        H3
//!   └─────────────────┘             (every matching handler, errors collected)
//! ```
//!
//! An identifier filter narrows every operation to the listed handlers; an
//! empty filter selects all of them.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use crate::config::CacheServiceConfig;
use crate::error::{Error, Result};
use crate::handler::{CacheHandler, HandlerStats};
use crate::health::HealthReport;
use crate::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use crate::node::{NodeConnector, TcpConnector};

/// Multi-backend cache service
pub struct CacheService {
    caches: Vec<CacheHandler>,
    metrics: Arc<CacheMetrics>,
    started_at: Instant,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("caches", &self.caches)
            .finish_non_exhaustive()
    }
}

impl CacheService {
    /// Build the service, connecting to memcached nodes over TCP
    pub async fn from_config(config: &CacheServiceConfig) -> Result<Self> {
        Self::from_config_with(config, &TcpConnector).await
    }

    /// Build the service with a custom node connector.
    ///
    /// Every handler is built and probed in configuration order. The first
    /// failure aborts construction; no partially built service is returned.
    pub async fn from_config_with(
        config: &CacheServiceConfig,
        connector: &dyn NodeConnector,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(CacheMetrics::new());
        let mut caches = Vec::with_capacity(config.handlers.len());
        for entry in &config.handlers {
            let handler = CacheHandler::from_config(entry, connector, metrics.clone()).await?;
            handler.check_service().await?;
            caches.push(handler);
        }

        info!(handlers = caches.len(), "Cache service ready");
        Ok(Self {
            caches,
            metrics,
            started_at: Instant::now(),
        })
    }

    /// Wrap already-built handlers; no probe is run
    pub fn with_handlers(caches: Vec<CacheHandler>) -> Self {
        Self {
            caches,
            metrics: Arc::new(CacheMetrics::new()),
            started_at: Instant::now(),
        }
    }

    /// Handler registered under `identifier`
    pub fn handler(&self, identifier: &str) -> Option<&CacheHandler> {
        self.caches.iter().find(|h| h.identifier() == identifier)
    }

    /// All handlers in read priority order
    pub fn handlers(&self) -> &[CacheHandler] {
        &self.caches
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Read from the first matching handler that holds `key`, each handler
    /// using its own default expiry window
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str, identifiers: &[&str]) -> Result<Option<Bytes>> {
        self.read(key, None, identifiers).await
    }

    /// Like [`CacheService::get`] with one expiry window for every handler
    #[instrument(skip(self))]
    pub async fn get_with_expiry(
        &self,
        key: &str,
        expires: u32,
        identifiers: &[&str],
    ) -> Result<Option<Bytes>> {
        self.read(key, Some(expires), identifiers).await
    }

    async fn read(
        &self,
        key: &str,
        expires: Option<u32>,
        identifiers: &[&str],
    ) -> Result<Option<Bytes>> {
        let tracker = LatencyTracker::start();

        for handler in self.matching(identifiers) {
            let result = match expires {
                Some(expires) => handler.get_with_expiry(key, expires).await,
                None => handler.get(key).await,
            };
            match result {
                Ok(Some(value)) => {
                    debug!(identifier = handler.identifier(), "Cache hit");
                    self.metrics.record_hit();
                    self.metrics.record_read_latency(tracker.elapsed());
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(e) => {
                    self.metrics.record_handler_failure();
                    return Err(Error::HandlerFailed {
                        identifier: handler.identifier().to_string(),
                        source: Box::new(e),
                    });
                }
            }
        }

        self.metrics.record_miss();
        self.metrics.record_read_latency(tracker.elapsed());
        Ok(None)
    }

    /// Write `value` to every matching handler
    #[instrument(skip(self, value))]
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        expires: u32,
        identifiers: &[&str],
    ) -> Result<()> {
        let value = value.into();
        self.metrics.record_set();

        let mut first_error = None;
        for handler in self.matching(identifiers) {
            let result = handler.set(key, value.clone(), expires).await;
            self.collect("set", handler, result, &mut first_error);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Remove `key` from every matching handler
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str, identifiers: &[&str]) -> Result<()> {
        self.metrics.record_delete();

        let mut first_error = None;
        for handler in self.matching(identifiers) {
            let result = handler.delete(key).await;
            self.collect("delete", handler, result, &mut first_error);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drop every key on every matching handler
    #[instrument(skip(self))]
    pub async fn flush_all(&self, identifiers: &[&str]) -> Result<()> {
        self.metrics.record_flush();

        let mut first_error = None;
        for handler in self.matching(identifiers) {
            let result = handler.flush().await;
            self.collect("flush", handler, result, &mut first_error);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Per-handler statistics
    pub async fn stats(&self, identifiers: &[&str]) -> Vec<HandlerStats> {
        let mut stats = Vec::new();
        for handler in self.matching(identifiers) {
            stats.push(handler.stats().await);
        }
        stats
    }

    /// Health of every handler; overall status is the worst one
    pub async fn health(&self) -> HealthReport {
        let mut handlers = Vec::with_capacity(self.caches.len());
        for handler in &self.caches {
            handlers.push(handler.health().await);
        }
        HealthReport::new(handlers, self.started_at.elapsed())
    }

    fn matching<'a>(&'a self, identifiers: &'a [&'a str]) -> impl Iterator<Item = &'a CacheHandler> {
        self.caches
            .iter()
            .filter(move |h| identifiers.is_empty() || identifiers.iter().any(|id| *id == h.identifier()))
    }

    fn collect(
        &self,
        op: &str,
        handler: &CacheHandler,
        result: Result<()>,
        first_error: &mut Option<Error>,
    ) {
        if let Err(e) = result {
            self.metrics.record_handler_failure();
            warn!(identifier = handler.identifier(), op, error = %e, "Cache handler failed");
            if first_error.is_none() {
                *first_error = Some(Error::HandlerFailed {
                    identifier: handler.identifier().to_string(),
                    source: Box::new(e),
                });
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HandlerConfig, ReplicationOptions, ServerConfig};
    use crate::health::HealthStatus;
    use crate::node::InMemoryConnector;
    use assert_matches::assert_matches;

    fn servers(prefix: &str, n: usize) -> Vec<ServerConfig> {
        (0..n)
            .map(|i| ServerConfig::new(format!("{}.{}", prefix, i + 1), 11211))
            .collect()
    }

    async fn service(connector: &InMemoryConnector, dir: &tempfile::TempDir) -> CacheService {
        let config = CacheServiceConfig::new(vec![
            HandlerConfig::disk("pages", dir.path().join("pages")),
            HandlerConfig::memcache("fragments", servers("10.1.0", 2)),
            HandlerConfig::memcached("sessions", servers("10.2.0", 3))
                .with_options(ReplicationOptions::replicated(2)),
        ]);
        CacheService::from_config_with(&config, connector).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_reaches_every_handler() {
        let connector = InMemoryConnector::new();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&connector, &dir).await;

        service.set("user", "ada", 300, &[]).await.unwrap();

        for handler in service.handlers() {
            assert_eq!(
                handler.get("user").await.unwrap(),
                Some(Bytes::from_static(b"ada")),
                "handler {}",
                handler.identifier()
            );
        }
        assert_eq!(service.metrics().sets, 1);
    }

    #[tokio::test]
    async fn test_get_returns_first_match_without_writing_earlier_handlers() {
        let connector = InMemoryConnector::new();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&connector, &dir).await;

        let fragments = service.handler("fragments").unwrap();
        fragments.set("k", Bytes::from_static(b"v"), 0).await.unwrap();

        assert_eq!(
            service.get("k", &[]).await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );
        assert_eq!(service.handler("pages").unwrap().get("k").await.unwrap(), None);
        assert_eq!(service.metrics().hits, 1);
    }

    #[tokio::test]
    async fn test_identifier_filter() {
        let connector = InMemoryConnector::new();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&connector, &dir).await;

        service.set("k", "v", 300, &["sessions"]).await.unwrap();

        assert_eq!(service.handler("pages").unwrap().get("k").await.unwrap(), None);
        assert_eq!(service.get("k", &["pages", "fragments"]).await.unwrap(), None);
        assert_eq!(
            service.get("k", &["sessions"]).await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );
        assert_eq!(service.get("k", &["unknown"]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_with_expiry_overrides_window() {
        let connector = InMemoryConnector::new();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&connector, &dir).await;

        service.set("k", "v", 300, &["pages"]).await.unwrap();
        let path = match service.handler("pages").unwrap().backend() {
            crate::handler::HandlerBackend::Disk(h) => h.path_for("k").unwrap(),
            _ => unreachable!(),
        };
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(std::time::SystemTime::now() - std::time::Duration::from_secs(30))
            .unwrap();

        assert!(service.get("k", &["pages"]).await.unwrap().is_some());
        assert!(service
            .get_with_expiry("k", 10, &["pages"])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_and_flush_fan_out() {
        let connector = InMemoryConnector::new();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&connector, &dir).await;

        service.set("a", "1", 300, &[]).await.unwrap();
        service.set("b", "2", 300, &[]).await.unwrap();

        service.delete("a", &[]).await.unwrap();
        service.delete("a", &[]).await.unwrap();
        assert_eq!(service.get("a", &[]).await.unwrap(), None);
        assert!(service.get("b", &[]).await.unwrap().is_some());

        service.flush_all(&[]).await.unwrap();
        assert_eq!(service.get("b", &[]).await.unwrap(), None);
        assert_eq!(service.metrics().misses, 2);
    }

    #[tokio::test]
    async fn test_set_continues_after_handler_failure() {
        let connector = InMemoryConnector::new();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&connector, &dir).await;

        // Disk rejects the key, networked handlers still receive it
        let result = service.set("a/b", "v", 300, &[]).await;
        assert_matches!(
            result,
            Err(Error::HandlerFailed { identifier, source }) if identifier == "pages"
                && matches!(*source, Error::InvalidKey(_))
        );
        assert!(service
            .handler("sessions")
            .unwrap()
            .get("a/b")
            .await
            .unwrap()
            .is_some());
        assert_eq!(service.metrics().handler_failures, 1);
    }

    #[tokio::test]
    async fn test_construction_fails_on_bad_entry() {
        let connector = InMemoryConnector::new();
        let dir = tempfile::tempdir().unwrap();
        let config = CacheServiceConfig::new(vec![
            HandlerConfig::disk("pages", dir.path()),
            HandlerConfig::memcached("sessions", vec![]),
        ]);

        let result = CacheService::from_config_with(&config, &connector).await;
        assert_matches!(result, Err(Error::EmptyServerList { identifier }) if identifier == "sessions");
    }

    #[tokio::test]
    async fn test_construction_rejects_duplicates() {
        let connector = InMemoryConnector::new();
        let dir = tempfile::tempdir().unwrap();
        let config = CacheServiceConfig::new(vec![
            HandlerConfig::disk("pages", dir.path().join("a")),
            HandlerConfig::disk("pages", dir.path().join("b")),
        ]);

        let result = CacheService::from_config_with(&config, &connector).await;
        assert_matches!(result, Err(Error::DuplicateIdentifier(id)) if id == "pages");
    }

    #[tokio::test]
    async fn test_construction_fails_when_probe_fails() {
        let connector = InMemoryConnector::new();
        let config = CacheServiceConfig::new(vec![HandlerConfig::memcache(
            "fragments",
            servers("10.3.0", 1),
        )
        .with_timeout(std::time::Duration::from_millis(50))]);
        connector
            .node_for(&crate::node::Endpoint::new("10.3.0.1", 11211))
            .set_reachable(false);

        let result = CacheService::from_config_with(&config, &connector).await;
        assert_matches!(result, Err(Error::HealthProbeFailed { .. }));
    }

    #[tokio::test]
    async fn test_health_and_stats() {
        let connector = InMemoryConnector::new();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&connector, &dir).await;

        let health = service.health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.handlers.len(), 3);

        connector.node("10.2.0.3:11211").unwrap().set_reachable(false);
        let health = service.health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.handlers[2].unreachable(), vec!["10.2.0.3:11211"]);

        let stats = service.stats(&["fragments", "sessions"]).await;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].nodes.len(), 2);
        assert!(stats[1].nodes[2].error.is_some());
    }

    #[tokio::test]
    async fn test_empty_service() {
        let service = CacheService::with_handlers(Vec::new());
        assert_eq!(service.get("k", &[]).await.unwrap(), None);
        service.set("k", "v", 0, &[]).await.unwrap();
        assert!(service.handlers().is_empty());
    }
}
