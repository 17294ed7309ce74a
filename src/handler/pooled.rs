//! Pool-routed handler (memcache)
//!
//! No replication: every key lives on the node the pool routes it to. Node
//! failures degrade to misses and silent no-op writes.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::NodeStatsReport;
use crate::health::NodeHealth;
use crate::metrics::CacheMetrics;
use crate::node::{NodeError, NodePool};

/// Single logical pool without replication
pub struct PooledHandler {
    identifier: String,
    pool: NodePool,
    metrics: Arc<CacheMetrics>,
}

impl PooledHandler {
    pub fn new(identifier: impl Into<String>, pool: NodePool, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            identifier: identifier.into(),
            pool,
            metrics,
        }
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        match self.pool.get(key).await {
            Ok(value) => Some(value),
            Err(e) if e.is_answer() => None,
            Err(e) => {
                self.node_failure("get", key, &e);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Bytes, ttl: u32) {
        if let Err(e) = self.pool.set(key, value, ttl).await {
            self.node_failure("set", key, &e);
        }
    }

    pub async fn delete(&self, key: &str) {
        match self.pool.delete(key).await {
            Ok(()) | Err(NodeError::NotFound) => {}
            Err(e) => self.node_failure("delete", key, &e),
        }
    }

    pub async fn flush(&self) {
        for (endpoint, result) in self.pool.flush().await {
            if let Err(e) = result {
                self.metrics.record_node_failure();
                warn!(identifier = %self.identifier, %endpoint, error = %e, "Flush failed on node");
            }
        }
    }

    pub async fn stats(&self) -> Vec<NodeStatsReport> {
        self.pool
            .stats()
            .await
            .into_iter()
            .map(|(endpoint, result)| NodeStatsReport::from_result(endpoint, result))
            .collect()
    }

    /// Reachability of every node, probed with a stats request
    pub async fn node_health(&self) -> Vec<NodeHealth> {
        self.pool
            .stats()
            .await
            .into_iter()
            .map(|(endpoint, result)| NodeHealth::from_result(endpoint, &result))
            .collect()
    }

    fn node_failure(&self, op: &str, key: &str, error: &NodeError) {
        self.metrics.record_node_failure();
        if error.is_answer() {
            debug!(identifier = %self.identifier, op, key, error = %error, "Node refused request");
        } else {
            warn!(identifier = %self.identifier, op, key, error = %error, "Node request failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::InMemoryNode;
    use std::time::Duration;

    fn handler(n: usize) -> (PooledHandler, Vec<Arc<InMemoryNode>>) {
        let nodes: Vec<Arc<InMemoryNode>> = (0..n)
            .map(|i| Arc::new(InMemoryNode::new(format!("10.0.1.{}:11211", i + 1))))
            .collect();
        let mut builder = NodePool::builder().timeout(Duration::from_millis(50));
        for node in &nodes {
            builder = builder.add_server(node.clone());
        }
        let handler = PooledHandler::new("fragments", builder.build(), Arc::new(CacheMetrics::new()));
        (handler, nodes)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (handler, _) = handler(3);

        handler.set("k", Bytes::from_static(b"v"), 0).await;
        assert_eq!(handler.get("k").await, Some(Bytes::from_static(b"v")));

        handler.delete("k").await;
        assert_eq!(handler.get("k").await, None);
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_noop() {
        let (handler, nodes) = handler(2);
        handler.delete("never-written").await;
        assert_eq!(handler.metrics.snapshot().node_failures, 0);
        assert!(nodes.iter().all(|n| n.counters().items == 0));
    }

    #[tokio::test]
    async fn test_outage_degrades_to_miss() {
        let (handler, nodes) = handler(1);
        handler.set("k", Bytes::from_static(b"v"), 0).await;
        nodes[0].set_reachable(false);

        assert_eq!(handler.get("k").await, None);
        handler.set("k2", Bytes::from_static(b"v"), 0).await;
        assert!(!nodes[0].contains("k2"));
        assert_eq!(handler.metrics.snapshot().node_failures, 2);
    }

    #[tokio::test]
    async fn test_node_health_reports_partial_outage() {
        let (handler, nodes) = handler(3);
        assert!(handler.node_health().await.iter().all(|n| n.reachable));

        nodes[1].set_reachable(false);
        let health = handler.node_health().await;
        let reachable: Vec<bool> = health.iter().map(|n| n.reachable).collect();
        assert_eq!(reachable, vec![true, false, true]);
        assert_eq!(health[1].endpoint, "10.0.1.2:11211");
        assert!(health[1].error.is_some());
    }

    #[tokio::test]
    async fn test_flush_clears_every_node() {
        let (handler, nodes) = handler(3);
        for node in &nodes {
            node.seed("k", "v");
        }
        handler.flush().await;
        assert!(nodes.iter().all(|n| !n.contains("k")));
    }
}
