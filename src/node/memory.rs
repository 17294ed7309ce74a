//! In-Memory Node
//!
//! A [`NodeClient`] backed by a concurrent map. Used by tests and by embedders
//! that want the replication protocol without a memcached deployment.
//! Outages and slow links can be simulated per node.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::{Endpoint, NodeClient, NodeConnector, NodeError, NodeResult, NodeStats};

struct StoredValue {
    data: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Operation counters of an in-memory node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryNodeStats {
    pub items: u64,
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub flushes: u64,
}

/// In-memory cache node
pub struct InMemoryNode {
    endpoint: String,
    storage: DashMap<String, StoredValue>,
    reachable: AtomicBool,
    latency_us: AtomicU64,
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    flushes: AtomicU64,
}

impl InMemoryNode {
    /// Create a reachable, empty node
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            storage: DashMap::new(),
            reachable: AtomicBool::new(true),
            latency_us: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    /// Delay every request by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Check for a live key without touching counters or reachability
    pub fn contains(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    /// Read a live key without touching counters or reachability
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        self.storage
            .get(key)
            .filter(|v| !v.is_expired())
            .map(|v| v.data.clone())
    }

    /// Drop a key behind the protocol's back
    pub fn evict(&self, key: &str) {
        self.storage.remove(key);
    }

    /// Store a key behind the protocol's back
    pub fn seed(&self, key: &str, value: impl Into<Bytes>) {
        self.storage.insert(
            key.to_string(),
            StoredValue {
                data: value.into(),
                expires_at: None,
            },
        );
    }

    /// Counter snapshot
    pub fn counters(&self) -> InMemoryNodeStats {
        InMemoryNodeStats {
            items: self.storage.len() as u64,
            gets: self.gets.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }

    async fn enter(&self) -> NodeResult<()> {
        let latency = self.latency_us.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
        }
        if !self.is_reachable() {
            return Err(NodeError::Connection {
                endpoint: self.endpoint.clone(),
                reason: "node unreachable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NodeClient for InMemoryNode {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn get(&self, key: &str) -> NodeResult<Bytes> {
        self.enter().await?;
        self.gets.fetch_add(1, Ordering::Relaxed);

        let expired = match self.storage.get(key) {
            Some(value) if !value.is_expired() => return Ok(value.data.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.storage.remove(key);
        }
        Err(NodeError::NotFound)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: u32) -> NodeResult<()> {
        self.enter().await?;
        self.sets.fetch_add(1, Ordering::Relaxed);

        let expires_at = (ttl > 0).then(|| Instant::now() + Duration::from_secs(ttl as u64));
        self.storage.insert(
            key.to_string(),
            StoredValue {
                data: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> NodeResult<()> {
        self.enter().await?;
        self.deletes.fetch_add(1, Ordering::Relaxed);

        match self.storage.remove(key) {
            Some(_) => Ok(()),
            None => Err(NodeError::NotFound),
        }
    }

    async fn flush(&self) -> NodeResult<()> {
        self.enter().await?;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.storage.clear();
        Ok(())
    }

    async fn stats(&self) -> NodeResult<NodeStats> {
        self.enter().await?;
        let counters = self.counters();

        let mut stats = NodeStats::new();
        stats.insert("curr_items".to_string(), counters.items.to_string());
        stats.insert("cmd_get".to_string(), counters.gets.to_string());
        stats.insert("cmd_set".to_string(), counters.sets.to_string());
        stats.insert("cmd_delete".to_string(), counters.deletes.to_string());
        stats.insert("cmd_flush".to_string(), counters.flushes.to_string());
        Ok(stats)
    }
}

/// Connector handing out in-memory nodes, one per endpoint.
///
/// Connecting twice to the same endpoint returns the same node, so tests can
/// build a service from configuration and then reach into its nodes.
#[derive(Default)]
pub struct InMemoryConnector {
    nodes: DashMap<String, Arc<InMemoryNode>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node previously created for `endpoint`
    pub fn node(&self, endpoint: &str) -> Option<Arc<InMemoryNode>> {
        self.nodes.get(endpoint).map(|n| n.clone())
    }

    /// Create (or fetch) the node for `endpoint` before the service exists
    pub fn node_for(&self, endpoint: &Endpoint) -> Arc<InMemoryNode> {
        self.nodes
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(InMemoryNode::new(endpoint.to_string())))
            .clone()
    }
}

impl NodeConnector for InMemoryConnector {
    fn connect(&self, endpoint: &Endpoint, _timeout: Duration) -> Arc<dyn NodeClient> {
        self.node_for(endpoint)
    }
}

// =============================================================================
// Tests
// =============================================================================
