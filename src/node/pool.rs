//! Node Pool
//!
//! Ordered, immutable set of nodes behind one networked handler. Servers are
//! registered through [`NodePoolBuilder`]; once built the endpoint list never
//! changes.
//!
//! Two ways of addressing nodes:
//!
//! - pool-routed (`get`, `set`, `delete`): the key hash picks one node
//! - by-key (`get_by_key`, ...): the caller names the node index
//!
//! Every call is bounded by the pool timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;

use super::{NodeClient, NodeError, NodeResult, NodeStats};

/// Default per-call timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Builder phase of a [`NodePool`]
pub struct NodePoolBuilder {
    nodes: Vec<Arc<dyn NodeClient>>,
    timeout: Duration,
}

impl NodePoolBuilder {
    /// Create an empty builder with the default timeout
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the per-call timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a node; registration order is replica preference order
    pub fn add_server(mut self, node: Arc<dyn NodeClient>) -> Self {
        self.nodes.push(node);
        self
    }

    /// Finalize the pool
    pub fn build(self) -> NodePool {
        NodePool {
            nodes: self.nodes,
            timeout: self.timeout,
        }
    }
}

impl Default for NodePoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered pool of cache nodes
pub struct NodePool {
    nodes: Vec<Arc<dyn NodeClient>>,
    timeout: Duration,
}

impl NodePool {
    /// Start building a pool
    pub fn builder() -> NodePoolBuilder {
        NodePoolBuilder::new()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Per-call timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Endpoints in registration order
    pub fn endpoints(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.endpoint()).collect()
    }

    /// Endpoint of node `index`
    pub fn endpoint(&self, index: usize) -> String {
        self.nodes
            .get(index)
            .map(|n| n.endpoint())
            .unwrap_or_default()
    }

    /// Node index the pool routes `key` to
    pub fn route(&self, key: &str) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        Some((fx_hash(key.as_bytes()) % self.nodes.len() as u64) as usize)
    }

    // =========================================================================
    // Pool-routed operations
    // =========================================================================

    pub async fn get(&self, key: &str) -> NodeResult<Bytes> {
        let index = self.route_or_err(key)?;
        self.get_by_key(index, key).await
    }

    pub async fn set(&self, key: &str, value: Bytes, ttl: u32) -> NodeResult<()> {
        let index = self.route_or_err(key)?;
        self.set_by_key(index, key, value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> NodeResult<()> {
        let index = self.route_or_err(key)?;
        self.delete_by_key(index, key).await
    }

    // =========================================================================
    // Node-targeted operations
    // =========================================================================

    pub async fn get_by_key(&self, index: usize, key: &str) -> NodeResult<Bytes> {
        let node = self.node(index)?;
        self.bounded(node.get(key)).await
    }

    pub async fn set_by_key(
        &self,
        index: usize,
        key: &str,
        value: Bytes,
        ttl: u32,
    ) -> NodeResult<()> {
        let node = self.node(index)?;
        self.bounded(node.set(key, value, ttl)).await
    }

    pub async fn delete_by_key(&self, index: usize, key: &str) -> NodeResult<()> {
        let node = self.node(index)?;
        self.bounded(node.delete(key)).await
    }

    // =========================================================================
    // Pool-wide operations
    // =========================================================================

    /// Flush every node; one result per node in registration order
    pub async fn flush(&self) -> Vec<(String, NodeResult<()>)> {
        let calls = self.nodes.iter().map(|node| async move {
            (node.endpoint(), self.bounded(node.flush()).await)
        });
        join_all(calls).await
    }

    /// Stats from every node in registration order
    pub async fn stats(&self) -> Vec<(String, NodeResult<NodeStats>)> {
        let calls = self.nodes.iter().map(|node| async move {
            (node.endpoint(), self.bounded(node.stats()).await)
        });
        join_all(calls).await
    }

    fn node(&self, index: usize) -> NodeResult<&Arc<dyn NodeClient>> {
        self.nodes.get(index).ok_or_else(|| NodeError::Connection {
            endpoint: format!("node #{}", index),
            reason: "no such node in pool".to_string(),
        })
    }

    fn route_or_err(&self, key: &str) -> NodeResult<usize> {
        self.route(key).ok_or_else(|| NodeError::Connection {
            endpoint: "pool".to_string(),
            reason: "pool has no servers".to_string(),
        })
    }

    async fn bounded<T>(&self, call: impl Future<Output = NodeResult<T>>) -> NodeResult<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Timeout(self.timeout)),
        }
    }
}

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

// =============================================================================
// Tests
// =============================================================================
