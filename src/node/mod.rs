//! Cache Nodes
//!
//! Per-server key-value primitives consumed by the networked cache handlers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        NodePool                               │
//! │  pool-routed ops (key hash → node)  │  by-key ops (node #i)  │
//! ├──────────────────────────────────────────────────────────────┤
//! │            NodeClient (trait, one per server)                 │
//! │   ┌────────────────────┐        ┌────────────────────┐        │
//! │   │ MemcachedNode (TCP)│        │ InMemoryNode       │        │
//! │   └────────────────────┘        └────────────────────┘        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A node reports the outcome of every request as a [`ResultCode`]. The
//! replication protocol relies on telling definitive answers (`NotFound`,
//! `Deleted`, `NotStored`) apart from failures (timeouts, broken connections).

mod memcached;
mod memory;
mod pool;

pub use memcached::{MemcachedNode, TcpConnector};
pub use memory::{InMemoryConnector, InMemoryNode, InMemoryNodeStats};
pub use pool::{NodePool, NodePoolBuilder};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw statistics reported by a node (`STAT name value` pairs)
pub type NodeStats = BTreeMap<String, String>;

/// Result type for node operations
pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// Default memcached port
pub const DEFAULT_PORT: u16 = 11211;

// =============================================================================
// Result Codes
// =============================================================================

/// Outcome class of a single node request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// Request succeeded
    Success,
    /// Key is not present on the node
    NotFound,
    /// Key was deleted
    Deleted,
    /// Write was not stored
    NotStored,
    /// Timeout, connection or protocol failure
    Failure,
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::Success => write!(f, "SUCCESS"),
            ResultCode::NotFound => write!(f, "NOTFOUND"),
            ResultCode::Deleted => write!(f, "DELETED"),
            ResultCode::NotStored => write!(f, "NOTSTORED"),
            ResultCode::Failure => write!(f, "FAILURE"),
        }
    }
}

/// Errors returned by a node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Key not present
    #[error("key not found")]
    NotFound,

    /// Key was deleted
    #[error("key deleted")]
    Deleted,

    /// Node refused to store the value
    #[error("value not stored")]
    NotStored,

    /// Node did not answer in time
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Node could not be reached
    #[error("connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    /// Node answered with something we could not understand
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl NodeError {
    /// Map this error onto its result code
    pub fn code(&self) -> ResultCode {
        match self {
            NodeError::NotFound => ResultCode::NotFound,
            NodeError::Deleted => ResultCode::Deleted,
            NodeError::NotStored => ResultCode::NotStored,
            NodeError::Timeout(_) | NodeError::Connection { .. } | NodeError::Protocol(_) => {
                ResultCode::Failure
            }
        }
    }

    /// True when the node answered definitively (the node is reachable)
    pub fn is_answer(&self) -> bool {
        self.code() != ResultCode::Failure
    }
}

// =============================================================================
// Endpoint
// =============================================================================

/// Network address of a cache node (value object)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// =============================================================================
// Node Port
// =============================================================================

/// Port for a single cache server.
///
/// Implementations talk to exactly one node; routing across nodes lives in
/// [`NodePool`]. Misses are reported as `Err(NodeError::NotFound)` so callers
/// see the same result codes a memcached client library exposes.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// `host:port` of this node
    fn endpoint(&self) -> String;

    /// Read a key
    async fn get(&self, key: &str) -> NodeResult<Bytes>;

    /// Store a key; `ttl` of zero means no expiry
    async fn set(&self, key: &str, value: Bytes, ttl: u32) -> NodeResult<()>;

    /// Remove a key; `NotFound` when it was absent
    async fn delete(&self, key: &str) -> NodeResult<()>;

    /// Drop every key on the node
    async fn flush(&self) -> NodeResult<()>;

    /// Server statistics
    async fn stats(&self) -> NodeResult<NodeStats>;
}

/// Creates node clients for configured servers
pub trait NodeConnector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> Arc<dyn NodeClient>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes() {
        assert_eq!(NodeError::NotFound.code(), ResultCode::NotFound);
        assert_eq!(NodeError::Deleted.code(), ResultCode::Deleted);
        assert_eq!(NodeError::NotStored.code(), ResultCode::NotStored);
        assert_eq!(
            NodeError::Timeout(Duration::from_millis(5)).code(),
            ResultCode::Failure
        );
        assert_eq!(
            NodeError::Protocol("garbage".into()).code(),
            ResultCode::Failure
        );
    }

    #[test]
    fn test_answers_mark_node_active() {
        assert!(NodeError::NotFound.is_answer());
        assert!(NodeError::Deleted.is_answer());
        assert!(NodeError::NotStored.is_answer());
        assert!(!NodeError::Connection {
            endpoint: "10.0.0.1:11211".into(),
            reason: "refused".into(),
        }
        .is_answer());
        assert!(!NodeError::Timeout(Duration::from_secs(1)).is_answer());
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint::new("cache-1.internal", DEFAULT_PORT);
        assert_eq!(endpoint.to_string(), "cache-1.internal:11211");
    }
}
