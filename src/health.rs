//! Handler Health
//!
//! Reachability of every handler's backend, node by node.
//!
//! ```text
//! HealthReport              status = worst handler
//!  └─ HandlerHealth         status = answering / total nodes
//!      └─ NodeHealth        endpoint, reachable, error
//! ```
//!
//! A replicated handler with some nodes down is `Degraded`: reads still find
//! a replica on the active nodes and repair skips the unreachable ones.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::HandlerType;
use crate::node::NodeResult;

/// Health of a handler or of the whole service.
///
/// Variants are ordered by severity, so the worst of several is their `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// At least one node can still serve requests
    pub fn is_operational(&self) -> bool {
        *self != HealthStatus::Unhealthy
    }

    /// Classify a networked handler by how many of its nodes answered
    pub fn from_node_counts(answering: usize, total: usize) -> Self {
        match answering {
            0 => HealthStatus::Unhealthy,
            n if n == total => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        }
    }
}

/// Reachability of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub endpoint: String,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeHealth {
    /// Any answer from the node counts as reachable
    pub fn from_result<T>(endpoint: String, result: &NodeResult<T>) -> Self {
        match result {
            Ok(_) => Self {
                endpoint,
                reachable: true,
                error: None,
            },
            Err(e) if e.is_answer() => Self {
                endpoint,
                reachable: true,
                error: None,
            },
            Err(e) => Self {
                endpoint,
                reachable: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Health of one configured handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerHealth {
    pub identifier: String,
    pub handler_type: HandlerType,
    pub status: HealthStatus,
    /// Per-node reachability; empty for disk handlers
    pub nodes: Vec<NodeHealth>,
    /// Why a local backend is unusable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl HandlerHealth {
    /// Networked handler, classified by its answering nodes
    pub fn from_nodes(
        identifier: impl Into<String>,
        handler_type: HandlerType,
        nodes: Vec<NodeHealth>,
    ) -> Self {
        let answering = nodes.iter().filter(|n| n.reachable).count();
        Self {
            identifier: identifier.into(),
            handler_type,
            status: HealthStatus::from_node_counts(answering, nodes.len()),
            nodes,
            error: None,
            elapsed_ms: 0,
        }
    }

    /// Local handler: healthy unless `error` is set
    pub fn local(
        identifier: impl Into<String>,
        handler_type: HandlerType,
        error: Option<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            handler_type,
            status: if error.is_some() {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Healthy
            },
            nodes: Vec::new(),
            error,
            elapsed_ms: 0,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = elapsed.as_millis() as u64;
        self
    }

    /// Endpoints that did not answer
    pub fn unreachable(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| !n.reachable)
            .map(|n| n.endpoint.as_str())
            .collect()
    }
}

/// Health of the whole service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub handlers: Vec<HandlerHealth>,
    pub version: String,
    pub uptime_seconds: u64,
}

impl HealthReport {
    pub fn new(handlers: Vec<HandlerHealth>, uptime: Duration) -> Self {
        let status = handlers
            .iter()
            .map(|h| h.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            handlers,
            version: crate::VERSION.to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
