//! Rivera Cache - Multi-backend cache service
//!
//! A cache front door for the Rivera framework. Callers see one
//! get/set/delete/flush surface over an ordered list of named handlers, each
//! backed by a local directory or a memcached pool.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         CacheService                            │
//! │      read: first hit in order │ write: fan-out to every handler │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │     Disk     │    │   Memcache   │    │  Memcached   │       │
//! │  │  nested path │    │ pool-routed  │    │  replicated  │       │
//! │  │  mtime TTL   │    │  single copy │    │ read repair  │       │
//! │  └──────────────┘    └──────┬───────┘    └──────┬───────┘       │
//! │                             └────────┬──────────┘               │
//! │                                  NodePool                       │
//! │                         (ordered memcached nodes)               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`] - Handler and service configuration (YAML / JSON)
//! - [`error`] - Error types
//! - [`handler`] - Disk, pooled and replicated cache handlers
//! - [`health`] - Health reporting
//! - [`metrics`] - Service counters
//! - [`node`] - Memcached node clients and the node pool
//! - [`service`] - The multi-handler cache service

pub mod config;
pub mod error;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod node;
pub mod service;

// Re-export commonly used types
pub use config::{CacheServiceConfig, HandlerConfig, HandlerType, ReplicationOptions, ServerConfig};
pub use error::{Error, Result};
pub use handler::{CacheHandler, HandlerStats};
pub use health::{HandlerHealth, HealthReport, HealthStatus, NodeHealth};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use node::{InMemoryConnector, NodeClient, NodeConnector, NodePool, TcpConnector};
pub use service::CacheService;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
