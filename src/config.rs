//! Cache Service Configuration
//!
//! Static description of the handlers a [`CacheService`](crate::CacheService)
//! is built from. Loaded from YAML or JSON.
//!
//! ```yaml
//! handlers:
//!   - identifier: sessions
//!     type: memcached
//!     timeout_ms: 500
//!     servers:
//!       - { host: 10.0.0.1, port: 11211 }
//!       - { host: 10.0.0.2, port: 11211 }
//!     options: { replication: true, replicate_to: 2, attempts_max: 2 }
//!   - identifier: pages
//!     type: disk
//!     path: /var/cache/rivera
//!     expires: 3600
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::node::Endpoint;

/// Default per-call node timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default read expiry window of disk handlers (seconds)
pub const DEFAULT_DISK_EXPIRES: u32 = 3600;

// =============================================================================
// Handler Type
// =============================================================================

/// Kind of cache backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerType {
    /// Filesystem-backed cache
    Disk,
    /// Non-replicated memcache pool
    Memcache,
    /// Memcached pool with optional replication
    Memcached,
    /// Reserved, no implementation
    Redis,
}

impl HandlerType {
    /// Check if this kind talks to network servers
    pub fn is_networked(&self) -> bool {
        !matches!(self, HandlerType::Disk)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerType::Disk => "disk",
            HandlerType::Memcache => "memcache",
            HandlerType::Memcached => "memcached",
            HandlerType::Redis => "redis",
        }
    }
}

impl std::fmt::Display for HandlerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "disk" => Ok(HandlerType::Disk),
            "memcache" => Ok(HandlerType::Memcache),
            "memcached" => Ok(HandlerType::Memcached),
            "redis" => Ok(HandlerType::Redis),
            other => Err(other.to_string()),
        }
    }
}

// =============================================================================
// Replication Options
// =============================================================================

/// Replication settings of a memcached handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationOptions {
    /// Enable the replication protocol
    pub replication: bool,
    /// Target number of nodes holding a copy of each key
    pub replicate_to: usize,
    /// Read attempts per node before giving up on it
    pub attempts_max: u32,
    /// Initial backoff between attempts on one node, doubled per attempt
    pub retry_backoff_ms: u64,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            replication: false,
            replicate_to: 1,
            attempts_max: 1,
            retry_backoff_ms: 0,
        }
    }
}

impl ReplicationOptions {
    /// Replication enabled with `replicate_to` copies and a single attempt
    pub fn replicated(replicate_to: usize) -> Self {
        Self {
            replication: true,
            replicate_to,
            ..Default::default()
        }
    }

    pub fn with_attempts(mut self, attempts_max: u32) -> Self {
        self.attempts_max = attempts_max;
        self
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.retry_backoff_ms == 0 || attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64 << (attempt - 1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

// =============================================================================
// Handler Configuration
// =============================================================================

/// One server entry; host and port are checked during validation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
        }
    }
}

/// Configuration of a single cache handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Caller-facing label used for selective targeting
    pub identifier: String,

    /// Backend kind (`disk`, `memcache`, `memcached`, `redis`)
    #[serde(rename = "type")]
    pub kind: String,

    /// Servers of networked handlers, in replica preference order
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Replication options (memcached only)
    #[serde(default)]
    pub options: Option<ReplicationOptions>,

    /// Root directory of disk handlers
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Default read expiry window in seconds
    #[serde(default)]
    pub expires: Option<u32>,

    /// Per-call node timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl HandlerConfig {
    fn with_kind(identifier: impl Into<String>, kind: HandlerType) -> Self {
        Self {
            identifier: identifier.into(),
            kind: kind.as_str().to_string(),
            servers: Vec::new(),
            options: None,
            path: None,
            expires: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Disk handler rooted at `path`
    pub fn disk(identifier: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let mut config = Self::with_kind(identifier, HandlerType::Disk);
        config.path = Some(path.into());
        config
    }

    /// Non-replicated memcache handler
    pub fn memcache(identifier: impl Into<String>, servers: Vec<ServerConfig>) -> Self {
        let mut config = Self::with_kind(identifier, HandlerType::Memcache);
        config.servers = servers;
        config
    }

    /// Memcached handler; replication is off until options are set
    pub fn memcached(identifier: impl Into<String>, servers: Vec<ServerConfig>) -> Self {
        let mut config = Self::with_kind(identifier, HandlerType::Memcached);
        config.servers = servers;
        config
    }

    pub fn with_options(mut self, options: ReplicationOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Parse and check the handler kind
    pub fn handler_type(&self) -> Result<HandlerType> {
        let kind = self
            .kind
            .parse::<HandlerType>()
            .map_err(|kind| Error::UnknownHandlerType {
                identifier: self.identifier.clone(),
                kind,
            })?;
        if kind == HandlerType::Redis {
            return Err(Error::UnsupportedHandlerType {
                identifier: self.identifier.clone(),
                kind: kind.to_string(),
            });
        }
        Ok(kind)
    }

    /// Validated server endpoints
    pub fn endpoints(&self) -> Result<Vec<Endpoint>> {
        if self.servers.is_empty() {
            return Err(Error::EmptyServerList {
                identifier: self.identifier.clone(),
            });
        }

        self.servers
            .iter()
            .enumerate()
            .map(|(index, server)| {
                let malformed = |reason: &str| Error::MalformedServer {
                    identifier: self.identifier.clone(),
                    index,
                    reason: reason.to_string(),
                };
                let host = server
                    .host
                    .as_deref()
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| malformed("missing host"))?;
                let port = server
                    .port
                    .filter(|p| *p != 0)
                    .ok_or_else(|| malformed("missing port"))?;
                Ok(Endpoint::new(host, port))
            })
            .collect()
    }

    /// Replication options, defaulted when absent
    pub fn replication(&self) -> Result<ReplicationOptions> {
        let options = self.options.clone().unwrap_or_default();
        if options.attempts_max == 0 {
            return Err(Error::Config(format!(
                "handler '{}': attempts_max must be at least 1",
                self.identifier
            )));
        }
        Ok(options)
    }

    /// Disk root directory
    pub fn disk_root(&self) -> Result<&Path> {
        self.path.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "disk handler '{}' has no path configured",
                self.identifier
            ))
        })
    }

    /// Per-call node timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    /// Read expiry window used when callers do not pass one
    pub fn default_expires(&self, kind: HandlerType) -> u32 {
        self.expires.unwrap_or(match kind {
            HandlerType::Disk => DEFAULT_DISK_EXPIRES,
            _ => 0,
        })
    }

    /// Check everything that can be checked without touching a backend
    pub fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(Error::Config("handler identifier must not be empty".to_string()));
        }

        let kind = self.handler_type()?;
        if kind.is_networked() {
            let endpoints = self.endpoints()?;
            let options = self.replication()?;
            if kind == HandlerType::Memcached && options.replication && options.replicate_to == 0 {
                return Err(Error::Config(format!(
                    "handler '{}': replicate_to must be at least 1 when replication is enabled",
                    self.identifier
                )));
            }
            if kind == HandlerType::Memcached
                && options.replication
                && options.replicate_to > endpoints.len()
            {
                warn!(
                    identifier = %self.identifier,
                    replicate_to = options.replicate_to,
                    servers = endpoints.len(),
                    "replicate_to exceeds server count; replication saturates at available nodes"
                );
            }
        } else {
            self.disk_root()?;
        }
        Ok(())
    }
}

// =============================================================================
// Service Configuration
// =============================================================================

/// Configuration of a whole cache service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheServiceConfig {
    /// Handlers in read priority order
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

impl CacheServiceConfig {
    pub fn new(handlers: Vec<HandlerConfig>) -> Self {
        Self { handlers }
    }

    pub fn from_yaml_str(input: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(input)?)
    }

    pub fn from_json_str(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }

    /// Load from a file; `.yaml`/`.yml` is YAML, anything else JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents),
            _ => Self::from_json_str(&contents),
        }
    }

    /// Validate every handler and reject duplicate identifiers
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for handler in &self.handlers {
            handler.validate()?;
            if !seen.insert(handler.identifier.as_str()) {
                return Err(Error::DuplicateIdentifier(handler.identifier.clone()));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const SAMPLE: &str = r#"
handlers:
  - identifier: sessions
    type: memcached
    timeout_ms: 500
    servers:
      - { host: 10.0.0.1, port: 11211 }
      - { host: 10.0.0.2, port: 11211 }
    options: { replication: true, replicate_to: 2, attempts_max: 2 }
  - identifier: pages
    type: Disk
    path: /var/cache/rivera
    expires: 60
"#;

    #[test]
    fn test_parse_yaml() {
        let config = CacheServiceConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.handlers.len(), 2);

        let sessions = &config.handlers[0];
        assert_eq!(sessions.handler_type().unwrap(), HandlerType::Memcached);
        assert_eq!(sessions.timeout(), Duration::from_millis(500));
        let options = sessions.replication().unwrap();
        assert!(options.replication);
        assert_eq!(options.replicate_to, 2);
        assert_eq!(options.attempts_max, 2);
        assert_eq!(options.retry_backoff_ms, 0);
        assert_eq!(sessions.endpoints().unwrap()[1].to_string(), "10.0.0.2:11211");

        let pages = &config.handlers[1];
        assert_eq!(pages.handler_type().unwrap(), HandlerType::Disk);
        assert_eq!(pages.default_expires(HandlerType::Disk), 60);
        assert_eq!(pages.timeout_ms, DEFAULT_TIMEOUT_MS);

        config.validate().unwrap();
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"handlers":[{"identifier":"a","type":"memcache","servers":[{"host":"h","port":1}]}]}"#;
        let config = CacheServiceConfig::from_json_str(json).unwrap();
        assert_eq!(
            config.handlers[0].handler_type().unwrap(),
            HandlerType::Memcache
        );
        assert!(config.handlers[0].options.is_none());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut config = HandlerConfig::disk("x", "/tmp/x");
        config.kind = "mongodb".to_string();
        assert_matches!(
            config.validate(),
            Err(Error::UnknownHandlerType { kind, .. }) if kind == "mongodb"
        );
    }

    #[test]
    fn test_redis_reserved() {
        let mut config = HandlerConfig::memcache("x", vec![ServerConfig::new("h", 1)]);
        config.kind = "redis".to_string();
        assert_matches!(config.validate(), Err(Error::UnsupportedHandlerType { .. }));
    }

    #[test]
    fn test_empty_server_list_rejected() {
        let config = HandlerConfig::memcached("sessions", vec![]);
        assert_matches!(
            config.validate(),
            Err(Error::EmptyServerList { identifier }) if identifier == "sessions"
        );
    }

    #[test]
    fn test_malformed_server_rejected() {
        let config = HandlerConfig::memcache(
            "sessions",
            vec![
                ServerConfig::new("10.0.0.1", 11211),
                ServerConfig {
                    host: Some("10.0.0.2".into()),
                    port: None,
                },
            ],
        );
        assert_matches!(
            config.validate(),
            Err(Error::MalformedServer { index: 1, .. })
        );

        let config = HandlerConfig::memcache("sessions", vec![ServerConfig::new("  ", 11211)]);
        assert_matches!(
            config.validate(),
            Err(Error::MalformedServer { index: 0, .. })
        );
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = HandlerConfig::memcached("s", vec![ServerConfig::new("h", 1)])
            .with_options(ReplicationOptions::replicated(1).with_attempts(0));
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_zero_replicate_to_rejected() {
        let config = HandlerConfig::memcached("s", vec![ServerConfig::new("h", 1)])
            .with_options(ReplicationOptions::replicated(0));
        assert_matches!(
            config.validate(),
            Err(Error::Config(msg)) if msg.contains("replicate_to")
        );

        // Ignored while replication is off
        let mut options = ReplicationOptions::default();
        options.replicate_to = 0;
        let config = HandlerConfig::memcached("s", vec![ServerConfig::new("h", 1)]).with_options(options);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_disk_requires_path() {
        let mut config = HandlerConfig::disk("pages", "/tmp");
        config.path = None;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_duplicate_identifiers_rejected() {
        let config = CacheServiceConfig::new(vec![
            HandlerConfig::disk("pages", "/tmp/a"),
            HandlerConfig::disk("pages", "/tmp/b"),
        ]);
        assert_matches!(config.validate(), Err(Error::DuplicateIdentifier(id)) if id == "pages");
    }

    #[test]
    fn test_backoff_doubles() {
        let mut options = ReplicationOptions::replicated(2);
        assert_eq!(options.backoff(1), Duration::ZERO);

        options.retry_backoff_ms = 10;
        assert_eq!(options.backoff(1), Duration::from_millis(10));
        assert_eq!(options.backoff(2), Duration::from_millis(20));
        assert_eq!(options.backoff(3), Duration::from_millis(40));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = CacheServiceConfig::load(&path).unwrap();
        assert_eq!(config.handlers.len(), 2);
    }
}
