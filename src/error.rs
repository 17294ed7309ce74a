//! Error types for the Rivera cache service

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache service
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error (disk handler, config file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML configuration could not be parsed
    #[error("Failed to parse YAML configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// JSON configuration could not be parsed
    #[error("Failed to parse JSON configuration: {0}")]
    ConfigJson(#[from] serde_json::Error),

    /// Handler type is not one of the known kinds
    #[error("Unknown cache handler type '{kind}' for handler '{identifier}'")]
    UnknownHandlerType { identifier: String, kind: String },

    /// Handler type is known but has no implementation
    #[error("Cache handler type '{kind}' for handler '{identifier}' is not supported")]
    UnsupportedHandlerType { identifier: String, kind: String },

    /// Networked handler configured without servers
    #[error("Cache handler '{identifier}' has no servers configured")]
    EmptyServerList { identifier: String },

    /// Server entry is missing its host or port
    #[error("Cache handler '{identifier}' has a malformed server entry #{index}: {reason}")]
    MalformedServer {
        identifier: String,
        index: usize,
        reason: String,
    },

    /// Two handlers share one identifier
    #[error("Duplicate cache handler identifier: {0}")]
    DuplicateIdentifier(String),

    /// Construction-time write/read round trip failed
    #[error("Health probe failed for cache handler '{identifier}'")]
    HealthProbeFailed { identifier: String },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Key cannot be stored by this handler
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    /// A fan-out operation failed on one handler
    #[error("Cache handler '{identifier}' failed: {source}")]
    HandlerFailed {
        identifier: String,
        #[source]
        source: Box<Error>,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error was raised while validating configuration
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::ConfigParse(_)
                | Error::ConfigJson(_)
                | Error::UnknownHandlerType { .. }
                | Error::UnsupportedHandlerType { .. }
                | Error::EmptyServerList { .. }
                | Error::MalformedServer { .. }
                | Error::DuplicateIdentifier(_)
                | Error::HealthProbeFailed { .. }
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
