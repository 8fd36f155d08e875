//! # Error Handling Module
//!
//! This module defines every failure the release pipeline can produce, using the
//! `thiserror` crate. The variants follow the pipeline's error taxonomy:
//!
//! - **Precondition errors** (inactive gateway/stage, missing backend, empty host
//!   list, stale resource version): reported before anything is written and never
//!   retried automatically.
//! - **Lock contention** (`LockTimeout`): the whole release may be retried by the
//!   caller.
//! - **Partial distribution failure** (`SyncFail`): carries the keys that could
//!   not be written or deleted. The distributor converts it into a structured
//!   outcome at its boundary.
//! - **Infrastructure errors** (store, repository, timeouts, I/O, serialization).
//!
//! Errors are plain data, so they can be logged, stored in publish event details
//! and compared in tests.

use thiserror::Error;

/// Main result type used throughout the release pipeline
pub type ReleaseResult<T> = Result<T, ReleaseError>;

/// Error types for the release pipeline
///
/// The `#[error("...")]` attribute from `thiserror` implements `Display`
/// with the given message.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReleaseError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A release precondition does not hold (inactive gateway, stale version, ...)
    #[error("Release precondition failed: {reason}")]
    Precondition { reason: String },

    /// A referenced entity does not exist in the repository
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A resource does not reference a concrete backend
    #[error("Resource {resource_name} (id={resource_id}) has no backend bound")]
    MissingBackend {
        resource_id: i64,
        resource_name: String,
    },

    /// A backend resolved to an empty host list for the stage
    #[error("Backend {backend} has no hosts configured for this stage")]
    EmptyHosts { backend: String },

    /// A plugin binding carries a configuration its handler rejects
    #[error("Invalid config for plugin {plugin}: {reason}")]
    InvalidPluginConfig { plugin: String, reason: String },

    /// A resource path template cannot be rendered
    #[error("Invalid resource path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// The per-(gateway, stage) release lock could not be acquired
    #[error("Another release is in progress for {key}, lock not acquired after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },

    /// Some keys could not be reconciled into the distributed store
    #[error("Failed to sync {} key(s) to the distributed store: {}", keys.len(), keys.join(", "))]
    SyncFail { keys: Vec<String> },

    /// Distributed store errors (connection, protocol, ...)
    #[error("Store error: {message}")]
    Store { message: String },

    /// An operation exceeded its deadline
    #[error("Operation timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Persistence collaborator errors
    #[error("Repository error: {message}")]
    Repository { message: String },

    /// Internal errors for unexpected failures
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration and plugin configs
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl ReleaseError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a precondition error with a custom reason
    pub fn precondition<S: Into<String>>(reason: S) -> Self {
        Self::Precondition {
            reason: reason.into(),
        }
    }

    /// Create a not found error for an entity
    pub fn not_found<E: Into<String>, I: ToString>(entity: E, id: I) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Create a store error with a custom message
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a repository error with a custom message
    pub fn repository<S: Into<String>>(message: S) -> Self {
        Self::Repository {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an invalid plugin config error
    pub fn plugin<P: Into<String>, R: Into<String>>(plugin: P, reason: R) -> Self {
        Self::InvalidPluginConfig {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is worth retrying the whole release for
    ///
    /// Precondition errors are permanent until an administrator changes the
    /// gateway definition; contention and store failures are transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::SyncFail { .. }
                | Self::Store { .. }
                | Self::Timeout { .. }
                | Self::Io { .. }
        )
    }

    /// Check if this error was raised before any write was attempted
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::Precondition { .. }
                | Self::MissingBackend { .. }
                | Self::EmptyHosts { .. }
                | Self::InvalidPath { .. }
                | Self::InvalidPluginConfig { .. }
        )
    }

    /// Get a string representation of the error type for event details
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::Precondition { .. } => "precondition_failed",
            Self::NotFound { .. } => "not_found",
            Self::MissingBackend { .. } => "missing_backend",
            Self::EmptyHosts { .. } => "empty_hosts",
            Self::InvalidPluginConfig { .. } => "invalid_plugin_config",
            Self::InvalidPath { .. } => "invalid_path",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::SyncFail { .. } => "sync_fail",
            Self::Store { .. } => "store_error",
            Self::Timeout { .. } => "timeout",
            Self::Repository { .. } => "repository_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }
}

/// Implement conversion from std::io::Error
impl From<std::io::Error> for ReleaseError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_json::Error
impl From<serde_json::Error> for ReleaseError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_yaml::Error
impl From<serde_yaml::Error> for ReleaseError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from redis::RedisError
impl From<redis::RedisError> for ReleaseError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

/// Convenience macro for creating internal errors
///
/// Usage: `internal_error!("Failed to load stage {}", stage_id)`
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::core::error::ReleaseError::internal(format!($($arg)*))
    };
}

/// Convenience macro for creating precondition errors
///
/// Usage: `precondition_error!("stage {} is not active", stage.name)`
#[macro_export]
macro_rules! precondition_error {
    ($($arg:tt)*) => {
        $crate::core::error::ReleaseError::precondition(format!($($arg)*))
    };
}
