//! # Sync Error Types
//!
//! Error types for the runtime layer.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Registry      │  │     Discovery           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Io             │  │  DiscoveryFailed        │ │
//! │  │  MissingNodeId  │  │  Serialization  │  │  PayloadTooLarge        │ │
//! │  │  ConfigLoad/Save│  │  Permissions    │  │  NotRegistered          │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │     Cloud       │  │    Internal     │                              │
//! │  │                 │  │                 │                              │
//! │  │  CloudFailed    │  │  Timeout        │                              │
//! │  │                 │  │  ShuttingDown   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use consolenet_core::CoreError;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Runtime error type covering every collaborator failure.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid agent configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No node id configured and the hostname could not be read.
    #[error("Node ID not configured and hostname unavailable")]
    MissingNodeId,

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Registry File Errors
    // =========================================================================
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to encode or decode JSON.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to set ownership or mode on a written file.
    #[error("Failed to set permissions on {path}: {reason}")]
    PermissionsFailed { path: String, reason: String },

    // =========================================================================
    // Discovery Errors
    // =========================================================================
    /// The discovery transport refused the operation.
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The announcement does not fit the transport's size budget.
    #[error("Announcement too large: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Update or unregister called before a successful register.
    #[error("No service registered")]
    NotRegistered,

    // =========================================================================
    // Cloud Errors
    // =========================================================================
    /// Push or pull against the shared directory failed.
    #[error("Cloud directory error: {0}")]
    CloudFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// A task body ran past its deadline.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Agent is shutting down.
    #[error("Agent is shutting down")]
    ShuttingDown,

    /// Invariant or logic failure inside the runtime.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<mdns_sd::Error> for SyncError {
    fn from(err: mdns_sd::Error) -> Self {
        SyncError::DiscoveryFailed(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::PayloadTooLarge { size, limit, .. } => SyncError::PayloadTooLarge { size, limit },
            CoreError::Encoding { .. } => SyncError::SerializationFailed(err.to_string()),
            CoreError::InvariantViolation(msg) => SyncError::Internal(msg),
        }
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the next debounced cycle may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Io(_)
                | SyncError::DiscoveryFailed(_)
                | SyncError::CloudFailed(_)
                | SyncError::Timeout(_)
                | SyncError::NotRegistered
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingNodeId
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if the payload was rejected for size.
    pub fn is_size_exceeded(&self) -> bool {
        matches!(self, SyncError::PayloadTooLarge { .. })
    }
}
