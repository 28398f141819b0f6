//! # Error Types
//!
//! Domain-specific error types for consolenet-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  consolenet-core errors (this file)                                    │
//! │  └── CoreError        - Payload budget and record invariants           │
//! │                                                                         │
//! │  consolenet-sync errors (separate crate)                               │
//! │  └── SyncError        - Config, file, discovery and cloud failures     │
//! │                                                                         │
//! │  Flow: CoreError → SyncError → logged by the task that hit it          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::advertisement::PayloadTier;

// =============================================================================
// Core Error
// =============================================================================

/// Errors produced by the pure registry logic.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The announcement does not fit the size budget even at the last tier.
    ///
    /// ## When This Occurs
    /// - A node has so many interfaces that even the routable subset is
    ///   larger than the discovery transport accepts
    /// - A single TXT entry (e.g. `interfaces=...`) exceeds the entry limit
    #[error("Announcement payload too large at tier {tier}: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge {
        tier: PayloadTier,
        size: usize,
        limit: usize,
    },

    /// Failed to serialize a record field into the announcement.
    #[error("Failed to encode announcement field '{field}': {reason}")]
    Encoding { field: String, reason: String },

    /// A directory or record broke one of its structural invariants.
    #[error("Registry invariant violated: {0}")]
    InvariantViolation(String),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
