//! # consolenet-core: Pure Registry Logic for ConsoleNet
//!
//! This crate holds the part of ConsoleNet that decides *what* the fleet
//! directory looks like. Everything here is deterministic and free of I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        ConsoleNet Architecture                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 consolenet-agent (binary)                       │   │
//! │  │      config load ──► wiring ──► signal handling ──► remotes     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    consolenet-sync                              │   │
//! │  │   RegistryStore, ChangeCoordinator, mDNS + cloud adapters       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │            ★ consolenet-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌────────────┐   ┌────────────┐   ┌──────────────────────┐   │   │
//! │  │   │   types    │   │ reconcile  │   │    advertisement     │   │   │
//! │  │   │ NodeRecord │   │   merge    │   │ AdvertisementBuilder │   │   │
//! │  │   │ Directory  │   │ Resolution │   │ PayloadTier          │   │   │
//! │  │   └────────────┘   └────────────┘   └──────────────────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO FILESYSTEM • PURE FUNCTIONS          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - `NodeRecord`, `RegistryDirectory` and friends
//! - [`reconcile`] - The merge rules applied each reconciliation cycle
//! - [`advertisement`] - Bounded-size announcement rendering
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use consolenet_core::{merge, NodeRecord, PeerBatch, RecordSource, RegistryDirectory};
//!
//! let mut cache = RegistryDirectory::new();
//! cache.insert(NodeRecord::new("lab-a", RecordSource::Mdns).with_remote_ip("10.0.0.5"));
//!
//! let mut batch = PeerBatch::new();
//! batch.insert("lab-a".into(), NodeRecord::new("lab-a", RecordSource::Cloud));
//!
//! let merged = merge(&batch, &cache);
//! let a = merged.get("lab-a").unwrap();
//! assert_eq!(a.remote_ip.as_deref(), Some("10.0.0.5"));
//! assert_eq!(a.source, RecordSource::Cloud);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod advertisement;
pub mod error;
pub mod reconcile;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use advertisement::{AdvertisementBuilder, AnnouncementPayload, PayloadLimits, PayloadTier};
pub use error::{CoreError, CoreResult};
pub use reconcile::{merge, merge_with_report, Resolution, FAIL_THRESHOLD};
pub use types::*;
