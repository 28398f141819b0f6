//! # consolenet-sync: Runtime Layer for ConsoleNet
//!
//! Everything that touches the network, the filesystem or the clock: the
//! persisted registry, the debounced task coordinator and the collaborator
//! adapters.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Console Agent Architecture                       │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 ConsoleAgent (Main Orchestrator)                 │  │
//! │  │                                                                  │  │
//! │  │  Spawned by consolenet-agent, owns every background task         │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ DeviceWatcher  │  │ Change         │  │  RegistryStore         │    │
//! │  │                │  │ Coordinator    │  │                        │    │
//! │  │ Polls serial   │─►│ Debounce +     │  │ Cached directory,      │    │
//! │  │ by-id dir      │  │ one in-flight  │  │ atomic persist         │    │
//! │  │                │  │ task per kind  │  │                        │    │
//! │  └────────────────┘  └───────┬────────┘  └───────────▲────────────┘    │
//! │                              │                       │                  │
//! │               ┌──────────────┴─────────┐             │                  │
//! │               ▼                        ▼             │                  │
//! │  ┌────────────────────────┐  ┌────────────────────────┴───┐            │
//! │  │ Advertiser             │  │ CloudSync                  │            │
//! │  │ update/unregister/     │  │ push, pull, merge, persist │            │
//! │  │ register via Discovery │  │ via CloudDirectory         │            │
//! │  └────────────────────────┘  └────────────────────────────┘            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - `ConsoleAgent` orchestrator and its handle
//! - [`config`] - Agent configuration (TOML + environment)
//! - [`coordinator`] - Debounced, deduplicated task scheduling
//! - [`store`] - Persisted registry directory
//! - [`discovery`] - `Discovery` trait, mDNS adapter, `Advertiser`
//! - [`cloud`] - `CloudDirectory` trait, shared-file backend, `CloudSync`
//! - [`local`] - Local record source and device watcher
//! - [`error`] - Runtime error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use consolenet_sync::{AgentConfig, ConsoleAgent};
//!
//! let config = AgentConfig::load(None)?;
//! let mut agent = ConsoleAgent::from_config(config)?;
//! let handle = agent.start().await?;
//!
//! let status = handle.status().await;
//! println!("{} knows {} nodes", status.node_id, status.known_nodes);
//!
//! agent.shutdown().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod cloud;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod local;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{AgentHandle, AgentStatus, ConsoleAgent, ConsoleAgentBuilder};
pub use cloud::{CloudDirectory, CloudSync, CycleReport, FileBlobCloud};
pub use config::AgentConfig;
pub use coordinator::{ChangeCoordinator, TaskBody, TaskKind, TaskState};
pub use discovery::{Advertiser, Discovery, MdnsDiscovery};
pub use error::{SyncError, SyncResult};
pub use local::{DevfsLocalNode, DeviceAction, DeviceEvent, DeviceWatcher, LocalNode};
pub use store::RegistryStore;
