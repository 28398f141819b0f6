//! # Local Node
//!
//! Builds this node's own record and watches for serial adapter changes.
//!
//! ## Change Detection
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  /dev/serial/by-id ──► scan every poll_interval ──► diff with previous  │
//! │                                                       │                 │
//! │                         ┌─────────────────────────────┘                 │
//! │                         ▼                                               │
//! │                 DeviceEvent { add | remove, device }                    │
//! │                         │                                               │
//! │                         ▼                                               │
//! │                 ChangeCoordinator::on_change                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use consolenet_core::{InterfaceInfo, NodeRecord, RecordSource};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::SyncResult;

// =============================================================================
// Device Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Add,
    Remove,
}

impl std::fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceAction::Add => write!(f, "add"),
            DeviceAction::Remove => write!(f, "remove"),
        }
    }
}

/// One hardware change. Only the fact of the change matters downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub action: DeviceAction,
    pub device: String,
}

impl DeviceEvent {
    pub fn new(action: DeviceAction, device: impl Into<String>) -> Self {
        DeviceEvent {
            action,
            device: device.into(),
        }
    }
}

// =============================================================================
// Local Node Source
// =============================================================================

/// Produces the local node's current record.
#[async_trait]
pub trait LocalNode: Send + Sync {
    async fn local_record(&self) -> SyncResult<NodeRecord>;
}

/// Local record from the serial-by-id directory and configured interfaces.
#[derive(Debug, Clone)]
pub struct DevfsLocalNode {
    node_id: String,
    serial_dir: PathBuf,
    interfaces: BTreeMap<String, InterfaceInfo>,
}

impl DevfsLocalNode {
    pub fn new(
        node_id: impl Into<String>,
        serial_dir: impl Into<PathBuf>,
        interfaces: BTreeMap<String, InterfaceInfo>,
    ) -> Self {
        DevfsLocalNode {
            node_id: node_id.into(),
            serial_dir: serial_dir.into(),
            interfaces,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.node_id(),
            config.node.serial_dir.clone(),
            config.node.interfaces.clone(),
        )
    }
}

#[async_trait]
impl LocalNode for DevfsLocalNode {
    async fn local_record(&self) -> SyncResult<NodeRecord> {
        let mut record = NodeRecord::new(self.node_id.clone(), RecordSource::Manual);
        record.interfaces = self.interfaces.clone();

        for name in scan_dir(&self.serial_dir).await? {
            let link = self.serial_dir.join(&name);
            let target = tokio::fs::canonicalize(&link).await.unwrap_or_else(|_| link.clone());
            record.adapters.insert(
                name,
                json!({
                    "path": link.to_string_lossy(),
                    "dev": target.to_string_lossy(),
                }),
            );
        }

        Ok(record)
    }
}

/// Entry names in `dir`. A missing directory means no adapters attached.
pub async fn scan_dir(dir: &Path) -> SyncResult<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        names.insert(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Events turning `previous` into `current`.
pub fn diff(previous: &BTreeSet<String>, current: &BTreeSet<String>) -> Vec<DeviceEvent> {
    let removed = previous
        .difference(current)
        .map(|d| DeviceEvent::new(DeviceAction::Remove, d.clone()));
    let added = current
        .difference(previous)
        .map(|d| DeviceEvent::new(DeviceAction::Add, d.clone()));
    removed.chain(added).collect()
}

// =============================================================================
// Device Watcher
// =============================================================================

/// Polls the serial directory and emits a [`DeviceEvent`] per change.
#[derive(Debug, Clone)]
pub struct DeviceWatcher {
    dir: PathBuf,
    interval: Duration,
}

impl DeviceWatcher {
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Self {
        DeviceWatcher {
            dir: dir.into(),
            interval,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.node.serial_dir.clone(), config.poll_interval())
    }

    /// Runs until shutdown or until the receiving side is dropped.
    pub async fn run(self, events: mpsc::Sender<DeviceEvent>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut known = scan_dir(&self.dir).await.unwrap_or_default();
        info!(dir = ?self.dir, devices = known.len(), "Device watcher started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = match scan_dir(&self.dir).await {
                        Ok(current) => current,
                        Err(e) => {
                            warn!(dir = ?self.dir, error = %e, "Device scan failed");
                            continue;
                        }
                    };
                    for event in diff(&known, &current) {
                        debug!(action = %event.action, device = %event.device, "Device change detected");
                        if events.send(event).await.is_err() {
                            debug!("Device event receiver closed");
                            return;
                        }
                    }
                    known = current;
                }
                _ = shutdown_rx.recv() => {
                    info!("Device watcher received shutdown");
                    break;
                }
            }
        }
    }
}
