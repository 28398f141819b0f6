//! # Console Agent
//!
//! Main orchestrator: wires the registry, the coordinator and every
//! collaborator together for the lifetime of the daemon.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          ConsoleAgent                                   │
//! │                                                                         │
//! │  start()                                                               │
//! │   1. RegistryStore::load                                               │
//! │   2. Advertiser::publish_initial      (discovery enabled)              │
//! │   3. wire Advertise + CloudSync kinds on the ChangeCoordinator         │
//! │   4. trigger CloudSync                 (cloud enabled, sync_on_start)  │
//! │   5. spawn coordinator loop + DeviceWatcher                            │
//! │                                                                         │
//! │  DeviceWatcher ──► events ──► ChangeCoordinator ──► Advertiser         │
//! │                                               └───► CloudSync          │
//! │                                                        └─► persist     │
//! │                                                                         │
//! │  shutdown()                                                            │
//! │   stop loops, close the coordinator (pending tasks skip their body,    │
//! │   running ones finish), unregister the announcement                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use consolenet_core::{AdvertisementBuilder, RegistryDirectory};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cloud::{CloudDirectory, CloudSync, FileBlobCloud};
use crate::config::AgentConfig;
use crate::coordinator::{ChangeCoordinator, TaskKind, TaskState};
use crate::discovery::{Advertiser, Discovery, MdnsDiscovery};
use crate::error::{SyncError, SyncResult};
use crate::local::{DevfsLocalNode, DeviceEvent, DeviceWatcher, LocalNode};
use crate::store::RegistryStore;

const EVENT_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Agent Status
// =============================================================================

/// Snapshot of the running agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
    pub node_id: String,
    pub advertise: TaskState,
    pub cloud_sync: TaskState,
    pub known_nodes: usize,
}

// =============================================================================
// Console Agent
// =============================================================================

pub struct ConsoleAgent {
    config: Arc<AgentConfig>,
    store: Arc<RegistryStore>,
    local: Arc<dyn LocalNode>,
    discovery: Option<Arc<dyn Discovery>>,
    cloud: Option<Arc<dyn CloudDirectory>>,
    watch_devices: bool,

    advertiser: Option<Arc<Advertiser>>,
    coordinator: Option<ChangeCoordinator>,
    shutdown_txs: Vec<mpsc::Sender<()>>,
}

impl ConsoleAgent {
    /// Agent with the production collaborators selected by `config`.
    pub fn from_config(config: AgentConfig) -> SyncResult<Self> {
        let mut builder = ConsoleAgentBuilder::new(config.clone())
            .local_node(Arc::new(DevfsLocalNode::from_config(&config)));

        if config.discovery.enabled {
            builder = builder.discovery(Arc::new(MdnsDiscovery::from_config(&config)?));
        }

        if config.cloud.enabled {
            let blob = config.cloud.blob_path.clone().ok_or_else(|| {
                SyncError::InvalidConfig("cloud.blob_path is required when cloud sync is enabled".into())
            })?;
            builder = builder.cloud(Arc::new(FileBlobCloud::new(blob)));
        }

        builder.build()
    }

    pub fn builder(config: AgentConfig) -> ConsoleAgentBuilder {
        ConsoleAgentBuilder::new(config)
    }

    pub fn store(&self) -> Arc<RegistryStore> {
        self.store.clone()
    }

    /// Loads the registry, publishes the announcement and spawns the loops.
    pub async fn start(&mut self) -> SyncResult<AgentHandle> {
        self.config.validate()?;
        info!(
            node_id = %self.config.node_id(),
            discovery = self.discovery.is_some(),
            cloud = self.cloud.is_some(),
            "Starting console agent"
        );

        self.store.load().await;

        let mut coordinator = ChangeCoordinator::new();

        if let Some(discovery) = &self.discovery {
            let builder = AdvertisementBuilder::new(self.config.payload_limits())
                .with_virtual_markers(self.config.discovery.virtual_markers.clone());
            let advertiser = Arc::new(Advertiser::new(
                discovery.clone(),
                self.local.clone(),
                builder,
                self.config.reregister_gap(),
            ));

            match advertiser.publish_initial().await {
                Ok(payload) => debug!(tier = %payload.tier, "Initial announcement published"),
                Err(e) if e.is_size_exceeded() => {
                    warn!(error = %e, "Initial announcement does not fit at any tier")
                }
                Err(e) => warn!(error = %e, "Initial announcement failed, next change retries"),
            }

            coordinator = coordinator.with_task(
                TaskKind::Advertise,
                self.config.advertise_delay(),
                self.config.advertise_timeout(),
                advertiser.clone(),
            );
            self.advertiser = Some(advertiser);
        }

        if let Some(cloud) = &self.cloud {
            let sync = Arc::new(CloudSync::new(cloud.clone(), self.local.clone(), self.store.clone()));
            coordinator = coordinator.with_task(
                TaskKind::CloudSync,
                self.config.cloud_delay(),
                self.config.cloud_timeout(),
                sync,
            );
            if self.config.cloud.sync_on_start {
                coordinator.trigger(TaskKind::CloudSync);
            }
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let (coordinator_shutdown_tx, coordinator_shutdown_rx) = mpsc::channel(1);
        self.shutdown_txs.push(coordinator_shutdown_tx);
        tokio::spawn(coordinator.clone().run(events_rx, coordinator_shutdown_rx));

        if self.watch_devices {
            let (watcher_shutdown_tx, watcher_shutdown_rx) = mpsc::channel(1);
            self.shutdown_txs.push(watcher_shutdown_tx);
            let watcher = DeviceWatcher::from_config(&self.config);
            tokio::spawn(watcher.run(events_tx.clone(), watcher_shutdown_rx));
        }

        self.coordinator = Some(coordinator.clone());
        info!("Console agent started");
        Ok(AgentHandle {
            node_id: self.config.node_id().to_string(),
            events_tx,
            coordinator,
            store: self.store.clone(),
        })
    }

    /// Stops the loops and withdraws the announcement.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        info!("Shutting down console agent");

        for tx in self.shutdown_txs.drain(..) {
            let _ = tx.send(()).await;
        }

        // Nothing may re-announce or persist once the announcement is withdrawn.
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.close().await;
        }

        if let Some(advertiser) = self.advertiser.take() {
            if let Err(e) = advertiser.withdraw().await {
                warn!(error = %e, "Failed to unregister announcement");
            }
        }

        info!("Console agent stopped");
        Ok(())
    }
}

// =============================================================================
// Agent Handle
// =============================================================================

/// Handle for a running agent: feed events, read status and the directory.
#[derive(Clone)]
pub struct AgentHandle {
    node_id: String,
    events_tx: mpsc::Sender<DeviceEvent>,
    coordinator: ChangeCoordinator,
    store: Arc<RegistryStore>,
}

impl AgentHandle {
    /// Injects a hardware-change event, as the device watcher does.
    pub async fn notify(&self, event: DeviceEvent) -> SyncResult<()> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }

    pub fn coordinator(&self) -> &ChangeCoordinator {
        &self.coordinator
    }

    /// Snapshot of the merged directory.
    pub async fn directory(&self) -> RegistryDirectory {
        self.store.get().await
    }

    pub async fn status(&self) -> AgentStatus {
        AgentStatus {
            node_id: self.node_id.clone(),
            advertise: self.coordinator.state(TaskKind::Advertise),
            cloud_sync: self.coordinator.state(TaskKind::CloudSync),
            known_nodes: self.store.get().await.len(),
        }
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for a [`ConsoleAgent`] with injected collaborators.
pub struct ConsoleAgentBuilder {
    config: AgentConfig,
    store: Option<Arc<RegistryStore>>,
    local: Option<Arc<dyn LocalNode>>,
    discovery: Option<Arc<dyn Discovery>>,
    cloud: Option<Arc<dyn CloudDirectory>>,
    watch_devices: bool,
}

impl ConsoleAgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        ConsoleAgentBuilder {
            config,
            store: None,
            local: None,
            discovery: None,
            cloud: None,
            watch_devices: true,
        }
    }

    pub fn store(mut self, store: Arc<RegistryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn local_node(mut self, local: Arc<dyn LocalNode>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn cloud(mut self, cloud: Arc<dyn CloudDirectory>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Disables the polling device watcher; events then come only through
    /// [`AgentHandle::notify`].
    pub fn without_device_watcher(mut self) -> Self {
        self.watch_devices = false;
        self
    }

    pub fn build(self) -> SyncResult<ConsoleAgent> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(RegistryStore::from_settings(&self.config.registry)));
        let local = self.local.unwrap_or_else(|| {
            Arc::new(DevfsLocalNode::from_config(&self.config)) as Arc<dyn LocalNode>
        });

        Ok(ConsoleAgent {
            config: Arc::new(self.config),
            store,
            local,
            discovery: self.discovery,
            cloud: self.cloud,
            watch_devices: self.watch_devices,
            advertiser: None,
            coordinator: None,
            shutdown_txs: Vec::new(),
        })
    }
}
