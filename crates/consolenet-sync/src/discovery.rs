//! # Discovery Module
//!
//! Announces the local node on the LAN and keeps the announcement current.
//!
//! ## Refresh Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Advertiser (advertise task body)                   │
//! │                                                                         │
//! │  agent start ──► register(payload)                                     │
//! │                                                                         │
//! │  debounced change:                                                     │
//! │    1. update(payload)        (tier fallback on size rejection)         │
//! │    2. unregister()                                                     │
//! │    3. wait reregister_gap    (default 5s)                              │
//! │    4. register(payload)      same payload accepted in step 1           │
//! │                                                                         │
//! │  agent shutdown ──► unregister()                                       │
//! │                                                                         │
//! │  Size rejection at the last tier: warn, skip the cycle, the next       │
//! │  debounced change tries again.                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//! - mDNS service type: `_consolepi._tcp.local.`
//! - Announced port: 5000 (configurable)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use consolenet_core::{AdvertisementBuilder, AnnouncementPayload, NodeRecord, PayloadTier};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::coordinator::TaskBody;
use crate::error::{SyncError, SyncResult};
use crate::local::LocalNode;

// =============================================================================
// Discovery Collaborator
// =============================================================================

/// Register/unregister/update primitives of a service-discovery transport.
///
/// Implementations reject payloads they cannot carry with
/// [`SyncError::PayloadTooLarge`].
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn register(&self, payload: &AnnouncementPayload) -> SyncResult<()>;

    /// Replaces the registered announcement.
    async fn update(&self, payload: &AnnouncementPayload) -> SyncResult<()>;

    /// Withdraws the announcement. A no-op when nothing is registered.
    async fn unregister(&self) -> SyncResult<()>;
}

// =============================================================================
// mDNS Transport
// =============================================================================

/// [`Discovery`] over multicast DNS.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    service_type: String,
    port: u16,
    max_entry_len: usize,
    registered: Mutex<Option<String>>,
}

impl MdnsDiscovery {
    pub fn new(service_type: impl Into<String>, port: u16, max_entry_len: usize) -> SyncResult<Self> {
        Ok(MdnsDiscovery {
            daemon: ServiceDaemon::new()?,
            service_type: service_type.into(),
            port,
            max_entry_len,
            registered: Mutex::new(None),
        })
    }

    pub fn from_config(config: &AgentConfig) -> SyncResult<Self> {
        Self::new(
            config.discovery.service_type.clone(),
            config.discovery.port,
            config.discovery.max_entry_len,
        )
    }

    /// TXT strings carry a one-byte length, so every `key=value` must fit.
    fn check_entries(&self, payload: &AnnouncementPayload) -> SyncResult<()> {
        let largest = payload.largest_entry_len();
        if largest > self.max_entry_len {
            return Err(SyncError::PayloadTooLarge {
                size: largest,
                limit: self.max_entry_len,
            });
        }
        Ok(())
    }

    fn service_info(&self, payload: &AnnouncementPayload) -> SyncResult<ServiceInfo> {
        let properties: HashMap<String, String> = payload.properties.clone().into_iter().collect();
        let info = ServiceInfo::new(
            &self.service_type,
            &payload.node_id,
            &format!("{}.local.", payload.node_id),
            payload.address.as_str(),
            self.port,
            properties,
        )?;
        Ok(info)
    }

    fn publish(&self, payload: &AnnouncementPayload) -> SyncResult<()> {
        self.check_entries(payload)?;
        let info = self.service_info(payload)?;
        let fullname = info.get_fullname().to_string();
        self.daemon.register(info)?;
        *self.registered_slot()? = Some(fullname);
        Ok(())
    }

    fn registered_slot(&self) -> SyncResult<std::sync::MutexGuard<'_, Option<String>>> {
        self.registered
            .lock()
            .map_err(|_| SyncError::Internal("registration state poisoned".into()))
    }
}

#[async_trait]
impl Discovery for MdnsDiscovery {
    async fn register(&self, payload: &AnnouncementPayload) -> SyncResult<()> {
        self.publish(payload)?;
        info!(
            node_id = %payload.node_id,
            address = %payload.address,
            port = self.port,
            tier = %payload.tier,
            "mDNS service registered"
        );
        Ok(())
    }

    async fn update(&self, payload: &AnnouncementPayload) -> SyncResult<()> {
        if self.registered_slot()?.is_none() {
            return Err(SyncError::NotRegistered);
        }
        // Registering the same full name again replaces the records.
        self.publish(payload)?;
        debug!(node_id = %payload.node_id, tier = %payload.tier, "mDNS service updated");
        Ok(())
    }

    async fn unregister(&self) -> SyncResult<()> {
        let Some(fullname) = self.registered_slot()?.take() else {
            return Ok(());
        };
        self.daemon.unregister(&fullname)?;
        info!(service = %fullname, "mDNS service unregistered");
        Ok(())
    }
}

// =============================================================================
// Advertiser
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Offer {
    Register,
    Update,
}

/// Keeps the local announcement in step with local hardware.
pub struct Advertiser {
    discovery: Arc<dyn Discovery>,
    local: Arc<dyn LocalNode>,
    builder: AdvertisementBuilder,
    reregister_gap: Duration,
}

impl Advertiser {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        local: Arc<dyn LocalNode>,
        builder: AdvertisementBuilder,
        reregister_gap: Duration,
    ) -> Self {
        Advertiser {
            discovery,
            local,
            builder,
            reregister_gap,
        }
    }

    /// First registration at agent start.
    pub async fn publish_initial(&self) -> SyncResult<AnnouncementPayload> {
        let record = self.local.local_record().await?;
        self.offer(&record, Offer::Register).await
    }

    /// Update, unregister, wait, register again with the accepted payload.
    pub async fn refresh(&self) -> SyncResult<AnnouncementPayload> {
        let record = self.local.local_record().await?;

        let payload = match self.offer(&record, Offer::Update).await {
            Ok(payload) => payload,
            Err(SyncError::NotRegistered) => {
                debug!(node_id = %record.node_id, "Nothing registered yet, registering");
                return self.offer(&record, Offer::Register).await;
            }
            Err(e) => return Err(e),
        };

        self.discovery.unregister().await?;
        tokio::time::sleep(self.reregister_gap).await;
        self.discovery.register(&payload).await?;

        info!(node_id = %payload.node_id, tier = %payload.tier, "Announcement refreshed");
        Ok(payload)
    }

    /// Withdraws the announcement at shutdown.
    pub async fn withdraw(&self) -> SyncResult<()> {
        self.discovery.unregister().await
    }

    /// Offers the payload, stepping down a tier each time the transport
    /// rejects it for size.
    async fn offer(&self, record: &NodeRecord, offer: Offer) -> SyncResult<AnnouncementPayload> {
        let mut start = PayloadTier::Full;
        loop {
            let payload = self.builder.build_from(record, start)?;
            let result = match offer {
                Offer::Register => self.discovery.register(&payload).await,
                Offer::Update => self.discovery.update(&payload).await,
            };
            match result {
                Ok(()) => return Ok(payload),
                Err(e) if e.is_size_exceeded() => match payload.tier.next() {
                    Some(next) => {
                        debug!(tier = %payload.tier, %next, "Transport rejected payload size, stepping down");
                        start = next;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl TaskBody for Advertiser {
    async fn run(&self) -> SyncResult<()> {
        match self.refresh().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_size_exceeded() => {
                warn!(error = %e, "Announcement does not fit at any tier, skipping this cycle");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
