//! # Advertisement Builder
//!
//! Renders the local node's record into a bounded-size announcement for the
//! discovery transport.
//!
//! ## Degradation Tiers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Payload Tiers                                      │
//! │                                                                         │
//! │  Tier 0  Full ───────────────► hostname, adapters, interfaces           │
//! │     │ too large                                                         │
//! │     ▼                                                                   │
//! │  Tier 1  NoAdapters ─────────► hostname, interfaces                     │
//! │     │ too large                                                         │
//! │     ▼                                                                   │
//! │  Tier 2  RoutableInterfaces ─► hostname, interfaces without a           │
//! │     │ too large                 virtual/bridge marker in their name     │
//! │     ▼                                                                   │
//! │  PayloadTooLarge (caller logs and skips this cycle)                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Size Model
//! Properties travel as DNS TXT strings: each `key=value` entry carries a
//! one-byte length prefix, so a single entry can never exceed 255 bytes and
//! the whole record must fit the transport's packet budget.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::types::NodeRecord;

/// Hard ceiling for a single TXT string.
pub const TXT_ENTRY_MAX: usize = 255;

/// Default budget for the complete TXT record.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 1300;

/// Interface-name fragments identifying virtual, bridge and VLAN links.
pub const DEFAULT_VIRTUAL_MARKERS: &[&str] = &[".", "br-", "virbr", "docker", "veth", "tun", "tap"];

pub const PROP_HOSTNAME: &str = "hostname";
pub const PROP_ADAPTERS: &str = "adapters";
pub const PROP_INTERFACES: &str = "interfaces";

// =============================================================================
// Payload Tier
// =============================================================================

/// How much of the local record an announcement carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PayloadTier {
    /// Adapters and every interface.
    Full,
    /// Every interface, no adapters.
    NoAdapters,
    /// Only interfaces likely to carry a routable address.
    RoutableInterfaces,
}

impl PayloadTier {
    /// The next, smaller tier.
    pub fn next(self) -> Option<PayloadTier> {
        match self {
            PayloadTier::Full => Some(PayloadTier::NoAdapters),
            PayloadTier::NoAdapters => Some(PayloadTier::RoutableInterfaces),
            PayloadTier::RoutableInterfaces => None,
        }
    }
}

impl std::fmt::Display for PayloadTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadTier::Full => write!(f, "full"),
            PayloadTier::NoAdapters => write!(f, "no-adapters"),
            PayloadTier::RoutableInterfaces => write!(f, "routable-interfaces"),
        }
    }
}

// =============================================================================
// Limits & Payload
// =============================================================================

/// Size budget enforced on announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLimits {
    /// Largest single `key=value` entry, in bytes.
    pub max_entry_len: usize,
    /// Largest encoded TXT record, in bytes.
    pub max_total_len: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        PayloadLimits {
            max_entry_len: TXT_ENTRY_MAX,
            max_total_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

/// A rendered announcement, ready for the discovery transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncementPayload {
    /// Instance name to register under.
    pub node_id: String,
    /// Address to announce (routable interface or loopback).
    pub address: String,
    /// Tier this payload was rendered at.
    pub tier: PayloadTier,
    /// TXT properties.
    pub properties: BTreeMap<String, String>,
}

impl AnnouncementPayload {
    /// Encoded TXT record size: a length byte plus `key=value` per entry.
    pub fn encoded_len(&self) -> usize {
        self.properties
            .iter()
            .map(|(k, v)| 1 + entry_len(k, v))
            .sum()
    }

    /// Length of the largest `key=value` entry.
    pub fn largest_entry_len(&self) -> usize {
        self.properties
            .iter()
            .map(|(k, v)| entry_len(k, v))
            .max()
            .unwrap_or(0)
    }

    /// Fails with `PayloadTooLarge` when either limit is exceeded.
    pub fn check(&self, limits: &PayloadLimits) -> CoreResult<()> {
        let largest = self.largest_entry_len();
        if largest > limits.max_entry_len {
            return Err(CoreError::PayloadTooLarge {
                tier: self.tier,
                size: largest,
                limit: limits.max_entry_len,
            });
        }
        let total = self.encoded_len();
        if total > limits.max_total_len {
            return Err(CoreError::PayloadTooLarge {
                tier: self.tier,
                size: total,
                limit: limits.max_total_len,
            });
        }
        Ok(())
    }
}

fn entry_len(key: &str, value: &str) -> usize {
    key.len() + 1 + value.len()
}

// =============================================================================
// Builder
// =============================================================================

/// Renders local records into announcements that fit a size budget.
#[derive(Debug, Clone)]
pub struct AdvertisementBuilder {
    limits: PayloadLimits,
    virtual_markers: Vec<String>,
}

impl Default for AdvertisementBuilder {
    fn default() -> Self {
        Self::new(PayloadLimits::default())
    }
}

impl AdvertisementBuilder {
    pub fn new(limits: PayloadLimits) -> Self {
        AdvertisementBuilder {
            limits,
            virtual_markers: DEFAULT_VIRTUAL_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }

    /// Replaces the interface-name fragments used by the last tier.
    pub fn with_virtual_markers(mut self, markers: Vec<String>) -> Self {
        self.virtual_markers = markers;
        self
    }

    pub fn limits(&self) -> &PayloadLimits {
        &self.limits
    }

    /// Returns true when `name` looks like a virtual, bridge or VLAN link.
    pub fn is_virtual_interface(&self, name: &str) -> bool {
        self.virtual_markers.iter().any(|m| name.contains(m.as_str()))
    }

    /// Renders the first tier that fits the budget.
    pub fn build(&self, record: &NodeRecord) -> CoreResult<AnnouncementPayload> {
        self.build_from(record, PayloadTier::Full)
    }

    /// Renders the first tier at or below `start` that fits the budget.
    ///
    /// Used to resume after the transport itself rejected a payload.
    pub fn build_from(
        &self,
        record: &NodeRecord,
        start: PayloadTier,
    ) -> CoreResult<AnnouncementPayload> {
        let mut tier = start;
        loop {
            let payload = self.render(record, tier)?;
            match payload.check(&self.limits) {
                Ok(()) => return Ok(payload),
                Err(e) => match tier.next() {
                    Some(next) => {
                        if next == PayloadTier::RoutableInterfaces {
                            warn!(
                                node_id = %record.node_id,
                                size = payload.encoded_len(),
                                "Announcement still too large, reducing interface payload"
                            );
                        } else {
                            debug!(
                                node_id = %record.node_id,
                                %tier,
                                size = payload.encoded_len(),
                                "Announcement too large, removing adapter data"
                            );
                        }
                        tier = next;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    /// Renders `record` at exactly `tier`, without checking the budget.
    pub fn render(&self, record: &NodeRecord, tier: PayloadTier) -> CoreResult<AnnouncementPayload> {
        let mut local = record.clone();
        local.strip_volatile_adapter_keys();

        let mut properties = BTreeMap::new();
        properties.insert(PROP_HOSTNAME.to_string(), local.node_id.clone());

        if tier == PayloadTier::Full {
            properties.insert(PROP_ADAPTERS.to_string(), encode(PROP_ADAPTERS, &local.adapters)?);
        }

        let interfaces = if tier == PayloadTier::RoutableInterfaces {
            local
                .interfaces
                .iter()
                .filter(|(name, _)| !self.is_virtual_interface(name))
                .map(|(name, info)| (name.clone(), info.clone()))
                .collect()
        } else {
            local.interfaces.clone()
        };
        properties.insert(PROP_INTERFACES.to_string(), encode(PROP_INTERFACES, &interfaces)?);

        Ok(AnnouncementPayload {
            node_id: local.node_id.clone(),
            address: local.advertised_address().to_string(),
            tier,
            properties,
        })
    }
}

/// Compact JSON encoding of one property.
fn encode<T: serde::Serialize>(field: &str, value: &T) -> CoreResult<String> {
    serde_json::to_string(value).map_err(|e| CoreError::Encoding {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
