//! # Registry Types
//!
//! Domain types shared by every ConsoleNet component.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Registry Types                                  │
//! │                                                                         │
//! │  ┌──────────────────────────┐      ┌─────────────────────────────────┐ │
//! │  │    RegistryDirectory     │      │          NodeRecord             │ │
//! │  │  ──────────────────────  │ 1..n │  ─────────────────────────────  │ │
//! │  │  node_id -> NodeRecord   │─────▶│  node_id     (hostname)         │ │
//! │  │  (sorted, persisted)     │      │  adapters    (opaque map)       │ │
//! │  └──────────────────────────┘      │  interfaces  (name -> addr)     │ │
//! │                                    │  remote_ip   (reachability)     │ │
//! │  ┌──────────────────────────┐      │  source      (mdns|cloud|...)   │ │
//! │  │      RecordSource        │◀─────│  update_time (epoch, optional)  │ │
//! │  │  Mdns | Cloud | Manual   │      │  fail_count  (missed cycles)    │ │
//! │  └──────────────────────────┘      └─────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Compatibility
//! The persisted cache historically used `rem_ip`, `upd_time` and `fail_cnt`.
//! Those names are accepted as aliases when reading; writes always use the
//! current field names.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Adapter descriptor keys that only make sense on the node that owns the
/// adapter and are stripped before a record leaves the node.
pub const VOLATILE_ADAPTER_KEYS: &[&str] = &["udev"];

/// Address advertised when no interface is marked routable.
pub const LOOPBACK_ADDRESS: &str = "127.0.0.1";

// =============================================================================
// Record Source
// =============================================================================

/// Provenance of the most recent write to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    /// Learned from a multicast announcement on the local network.
    Mdns,
    /// Learned from the shared cloud directory blob.
    Cloud,
    /// Entered by an operator.
    Manual,
}

impl RecordSource {
    /// Returns true for records learned directly over multicast.
    pub fn is_mdns(&self) -> bool {
        matches!(self, RecordSource::Mdns)
    }
}

impl std::fmt::Display for RecordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordSource::Mdns => write!(f, "mdns"),
            RecordSource::Cloud => write!(f, "cloud"),
            RecordSource::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for RecordSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mdns" => Ok(RecordSource::Mdns),
            "cloud" => Ok(RecordSource::Cloud),
            "manual" => Ok(RecordSource::Manual),
            other => Err(CoreError::InvariantViolation(format!(
                "Unknown record source: '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// Interface Info
// =============================================================================

/// Address information for one network interface of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// IPv4 address assigned to the interface.
    pub ip: String,

    /// Link-layer (MAC) address.
    #[serde(default)]
    pub mac: String,

    /// Marks the interface carrying the default route.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub routable: bool,
}

impl InterfaceInfo {
    pub fn new(ip: impl Into<String>, mac: impl Into<String>) -> Self {
        InterfaceInfo {
            ip: ip.into(),
            mac: mac.into(),
            routable: false,
        }
    }

    /// Same interface, flagged as the routable one.
    pub fn routable(mut self) -> Self {
        self.routable = true;
        self
    }
}

// =============================================================================
// Node Record
// =============================================================================

/// One fleet member's advertised state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Hostname-derived key. Filled from the directory key when absent on disk.
    #[serde(default)]
    pub node_id: String,

    /// Adapter identifier -> descriptor. Opaque to the registry.
    #[serde(default)]
    pub adapters: BTreeMap<String, serde_json::Value>,

    /// Interface name -> address info.
    #[serde(default)]
    pub interfaces: BTreeMap<String, InterfaceInfo>,

    /// Last known reachable address, from the observer's point of view.
    #[serde(default, alias = "rem_ip")]
    pub remote_ip: Option<String>,

    /// Provenance of the most recent write.
    pub source: RecordSource,

    /// Epoch seconds, present only when the observation carried a clock.
    #[serde(default, alias = "upd_time", skip_serializing_if = "Option::is_none")]
    pub update_time: Option<f64>,

    /// Consecutive reconciliation cycles this node failed to reappear in.
    #[serde(default, alias = "fail_cnt")]
    pub fail_count: u32,
}

impl NodeRecord {
    /// Creates an empty record for `node_id`.
    pub fn new(node_id: impl Into<String>, source: RecordSource) -> Self {
        NodeRecord {
            node_id: node_id.into(),
            adapters: BTreeMap::new(),
            interfaces: BTreeMap::new(),
            remote_ip: None,
            source,
            update_time: None,
            fail_count: 0,
        }
    }

    pub fn with_remote_ip(mut self, ip: impl Into<String>) -> Self {
        self.remote_ip = Some(ip.into());
        self
    }

    pub fn with_update_time(mut self, epoch_secs: f64) -> Self {
        self.update_time = Some(epoch_secs);
        self
    }

    pub fn with_fail_count(mut self, fail_count: u32) -> Self {
        self.fail_count = fail_count;
        self
    }

    pub fn with_adapter(mut self, id: impl Into<String>, descriptor: serde_json::Value) -> Self {
        self.adapters.insert(id.into(), descriptor);
        self
    }

    pub fn with_interface(mut self, name: impl Into<String>, info: InterfaceInfo) -> Self {
        self.interfaces.insert(name.into(), info);
        self
    }

    /// Returns the interface flagged as routable, if any.
    pub fn routable_interface(&self) -> Option<(&str, &InterfaceInfo)> {
        self.interfaces
            .iter()
            .find(|(_, info)| info.routable)
            .map(|(name, info)| (name.as_str(), info))
    }

    /// Address to announce for this node: the routable interface or loopback.
    pub fn advertised_address(&self) -> &str {
        self.routable_interface()
            .map(|(_, info)| info.ip.as_str())
            .unwrap_or(LOOPBACK_ADDRESS)
    }

    /// Removes node-local keys from every adapter descriptor.
    pub fn strip_volatile_adapter_keys(&mut self) {
        for descriptor in self.adapters.values_mut() {
            if let Some(obj) = descriptor.as_object_mut() {
                for key in VOLATILE_ADAPTER_KEYS {
                    obj.remove(*key);
                }
            }
        }
    }
}

// =============================================================================
// Registry Directory
// =============================================================================

/// A freshly observed set of peer records from one transport.
pub type PeerBatch = BTreeMap<String, NodeRecord>;

/// Mapping of every known node, keyed by `node_id`.
///
/// Backed by a `BTreeMap` so iteration and serialization are always in
/// sorted key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistryDirectory {
    nodes: BTreeMap<String, NodeRecord>,
}

impl RegistryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Inserts a record under its own `node_id`.
    pub fn insert(&mut self, record: NodeRecord) -> Option<NodeRecord> {
        debug_assert!(!record.node_id.is_empty(), "record inserted without node_id");
        self.nodes.insert(record.node_id.clone(), record)
    }

    pub fn remove(&mut self, node_id: &str) -> Option<NodeRecord> {
        self.nodes.remove(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &NodeRecord)> {
        self.nodes.iter()
    }

    pub fn records(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn into_batch(self) -> PeerBatch {
        self.nodes
    }

    /// Reachable address of `node_id`, for console clients.
    pub fn resolve(&self, node_id: &str) -> Option<&str> {
        self.nodes.get(node_id).and_then(|r| r.remote_ip.as_deref())
    }

    /// Records with a known reachable address.
    pub fn reachable(&self) -> Vec<&NodeRecord> {
        self.nodes
            .values()
            .filter(|r| r.remote_ip.is_some())
            .collect()
    }

    /// Fills missing `node_id`s from their keys, as older files omit them.
    pub fn normalize(&mut self) {
        for (key, record) in self.nodes.iter_mut() {
            if record.node_id.is_empty() {
                record.node_id = key.clone();
            }
        }
    }

    /// Checks that every key matches its record's `node_id`.
    pub fn check_invariants(&self) -> CoreResult<()> {
        for (key, record) in &self.nodes {
            if key != &record.node_id {
                return Err(CoreError::InvariantViolation(format!(
                    "directory key '{}' holds record for '{}'",
                    key, record.node_id
                )));
            }
        }
        Ok(())
    }

    /// Parses a persisted directory and normalizes it.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let mut directory: RegistryDirectory = serde_json::from_slice(bytes)?;
        directory.normalize();
        Ok(directory)
    }

    /// Deterministic rendering: sorted keys, four-space indentation.
    pub fn to_json_pretty(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser).map_err(|e| CoreError::Encoding {
            field: "directory".into(),
            reason: e.to_string(),
        })?;
        buf.push(b'\n');
        Ok(buf)
    }
}

impl From<PeerBatch> for RegistryDirectory {
    fn from(nodes: PeerBatch) -> Self {
        let mut directory = RegistryDirectory { nodes };
        directory.normalize();
        directory
    }
}

impl FromIterator<NodeRecord> for RegistryDirectory {
    fn from_iter<I: IntoIterator<Item = NodeRecord>>(iter: I) -> Self {
        let mut directory = RegistryDirectory::new();
        for record in iter {
            directory.insert(record);
        }
        directory
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
