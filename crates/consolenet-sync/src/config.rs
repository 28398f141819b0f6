//! # Agent Configuration
//!
//! Configuration management for the ConsoleNet agent.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     CONSOLENET_NODE_ID=lab-pi-3                                        │
//! │     CONSOLENET_CLOUD_ENABLED=true                                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/consolenet/agent.toml (Linux)                            │
//! │     --config <path> on the command line                                │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     node id = hostname, cloud disabled, 30s debounce                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [node]
//! id = "lab-pi-3"
//! serial_dir = "/dev/serial/by-id"
//!
//! [node.interfaces.eth0]
//! ip = "10.0.0.20"
//! mac = "b8:27:eb:00:00:01"
//! routable = true
//!
//! [discovery]
//! port = 5000
//! advertise_delay_secs = 30
//!
//! [cloud]
//! enabled = true
//! blob_path = "/mnt/shared/consolenet/directory.json"
//!
//! [registry]
//! path = "/var/lib/consolenet/remotes.json"
//! group = "consolepi"
//! mode = 0o640
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use consolenet_core::advertisement::{DEFAULT_MAX_PAYLOAD_LEN, DEFAULT_VIRTUAL_MARKERS, TXT_ENTRY_MAX};
use consolenet_core::{InterfaceInfo, PayloadLimits};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Node Settings
// =============================================================================

/// Identity and local hardware of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Unique node identifier. Empty means "use the hostname".
    #[serde(default)]
    pub id: String,

    /// Directory holding one entry per attached serial adapter.
    #[serde(default = "default_serial_dir")]
    pub serial_dir: PathBuf,

    /// Network interfaces to announce.
    #[serde(default)]
    pub interfaces: BTreeMap<String, InterfaceInfo>,
}

fn default_serial_dir() -> PathBuf {
    PathBuf::from("/dev/serial/by-id")
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            id: String::new(),
            serial_dir: default_serial_dir(),
            interfaces: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Discovery Settings
// =============================================================================

/// Local-network announcement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Announce this node over mDNS.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fully qualified service type.
    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// Port announced with the service.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Settle delay after a hardware change before re-advertising (seconds).
    #[serde(default = "default_advertise_delay")]
    pub advertise_delay_secs: u64,

    /// Pause between unregister and register during a refresh (seconds).
    #[serde(default = "default_reregister_gap")]
    pub reregister_gap_secs: u64,

    /// Upper bound for one re-advertise task (seconds).
    #[serde(default = "default_task_timeout")]
    pub timeout_secs: u64,

    /// Largest single TXT entry, in bytes.
    #[serde(default = "default_max_entry_len")]
    pub max_entry_len: usize,

    /// Largest TXT record, in bytes.
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,

    /// Interface-name fragments dropped by the smallest payload tier.
    #[serde(default = "default_virtual_markers")]
    pub virtual_markers: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_service_type() -> String {
    "_consolepi._tcp.local.".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_advertise_delay() -> u64 {
    30
}

fn default_reregister_gap() -> u64 {
    5
}

fn default_task_timeout() -> u64 {
    60
}

fn default_max_entry_len() -> usize {
    TXT_ENTRY_MAX
}

fn default_max_payload_len() -> usize {
    DEFAULT_MAX_PAYLOAD_LEN
}

fn default_virtual_markers() -> Vec<String> {
    DEFAULT_VIRTUAL_MARKERS.iter().map(|m| m.to_string()).collect()
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            enabled: true,
            service_type: default_service_type(),
            port: default_port(),
            advertise_delay_secs: default_advertise_delay(),
            reregister_gap_secs: default_reregister_gap(),
            timeout_secs: default_task_timeout(),
            max_entry_len: default_max_entry_len(),
            max_payload_len: default_max_payload_len(),
            virtual_markers: default_virtual_markers(),
        }
    }
}

// =============================================================================
// Cloud Settings
// =============================================================================

/// Shared cloud directory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    /// Federate through the shared directory blob.
    #[serde(default)]
    pub enabled: bool,

    /// Location of the shared directory blob.
    #[serde(default)]
    pub blob_path: Option<PathBuf>,

    /// Settle delay after a hardware change before syncing (seconds).
    #[serde(default = "default_sync_delay")]
    pub sync_delay_secs: u64,

    /// Upper bound for one cloud-sync task (seconds).
    #[serde(default = "default_task_timeout")]
    pub timeout_secs: u64,

    /// Schedule a sync as soon as the agent starts.
    #[serde(default = "default_true")]
    pub sync_on_start: bool,
}

fn default_sync_delay() -> u64 {
    30
}

impl Default for CloudSettings {
    fn default() -> Self {
        CloudSettings {
            enabled: false,
            blob_path: None,
            sync_delay_secs: default_sync_delay(),
            timeout_secs: default_task_timeout(),
            sync_on_start: true,
        }
    }
}

// =============================================================================
// Registry Settings
// =============================================================================

/// Persisted directory file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Location of the persisted directory.
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,

    /// Group given ownership of the file.
    #[serde(default = "default_group")]
    pub group: String,

    /// File mode applied after every write.
    #[serde(default = "default_mode")]
    pub mode: u32,
}

fn default_registry_path() -> PathBuf {
    directories::ProjectDirs::from("net", "consolenet", "consolenet")
        .map(|dirs| dirs.data_dir().join("remotes.json"))
        .unwrap_or_else(|| PathBuf::from("remotes.json"))
}

fn default_group() -> String {
    "consolepi".to_string()
}

fn default_mode() -> u32 {
    0o640
}

impl Default for RegistrySettings {
    fn default() -> Self {
        RegistrySettings {
            path: default_registry_path(),
            group: default_group(),
            mode: default_mode(),
        }
    }
}

// =============================================================================
// Monitor Settings
// =============================================================================

/// Serial adapter change detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// How often the serial directory is rescanned (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    2
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

// =============================================================================
// Main Agent Configuration
// =============================================================================

/// Complete agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub cloud: CloudSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub monitor: MonitorSettings,
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (agent.toml)
    /// 3. Environment variables
    /// 4. Hostname, when no node id was given
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading agent config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.resolve_node_id()?;
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns defaults if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load agent config: {}. Using defaults.", e);
            let mut config = Self::default();
            if let Err(e) = config.resolve_node_id() {
                warn!(error = %e, "Running without a node id");
            }
            config
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Agent config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.node.id.is_empty() {
            return Err(SyncError::MissingNodeId);
        }

        if self.discovery.port == 0 {
            return Err(SyncError::InvalidConfig("discovery.port must be non-zero".into()));
        }

        if self.discovery.max_entry_len == 0 || self.discovery.max_entry_len > TXT_ENTRY_MAX {
            return Err(SyncError::InvalidConfig(format!(
                "discovery.max_entry_len must be between 1 and {}, got {}",
                TXT_ENTRY_MAX, self.discovery.max_entry_len
            )));
        }

        if self.discovery.max_payload_len < self.discovery.max_entry_len {
            return Err(SyncError::InvalidConfig(
                "discovery.max_payload_len must not be smaller than max_entry_len".into(),
            ));
        }

        if self.discovery.timeout_secs == 0 || self.cloud.timeout_secs == 0 {
            return Err(SyncError::InvalidConfig("task timeouts must be greater than 0".into()));
        }

        if self.cloud.enabled && self.cloud.blob_path.is_none() {
            return Err(SyncError::InvalidConfig(
                "cloud.blob_path is required when cloud sync is enabled".into(),
            ));
        }

        if self.registry.mode > 0o777 {
            return Err(SyncError::InvalidConfig(format!(
                "registry.mode {:o} is not a permission mode",
                self.registry.mode
            )));
        }

        if self.monitor.poll_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "monitor.poll_interval_secs must be greater than 0".into(),
            ));
        }

        if self.node.interfaces.values().filter(|i| i.routable).count() > 1 {
            return Err(SyncError::InvalidConfig(
                "at most one interface may be marked routable".into(),
            ));
        }

        Ok(())
    }

    /// Applies process environment overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup.
    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("CONSOLENET_NODE_ID") {
            debug!(node_id = %id, "Overriding node ID from environment");
            self.node.id = id;
        }

        if let Some(enabled) = lookup("CONSOLENET_CLOUD_ENABLED") {
            match parse_flag(&enabled) {
                Some(flag) => self.cloud.enabled = flag,
                None => warn!(value = %enabled, "Unknown CONSOLENET_CLOUD_ENABLED value"),
            }
        }

        if let Some(blob) = lookup("CONSOLENET_CLOUD_BLOB") {
            debug!(blob = %blob, "Overriding cloud blob path from environment");
            self.cloud.blob_path = Some(PathBuf::from(blob));
        }

        if let Some(path) = lookup("CONSOLENET_REGISTRY_PATH") {
            self.registry.path = PathBuf::from(path);
        }

        if let Some(delay) = lookup("CONSOLENET_ADVERTISE_DELAY") {
            if let Ok(secs) = delay.parse::<u64>() {
                debug!(secs, "Overriding advertise delay from environment");
                self.discovery.advertise_delay_secs = secs;
            }
        }
    }

    /// Falls back to the hostname when no node id is configured.
    fn resolve_node_id(&mut self) -> SyncResult<()> {
        if !self.node.id.is_empty() {
            return Ok(());
        }
        let host = hostname::get()
            .map_err(|_| SyncError::MissingNodeId)?
            .into_string()
            .map_err(|_| SyncError::MissingNodeId)?;
        // Announce the short name, not the FQDN.
        self.node.id = host.split('.').next().unwrap_or_default().to_string();
        Ok(())
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("net", "consolenet", "consolenet")
            .map(|dirs| dirs.config_dir().join("agent.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    pub fn payload_limits(&self) -> PayloadLimits {
        PayloadLimits {
            max_entry_len: self.discovery.max_entry_len,
            max_total_len: self.discovery.max_payload_len,
        }
    }

    pub fn advertise_delay(&self) -> Duration {
        Duration::from_secs(self.discovery.advertise_delay_secs)
    }

    pub fn reregister_gap(&self) -> Duration {
        Duration::from_secs(self.discovery.reregister_gap_secs)
    }

    pub fn advertise_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery.timeout_secs)
    }

    pub fn cloud_delay(&self) -> Duration {
        Duration::from_secs(self.cloud.sync_delay_secs)
    }

    pub fn cloud_timeout(&self) -> Duration {
        Duration::from_secs(self.cloud.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.poll_interval_secs)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn named() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.node.id = "lab-pi".into();
        config
    }

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.discovery.port, 5000);
        assert_eq!(config.discovery.service_type, "_consolepi._tcp.local.");
        assert_eq!(config.advertise_delay(), Duration::from_secs(30));
        assert_eq!(config.reregister_gap(), Duration::from_secs(5));
        assert!(!config.cloud.enabled);
        assert!(config.cloud.sync_on_start);
        assert_eq!(config.registry.group, "consolepi");
        assert_eq!(config.registry.mode, 0o640);
        assert_eq!(config.payload_limits(), PayloadLimits::default());
    }

    #[test]
    fn test_config_validation() {
        let mut config = named();
        assert!(config.validate().is_ok());

        config.cloud.enabled = true;
        assert!(config.validate().is_err());
        config.cloud.blob_path = Some(PathBuf::from("/mnt/shared/directory.json"));
        assert!(config.validate().is_ok());

        config.discovery.max_entry_len = 300;
        assert!(config.validate().is_err());
        config.discovery.max_entry_len = 255;

        config.node.id.clear();
        assert!(matches!(config.validate(), Err(SyncError::MissingNodeId)));
    }

    #[test]
    fn test_single_routable_interface() {
        let mut config = named();
        config
            .node
            .interfaces
            .insert("eth0".into(), InterfaceInfo::new("10.0.0.2", "aa").routable());
        config
            .node
            .interfaces
            .insert("wlan0".into(), InterfaceInfo::new("10.0.1.2", "bb").routable());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_parsing() {
        let config: AgentConfig = toml::from_str(
            r#"
            [node]
            id = "lab-pi-3"

            [node.interfaces.eth0]
            ip = "10.0.0.20"
            mac = "b8:27:eb:00:00:01"
            routable = true

            [cloud]
            enabled = true
            blob_path = "/mnt/shared/directory.json"
            sync_delay_secs = 10

            [registry]
            mode = 0o600
            "#,
        )
        .unwrap();

        assert_eq!(config.node_id(), "lab-pi-3");
        assert!(config.node.interfaces["eth0"].routable);
        assert_eq!(config.cloud_delay(), Duration::from_secs(10));
        assert_eq!(config.registry.mode, 0o600);
        assert_eq!(config.discovery.port, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CONSOLENET_NODE_ID", "from-env"),
            ("CONSOLENET_CLOUD_ENABLED", "yes"),
            ("CONSOLENET_CLOUD_BLOB", "/srv/blob.json"),
            ("CONSOLENET_ADVERTISE_DELAY", "3"),
        ]
        .into_iter()
        .collect();

        let mut config = named();
        config.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.node_id(), "from-env");
        assert!(config.cloud.enabled);
        assert_eq!(config.cloud.blob_path, Some(PathBuf::from("/srv/blob.json")));
        assert_eq!(config.discovery.advertise_delay_secs, 3);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");

        let mut config = named();
        config.discovery.port = 5050;
        config.save(Some(path.clone())).unwrap();

        let loaded = AgentConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.discovery.port, 5050);
    }
}
