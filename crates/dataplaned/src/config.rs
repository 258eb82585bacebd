//! Configuration file support for dataplaned
//!
//! Loads and validates dataplane configuration from TOML files.
//! Default location: /etc/dataplaned/dataplaned.toml

use dpa_types::Ipv4Address;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/dataplaned/dataplaned.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Orchestrator loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Hostname used to pick this node's host metadata. Empty means the
    /// system hostname.
    #[serde(default)]
    pub hostname: String,

    /// Maximum messages drained from one source per loop iteration
    #[serde(default = "default_peek_limit")]
    pub peek_limit: usize,

    /// Apply throttle bucket size
    #[serde(default = "default_throttle_bucket")]
    pub throttle_bucket: u32,

    /// Apply throttle refill interval in milliseconds
    #[serde(default = "default_throttle_refill_ms")]
    pub throttle_refill_ms: u64,

    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// Interval at which a dirty dataplane is woken for another apply
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// Forced IP-set resync interval; 0 disables
    #[serde(default)]
    pub ipsets_refresh_interval_secs: u64,

    /// Forced route and rule resync interval; 0 disables
    #[serde(default)]
    pub route_refresh_interval_secs: u64,

    /// Process status report interval; 0 disables
    #[serde(default)]
    pub status_reporting_interval_secs: u64,
}

/// Egress gateway settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_vxlan_device")]
    pub vxlan_device: String,

    #[serde(default = "default_vxlan_vni")]
    pub vxlan_vni: u32,

    #[serde(default = "default_vxlan_port")]
    pub vxlan_port: u16,

    #[serde(default = "default_vxlan_mtu")]
    pub vxlan_mtu: u32,

    #[serde(default = "default_rule_priority")]
    pub rule_priority: u32,

    /// Packet mark matched by every egress rule
    #[serde(default = "default_egress_mark")]
    pub fwmark: u32,

    /// First routing table index handed to gateway groups
    #[serde(default = "default_first_table")]
    pub first_table_index: u32,

    /// Last routing table index handed to gateway groups (inclusive)
    #[serde(default = "default_last_table")]
    pub last_table_index: u32,

    /// Node address used for the VXLAN device when host metadata never
    /// arrives
    #[serde(default)]
    pub fallback_node_ip: Option<Ipv4Address>,

    /// Interval between VXLAN device checks in seconds
    #[serde(default = "default_device_sync_interval")]
    pub device_sync_interval_secs: u64,
}

/// In-memory kernel settings used when no real kernel backend is wired in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_parent_iface")]
    pub parent_iface: String,

    #[serde(default = "default_parent_addr")]
    pub parent_addr: Ipv4Address,
}

/// Complete dataplaned configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataplaneConfig {
    #[serde(default)]
    pub dataplane: LoopConfig,

    #[serde(default)]
    pub egress: EgressConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

fn default_peek_limit() -> usize {
    100
}

fn default_throttle_bucket() -> u32 {
    10
}

fn default_throttle_refill_ms() -> u64 {
    100
}

fn default_health_interval() -> u64 {
    10
}

fn default_retry_interval() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_vxlan_device() -> String {
    "egress.calico".to_string()
}

fn default_vxlan_vni() -> u32 {
    4097
}

fn default_vxlan_port() -> u16 {
    4790
}

fn default_vxlan_mtu() -> u32 {
    1410
}

fn default_rule_priority() -> u32 {
    100
}

fn default_egress_mark() -> u32 {
    0x200
}

fn default_first_table() -> u32 {
    1
}

fn default_last_table() -> u32 {
    250
}

fn default_device_sync_interval() -> u64 {
    10
}

fn default_parent_iface() -> String {
    "eth0".to_string()
}

fn default_parent_addr() -> Ipv4Address {
    Ipv4Address::new(192, 168, 0, 10)
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            peek_limit: default_peek_limit(),
            throttle_bucket: default_throttle_bucket(),
            throttle_refill_ms: default_throttle_refill_ms(),
            health_interval_secs: default_health_interval(),
            retry_interval_secs: default_retry_interval(),
            ipsets_refresh_interval_secs: 0,
            route_refresh_interval_secs: 0,
            status_reporting_interval_secs: 0,
        }
    }
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            vxlan_device: default_vxlan_device(),
            vxlan_vni: default_vxlan_vni(),
            vxlan_port: default_vxlan_port(),
            vxlan_mtu: default_vxlan_mtu(),
            rule_priority: default_rule_priority(),
            fwmark: default_egress_mark(),
            first_table_index: default_first_table(),
            last_table_index: default_last_table(),
            fallback_node_ip: None,
            device_sync_interval_secs: default_device_sync_interval(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            parent_iface: default_parent_iface(),
            parent_addr: default_parent_addr(),
        }
    }
}

fn secs_or_none(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl LoopConfig {
    pub fn throttle_refill(&self) -> Duration {
        Duration::from_millis(self.throttle_refill_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn ipsets_refresh_interval(&self) -> Option<Duration> {
        secs_or_none(self.ipsets_refresh_interval_secs)
    }

    pub fn route_refresh_interval(&self) -> Option<Duration> {
        secs_or_none(self.route_refresh_interval_secs)
    }

    pub fn status_reporting_interval(&self) -> Option<Duration> {
        secs_or_none(self.status_reporting_interval_secs)
    }
}

impl EgressConfig {
    /// Table indices in the order they are pushed onto the allocator; the
    /// last one is claimed first.
    pub fn table_indices(&self) -> impl Iterator<Item = u32> {
        self.first_table_index..=self.last_table_index
    }

    pub fn device_sync_interval(&self) -> Duration {
        Duration::from_secs(self.device_sync_interval_secs)
    }
}

impl DataplaneConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.dataplane.peek_limit == 0 {
            return Err(ConfigError::Invalid("peek_limit must be > 0".to_string()));
        }

        if self.dataplane.throttle_bucket == 0 {
            return Err(ConfigError::Invalid(
                "throttle_bucket must be > 0".to_string(),
            ));
        }

        if self.dataplane.throttle_refill_ms == 0 {
            return Err(ConfigError::Invalid(
                "throttle_refill_ms must be > 0".to_string(),
            ));
        }

        if self.dataplane.health_interval_secs == 0 || self.dataplane.retry_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "health and retry intervals must be > 0".to_string(),
            ));
        }

        let egress = &self.egress;
        if egress.first_table_index == 0 || egress.first_table_index > egress.last_table_index {
            return Err(ConfigError::Invalid(format!(
                "table index range {}..={} is empty or starts at 0",
                egress.first_table_index, egress.last_table_index
            )));
        }

        // 253-255 are the kernel's default, main and local tables.
        if egress.last_table_index >= 253 {
            return Err(ConfigError::Invalid(format!(
                "table index range must end below 253, got {}",
                egress.last_table_index
            )));
        }

        if egress.fwmark == 0 {
            return Err(ConfigError::Invalid("fwmark must be non-zero".to_string()));
        }

        if egress.vxlan_device.is_empty() {
            return Err(ConfigError::Invalid("vxlan_device must be set".to_string()));
        }

        if egress.device_sync_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "device_sync_interval_secs must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
