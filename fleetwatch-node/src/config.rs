use crate::dispatch::{DispatchOptions, UpdateCheckOptions};
use crate::probe::ProbeOptions;
use crate::refresh::RefreshOptions;
use crate::scanner::{HostRange, ScanOptions};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "FLEETWATCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "fleetwatch.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },
    #[error("invalid setting {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub ports: PortsConfig,
    pub concurrency: ConcurrencyConfig,
    pub timeouts: TimeoutsConfig,
    pub backup: BackupConfig,
    pub sweep: SweepConfig,
    pub http: HttpConfig,
    pub update: UpdateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub router_ip: Ipv4Addr,
    /// Expected last octet of the node's own address; `None` skips the check
    pub node_host_suffix: Option<u8>,
    /// Skip self-identification and scan around this address
    pub local_ip: Option<Ipv4Addr>,
    pub prefix_len: u8,
    pub host_range: HostRange,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            router_ip: Ipv4Addr::new(192, 168, 123, 254),
            node_host_suffix: Some(1),
            local_ip: None,
            prefix_len: 24,
            host_range: HostRange::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PortsConfig {
    pub identity: u16,
    pub control: u16,
    pub update: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self { identity: 8888, control: 9000, update: 8888 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub scan: usize,
    pub refresh: usize,
    pub backup: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { scan: 64, refresh: 5, backup: 64 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub probe_ms: u64,
    pub status_ms: u64,
    pub dispatch_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self { probe_ms: 2_000, status_ms: 5_000, dispatch_ms: 10_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackupConfig {
    pub root: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { root: PathBuf::from("/ethoscope_results") }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SweepConfig {
    /// Seconds between scheduled sweeps; 0 = one sweep at startup, then on demand
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { bind: SocketAddr::from(([0, 0, 0, 0], 8080)) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpdateConfig {
    pub git_working_dir: PathBuf,
    pub branch: Option<String>,
    /// Exit status used for the requested restart
    pub restart_exit_code: i32,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            git_working_dir: PathBuf::from("/opt/fleetwatch"),
            branch: None,
            restart_exit_code: 0,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.concurrency;
        if c.scan == 0 || c.refresh == 0 || c.backup == 0 {
            return Err(ConfigError::Invalid("concurrency limits must be at least 1".into()));
        }
        if !(8..=30).contains(&self.network.prefix_len) {
            return Err(ConfigError::Invalid(format!(
                "network.prefix_len {} (expected 8..=30)",
                self.network.prefix_len
            )));
        }
        let range = self.network.host_range;
        if range.first == 0 || range.first > range.last {
            return Err(ConfigError::Invalid(format!(
                "network.host_range {}..={}",
                range.first, range.last
            )));
        }
        let broadcast_suffix = (1u64 << (32 - u32::from(self.network.prefix_len))) - 1;
        if u64::from(range.last) >= broadcast_suffix {
            return Err(ConfigError::Invalid(format!(
                "network.host_range.last {} outside a /{} subnet (max {})",
                range.last,
                self.network.prefix_len,
                broadcast_suffix - 1
            )));
        }
        if self.timeouts.probe_ms == 0 || self.timeouts.status_ms == 0 || self.timeouts.dispatch_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            prefix_len: self.network.prefix_len,
            range: self.network.host_range,
            concurrency: self.concurrency.scan,
            probe: ProbeOptions {
                timeout: Duration::from_millis(self.timeouts.probe_ms),
                port: self.ports.identity,
                ..ProbeOptions::default()
            },
        }
    }

    pub fn refresh_options(&self) -> RefreshOptions {
        RefreshOptions {
            port: self.ports.control,
            concurrency: self.concurrency.refresh,
            timeout: Duration::from_millis(self.timeouts.status_ms),
            ..RefreshOptions::default()
        }
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            port: self.ports.control,
            timeout: Duration::from_millis(self.timeouts.dispatch_ms),
        }
    }

    pub fn update_check_options(&self) -> UpdateCheckOptions {
        UpdateCheckOptions {
            port: self.ports.update,
            timeout: Duration::from_millis(self.timeouts.dispatch_ms),
        }
    }
}

/// Reads a YAML config file. An empty file yields the defaults.
pub async fn load_from_path(path: &Path) -> Result<NodeConfig, ConfigError> {
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if txt.trim().is_empty() {
        return Ok(NodeConfig::default());
    }
    serde_yaml::from_str(&txt).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads `$FLEETWATCH_CONFIG` (or `fleetwatch.yaml`), falling back to the
/// defaults when the file is missing or unreadable
pub async fn load_config() -> NodeConfig {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let path = Path::new(&path);
    if !path.exists() {
        warn!(path = %path.display(), "no config file, using defaults");
        return NodeConfig::default();
    }
    match load_from_path(path).await {
        Ok(config) => {
            info!(path = %path.display(), "config loaded");
            config
        }
        Err(e) => {
            warn!(error = %e, "invalid config, using defaults");
            NodeConfig::default()
        }
    }
}
