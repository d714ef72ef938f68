/*!
Test harness for the node

- Backup trees in a temp directory, with file ages under test control
- A preset config pointing at 10.0.0.0/24 and the temp backup root
- Orchestrators wired to a shared [`MockTransport`]
*/

use crate::device_builder::MockDevice;
use crate::mock_transport::MockTransport;
use anyhow::Result;
use fleetwatch_node::config::NodeConfig;
use fleetwatch_node::scanner::HostRange;
use fleetwatch_node::Orchestrator;
use std::fs::{self, File};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// Test logging; `RUST_LOG` applies, output goes through the test writer
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fleetwatch_node=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Backup root in a temp directory, removed on drop
pub struct BackupTree {
    dir: TempDir,
}

impl BackupTree {
    pub fn new() -> Result<Self> {
        Ok(Self { dir: TempDir::new()? })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Directory of a device's backups: `{root}/{id}[/{name}]`
    pub fn device_dir(&self, id: &str, name: Option<&str>) -> PathBuf {
        let dir = self.root().join(id);
        match name {
            Some(name) => dir.join(name),
            None => dir,
        }
    }

    /// Creates an empty backup directory
    pub fn add_dir(&self, id: &str, name: Option<&str>) -> Result<PathBuf> {
        let dir = self.device_dir(id, name);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Writes `relative` below the device directory, last modified `age` ago
    pub fn add_file(&self, id: &str, name: Option<&str>, relative: &str, age: Duration) -> Result<PathBuf> {
        let path = self.device_dir(id, name).join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, b"backup")?;
        let modified = SystemTime::now()
            .checked_sub(age)
            .ok_or_else(|| anyhow::anyhow!("age {age:?} is before the epoch"))?;
        File::options().write(true).open(&path)?.set_modified(modified)?;
        Ok(path)
    }
}

/// Node wired to mocks: subnet 10.0.0.0/24, hosts .2 to .10
pub struct FleetHarness {
    pub transport: MockTransport,
    pub backups: BackupTree,
    pub config: NodeConfig,
}

impl FleetHarness {
    pub fn new() -> Result<Self> {
        init_logging();
        let backups = BackupTree::new()?;

        let mut config = NodeConfig::default();
        config.network.local_ip = Some(Self::local_ip());
        config.network.node_host_suffix = None;
        config.network.host_range = HostRange { first: 2, last: 10 };
        config.backup.root = backups.root().to_path_buf();
        config.timeouts.probe_ms = 200;
        config.timeouts.status_ms = 200;
        config.timeouts.dispatch_ms = 200;

        Ok(Self {
            transport: MockTransport::new(),
            backups,
            config,
        })
    }

    pub fn local_ip() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 1)
    }

    pub fn add_device(&self, device: &MockDevice) -> &Self {
        device.install(&self.transport);
        self
    }

    pub fn orchestrator(&self) -> Orchestrator<MockTransport> {
        Orchestrator::new(self.transport.clone(), self.config.clone(), Self::local_ip())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_file_age() {
        let tree = BackupTree::new().unwrap();
        let path = tree
            .add_file("A", Some("ETHOSCOPE_001"), "2024/run.db", Duration::from_secs(3600))
            .unwrap();

        assert!(path.starts_with(tree.root().join("A").join("ETHOSCOPE_001")));
        let age = SystemTime::now()
            .duration_since(fs::metadata(&path).unwrap().modified().unwrap())
            .unwrap();
        assert!(age >= Duration::from_secs(3599));
    }

    #[test]
    fn test_harness_config() {
        let harness = FleetHarness::new().unwrap();
        assert_eq!(harness.config.network.local_ip, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(harness.config.backup.root, harness.backups.root());
        assert!(harness.config.validate().is_ok());
    }
}
