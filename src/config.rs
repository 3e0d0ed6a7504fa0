//! Configuration: defaults, then `~/.config/trellis/config.yaml` (or
//! `--config`), then `TRELLIS_*` environment variables. Nested keys use `__`,
//! e.g. `TRELLIS_PROVISION__AGENT_VERSION=0.4.1`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub ssh: SshConfig,
    pub provision: ProvisionConfig,
    pub overlay: OverlayConfig,
    pub mesh: MeshConfig,
    pub monitor: MonitorConfig,
    /// Base URL of the daemon, used by the CLI subcommands.
    pub controller_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub http_addr: String,
    pub log_level: String,
    /// Holds the state snapshot and per-node provisioning logs.
    pub data_dir: PathBuf,
    /// Persist the repository to `<data_dir>/state.json`.
    pub snapshot: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:9200".to_string(),
            log_level: "info".to_string(),
            data_dir: dirs::data_local_dir()
                .map(|d| d.join("trellis"))
                .unwrap_or_else(|| PathBuf::from(".trellis")),
            snapshot: true,
        }
    }
}

impl DaemonConfig {
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub connect_timeout_secs: u64,
    /// Upper bound for one remote command or file transfer. 0 disables it.
    pub command_timeout_secs: u64,
    /// How long an idle ControlMaster socket lingers after the last command.
    pub control_persist_secs: u64,
    /// Directory for ControlMaster sockets. Defaults to the system temp dir.
    pub control_dir: Option<PathBuf>,
    pub strict_host_key_checking: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            command_timeout_secs: 300,
            control_persist_secs: 60,
            control_dir: None,
            strict_host_key_checking: "accept-new".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Management agent release, must parse as semver.
    pub agent_version: String,
    /// Download URL template; `{version}` is substituted.
    pub agent_release_url: String,
    /// Local agent build uploaded to nodes instead of downloading a release.
    pub agent_binary: Option<PathBuf>,
    pub agent_log_level: String,
    pub docker_mtu: u32,
    /// Upper bound for one provisioning run.
    pub deadline_secs: Option<u64>,
    /// Local directory for write-file staging. Defaults to the system temp dir.
    pub scratch_dir: Option<PathBuf>,
}

impl SshConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            agent_version: "0.1.0".to_string(),
            agent_release_url:
                "https://github.com/pleme-io/trellis-agent/releases/download/v{version}/trellis-agent-linux-amd64"
                    .to_string(),
            agent_binary: None,
            agent_log_level: "info".to_string(),
            docker_mtu: 1420,
            deadline_secs: None,
            scratch_dir: None,
        }
    }
}

impl ProvisionConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub cidr: Ipv4Net,
    /// Leading host addresses never handed to nodes (the controller's).
    pub reserved_hosts: usize,
    pub interface: String,
    pub keepalive_secs: u16,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            cidr: Ipv4Net::new(std::net::Ipv4Addr::new(10, 0, 0, 0), 24)
                .unwrap_or_default(),
            reserved_hosts: 1,
            interface: "wg0".to_string(),
            keepalive_secs: 25,
        }
    }
}

impl OverlayConfig {
    pub fn config_path(&self) -> String {
        format!("/etc/wireguard/{}.conf", self.interface)
    }

    pub fn service(&self) -> String {
        format!("wg-quick@{}", self.interface)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Run a full mesh sync when the daemon starts.
    pub sync_on_start: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            sync_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Open an SSH session and run `true`.
    #[default]
    Shell,
    /// Call the management agent's `Ping` RPC (requires the `grpc` feature).
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub probe_mode: ProbeMode,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub latency_threshold_ms: u64,
    pub aggregate_interval_secs: u64,
    pub aggregate_window_secs: u64,
    pub retention_hours: u64,
    /// 0 disables the reconnect loop.
    pub reconnect_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_mode: ProbeMode::Shell,
            probe_interval_secs: 10,
            probe_timeout_secs: 5,
            latency_threshold_ms: 500,
            aggregate_interval_secs: 15 * 60,
            aggregate_window_secs: 15 * 60,
            retention_hours: 24,
            reconnect_interval_secs: 5 * 60,
        }
    }
}

impl MonitorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn aggregate_interval(&self) -> Duration {
        Duration::from_secs(self.aggregate_interval_secs.max(1))
    }

    pub fn aggregate_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.aggregate_window_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }

    pub fn reconnect_interval(&self) -> Option<Duration> {
        (self.reconnect_interval_secs > 0).then(|| Duration::from_secs(self.reconnect_interval_secs))
    }
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(config_dir.join("trellis").join("config.yaml"))
    }

    pub fn controller_url(&self) -> &str {
        if self.controller_url.is_empty() {
            "http://127.0.0.1:9200"
        } else {
            &self.controller_url
        }
    }

    /// Validate values that serde cannot check on its own.
    pub fn validate(&self) -> Result<()> {
        semver::Version::parse(&self.provision.agent_version).with_context(|| {
            format!(
                "provision.agent_version '{}' is not a semver version",
                self.provision.agent_version
            )
        })?;
        let usable = self
            .overlay
            .cidr
            .hosts()
            .count()
            .saturating_sub(self.overlay.reserved_hosts);
        if usable == 0 {
            bail!(
                "overlay.cidr {} leaves no addresses after {} reserved hosts",
                self.overlay.cidr,
                self.overlay.reserved_hosts
            );
        }
        Ok(())
    }
}

/// Load configuration. An explicit path must exist; the default path is
/// optional.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let file = match path {
        Some(p) => {
            if !p.exists() {
                bail!("config file {} does not exist", p.display());
            }
            Some(p.to_path_buf())
        }
        None => Config::default_path().ok(),
    };

    let mut figment = Figment::from(Serialized::defaults(Config::default()));
    if let Some(ref file) = file {
        figment = figment.merge(Yaml::file(file));
    }
    figment = figment.merge(Env::prefixed("TRELLIS_").split("__"));

    let config: Config = figment.extract().context("loading configuration")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "daemon:\n  http_addr: \"0.0.0.0:9300\"\noverlay:\n  cidr: 10.8.0.0/16\nmonitor:\n  probe_interval_secs: 30\n",
        )
        .unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.daemon.http_addr, "0.0.0.0:9300");
        assert_eq!(config.overlay.cidr.to_string(), "10.8.0.0/16");
        assert_eq!(config.monitor.probe_interval(), Duration::from_secs(30));
        assert_eq!(config.monitor.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.provision.docker_mtu, 1420);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(load(Some(Path::new("/nonexistent/trellis.yaml"))).is_err());
    }

    #[test]
    fn agent_version_must_be_semver() {
        let mut config = Config::default();
        config.provision.agent_version = "latest".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reconnect_loop_can_be_disabled() {
        let mut monitor = MonitorConfig::default();
        assert_eq!(monitor.reconnect_interval(), Some(Duration::from_secs(300)));
        monitor.reconnect_interval_secs = 0;
        assert_eq!(monitor.reconnect_interval(), None);
    }
}
