//! Management agent artifacts: binary release, YAML config and systemd unit.

use serde::{Deserialize, Serialize};

use crate::config::ProvisionConfig;
use crate::domain::node::Node;
use crate::error::ProvisionError;
use crate::remote::quote;

pub const SERVICE: &str = "trellis-agent";
pub const BINARY_PATH: &str = "/usr/local/bin/trellis-agent";
pub const CONFIG_DIR: &str = "/etc/trellis-agent";
pub const CONFIG_PATH: &str = "/etc/trellis-agent/config.yaml";
pub const CERT_PATH: &str = "/etc/trellis-agent/certs/server.crt";
pub const KEY_PATH: &str = "/etc/trellis-agent/certs/server.key";
pub const UNIT_PATH: &str = "/etc/systemd/system/trellis-agent.service";

/// On-node agent configuration, written as YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfigFile {
    pub server: ServerSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecuritySection>,
    pub log: LogSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecuritySection {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    pub level: String,
    pub filename: String,
    /// Megabytes per file before rotation.
    pub max_size: u32,
    pub max_backups: u32,
    /// Days.
    pub max_age: u32,
    pub compress: bool,
}

impl AgentConfigFile {
    pub fn for_node(node: &Node, log_level: &str) -> Self {
        let tls = node.agent.cert.is_some() && node.agent.key.is_some();
        Self {
            server: ServerSection {
                port: node.agent.port,
                host: "0.0.0.0".to_string(),
            },
            security: tls.then(|| SecuritySection {
                cert_file: CERT_PATH.to_string(),
                key_file: KEY_PATH.to_string(),
            }),
            log: LogSection {
                level: log_level.to_string(),
                filename: format!("{CONFIG_DIR}/agent.log"),
                max_size: 10,
                max_backups: 3,
                max_age: 28,
                compress: true,
            },
        }
    }

    pub fn to_yaml(&self) -> Result<String, ProvisionError> {
        serde_yaml::to_string(self)
            .map_err(|e| ProvisionError::Render(format!("agent config: {e}")))
    }
}

pub fn unit_file() -> String {
    format!(
        "[Unit]\n\
         Description=Trellis Agent\n\
         After=network.target\n\
         \n\
         [Service]\n\
         ExecStart={BINARY_PATH} -config {CONFIG_PATH}\n\
         Restart=always\n\
         User=root\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

/// Resolve the release download URL for the configured agent version.
pub fn release_url(config: &ProvisionConfig) -> Result<String, ProvisionError> {
    let version = semver::Version::parse(config.agent_version.trim()).map_err(|e| {
        ProvisionError::Release(format!("'{}': {e}", config.agent_version))
    })?;
    Ok(config
        .agent_release_url
        .replace("{version}", &version.to_string()))
}

/// Fetch `url` to `dest` with curl, falling back to wget.
pub fn download_command(url: &str, dest: &str) -> String {
    let (url, dest) = (quote(url), quote(dest));
    format!(
        "if command -v curl >/dev/null 2>&1; then curl -L -f -sS -o {dest} {url}; \
         elif command -v wget >/dev/null 2>&1; then wget -q -O {dest} {url}; \
         else echo 'neither curl nor wget found' >&2; exit 1; fi"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::fixtures;

    #[test]
    fn config_enables_tls_only_with_cert_and_key() {
        let mut node = fixtures::node("n1", "203.0.113.1");
        let plain = AgentConfigFile::for_node(&node, "info");
        assert!(plain.security.is_none());
        assert!(!plain.to_yaml().unwrap().contains("security"));

        node.agent.cert = Some("cert".into());
        node.agent.key = Some("key".into());
        let yaml = AgentConfigFile::for_node(&node, "debug").to_yaml().unwrap();
        let parsed: AgentConfigFile = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.server.port, 8083);
        assert_eq!(parsed.log.level, "debug");
        assert_eq!(parsed.security.unwrap().cert_file, CERT_PATH);
    }

    #[test]
    fn unit_runs_agent_with_config() {
        let unit = unit_file();
        assert!(unit.contains("ExecStart=/usr/local/bin/trellis-agent -config /etc/trellis-agent/config.yaml"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }

    #[test]
    fn release_url_requires_semver() {
        let mut config = ProvisionConfig::default();
        config.agent_version = "1.2.3".into();
        config.agent_release_url = "https://example.invalid/v{version}/agent".into();
        assert_eq!(release_url(&config).unwrap(), "https://example.invalid/v1.2.3/agent");

        config.agent_version = "nightly".into();
        assert!(matches!(release_url(&config), Err(ProvisionError::Release(_))));
    }
}
