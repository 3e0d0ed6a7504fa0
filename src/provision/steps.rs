//! Workflows executed by the provisioner, one per stage.

use crate::config::{OverlayConfig, ProvisionConfig};
use crate::domain::node::Node;
use crate::error::ProvisionError;
use crate::remote::quote;
use crate::workflow::{Step, Workflow};

use super::agent::{self, AgentConfigFile};

const DOCKER_SCRIPT_PATH: &str = "/tmp/trellis-install-docker.sh";
const DOCKER_DAEMON_CONFIG: &str = "/etc/docker/daemon.json";
const DOCKER_ABSENT: &str = "! command -v docker >/dev/null 2>&1";

pub fn dependencies() -> Workflow {
    let install = "if command -v apt-get >/dev/null 2>&1; then \
         export DEBIAN_FRONTEND=noninteractive; \
         apt-get update -y && apt-get install -y curl wget wireguard wireguard-tools; \
         elif command -v dnf >/dev/null 2>&1; then dnf install -y curl wget wireguard-tools; \
         elif command -v yum >/dev/null 2>&1; then \
         yum install -y epel-release && yum install -y curl wget wireguard-tools; \
         else echo 'no supported package manager found' >&2; exit 1; fi";

    Workflow::new(
        "Install dependencies",
        vec![
            Step::run("Install base packages", install),
            Step::run("Verify wireguard tools", "command -v wg && command -v wg-quick"),
        ],
    )
}

pub fn agent(node: &Node, config: &ProvisionConfig) -> Result<Workflow, ProvisionError> {
    let agent_config = AgentConfigFile::for_node(node, &config.agent_log_level).to_yaml()?;
    let service = agent::SERVICE;

    let install_binary = match config.agent_binary {
        Some(ref local) => Step::copy_file(
            "Upload agent binary",
            local.clone(),
            agent::BINARY_PATH,
            0o755,
        ),
        None => Step::run(
            "Download agent binary",
            agent::download_command(&agent::release_url(config)?, agent::BINARY_PATH),
        ),
    };

    let mut steps = vec![
        Step::run("Stop existing agent", format!("systemctl stop {service}")).ignoring_failure(),
        install_binary,
        Step::run(
            "Make agent executable",
            format!("chmod 0755 {}", quote(agent::BINARY_PATH)),
        ),
    ];

    if let (Some(cert), Some(key)) = (node.agent.cert.as_ref(), node.agent.key.as_ref()) {
        steps.push(Step::write_file(
            "Write agent certificate",
            cert.clone(),
            agent::CERT_PATH,
            0o644,
        ));
        steps.push(Step::write_file(
            "Write agent key",
            key.clone(),
            agent::KEY_PATH,
            0o600,
        ));
    }

    steps.extend([
        Step::write_file("Write agent config", agent_config, agent::CONFIG_PATH, 0o644),
        Step::write_file("Write agent unit", agent::unit_file(), agent::UNIT_PATH, 0o644),
        Step::run("Reload systemd", "systemctl daemon-reload"),
        Step::run("Enable agent", format!("systemctl enable {service}")),
        Step::run("Restart agent", format!("systemctl restart {service}")),
    ]);

    Ok(Workflow::new("Install management agent", steps))
}

pub fn docker() -> Workflow {
    let script = "#!/bin/sh\n\
                  set -e\n\
                  if command -v curl >/dev/null 2>&1; then\n\
                  \x20 curl -fsSL https://get.docker.com -o /tmp/get-docker.sh\n\
                  else\n\
                  \x20 wget -qO /tmp/get-docker.sh https://get.docker.com\n\
                  fi\n\
                  sh /tmp/get-docker.sh\n\
                  rm -f /tmp/get-docker.sh\n\
                  systemctl enable --now docker\n";

    Workflow::new(
        "Install Docker",
        vec![
            Step::write_file("Write Docker install script", script, DOCKER_SCRIPT_PATH, 0o755)
                .when(DOCKER_ABSENT),
            Step::run("Run Docker install script", format!("sh {DOCKER_SCRIPT_PATH}"))
                .when(DOCKER_ABSENT),
            Step::run(
                "Remove Docker install script",
                format!("rm -f {DOCKER_SCRIPT_PATH}"),
            )
            .ignoring_failure(),
        ],
    )
}

pub fn docker_mtu(mtu: u32) -> Result<Workflow, ProvisionError> {
    let daemon_json = serde_json::to_string_pretty(&serde_json::json!({ "mtu": mtu }))
        .map_err(|e| ProvisionError::Render(format!("docker daemon config: {e}")))?;

    Ok(Workflow::new(
        "Configure Docker MTU",
        vec![
            Step::write_file("Write daemon.json", daemon_json, DOCKER_DAEMON_CONFIG, 0o644),
            Step::run("Restart Docker", "systemctl restart docker"),
        ],
    ))
}

/// Bring up the overlay interface with `config` as its wg-quick file.
pub fn interface(config: String, overlay: &OverlayConfig) -> Workflow {
    let service = overlay.service();
    Workflow::new(
        "Configure WireGuard interface",
        vec![
            Step::write_file("Write interface config", config, overlay.config_path(), 0o600),
            Step::run("Enable interface", format!("systemctl enable {service}")),
            Step::run("Restart interface", format!("systemctl restart {service}")),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Action;

    #[test]
    fn docker_install_is_conditional_and_cleaned_up() {
        let wf = docker();
        let steps = wf.steps();
        assert_eq!(steps[0].condition.as_deref(), Some(DOCKER_ABSENT));
        assert_eq!(steps[1].condition.as_deref(), Some(DOCKER_ABSENT));
        assert!(steps[2].condition.is_none());
        assert!(steps[2].ignore_failure);
    }

    #[test]
    fn mtu_is_written_as_json() {
        let wf = docker_mtu(1420).unwrap();
        match &wf.steps()[0].action {
            Action::WriteFile { content, dest, .. } => {
                assert_eq!(dest, DOCKER_DAEMON_CONFIG);
                let value: serde_json::Value = serde_json::from_str(content).unwrap();
                assert_eq!(value["mtu"], 1420);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn agent_certificates_are_written_when_present() {
        let mut node = crate::domain::node::fixtures::node("n1", "203.0.113.1");
        let config = ProvisionConfig::default();
        let without = agent(&node, &config).unwrap();
        assert!(!without.steps().iter().any(|s| s.name == "Write agent key"));

        node.agent.cert = Some("cert".into());
        node.agent.key = Some("key".into());
        let with = agent(&node, &config).unwrap();
        let key = with
            .steps()
            .iter()
            .find(|s| s.name == "Write agent key")
            .unwrap();
        assert!(matches!(key.action, Action::WriteFile { mode: 0o600, .. }));
        assert!(with.steps()[0].ignore_failure);
    }

    #[test]
    fn local_agent_binary_is_uploaded_instead_of_downloaded() {
        let node = crate::domain::node::fixtures::node("n1", "203.0.113.1");
        let config = ProvisionConfig {
            agent_binary: Some("/opt/dist/trellis-agent".into()),
            ..Default::default()
        };
        let wf = agent(&node, &config).unwrap();
        assert!(matches!(
            wf.steps()[1].action,
            Action::CopyFile { ref dest, mode: 0o755, .. } if dest == agent::BINARY_PATH
        ));
        assert!(!wf.steps().iter().any(|s| s.name == "Download agent binary"));
    }

    #[test]
    fn interface_config_is_private() {
        let wf = interface("[Interface]\n".into(), &OverlayConfig::default());
        assert!(matches!(
            wf.steps()[0].action,
            Action::WriteFile { ref dest, mode: 0o600, .. } if dest == "/etc/wireguard/wg0.conf"
        ));
    }
}
