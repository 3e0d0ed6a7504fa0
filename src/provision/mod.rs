//! Node provisioner: installs dependencies, the management agent and Docker,
//! brings up the overlay interface and joins the node to the swarm.
//!
//! Status moves installing → configuring → finalizing → success, or to
//! failed on the first fatal error. Partial remote state is left in place;
//! running the pipeline again converges it.

pub mod agent;
pub mod cluster;
pub mod steps;

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{OverlayConfig, ProvisionConfig};
use crate::domain::node::{AgentStatus, ClusterRole, Node};
use crate::error::{ProvisionError, StoreError, WorkflowError};
use crate::mesh::MeshSynchronizer;
use crate::node_log::NodeLog;
use crate::overlay::{keys, InterfaceConfig};
use crate::remote::{Connector, LogSink, NullSink, RemoteExecutor};
use crate::store::{ManagerClaim, NodeRepository};
use crate::workflow::{Engine, Workflow};

pub struct Provisioner {
    nodes: Arc<dyn NodeRepository>,
    connector: Arc<dyn Connector>,
    mesh: Arc<MeshSynchronizer>,
    engine: Engine,
    provision: ProvisionConfig,
    overlay: OverlayConfig,
    data_dir: PathBuf,
}

impl Provisioner {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        connector: Arc<dyn Connector>,
        mesh: Arc<MeshSynchronizer>,
        provision: ProvisionConfig,
        overlay: OverlayConfig,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            nodes,
            connector,
            mesh,
            engine: Engine::new(provision.scratch_dir()),
            provision,
            overlay,
            data_dir,
        }
    }

    /// Run the full pipeline for one node and record the outcome.
    pub async fn run(&self, node_id: &str, cancel: CancellationToken) -> Result<(), ProvisionError> {
        let sink: Box<dyn LogSink> = match NodeLog::open(&self.data_dir, node_id) {
            Ok(log) => Box::new(log),
            Err(e) => {
                warn!(node = %node_id, error = %e, "cannot open node log, continuing without it");
                Box::new(NullSink)
            }
        };

        info!(node = %node_id, "provisioning started");
        sink.line("provisioning started");

        let pipeline = self.pipeline(node_id, sink.as_ref(), &cancel);
        let result = match self.provision.deadline() {
            Some(limit) => tokio::time::timeout(limit, pipeline)
                .await
                .unwrap_or(Err(ProvisionError::DeadlineExceeded(limit))),
            None => pipeline.await,
        };

        match result {
            Ok(()) => {
                self.set_status(node_id, AgentStatus::Success).await?;
                sink.line("provisioning completed");
                info!(node = %node_id, "provisioning completed");
                self.mesh.request();
                Ok(())
            }
            Err(e) => {
                sink.line(&format!("provisioning failed: {e}"));
                warn!(node = %node_id, error = %e, "provisioning failed");
                if let Err(status_err) = self.set_status(node_id, AgentStatus::Failed).await {
                    warn!(node = %node_id, error = %status_err, "could not record failed status");
                }
                Err(e)
            }
        }
    }

    async fn pipeline(
        &self,
        node_id: &str,
        sink: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let node = self.nodes.get(node_id).await?;
        if !node.is_connected() {
            return Err(ProvisionError::NotConnected(node_id.to_string()));
        }
        self.set_status(node_id, AgentStatus::Installing).await?;

        sink.line(&format!("connecting to {}:{}", node.address, node.ssh_port));
        let exec = self.connector.connect(&node).await?;
        let result = self.stages(node, exec.as_ref(), sink, cancel).await;
        exec.close().await;
        result
    }

    async fn stages(
        &self,
        node: Node,
        exec: &dyn RemoteExecutor,
        sink: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        self.workflow(&steps::dependencies(), exec, sink, cancel).await?;
        self.workflow(&steps::agent(&node, &self.provision)?, exec, sink, cancel)
            .await?;
        self.workflow(&steps::docker(), exec, sink, cancel).await?;

        self.set_status(&node.id, AgentStatus::Configuring).await?;
        self.workflow(&steps::docker_mtu(self.provision.docker_mtu)?, exec, sink, cancel)
            .await?;
        let node = self.configure_overlay(&node.id, exec, sink, cancel).await?;

        self.set_status(&node.id, AgentStatus::Finalizing).await?;
        self.join_cluster(&node, exec, sink, cancel).await
    }

    async fn configure_overlay(
        &self,
        node_id: &str,
        exec: &dyn RemoteExecutor,
        sink: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<Node, ProvisionError> {
        check(cancel)?;
        sink.line("generating wireguard key pair");
        let private_key = exec
            .run_checked(&keys::keygen_command(&self.overlay.interface))
            .await?;
        let public_key = keys::public_key_from_private(&private_key)?;

        let ip = self
            .nodes
            .claim_internal_ip(node_id, self.overlay.cidr, self.overlay.reserved_hosts)
            .await?;
        sink.line(&format!("overlay address {ip}"));

        let node = self
            .nodes
            .mutate(
                node_id,
                Box::new(move |n: &mut Node| {
                    n.overlay.private_key = Some(private_key);
                    n.overlay.public_key = Some(public_key);
                }),
            )
            .await?;

        let interface = InterfaceConfig::for_node(&node, self.overlay.cidr.prefix_len())
            .ok_or_else(|| ProvisionError::Key("overlay identity incomplete".to_string()))?;
        self.workflow(
            &steps::interface(interface.to_wg_config(), &self.overlay),
            exec,
            sink,
            cancel,
        )
        .await?;
        Ok(node)
    }

    async fn join_cluster(
        &self,
        node: &Node,
        exec: &dyn RemoteExecutor,
        sink: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        check(cancel)?;
        let state = exec.run(cluster::state_command()).await?;
        if state.success() && cluster::is_active(&state.stdout) {
            sink.line("node is already part of a swarm");
            return Ok(());
        }

        let ip = node
            .overlay
            .internal_ip
            .ok_or_else(|| ProvisionError::Cluster("node has no overlay address".to_string()))?;

        match self.nodes.claim_cluster_manager(&node.id).await? {
            ManagerClaim::Claimed => {
                sink.line(&format!("initializing swarm on {ip}"));
                exec.run_checked(&cluster::init_command(ip))
                    .await
                    .map_err(|e| ProvisionError::Cluster(e.to_string()))?;
                info!(node = %node.id, ip = %ip, "swarm initialized");
            }
            ManagerClaim::Existing(manager) => {
                let manager_ip = manager.overlay.internal_ip.ok_or_else(|| {
                    ProvisionError::Cluster(format!("manager {} has no overlay address", manager.id))
                })?;

                sink.line("syncing mesh before joining");
                let report = self.mesh.sync_all(cancel).await?;
                if report.cancelled {
                    return Err(ProvisionError::Cancelled);
                }
                if let Some(failed) = report
                    .peers
                    .iter()
                    .find(|p| p.node_id == manager.id && p.error.is_some())
                {
                    sink.line(&format!(
                        "mesh sync to manager failed: {}",
                        failed.error.as_deref().unwrap_or_default()
                    ));
                }

                let token = self.join_token(&manager).await?;
                sink.line(&format!("joining swarm via {manager_ip}"));
                exec.run_checked(&cluster::join_command(&token, ip, manager_ip))
                    .await
                    .map_err(|e| ProvisionError::Cluster(e.to_string()))?;
                self.nodes
                    .mutate(&node.id, Box::new(|n: &mut Node| n.cluster_role = ClusterRole::Worker))
                    .await?;
                info!(node = %node.id, manager = %manager.id, "joined swarm");
            }
        }
        Ok(())
    }

    async fn join_token(&self, manager: &Node) -> Result<String, ProvisionError> {
        let exec = self.connector.connect(manager).await?;
        let token = exec.run_checked(cluster::join_token_command()).await;
        exec.close().await;
        let token = token.map_err(|e| ProvisionError::Cluster(e.to_string()))?;
        if token.is_empty() {
            return Err(ProvisionError::Cluster(format!(
                "manager {} returned an empty join token",
                manager.id
            )));
        }
        Ok(token)
    }

    async fn workflow(
        &self,
        workflow: &Workflow,
        exec: &dyn RemoteExecutor,
        sink: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        self.engine
            .run(workflow, exec, sink, cancel)
            .await
            .map_err(|e| match e {
                WorkflowError::Cancelled(_) => ProvisionError::Cancelled,
                other => ProvisionError::Workflow(other),
            })
    }

    async fn set_status(&self, node_id: &str, status: AgentStatus) -> Result<Node, StoreError> {
        self.nodes
            .mutate(node_id, Box::new(move |n: &mut Node| n.agent.status = status))
            .await
    }
}

fn check(cancel: &CancellationToken) -> Result<(), ProvisionError> {
    if cancel.is_cancelled() {
        return Err(ProvisionError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::config::ProvisionConfig;
    use crate::domain::node::fixtures;
    use crate::remote::fake::{FakeConnector, FakeState};
    use crate::store::MemoryStore;

    struct Harness {
        store: Arc<MemoryStore>,
        state: Arc<FakeState>,
        provisioner: Provisioner,
        dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let state = FakeState::new();
        // wg genkey output: a valid 32-byte key.
        state.on("cat '/etc/wireguard/wg0.key'", 0, "BwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwc=\n");
        state.on("docker info", 0, "inactive\n");
        state.on("join-token", 0, "SWMTKN-1-test\n");
        let connector = Arc::new(FakeConnector::new(state.clone()));
        let mesh = Arc::new(MeshSynchronizer::new(
            store.clone(),
            connector.clone(),
            OverlayConfig::default(),
        ));
        let provision = ProvisionConfig {
            scratch_dir: Some(dir.path().join("scratch")),
            ..Default::default()
        };
        let provisioner = Provisioner::new(
            store.clone(),
            connector,
            mesh,
            provision,
            OverlayConfig::default(),
            dir.path().to_path_buf(),
        );
        Harness {
            store,
            state,
            provisioner,
            dir,
        }
    }

    #[tokio::test]
    async fn first_node_becomes_manager() {
        let h = harness();
        h.store.create(fixtures::node("a", "203.0.113.1")).await.unwrap();

        h.provisioner.run("a", CancellationToken::new()).await.unwrap();

        let node = h.store.get("a").await.unwrap();
        assert_eq!(node.agent.status, AgentStatus::Success);
        assert_eq!(node.overlay.internal_ip, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(node.overlay.public_key.as_deref().map(str::len), Some(44));
        assert_eq!(node.cluster_role, ClusterRole::Manager);
        assert!(h.state.ran("a", "docker swarm init --advertise-addr 10.0.0.2 --data-path-addr 10.0.0.2"));

        let wg = h.state.file("a", "/etc/wireguard/wg0.conf").unwrap();
        assert!(wg.contains("Address = 10.0.0.2/24"));
        assert!(!wg.contains("[Peer]"));
        assert!(h.state.file("a", agent::UNIT_PATH).is_some());
    }

    #[tokio::test]
    async fn three_nodes_get_sequential_addresses_and_join_manager() {
        let h = harness();
        for (id, addr) in [("a", "203.0.113.1"), ("b", "203.0.113.2"), ("c", "203.0.113.3")] {
            h.store.create(fixtures::node(id, addr)).await.unwrap();
            h.provisioner.run(id, CancellationToken::new()).await.unwrap();
        }

        let ip = |id: &'static str| {
            let store = h.store.clone();
            async move { store.get(id).await.unwrap().overlay.internal_ip.unwrap() }
        };
        assert_eq!(ip("a").await, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ip("b").await, Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(ip("c").await, Ipv4Addr::new(10, 0, 0, 4));

        assert!(h.state.ran(
            "c",
            "docker swarm join --token 'SWMTKN-1-test' --advertise-addr 10.0.0.4 --data-path-addr 10.0.0.4 10.0.0.2:2377"
        ));
        assert!(h.state.ran("a", "docker swarm join-token -q worker"));
        assert_eq!(h.store.get("b").await.unwrap().cluster_role, ClusterRole::Worker);

        // The inline sync before c joined already included c.
        let on_a = h.state.file("a", "/etc/wireguard/wg0.conf").unwrap();
        assert_eq!(on_a.matches("[Peer]").count(), 2);
    }

    #[tokio::test]
    async fn failed_step_marks_node_failed() {
        let h = harness();
        h.state.on("apt-get", 100, "");
        h.store.create(fixtures::node("a", "203.0.113.1")).await.unwrap();

        let err = h.provisioner.run("a", CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Workflow(WorkflowError::StepFailed { .. })));

        let node = h.store.get("a").await.unwrap();
        assert_eq!(node.agent.status, AgentStatus::Failed);
        assert!(node.overlay.internal_ip.is_none());

        let log = std::fs::read_to_string(crate::node_log::path(h.dir.path(), "a")).unwrap();
        assert!(log.contains("provisioning failed"));
    }

    #[tokio::test]
    async fn unreachable_node_marks_failed() {
        let h = harness();
        h.state.unreachable("a");
        h.store.create(fixtures::node("a", "203.0.113.1")).await.unwrap();

        let err = h.provisioner.run("a", CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Exec(ref e) if e.is_connect()));
        assert_eq!(h.store.get("a").await.unwrap().agent.status, AgentStatus::Failed);
    }

    #[tokio::test]
    async fn active_swarm_member_skips_join() {
        let h = harness();
        h.state.on("docker info", 0, "active\n");
        h.store.create(fixtures::node("a", "203.0.113.1")).await.unwrap();

        h.provisioner.run("a", CancellationToken::new()).await.unwrap();
        assert!(!h.state.ran("a", "docker swarm init"));
        assert_eq!(h.store.get("a").await.unwrap().cluster_role, ClusterRole::None);
    }

    #[tokio::test]
    async fn cancellation_marks_failed() {
        let h = harness();
        h.store.create(fixtures::node("a", "203.0.113.1")).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.provisioner.run("a", cancel).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Cancelled));
        assert_eq!(h.store.get("a").await.unwrap().agent.status, AgentStatus::Failed);
    }
}
