//! Fleet service: the operations the REST, GraphQL and CLI surfaces call.
//!
//! Provisioning runs as a supervised task per node; everything else answers
//! from the repositories directly.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::domain::monitoring::{Accident, AccidentQuery, Page, Ping, Stat};
use crate::domain::new_id;
use crate::domain::node::{ConnectionStatus, NewNode, Node, NodeView};
use crate::error::{ExecError, FleetError, ProvisionError, StoreError};
use crate::mesh::{MeshReport, MeshStatus, MeshSynchronizer};
use crate::node_log::{self, LogPage};
use crate::provision::Provisioner;
use crate::remote::Connector;
use crate::store::{MonitoringRepository, NodeRepository};
use crate::tasks::TaskSupervisor;

pub const DEFAULT_STATS_LIMIT: usize = 100;
pub const DEFAULT_PINGS_LIMIT: usize = 50;

const HELLO: &str = "hello";

pub struct FleetService {
    nodes: Arc<dyn NodeRepository>,
    monitoring: Arc<dyn MonitoringRepository>,
    connector: Arc<dyn Connector>,
    provisioner: Arc<Provisioner>,
    mesh: Arc<MeshSynchronizer>,
    supervisor: TaskSupervisor,
    data_dir: PathBuf,
}

impl FleetService {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        monitoring: Arc<dyn MonitoringRepository>,
        connector: Arc<dyn Connector>,
        provisioner: Arc<Provisioner>,
        mesh: Arc<MeshSynchronizer>,
        supervisor: TaskSupervisor,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            nodes,
            monitoring,
            connector,
            provisioner,
            mesh,
            supervisor,
            data_dir,
        }
    }

    /// Register a node, check its connection and optionally start provisioning.
    pub async fn add_node(&self, req: NewNode) -> Result<NodeView, FleetError> {
        let provision = req.provision;
        let node = self.nodes.create(Node::new(new_id(), req)?).await?;
        info!(node = %node.id, name = %node.name, address = %node.address, "node added");

        let node = self.check_connection(node).await?;
        if provision {
            if node.is_connected() {
                self.provision(&node.id)?;
            } else {
                warn!(node = %node.id, "skipping provisioning, node is not reachable");
            }
        }
        Ok(node.view())
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeView>, FleetError> {
        let mut nodes = self.nodes.list().await?;
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(nodes.iter().map(Node::view).collect())
    }

    pub async fn get_node(&self, id: &str) -> Result<NodeView, FleetError> {
        Ok(self.nodes.get(id).await?.view())
    }

    /// Forget a node. Remote state is left as is; the remaining peers drop it
    /// on the next mesh sync.
    pub async fn remove_node(&self, id: &str) -> Result<(), FleetError> {
        if self.supervisor.cancel(id) {
            info!(node = %id, "cancelled provisioning of removed node");
        }
        self.nodes.delete(id).await?;
        info!(node = %id, "node removed");
        self.mesh.request();
        Ok(())
    }

    pub async fn retry_connection(&self, id: &str) -> Result<NodeView, FleetError> {
        let node = self.nodes.get(id).await?;
        Ok(self.check_connection(node).await?.view())
    }

    async fn check_connection(&self, node: Node) -> Result<Node, FleetError> {
        let status = match self.say_hello(&node).await {
            Ok(()) => ConnectionStatus::Connected,
            Err(e) => {
                warn!(node = %node.id, error = %e, "connection check failed");
                ConnectionStatus::Disconnected
            }
        };
        info!(node = %node.id, status = ?status, "connection checked");
        let updated = self
            .nodes
            .mutate(&node.id, Box::new(move |n: &mut Node| n.connection = status))
            .await?;
        Ok(updated)
    }

    async fn say_hello(&self, node: &Node) -> Result<(), ExecError> {
        let exec = self.connector.connect(node).await?;
        let result = exec.run_checked(&format!("echo '{HELLO}'")).await;
        exec.close().await;
        let output = result?;
        if output != HELLO {
            return Err(ExecError::Command {
                command: "echo".to_string(),
                status: 0,
                stderr: format!("unexpected greeting {output:?}"),
            });
        }
        Ok(())
    }

    /// Start provisioning in the background. Fails if the node is unknown,
    /// not connected, or already being provisioned.
    pub async fn start_provisioning(&self, id: &str) -> Result<(), FleetError> {
        let node = self.nodes.get(id).await?;
        if !node.is_connected() {
            return Err(ProvisionError::NotConnected(id.to_string()).into());
        }
        self.provision(id)
    }

    fn provision(&self, id: &str) -> Result<(), FleetError> {
        let provisioner = Arc::clone(&self.provisioner);
        let node_id = id.to_string();
        self.supervisor.spawn(id, move |cancel| async move {
            // The outcome is recorded on the node and in its log.
            let _ = provisioner.run(&node_id, cancel).await;
        })?;
        info!(node = %id, "provisioning scheduled");
        Ok(())
    }

    /// Returns whether a running provisioning task was asked to stop.
    pub fn cancel_provisioning(&self, id: &str) -> bool {
        self.supervisor.cancel(id)
    }

    pub fn is_provisioning(&self, id: &str) -> bool {
        self.supervisor.is_running(id)
    }

    pub async fn node_logs(
        &self,
        id: &str,
        page: Option<usize>,
        page_size: Option<usize>,
    ) -> Result<LogPage, FleetError> {
        self.nodes.get(id).await?;
        Ok(node_log::read_page(&self.data_dir, id, page, page_size).await?)
    }

    pub async fn stats(&self, id: &str, limit: Option<usize>) -> Result<Vec<Stat>, FleetError> {
        self.nodes.get(id).await?;
        let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_STATS_LIMIT);
        Ok(self.monitoring.stats(id, limit).await?)
    }

    pub async fn pings(&self, id: &str, limit: Option<usize>) -> Result<Vec<Ping>, FleetError> {
        self.nodes.get(id).await?;
        let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_PINGS_LIMIT);
        Ok(self.monitoring.recent_pings(id, limit).await?)
    }

    pub async fn accidents(&self, query: &AccidentQuery) -> Result<Page<Accident>, FleetError> {
        Ok(self.monitoring.accidents(query).await?)
    }

    pub async fn delete_accident(&self, id: &str) -> Result<(), FleetError> {
        let removed = self.monitoring.delete_accidents(&[id.to_string()]).await?;
        if removed == 0 {
            return Err(StoreError::AccidentNotFound(id.to_string()).into());
        }
        Ok(())
    }

    pub async fn delete_accidents(&self, ids: &[String]) -> Result<usize, FleetError> {
        let removed = self.monitoring.delete_accidents(ids).await?;
        info!(requested = ids.len(), removed, "accidents deleted");
        Ok(removed)
    }

    /// Run a mesh sync now and return its report.
    pub async fn sync_mesh(&self) -> Result<MeshReport, FleetError> {
        let cancel = self.supervisor.root().child_token();
        Ok(self.mesh.sync_all(&cancel).await?)
    }

    pub async fn mesh_status(&self) -> MeshStatus {
        self.mesh.status().await
    }
}
