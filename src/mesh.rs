//! Full-mesh WireGuard synchronizer.
//!
//! Every valid peer gets a complete wg-quick config listing all other peers.
//! Sync runs are serialized; requests made while one is running collapse
//! into at most one follow-up run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_graphql::SimpleObject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OverlayConfig;
use crate::domain::node::Node;
use crate::error::{ExecError, StoreError};
use crate::overlay::{fingerprint, mesh_members, render_mesh_config};
use crate::remote::Connector;
use crate::store::NodeRepository;

#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct PeerSync {
    pub node_id: String,
    pub name: String,
    pub internal_ip: String,
    /// SHA-256 of the rendered config, present on success.
    pub fingerprint: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct MeshReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub peers: Vec<PeerSync>,
    /// Nodes without a complete overlay identity.
    pub skipped: Vec<String>,
    pub cancelled: bool,
}

impl MeshReport {
    pub fn synced(&self) -> usize {
        self.peers.iter().filter(|p| p.error.is_none()).count()
    }

    pub fn failed(&self) -> usize {
        self.peers.iter().filter(|p| p.error.is_some()).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct MeshStatus {
    pub running: bool,
    pub pending: bool,
    pub last: Option<MeshReport>,
}

/// Holds `running` high until dropped, including when the sync future is
/// dropped mid-run by a deadline or abort.
struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct MeshSynchronizer {
    nodes: Arc<dyn NodeRepository>,
    connector: Arc<dyn Connector>,
    overlay: OverlayConfig,
    run_lock: Mutex<()>,
    running: AtomicBool,
    pending: AtomicBool,
    notify: Notify,
    last: RwLock<Option<MeshReport>>,
}

impl MeshSynchronizer {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        connector: Arc<dyn Connector>,
        overlay: OverlayConfig,
    ) -> Self {
        Self {
            nodes,
            connector,
            overlay,
            run_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            notify: Notify::new(),
            last: RwLock::new(None),
        }
    }

    /// Ask the background worker for a sync. Returns immediately.
    pub fn request(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub async fn status(&self) -> MeshStatus {
        MeshStatus {
            running: self.running.load(Ordering::SeqCst),
            pending: self.pending.load(Ordering::SeqCst),
            last: self.last.read().await.clone(),
        }
    }

    /// Serve [`request`](Self::request) calls until `cancel` fires.
    pub async fn run_worker(self: Arc<Self>, cancel: CancellationToken) {
        info!("mesh sync worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => {}
            }
            if !self.pending.swap(false, Ordering::SeqCst) {
                continue;
            }
            if let Err(e) = self.sync_all(&cancel).await {
                warn!(error = %e, "mesh sync failed");
            }
        }
        info!("mesh sync worker stopped");
    }

    /// Push the current mesh to every valid peer, one at a time.
    pub async fn sync_all(&self, cancel: &CancellationToken) -> Result<MeshReport, StoreError> {
        let _guard = self.run_lock.lock().await;
        let running = RunningFlag::raise(&self.running);
        let result = self.sync_locked(cancel).await;
        drop(running);

        let report = result?;
        *self.last.write().await = Some(report.clone());
        Ok(report)
    }

    async fn sync_locked(&self, cancel: &CancellationToken) -> Result<MeshReport, StoreError> {
        let started_at = Utc::now();
        let nodes = self.nodes.list().await?;
        let skipped: Vec<String> = nodes
            .iter()
            .filter(|n| !n.is_mesh_peer())
            .map(|n| n.id.clone())
            .collect();
        let members = mesh_members(nodes);
        let prefix = self.overlay.cidr.prefix_len();

        info!(peers = members.len(), skipped = skipped.len(), "mesh sync started");

        let mut peers = Vec::with_capacity(members.len());
        let mut cancelled = false;
        for node in &members {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let Some(config) =
                render_mesh_config(node, &members, prefix, self.overlay.keepalive_secs)
            else {
                continue;
            };
            let fp = fingerprint(&config);
            let internal_ip = node
                .overlay
                .internal_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default();

            match self.push(node, &config).await {
                Ok(()) => {
                    debug!(node = %node.id, fingerprint = %fp, "mesh config applied");
                    peers.push(PeerSync {
                        node_id: node.id.clone(),
                        name: node.name.clone(),
                        internal_ip,
                        fingerprint: Some(fp),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(node = %node.id, error = %e, "mesh config push failed");
                    peers.push(PeerSync {
                        node_id: node.id.clone(),
                        name: node.name.clone(),
                        internal_ip,
                        fingerprint: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let report = MeshReport {
            started_at,
            finished_at: Utc::now(),
            peers,
            skipped,
            cancelled,
        };
        info!(
            synced = report.synced(),
            failed = report.failed(),
            cancelled = report.cancelled,
            "mesh sync finished"
        );
        Ok(report)
    }

    async fn push(&self, node: &Node, config: &str) -> Result<(), ExecError> {
        let exec = self.connector.connect(node).await?;
        let result = async {
            exec.write_file(&self.overlay.config_path(), config.as_bytes(), 0o600)
                .await?;
            exec.run_checked(&format!("systemctl restart {}", self.overlay.service()))
                .await?;
            Ok::<(), ExecError>(())
        }
        .await;
        exec.close().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::node::fixtures::{mesh_node, node};
    use crate::remote::fake::{FakeConnector, FakeState};
    use crate::store::MemoryStore;

    async fn setup() -> (Arc<MeshSynchronizer>, Arc<FakeState>) {
        let store = Arc::new(MemoryStore::new());
        store.create(mesh_node("a", "203.0.113.1", [10, 0, 0, 2], 1)).await.unwrap();
        store.create(mesh_node("b", "203.0.113.2", [10, 0, 0, 3], 2)).await.unwrap();
        store.create(mesh_node("c", "203.0.113.3", [10, 0, 0, 4], 3)).await.unwrap();
        store.create(node("fresh", "203.0.113.9")).await.unwrap();

        let state = FakeState::new();
        let mesh = Arc::new(MeshSynchronizer::new(
            store,
            Arc::new(FakeConnector::new(state.clone())),
            OverlayConfig::default(),
        ));
        (mesh, state)
    }

    #[tokio::test]
    async fn every_peer_gets_the_other_peers() {
        let (mesh, state) = setup().await;
        let report = mesh.sync_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.synced(), 3);
        assert_eq!(report.skipped, vec!["fresh".to_string()]);
        for id in ["a", "b", "c"] {
            let config = state.file(id, "/etc/wireguard/wg0.conf").unwrap();
            assert_eq!(config.matches("[Peer]").count(), 2);
            assert!(state.ran(id, "systemctl restart wg-quick@wg0"));
            assert_eq!(state.files(id)[0].mode, 0o600);
        }
        assert!(state.files("fresh").is_empty());
    }

    #[tokio::test]
    async fn one_unreachable_peer_does_not_stop_the_rest() {
        let (mesh, state) = setup().await;
        state.unreachable("b");
        let report = mesh.sync_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.synced(), 2);
        assert_eq!(report.failed(), 1);
        let failed = report.peers.iter().find(|p| p.error.is_some()).unwrap();
        assert_eq!(failed.node_id, "b");
        assert!(state.file("c", "/etc/wireguard/wg0.conf").is_some());
    }

    #[tokio::test]
    async fn repeated_sync_is_byte_identical() {
        let (mesh, _state) = setup().await;
        let first = mesh.sync_all(&CancellationToken::new()).await.unwrap();
        let second = mesh.sync_all(&CancellationToken::new()).await.unwrap();
        let prints = |r: &MeshReport| -> Vec<Option<String>> {
            r.peers.iter().map(|p| p.fingerprint.clone()).collect()
        };
        assert_eq!(prints(&first), prints(&second));
    }

    #[tokio::test]
    async fn cancelled_sync_stops_between_peers() {
        let (mesh, state) = setup().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = mesh.sync_all(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert!(report.peers.is_empty());
        assert!(state.files("a").is_empty());
    }

    #[tokio::test]
    async fn abandoned_sync_is_not_reported_as_running() {
        let (mesh, state) = setup().await;
        state.delay("systemctl restart", Duration::from_secs(5));

        let cancel = CancellationToken::new();
        let sync = mesh.sync_all(&cancel);
        let outcome = tokio::time::timeout(Duration::from_millis(200), sync).await;
        assert!(outcome.is_err());

        let status = mesh.status().await;
        assert!(!status.running);
        assert!(status.last.is_none());
    }

    #[tokio::test]
    async fn burst_of_requests_runs_once() {
        let (mesh, state) = setup().await;
        for _ in 0..5 {
            mesh.request();
        }
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&mesh).run_worker(cancel.clone()));

        for _ in 0..200 {
            if mesh.status().await.last.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(state.files("a").len(), 1);
        assert!(!mesh.status().await.pending);
    }
}
