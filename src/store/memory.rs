//! MemoryStore — the daemon's repository, held in memory behind one lock.
//!
//! Every write happens under the write lock, so read-modify-write helpers
//! (`mutate`, address and manager claims) are atomic with respect to each
//! other. Nodes, stats and accidents are persisted to the snapshot file, if
//! one is configured, before a change becomes visible. Raw pings are only
//! kept in memory: they are aggregated into stats and expire within a day.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::snapshot::SnapshotFile;
use super::{ManagerClaim, MonitoringRepository, NodeEdit, NodeRepository, Result};
use crate::domain::monitoring::{page_offset, Accident, AccidentQuery, Page, Ping, Stat};
use crate::domain::node::{ClusterRole, Node};
use crate::error::StoreError;

/// The persisted part of the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    pub nodes: BTreeMap<String, Node>,
    #[serde(default)]
    pub stats: Vec<Stat>,
    #[serde(default)]
    pub accidents: Vec<Accident>,
}

impl Tables {
    fn node(&self, id: &str) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn node_mut(&mut self, id: &str) -> Result<&mut Node> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[derive(Default)]
struct State {
    tables: Tables,
    pings: Vec<Ping>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    snapshot: Option<SnapshotFile>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted at `path`, loading the existing snapshot.
    pub async fn open(path: PathBuf) -> anyhow::Result<Self> {
        let snapshot = SnapshotFile::new(path.clone());
        let tables = if snapshot.exists() {
            let tables = snapshot
                .read()
                .await
                .with_context(|| format!("loading snapshot {}", path.display()))?;
            info!(
                path = %path.display(),
                nodes = tables.nodes.len(),
                "loaded state snapshot"
            );
            tables
        } else {
            Tables::default()
        };

        Ok(Self {
            state: RwLock::new(State {
                tables,
                pings: Vec::new(),
            }),
            snapshot: Some(snapshot),
        })
    }

    /// Apply `edit` to the persisted tables. With a snapshot the edit runs on
    /// a copy that replaces the live tables only once it is on disk, so a
    /// failed write leaves memory as it was. Edits return errors before
    /// changing anything.
    async fn commit<T, F>(&self, state: &mut State, edit: F) -> Result<T>
    where
        F: FnOnce(&mut Tables) -> Result<T> + Send,
        T: Send,
    {
        let Some(ref snapshot) = self.snapshot else {
            return edit(&mut state.tables);
        };
        let mut next = state.tables.clone();
        let value = edit(&mut next)?;
        snapshot
            .write(&next)
            .await
            .map_err(|e| StoreError::Persist(format!("{e:#}")))?;
        state.tables = next;
        Ok(value)
    }
}

fn touch(node: &mut Node) {
    node.revision += 1;
    node.updated_at = Utc::now();
}

#[async_trait]
impl NodeRepository for MemoryStore {
    async fn create(&self, mut node: Node) -> Result<Node> {
        let mut state = self.state.write().await;
        self.commit(&mut state, move |tables| {
            if tables.nodes.contains_key(&node.id) {
                return Err(StoreError::Invalid(format!("node {} already exists", node.id)));
            }
            node.revision = 1;
            tables.nodes.insert(node.id.clone(), node.clone());
            Ok(node)
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Node> {
        self.state.read().await.tables.node(id).cloned()
    }

    async fn list(&self) -> Result<Vec<Node>> {
        Ok(self.state.read().await.tables.nodes.values().cloned().collect())
    }

    async fn update(&self, mut node: Node) -> Result<Node> {
        let mut state = self.state.write().await;
        self.commit(&mut state, move |tables| {
            let stored = tables.node_mut(&node.id)?;
            if stored.revision != node.revision {
                return Err(StoreError::Conflict {
                    id: node.id.clone(),
                    expected: node.revision,
                    found: stored.revision,
                });
            }
            touch(&mut node);
            *stored = node.clone();
            Ok(node)
        })
        .await
    }

    async fn mutate(&self, id: &str, edit: NodeEdit) -> Result<Node> {
        let mut state = self.state.write().await;
        self.commit(&mut state, move |tables| {
            let node = tables.node_mut(id)?;
            edit(node);
            touch(node);
            Ok(node.clone())
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        self.commit(&mut state, |tables| {
            if tables.nodes.remove(id).is_none() {
                return Err(StoreError::NotFound(id.to_string()));
            }
            tables.stats.retain(|s| s.node_id != id);
            tables.accidents.retain(|a| a.node_id != id);
            Ok(())
        })
        .await?;
        state.pings.retain(|p| p.node_id != id);
        Ok(())
    }

    async fn claim_internal_ip(
        &self,
        id: &str,
        pool: Ipv4Net,
        reserved: usize,
    ) -> Result<Ipv4Addr> {
        let mut state = self.state.write().await;

        let current = state.tables.node(id)?.overlay.internal_ip;
        if let Some(ip) = current.filter(|ip| pool.contains(ip)) {
            return Ok(ip);
        }

        let used: HashSet<Ipv4Addr> = state
            .tables
            .nodes
            .values()
            .filter(|n| n.id != id)
            .filter_map(|n| n.overlay.internal_ip)
            .collect();

        let ip = pool
            .hosts()
            .skip(reserved)
            .find(|candidate| !used.contains(candidate))
            .ok_or_else(|| StoreError::AddressPoolExhausted(pool.to_string()))?;

        self.commit(&mut state, |tables| {
            let node = tables.node_mut(id)?;
            node.overlay.internal_ip = Some(ip);
            touch(node);
            Ok(())
        })
        .await?;

        debug!(node = %id, ip = %ip, "claimed internal address");
        Ok(ip)
    }

    async fn claim_cluster_manager(&self, id: &str) -> Result<ManagerClaim> {
        let mut state = self.state.write().await;
        let role = state.tables.node(id)?.cluster_role;

        if let Some(manager) = state
            .tables
            .nodes
            .values()
            .find(|n| n.id != id && n.cluster_role == ClusterRole::Manager)
        {
            return Ok(ManagerClaim::Existing(manager.clone()));
        }

        if role != ClusterRole::Manager {
            self.commit(&mut state, |tables| {
                let node = tables.node_mut(id)?;
                node.cluster_role = ClusterRole::Manager;
                touch(node);
                Ok(())
            })
            .await?;
        }
        Ok(ManagerClaim::Claimed)
    }
}

#[async_trait]
impl MonitoringRepository for MemoryStore {
    async fn save_ping(&self, ping: Ping) -> Result<()> {
        self.state.write().await.pings.push(ping);
        Ok(())
    }

    async fn save_stat(&self, stat: Stat) -> Result<()> {
        let mut state = self.state.write().await;
        self.commit(&mut state, move |tables| {
            tables.stats.push(stat);
            Ok(())
        })
        .await
    }

    async fn save_accident(&self, accident: Accident) -> Result<()> {
        let mut state = self.state.write().await;
        self.commit(&mut state, move |tables| {
            tables.accidents.push(accident);
            Ok(())
        })
        .await
    }

    async fn pings_since(&self, node_id: &str, since: DateTime<Utc>) -> Result<Vec<Ping>> {
        let state = self.state.read().await;
        let mut pings: Vec<Ping> = state
            .pings
            .iter()
            .filter(|p| p.node_id == node_id && p.created_at >= since)
            .cloned()
            .collect();
        pings.sort_by_key(|p| p.created_at);
        Ok(pings)
    }

    async fn recent_pings(&self, node_id: &str, limit: usize) -> Result<Vec<Ping>> {
        let state = self.state.read().await;
        let mut pings: Vec<Ping> = state
            .pings
            .iter()
            .filter(|p| p.node_id == node_id)
            .cloned()
            .collect();
        pings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        pings.truncate(limit);
        Ok(pings)
    }

    async fn stats(&self, node_id: &str, limit: usize) -> Result<Vec<Stat>> {
        let state = self.state.read().await;
        let mut stats: Vec<Stat> = state
            .tables
            .stats
            .iter()
            .filter(|s| s.node_id == node_id)
            .cloned()
            .collect();
        stats.sort_by(|a, b| b.computed_at.cmp(&a.computed_at));
        stats.truncate(limit);
        Ok(stats)
    }

    async fn accidents(&self, query: &AccidentQuery) -> Result<Page<Accident>> {
        let state = self.state.read().await;
        let mut matching: Vec<&Accident> = state
            .tables
            .accidents
            .iter()
            .filter(|a| query.matches(a))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let (page, page_size) = query.paging();
        let items = matching
            .iter()
            .skip(page_offset(page, page_size))
            .take(page_size)
            .map(|a| (*a).clone())
            .collect();

        Ok(Page {
            items,
            total: matching.len() as u64,
            page: page as u64,
            page_size: page_size as u64,
        })
    }

    async fn delete_pings_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let before = state.pings.len();
        state.pings.retain(|p| p.created_at >= cutoff);
        Ok(before - state.pings.len())
    }

    async fn delete_accidents(&self, ids: &[String]) -> Result<usize> {
        let mut state = self.state.write().await;
        let removed = state
            .tables
            .accidents
            .iter()
            .filter(|a| ids.contains(&a.id))
            .count();
        if removed > 0 {
            self.commit(&mut state, |tables| {
                tables.accidents.retain(|a| !ids.contains(&a.id));
                Ok(())
            })
            .await?;
        }
        Ok(removed)
    }
}
