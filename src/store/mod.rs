//! Repository contracts for nodes and monitoring data.
//!
//! The daemon uses [`memory::MemoryStore`], optionally backed by a JSON
//! snapshot file. Any other backend only has to implement these traits.

pub mod memory;
pub mod snapshot;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;

use crate::domain::monitoring::{Accident, AccidentQuery, Page, Ping, Stat};
use crate::domain::node::Node;
use crate::error::StoreError;

pub use memory::MemoryStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// In-place edit applied atomically by [`NodeRepository::mutate`].
pub type NodeEdit = Box<dyn FnOnce(&mut Node) + Send>;

/// Outcome of [`NodeRepository::claim_cluster_manager`].
#[derive(Debug, Clone)]
pub enum ManagerClaim {
    /// The caller is (now) the cluster manager.
    Claimed,
    /// Another node already holds the manager role.
    Existing(Node),
}

#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn create(&self, node: Node) -> Result<Node>;

    async fn get(&self, id: &str) -> Result<Node>;

    async fn list(&self) -> Result<Vec<Node>>;

    /// Replace a node if its revision still matches the stored one.
    async fn update(&self, node: Node) -> Result<Node>;

    /// Atomic read-modify-write of a single node.
    async fn mutate(&self, id: &str, edit: NodeEdit) -> Result<Node>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Assign the lowest free host address of `pool` to the node, skipping
    /// the first `reserved` hosts. A node that already holds an address in
    /// the pool keeps it.
    async fn claim_internal_ip(&self, id: &str, pool: Ipv4Net, reserved: usize) -> Result<Ipv4Addr>;

    /// Make the node the cluster manager unless another node already is.
    async fn claim_cluster_manager(&self, id: &str) -> Result<ManagerClaim>;
}

#[async_trait]
pub trait MonitoringRepository: Send + Sync {
    async fn save_ping(&self, ping: Ping) -> Result<()>;

    async fn save_stat(&self, stat: Stat) -> Result<()>;

    async fn save_accident(&self, accident: Accident) -> Result<()>;

    /// Pings of one node created at or after `since`, oldest first.
    async fn pings_since(&self, node_id: &str, since: DateTime<Utc>) -> Result<Vec<Ping>>;

    /// Latest pings of one node, newest first.
    async fn recent_pings(&self, node_id: &str, limit: usize) -> Result<Vec<Ping>>;

    /// Latest stats of one node, newest first.
    async fn stats(&self, node_id: &str, limit: usize) -> Result<Vec<Stat>>;

    async fn accidents(&self, query: &AccidentQuery) -> Result<Page<Accident>>;

    /// Delete every ping created strictly before `cutoff`. Returns the count.
    async fn delete_pings_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    async fn delete_accidents(&self, ids: &[String]) -> Result<usize>;
}
