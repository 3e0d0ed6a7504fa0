//! wg-quick configuration rendering.

use std::net::Ipv4Addr;

use sha2::{Digest, Sha256};

use crate::domain::node::Node;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub private_key: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub listen_port: u16,
}

impl InterfaceConfig {
    /// `None` unless the node has both a private key and an internal IP.
    pub fn for_node(node: &Node, prefix_len: u8) -> Option<Self> {
        Some(Self {
            private_key: node.overlay.private_key.clone()?,
            address: node.overlay.internal_ip?,
            prefix_len,
            listen_port: node.overlay.listen_port,
        })
    }

    pub fn to_wg_config(&self) -> String {
        format!(
            "[Interface]\n\
             PrivateKey = {}\n\
             Address = {}/{}\n\
             ListenPort = {}\n",
            self.private_key, self.address, self.prefix_len, self.listen_port
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ip: Ipv4Addr,
    pub persistent_keepalive: u16,
}

impl PeerConfig {
    pub fn for_node(node: &Node, persistent_keepalive: u16) -> Option<Self> {
        Some(Self {
            public_key: node.overlay.public_key.clone()?,
            endpoint: node.overlay_endpoint(),
            allowed_ip: node.overlay.internal_ip?,
            persistent_keepalive,
        })
    }

    pub fn to_wg_config(&self) -> String {
        format!(
            "[Peer]\n\
             PublicKey = {}\n\
             AllowedIPs = {}/32\n\
             Endpoint = {}\n\
             PersistentKeepalive = {}\n",
            self.public_key, self.allowed_ip, self.endpoint, self.persistent_keepalive
        )
    }
}

/// Nodes that can take part in the mesh, ordered by internal IP.
pub fn mesh_members(nodes: impl IntoIterator<Item = Node>) -> Vec<Node> {
    let mut members: Vec<Node> = nodes.into_iter().filter(Node::is_mesh_peer).collect();
    members.sort_by_key(|n| n.overlay.internal_ip);
    members
}

/// Full config for `node`: its interface plus one peer block per other member.
///
/// `members` must come from [`mesh_members`] so the output is deterministic.
pub fn render_mesh_config(
    node: &Node,
    members: &[Node],
    prefix_len: u8,
    keepalive: u16,
) -> Option<String> {
    let mut out = InterfaceConfig::for_node(node, prefix_len)?.to_wg_config();
    for peer in members.iter().filter(|m| m.id != node.id) {
        if let Some(peer) = PeerConfig::for_node(peer, keepalive) {
            out.push('\n');
            out.push_str(&peer.to_wg_config());
        }
    }
    Some(out)
}

pub fn fingerprint(config: &str) -> String {
    format!("sha256:{:x}", Sha256::digest(config.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::fixtures::{mesh_node, node};

    fn fleet() -> Vec<Node> {
        vec![
            mesh_node("c", "203.0.113.3", [10, 0, 0, 4], 3),
            mesh_node("a", "203.0.113.1", [10, 0, 0, 2], 1),
            mesh_node("b", "203.0.113.2", [10, 0, 0, 3], 2),
            node("fresh", "203.0.113.9"),
        ]
    }

    #[test]
    fn members_exclude_incomplete_nodes_and_sort_by_ip() {
        let members = mesh_members(fleet());
        let ids: Vec<&str> = members.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn each_node_gets_one_block_per_other_member() {
        let members = mesh_members(fleet());
        for member in &members {
            let config = render_mesh_config(member, &members, 24, 25).unwrap();
            assert_eq!(config.matches("[Interface]").count(), 1);
            assert_eq!(config.matches("[Peer]").count(), members.len() - 1);
            let own_ip = member.overlay.internal_ip.unwrap();
            assert!(config.contains(&format!("Address = {own_ip}/24")));
            assert!(!config.contains(&format!("AllowedIPs = {own_ip}/32")));
        }
    }

    #[test]
    fn three_node_scenario() {
        let members = mesh_members(fleet());
        let config = render_mesh_config(&members[0], &members, 24, 25).unwrap();
        assert!(config.starts_with("[Interface]\n"));
        assert!(config.contains("Address = 10.0.0.2/24\nListenPort = 51820\n"));
        assert!(config.contains("AllowedIPs = 10.0.0.3/32\nEndpoint = 203.0.113.2:51820\nPersistentKeepalive = 25\n"));
        assert!(config.contains("AllowedIPs = 10.0.0.4/32\nEndpoint = 203.0.113.3:51820\n"));
        let b = config.find("10.0.0.3/32").unwrap();
        let c = config.find("10.0.0.4/32").unwrap();
        assert!(b < c);
    }

    #[test]
    fn rendering_is_deterministic() {
        let mut shuffled = fleet();
        shuffled.reverse();
        let one = mesh_members(fleet());
        let two = mesh_members(shuffled);
        let a = render_mesh_config(&one[1], &one, 24, 25).unwrap();
        let b = render_mesh_config(&two[1], &two, 24, 25).unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn incomplete_node_renders_nothing() {
        let members = mesh_members(fleet());
        assert!(render_mesh_config(&node("fresh", "203.0.113.9"), &members, 24, 25).is_none());
    }
}
