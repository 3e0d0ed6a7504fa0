//! Docker Swarm commands.

use std::net::Ipv4Addr;

use crate::remote::quote;

pub const SWARM_PORT: u16 = 2377;

pub fn state_command() -> &'static str {
    "docker info --format '{{.Swarm.LocalNodeState}}'"
}

/// Whether `docker info` reports membership in a swarm.
pub fn is_active(state: &str) -> bool {
    state.trim() == "active"
}

pub fn init_command(internal_ip: Ipv4Addr) -> String {
    format!("docker swarm init --advertise-addr {internal_ip} --data-path-addr {internal_ip}")
}

pub fn join_token_command() -> &'static str {
    "docker swarm join-token -q worker"
}

pub fn join_command(token: &str, internal_ip: Ipv4Addr, manager_ip: Ipv4Addr) -> String {
    format!(
        "docker swarm join --token {} --advertise-addr {internal_ip} --data-path-addr {internal_ip} {manager_ip}:{SWARM_PORT}",
        quote(token.trim())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_targets_manager_overlay_address() {
        let cmd = join_command(
            "SWMTKN-1-abc\n",
            Ipv4Addr::new(10, 0, 0, 3),
            Ipv4Addr::new(10, 0, 0, 2),
        );
        assert_eq!(
            cmd,
            "docker swarm join --token 'SWMTKN-1-abc' --advertise-addr 10.0.0.3 --data-path-addr 10.0.0.3 10.0.0.2:2377"
        );
    }

    #[test]
    fn only_active_state_counts_as_member() {
        assert!(is_active("active\n"));
        assert!(!is_active("inactive"));
        assert!(!is_active("pending"));
    }
}
