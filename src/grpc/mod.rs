//! Management agent RPC client.

use std::time::Duration;

use chrono::Utc;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::debug;

use crate::domain::node::Node;
use crate::error::ProbeError;

pub mod proto {
    tonic::include_proto!("trellis.agent.v1");
}

use proto::agent_client::AgentClient;
use proto::PingRequest;

/// Open a channel to the node's agent. With a stored certificate the channel
/// uses TLS, trusting that certificate and expecting the node address as name.
pub async fn connect(node: &Node, timeout: Duration) -> Result<AgentClient<Channel>, ProbeError> {
    let tls = node.agent.cert.is_some();
    let scheme = if tls { "https" } else { "http" };
    let uri = format!("{scheme}://{}:{}", node.address, node.agent.port);

    let mut endpoint = Endpoint::from_shared(uri.clone())
        .map_err(|e| ProbeError::Rpc(format!("invalid agent uri {uri}: {e}")))?
        .connect_timeout(timeout)
        .timeout(timeout);

    if let Some(ref cert) = node.agent.cert {
        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(cert))
            .domain_name(node.address.clone());
        endpoint = endpoint
            .tls_config(tls)
            .map_err(|e| ProbeError::Rpc(format!("tls config: {e}")))?;
    }

    let channel = endpoint
        .connect()
        .await
        .map_err(|e| ProbeError::Rpc(format!("connecting to {uri}: {e}")))?;
    Ok(AgentClient::new(channel))
}

/// Call `Ping` and require an `OK` status.
pub async fn ping(node: &Node, timeout: Duration) -> Result<(), ProbeError> {
    let mut client = connect(node, timeout).await?;
    let response = client
        .ping(PingRequest {
            timestamp: Utc::now().timestamp(),
        })
        .await
        .map_err(|status| ProbeError::Rpc(status.message().to_string()))?
        .into_inner();

    debug!(node = %node.id, status = %response.status, "agent ping");
    if !response.status.eq_ignore_ascii_case("ok") {
        return Err(ProbeError::Rpc(format!("agent reported status {}", response.status)));
    }
    Ok(())
}
