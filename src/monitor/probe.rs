//! Liveness probes.

use std::sync::Arc;
#[cfg(feature = "grpc")]
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::node::Node;
use crate::error::ProbeError;
use crate::remote::Connector;

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, node: &Node) -> Result<(), ProbeError>;
}

/// Opens a shell session and runs `true`.
pub struct ShellProbe {
    connector: Arc<dyn Connector>,
}

impl ShellProbe {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl Prober for ShellProbe {
    async fn probe(&self, node: &Node) -> Result<(), ProbeError> {
        let exec = self.connector.connect(node).await?;
        let result = exec.run_checked("true").await;
        exec.close().await;
        result?;
        Ok(())
    }
}

/// Calls the management agent's `Ping` RPC.
#[cfg(feature = "grpc")]
pub struct AgentProbe {
    timeout: Duration,
}

#[cfg(feature = "grpc")]
impl AgentProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[cfg(feature = "grpc")]
#[async_trait]
impl Prober for AgentProbe {
    async fn probe(&self, node: &Node) -> Result<(), ProbeError> {
        crate::grpc::ping(node, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::fixtures;
    use crate::remote::fake::{FakeConnector, FakeState};

    #[tokio::test]
    async fn shell_probe_reports_connect_errors() {
        let state = FakeState::new();
        state.unreachable("down");
        let probe = ShellProbe::new(Arc::new(FakeConnector::new(state.clone())));

        probe.probe(&fixtures::node("up", "203.0.113.1")).await.unwrap();
        assert!(state.ran("up", "true"));
        assert_eq!(state.closed(), 1);

        let err = probe
            .probe(&fixtures::node("down", "203.0.113.2"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Connection refused"));
    }
}
