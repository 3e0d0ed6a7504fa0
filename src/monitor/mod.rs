//! Monitoring worker: probe, aggregation and reconnect loops.

pub mod probe;
pub mod stats;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::domain::monitoring::{Accident, AccidentKind, Ping, PingOutcome};
use crate::domain::new_id;
use crate::domain::node::{ConnectionStatus, Node};
use crate::error::ProbeError;
use crate::remote::Connector;
use crate::store::{MonitoringRepository, NodeRepository};

pub use probe::Prober;

pub struct MonitoringWorker {
    nodes: Arc<dyn NodeRepository>,
    monitoring: Arc<dyn MonitoringRepository>,
    prober: Arc<dyn Prober>,
    connector: Arc<dyn Connector>,
    config: MonitorConfig,
}

impl MonitoringWorker {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        monitoring: Arc<dyn MonitoringRepository>,
        prober: Arc<dyn Prober>,
        connector: Arc<dyn Connector>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            nodes,
            monitoring,
            prober,
            connector,
            config,
        }
    }

    /// Run every loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            probe_interval_secs = self.config.probe_interval().as_secs(),
            aggregate_interval_secs = self.config.aggregate_interval().as_secs(),
            "monitoring worker started"
        );
        tokio::join!(
            self.probe_loop(cancel.clone()),
            self.aggregate_loop(cancel.clone()),
            self.reconnect_loop(cancel.clone()),
        );
        info!("monitoring worker stopped");
    }

    async fn probe_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.probe_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let probed = self.probe_cycle().await;
                    debug!(nodes = probed, "probe cycle finished");
                }
            }
        }
    }

    async fn aggregate_loop(&self, cancel: CancellationToken) {
        let period = self.config.aggregate_interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.aggregate_cycle().await,
            }
        }
    }

    async fn reconnect_loop(&self, cancel: CancellationToken) {
        let Some(period) = self.config.reconnect_interval() else {
            return;
        };
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.reconnect_cycle().await,
            }
        }
    }

    /// Probe every connected node concurrently. Returns how many were probed.
    pub async fn probe_cycle(&self) -> usize {
        let nodes = match self.nodes.list().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "probe cycle: listing nodes failed");
                return 0;
            }
        };

        let timeout = self.config.probe_timeout();
        let mut probes = JoinSet::new();
        for node in nodes.into_iter().filter(Node::is_connected) {
            let prober = Arc::clone(&self.prober);
            probes.spawn(async move {
                let started = Instant::now();
                let result = match tokio::time::timeout(timeout, prober.probe(&node)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProbeError::Timeout(timeout)),
                };
                (node, started.elapsed(), result)
            });
        }

        let mut probed = 0;
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((node, elapsed, result)) => {
                    probed += 1;
                    self.record(&node, elapsed, result).await;
                }
                Err(e) => warn!(error = %e, "probe task panicked"),
            }
        }
        probed
    }

    async fn record(&self, node: &Node, elapsed: Duration, result: Result<(), ProbeError>) {
        let response_time_ms = elapsed.as_millis() as u64;
        let now = Utc::now();

        let (ping, accident) = match result {
            Ok(()) => {
                let ping = Ping {
                    id: new_id(),
                    node_id: node.id.clone(),
                    response_time_ms,
                    outcome: PingOutcome::Ok,
                    error: None,
                    created_at: now,
                };
                let accident = (response_time_ms > self.config.latency_threshold_ms).then(|| {
                    Accident {
                        id: new_id(),
                        node_id: node.id.clone(),
                        response_time_ms,
                        kind: AccidentKind::HighLatency,
                        detail: format!(
                            "response time {response_time_ms}ms exceeds {}ms",
                            self.config.latency_threshold_ms
                        ),
                        resolved: false,
                        created_at: now,
                    }
                });
                (ping, accident)
            }
            Err(e) => {
                let detail = e.to_string();
                debug!(node = %node.id, error = %detail, "probe failed");
                let ping = Ping {
                    id: new_id(),
                    node_id: node.id.clone(),
                    response_time_ms,
                    outcome: PingOutcome::Error,
                    error: Some(detail.clone()),
                    created_at: now,
                };
                let accident = Accident {
                    id: new_id(),
                    node_id: node.id.clone(),
                    response_time_ms,
                    kind: AccidentKind::ConnectionFailure,
                    detail,
                    resolved: false,
                    created_at: now,
                };
                (ping, Some(accident))
            }
        };

        if let Err(e) = self.monitoring.save_ping(ping).await {
            warn!(node = %node.id, error = %e, "saving ping failed");
        }
        if let Some(accident) = accident {
            info!(node = %node.id, kind = ?accident.kind, detail = %accident.detail, "accident recorded");
            if let Err(e) = self.monitoring.save_accident(accident).await {
                warn!(node = %node.id, error = %e, "saving accident failed");
            }
        }
    }

    /// Compute one stat per node over the trailing window, then drop old pings.
    pub async fn aggregate_cycle(&self) {
        let now = Utc::now();
        let since = now - self.config.aggregate_window();

        match self.nodes.list().await {
            Ok(nodes) => {
                for node in nodes {
                    let pings = match self.monitoring.pings_since(&node.id, since).await {
                        Ok(pings) => pings,
                        Err(e) => {
                            warn!(node = %node.id, error = %e, "loading pings failed");
                            continue;
                        }
                    };
                    let Some(stat) = stats::aggregate(&node.id, &pings, now) else {
                        continue;
                    };
                    debug!(
                        node = %node.id,
                        avg_ms = stat.avg_response_time_ms,
                        success_rate = stat.success_rate,
                        "stat computed"
                    );
                    if let Err(e) = self.monitoring.save_stat(stat).await {
                        warn!(node = %node.id, error = %e, "saving stat failed");
                    }
                }
            }
            Err(e) => warn!(error = %e, "aggregation: listing nodes failed"),
        }

        let cutoff = now - self.config.retention();
        match self.monitoring.delete_pings_before(cutoff).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "expired pings deleted"),
            Err(e) => warn!(error = %e, "ping cleanup failed"),
        }
    }

    /// Retry disconnected nodes and mark the reachable ones connected.
    pub async fn reconnect_cycle(&self) {
        let nodes = match self.nodes.list().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "reconnect cycle: listing nodes failed");
                return;
            }
        };

        for node in nodes.into_iter().filter(|n| !n.is_connected()) {
            match self.connector.connect(&node).await {
                Ok(exec) => {
                    exec.close().await;
                    let marked = self
                        .nodes
                        .mutate(
                            &node.id,
                            Box::new(|n: &mut Node| n.connection = ConnectionStatus::Connected),
                        )
                        .await;
                    match marked {
                        Ok(_) => info!(node = %node.id, "node reconnected"),
                        Err(e) => warn!(node = %node.id, error = %e, "marking node connected failed"),
                    }
                }
                Err(e) => debug!(node = %node.id, error = %e, "node still unreachable"),
            }
        }
    }
}
