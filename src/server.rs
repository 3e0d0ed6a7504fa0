use anyhow::{Context, Result};
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::graphql::{self, TrellisSchema};
use crate::api::rest::{self, AppState};
use crate::config::{Config, ProbeMode};
use crate::domain::fleet_service::FleetService;
use crate::mesh::MeshSynchronizer;
use crate::monitor::probe::{Prober, ShellProbe};
use crate::monitor::MonitoringWorker;
use crate::provision::Provisioner;
use crate::remote::{Connector, SshConnector};
use crate::store::{MemoryStore, MonitoringRepository, NodeRepository};
use crate::tasks::TaskSupervisor;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub async fn run(config: Config) -> Result<()> {
    // Init tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.daemon.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();

    let controller = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "trellis".to_string());
    info!(
        version = env!("CARGO_PKG_VERSION"),
        controller = %controller,
        data_dir = %config.daemon.data_dir.display(),
        "trellis daemon starting"
    );

    tokio::fs::create_dir_all(&config.daemon.data_dir)
        .await
        .with_context(|| format!("creating data dir {}", config.daemon.data_dir.display()))?;

    // Repository
    let store = if config.daemon.snapshot {
        let path = config.daemon.snapshot_path();
        let store = MemoryStore::open(path.clone())
            .await
            .with_context(|| format!("opening state snapshot {}", path.display()))?;
        info!(path = %path.display(), "state snapshot enabled");
        Arc::new(store)
    } else {
        warn!("state snapshot disabled, fleet state lives in memory only");
        Arc::new(MemoryStore::new())
    };
    let nodes: Arc<dyn NodeRepository> = store.clone();
    let monitoring: Arc<dyn MonitoringRepository> = store;

    // Services
    let connector: Arc<dyn Connector> = Arc::new(SshConnector::new(config.ssh.clone()));
    let supervisor = TaskSupervisor::new();
    let mesh = Arc::new(MeshSynchronizer::new(
        nodes.clone(),
        connector.clone(),
        config.overlay.clone(),
    ));
    let provisioner = Arc::new(Provisioner::new(
        nodes.clone(),
        connector.clone(),
        mesh.clone(),
        config.provision.clone(),
        config.overlay.clone(),
        config.daemon.data_dir.clone(),
    ));
    let fleet = Arc::new(FleetService::new(
        nodes.clone(),
        monitoring.clone(),
        connector.clone(),
        provisioner,
        mesh.clone(),
        supervisor.clone(),
        config.daemon.data_dir.clone(),
    ));
    let monitor = Arc::new(MonitoringWorker::new(
        nodes,
        monitoring,
        prober(&config, connector.clone()),
        connector,
        config.monitor.clone(),
    ));

    let app_state = AppState {
        fleet: fleet.clone(),
        controller: controller.clone(),
    };

    // Build GraphQL schema
    let schema = graphql::build_schema(fleet);

    // Build GraphQL sub-router with its own state
    let graphql_router = Router::new()
        .route("/graphql", get(graphql_playground).post(graphql_handler))
        .with_state(schema);

    // Build Axum router: REST (with AppState) + GraphQL (with schema state)
    let app = rest::router(app_state)
        .merge(graphql_router)
        .layer(TraceLayer::new_for_http());

    // Bind HTTP listener
    let http_addr = &config.daemon.http_addr;
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding to {}", http_addr))?;

    info!(addr = %http_addr, "HTTP server listening");

    // Background loops run under the supervisor's root token
    let root = supervisor.root();
    let mut loops = Vec::new();
    loops.push(tokio::spawn(mesh.clone().run_worker(root.child_token())));
    loops.push(tokio::spawn(monitor.run(root.child_token())));

    if config.mesh.sync_on_start {
        info!("requesting initial mesh sync");
        mesh.request();
    }

    // Run HTTP server with graceful shutdown
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("stopping background tasks");
    supervisor.shutdown(SHUTDOWN_GRACE).await;
    for handle in loops {
        if let Err(e) = handle.await {
            warn!(error = %e, "background loop ended abnormally");
        }
    }

    info!("trellis daemon stopped");
    Ok(())
}

fn prober(config: &Config, connector: Arc<dyn Connector>) -> Arc<dyn Prober> {
    match config.monitor.probe_mode {
        ProbeMode::Shell => Arc::new(ShellProbe::new(connector)),
        #[cfg(feature = "grpc")]
        ProbeMode::Agent => Arc::new(crate::monitor::probe::AgentProbe::new(
            config.monitor.probe_timeout(),
        )),
        #[cfg(not(feature = "grpc"))]
        ProbeMode::Agent => {
            warn!("agent probes need the grpc feature, falling back to shell probes");
            Arc::new(ShellProbe::new(connector))
        }
    }
}

async fn graphql_playground() -> Html<String> {
    Html(
        async_graphql::http::playground_source(
            async_graphql::http::GraphQLPlaygroundConfig::new("/graphql"),
        ),
    )
}

async fn graphql_handler(
    State(schema): State<TrellisSchema>,
    req: GraphQLRequest,
) -> GraphQLResponse {
    schema.execute(req.into_inner()).await.into()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, shutting down"); },
        _ = terminate => { info!("Received SIGTERM, shutting down"); },
    }
}
