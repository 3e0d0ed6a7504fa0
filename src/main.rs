mod api;
mod client;
mod commands;
mod config;
mod domain;
mod error;
#[cfg(feature = "grpc")]
mod grpc;
mod mesh;
mod monitor;
mod node_log;
mod overlay;
mod provision;
mod remote;
mod server;
mod store;
mod tasks;
mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "trellis",
    version,
    about = "Fleet control plane: SSH provisioning, swarm join, WireGuard mesh and health monitoring"
)]
struct Cli {
    /// Path to config file (default: ~/.config/trellis/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format (table or json)
    #[arg(long, global = true, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane daemon (REST + GraphQL + background workers)
    Daemon {
        /// HTTP listen address (overrides config)
        #[arg(long)]
        http_addr: Option<String>,

        /// Log level (overrides config)
        #[arg(long)]
        log_level: Option<String>,

        /// State and log directory (overrides config)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Manage fleet nodes
    Node {
        #[command(subcommand)]
        command: commands::node::NodeCommands,
    },

    /// WireGuard mesh synchronization
    Mesh {
        #[command(subcommand)]
        command: commands::mesh::MeshCommands,
    },

    /// Monitoring data: stats, pings and accidents
    Monitor {
        #[command(subcommand)]
        command: commands::monitor::MonitorCommands,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Daemon {
            http_addr,
            log_level,
            data_dir,
        } => commands::daemon::run(http_addr, log_level, data_dir, cli.config.clone()),
        Commands::Node { command } => commands::node::run(config, &cli.format, command),
        Commands::Mesh { command } => commands::mesh::run(config, &cli.format, command),
        Commands::Monitor { command } => commands::monitor::run(config, &cli.format, command),
    }
}
