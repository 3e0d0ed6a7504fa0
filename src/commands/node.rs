//! `trellis node …` — manage fleet nodes through the daemon.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

use super::output::{agent_badge, connection_badge, print_output};
use crate::domain::node::{NewNode, NodeView};

#[derive(Subcommand)]
pub enum NodeCommands {
    /// List all nodes
    List,
    /// Show one node
    Show {
        /// Node id
        id: String,
    },
    /// Register a node and check its SSH connection
    Add(AddArgs),
    /// Forget a node (remote state is left untouched)
    Remove {
        /// Node id
        id: String,
    },
    /// Start provisioning a connected node
    Provision {
        /// Node id
        id: String,
    },
    /// Cancel a running provisioning task
    Cancel {
        /// Node id
        id: String,
    },
    /// Re-check the SSH connection
    Retry {
        /// Node id
        id: String,
    },
    /// Show the provisioning log
    Logs {
        /// Node id
        id: String,
        /// 1-based page
        #[arg(long)]
        page: Option<usize>,
        /// Lines per page
        #[arg(long)]
        page_size: Option<usize>,
    },
}

#[derive(Args)]
pub struct AddArgs {
    /// Display name
    #[arg(long)]
    name: String,
    /// Public IP or hostname
    #[arg(long)]
    address: String,
    /// SSH port
    #[arg(long)]
    port: Option<u16>,
    /// SSH user
    #[arg(long, default_value = "root")]
    user: String,
    /// SSH password
    #[arg(long)]
    password: Option<String>,
    /// Path to an SSH private key
    #[arg(long)]
    key_file: Option<PathBuf>,
    /// Management agent port
    #[arg(long)]
    agent_port: Option<u16>,
    /// WireGuard listen port
    #[arg(long)]
    listen_port: Option<u16>,
    /// PEM certificate for the management agent
    #[arg(long, requires = "agent_key")]
    agent_cert: Option<PathBuf>,
    /// PEM key for the management agent
    #[arg(long, requires = "agent_cert")]
    agent_key: Option<PathBuf>,
    /// Start provisioning once the connection check passes
    #[arg(long)]
    provision: bool,
}

impl AddArgs {
    fn into_request(self) -> Result<NewNode> {
        if self.password.is_none() && self.key_file.is_none() {
            bail!("either --password or --key-file is required");
        }
        Ok(NewNode {
            name: self.name,
            address: self.address,
            ssh_port: self.port,
            username: self.user,
            password: self.password,
            private_key: read_optional(self.key_file.as_deref())?,
            agent_port: self.agent_port,
            listen_port: self.listen_port,
            agent_cert: read_optional(self.agent_cert.as_deref())?,
            agent_key: read_optional(self.agent_key.as_deref())?,
            provision: self.provision,
        })
    }
}

fn read_optional(path: Option<&Path>) -> Result<Option<String>> {
    path.map(|p| std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display())))
        .transpose()
}

pub fn run(config_path: Option<&Path>, format: &str, command: NodeCommands) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(config_path, format, command))
}

async fn run_async(config_path: Option<&Path>, format: &str, command: NodeCommands) -> Result<()> {
    let client = super::client(config_path)?;

    match command {
        NodeCommands::List => {
            let nodes = client.nodes().await?;
            if format == "json" {
                return print_output(format, &nodes);
            }
            print_table(&nodes);
            Ok(())
        }
        NodeCommands::Show { id } => {
            let node = client.node(&id).await?;
            print_output(format, &node)
        }
        NodeCommands::Add(args) => {
            let node = client.add_node(&args.into_request()?).await?;
            if format == "json" {
                return print_output(format, &node);
            }
            println!(
                "{} Added {} ({}) as {}: {}",
                "ok".green().bold(),
                node.name.bold(),
                node.address.dimmed(),
                node.id,
                connection_badge(node.connection)
            );
            Ok(())
        }
        NodeCommands::Remove { id } => {
            client.remove_node(&id).await?;
            println!("{} Removed {}", "ok".green().bold(), id);
            Ok(())
        }
        NodeCommands::Provision { id } => {
            let accepted = client.provision(&id).await?;
            if format == "json" {
                return print_output(format, &accepted);
            }
            println!(
                "{} Provisioning {} started, follow it with `trellis node logs {}`",
                ">>".blue().bold(),
                id,
                id
            );
            Ok(())
        }
        NodeCommands::Cancel { id } => {
            let result = client.cancel(&id).await?;
            if format == "json" {
                return print_output(format, &result);
            }
            if result.cancelled {
                println!("{} Cancellation requested for {}", "ok".green().bold(), id);
            } else {
                println!("{} No provisioning running for {}", "::".blue().bold(), id);
            }
            Ok(())
        }
        NodeCommands::Retry { id } => {
            let node = client.retry_connection(&id).await?;
            if format == "json" {
                return print_output(format, &node);
            }
            println!("{} {}", node.name.bold(), connection_badge(node.connection));
            Ok(())
        }
        NodeCommands::Logs {
            id,
            page,
            page_size,
        } => {
            let logs = client.logs(&id, page, page_size).await?;
            if format == "json" {
                return print_output(format, &logs);
            }
            for line in &logs.lines {
                println!("{}", line);
            }
            println!(
                "{}",
                format!(
                    "page {} ({} per page), {} lines total",
                    logs.page, logs.page_size, logs.total
                )
                .dimmed()
            );
            Ok(())
        }
    }
}

fn print_table(nodes: &[NodeView]) {
    if nodes.is_empty() {
        println!("{} No nodes registered", "::".blue().bold());
        return;
    }
    println!(
        "{:<34} {:<16} {:<22} {:<14} {:<13} {:<12} {}",
        "ID".bold(),
        "NAME".bold(),
        "ADDRESS".bold(),
        "CONNECTION".bold(),
        "AGENT".bold(),
        "OVERLAY".bold(),
        "ROLE".bold()
    );
    for node in nodes {
        println!(
            "{:<34} {:<16} {:<22} {:<14} {:<13} {:<12} {:?}",
            node.id,
            node.name,
            format!("{}:{}", node.address, node.ssh_port),
            connection_badge(node.connection),
            agent_badge(node.agent_status),
            node.internal_ip.as_deref().unwrap_or("-"),
            node.cluster_role
        );
    }
}
