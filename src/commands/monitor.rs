//! `trellis monitor …` — query probe results, stats and accidents.

use std::path::Path;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use colored::Colorize;

use super::output::print_output;
use crate::domain::monitoring::{AccidentKind, AccidentQuery, PingOutcome};

#[derive(Subcommand)]
pub enum MonitorCommands {
    /// Aggregated latency statistics of a node, newest first
    Stats {
        /// Node id
        node: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Raw probe results of a node, newest first
    Pings {
        /// Node id
        node: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List accidents
    Accidents {
        /// Only this node
        #[arg(long)]
        node: Option<String>,
        /// RFC 3339 lower bound
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// RFC 3339 upper bound
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long)]
        resolved: Option<bool>,
        #[arg(long)]
        page: Option<usize>,
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// Delete accidents by id
    DeleteAccidents {
        /// Accident ids
        ids: Vec<String>,
    },
}

pub fn run(config_path: Option<&Path>, format: &str, command: MonitorCommands) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(config_path, format, command))
}

async fn run_async(config_path: Option<&Path>, format: &str, command: MonitorCommands) -> Result<()> {
    let client = super::client(config_path)?;

    match command {
        MonitorCommands::Stats { node, limit } => {
            let stats = client.stats(&node, limit).await?;
            if format == "json" {
                return print_output(format, &stats);
            }
            if stats.is_empty() {
                println!("{} No stats for {} yet", "::".blue().bold(), node);
            }
            for stat in &stats {
                println!(
                    "{}  avg {:>8.1}ms  min {:>5}ms  max {:>5}ms  {:>5.1}% of {} pings",
                    stat.computed_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                    stat.avg_response_time_ms,
                    stat.min_response_time_ms,
                    stat.max_response_time_ms,
                    stat.success_rate * 100.0,
                    stat.ping_count
                );
            }
            Ok(())
        }
        MonitorCommands::Pings { node, limit } => {
            let pings = client.pings(&node, limit).await?;
            if format == "json" {
                return print_output(format, &pings);
            }
            for ping in &pings {
                let outcome = match ping.outcome {
                    PingOutcome::Ok => "ok".green().bold(),
                    PingOutcome::Error => "!!".red().bold(),
                };
                println!(
                    "{} {}  {:>5}ms  {}",
                    outcome,
                    ping.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                    ping.response_time_ms,
                    ping.error.as_deref().unwrap_or_default()
                );
            }
            Ok(())
        }
        MonitorCommands::Accidents {
            node,
            since,
            until,
            resolved,
            page,
            page_size,
        } => {
            let query = AccidentQuery {
                node_id: node,
                since,
                until,
                resolved,
                page,
                page_size,
            };
            let accidents = client.accidents(&query).await?;
            if format == "json" {
                return print_output(format, &accidents);
            }
            for accident in &accidents.items {
                let kind = match accident.kind {
                    AccidentKind::HighLatency => "latency".yellow(),
                    AccidentKind::ConnectionFailure => "failure".red(),
                };
                println!(
                    "{} {} {:<8} {} {}",
                    accident.id.dimmed(),
                    accident.created_at.format("%Y-%m-%d %H:%M:%S"),
                    kind,
                    accident.node_id.bold(),
                    accident.detail
                );
            }
            println!(
                "{}",
                format!(
                    "page {} ({} per page), {} accidents total",
                    accidents.page, accidents.page_size, accidents.total
                )
                .dimmed()
            );
            Ok(())
        }
        MonitorCommands::DeleteAccidents { ids } => {
            if ids.is_empty() {
                bail!("no accident ids given");
            }
            let result = client.delete_accidents(ids).await?;
            if format == "json" {
                return print_output(format, &result);
            }
            println!("{} Deleted {} accidents", "ok".green().bold(), result.deleted);
            Ok(())
        }
    }
}
