//! `trellis mesh sync` / `trellis mesh status`

use std::path::Path;

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use super::output::print_output;
use crate::mesh::MeshReport;

#[derive(Subcommand)]
pub enum MeshCommands {
    /// Push the full WireGuard mesh to every peer now
    Sync,
    /// Show whether a sync is running and the last report
    Status,
}

pub fn run(config_path: Option<&Path>, format: &str, command: MeshCommands) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(config_path, format, command))
}

async fn run_async(config_path: Option<&Path>, format: &str, command: MeshCommands) -> Result<()> {
    let client = super::client(config_path)?;

    match command {
        MeshCommands::Sync => {
            println!("{} Syncing mesh", ">>".blue().bold());
            let report = client.sync_mesh().await?;
            if format == "json" {
                return print_output(format, &report);
            }
            print_report(&report);
            Ok(())
        }
        MeshCommands::Status => {
            let status = client.mesh_status().await?;
            if format == "json" {
                return print_output(format, &status);
            }
            let state = if status.running {
                "running".yellow()
            } else {
                "idle".green()
            };
            println!("{} {}", "Mesh sync".bold(), state);
            if status.pending {
                println!("   another sync is queued");
            }
            match status.last {
                Some(ref report) => print_report(report),
                None => println!("   no sync has run yet"),
            }
            Ok(())
        }
    }
}

fn print_report(report: &MeshReport) {
    println!(
        "   last run {} ({} synced, {} failed{})",
        report.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
        report.synced(),
        report.failed(),
        if report.cancelled { ", cancelled" } else { "" }
    );
    for peer in &report.peers {
        match peer.error {
            None => println!(
                "  {} {} {} {}",
                "ok".green().bold(),
                peer.name.bold(),
                peer.internal_ip.dimmed(),
                peer.fingerprint.as_deref().unwrap_or_default().dimmed()
            ),
            Some(ref err) => println!(
                "  {} {} {} {}",
                "!!".red().bold(),
                peer.name.bold(),
                peer.internal_ip.dimmed(),
                err
            ),
        }
    }
    if !report.skipped.is_empty() {
        println!(
            "   {} without overlay identity: {}",
            report.skipped.len(),
            report.skipped.join(", ")
        );
    }
}
