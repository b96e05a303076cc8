//! Topology command

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use ztnet_apply::TopologyDeployer;

use super::{print_json, print_report, print_steps, OutputFormat};
use crate::context::AppContext;

#[derive(Debug, Clone, Subcommand)]
pub enum TopologyAction {
    /// Join every network, hub first, and link the overlays
    Deploy,
    /// Check the network list
    Validate,
    /// Show membership of every network
    Status {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Remove links and gateway rules, then leave every network
    Cleanup,
}

/// Multi-network topologies from repeated `network=` lines
pub struct TopologyCommand {
    context: Arc<AppContext>,
}

impl TopologyCommand {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    pub async fn execute(&self, action: &TopologyAction) -> Result<()> {
        let topology = self.context.topology()?;
        let reconciler = self.context.reconciler().await;
        let deployer = TopologyDeployer::new(&reconciler);

        match action {
            TopologyAction::Validate => {
                deployer.validate(&topology)?;
                println!(
                    "✓ {} topology with {} networks is valid",
                    topology.kind(),
                    topology.networks().len()
                );
                for network in topology.networks() {
                    println!("  {} ({})", network.network_id, network.role);
                }
                Ok(())
            }
            TopologyAction::Deploy => {
                let report = deployer
                    .deploy(&topology, &self.context.reconcile_options())
                    .await
                    .context("Failed to deploy topology")?;
                if report.declined {
                    anyhow::bail!("Topology deployment was declined");
                }
                for network in &report.networks {
                    print_report(network);
                }
                if !report.links.is_empty() {
                    println!("Overlay links:");
                    print_steps(&report.links);
                }
                if let Some(error) = &report.error {
                    anyhow::bail!("Topology deployment failed: {}", error);
                }
                if let Some(failed) = report.networks.iter().find(|r| !r.is_success()) {
                    anyhow::bail!(
                        "Network {} failed: {}",
                        failed.network_id,
                        failed.error.as_deref().unwrap_or("unknown error")
                    );
                }
                println!("✓ {} topology deployed", topology.kind());
                Ok(())
            }
            TopologyAction::Status { format } => {
                let statuses = deployer.status(&topology).await?;
                if *format == OutputFormat::Json {
                    return print_json(&statuses);
                }
                println!("{:<18} {:<10} {:<24} {}", "Network", "Role", "Status", "Device");
                println!("{}", "-".repeat(64));
                for status in &statuses {
                    println!(
                        "{:<18} {:<10} {:<24} {}",
                        status.network_id,
                        status.role.as_str(),
                        status.status.as_deref().unwrap_or("NOT JOINED"),
                        status.device.as_deref().unwrap_or("-")
                    );
                }
                if statuses.iter().all(|s| s.is_ok()) {
                    Ok(())
                } else {
                    anyhow::bail!("Not every topology network is OK")
                }
            }
            TopologyAction::Cleanup => {
                let plan = format!(
                    "Remove the {} topology: leave {} networks and delete their rules",
                    topology.kind(),
                    topology.networks().len()
                );
                if !self.context.confirmation().confirm(&plan) {
                    anyhow::bail!("Topology cleanup was declined");
                }
                let records = deployer
                    .cleanup(&topology)
                    .await
                    .context("Failed to clean up topology")?;
                print_steps(&records);
                println!("✓ {} topology removed", topology.kind());
                Ok(())
            }
        }
    }
}
