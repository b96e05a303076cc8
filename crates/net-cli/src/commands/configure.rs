//! Configure command

use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use super::{ensure_reconciled, print_report};
use crate::context::AppContext;

/// Bring the host in line with the desired gateway state
pub struct ConfigureCommand {
    context: Arc<AppContext>,
}

impl ConfigureCommand {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    pub async fn execute(&self) -> Result<()> {
        let desired = self.context.desired_state()?;
        if self.context.is_dry_run() {
            println!("Dry run: commands that change the host are logged, not executed");
        }
        info!("Configuring gateway for network {}", desired.network_id());

        let reconciler = self.context.reconciler().await;
        let report = reconciler
            .reconcile(&desired, &self.context.reconcile_options())
            .await
            .with_context(|| format!("Failed to configure network {}", desired.network_id()))?;

        print_report(&report);
        ensure_reconciled(&report)
    }
}
