//! Diagnose command

use std::sync::Arc;

use anyhow::Result;
use ztnet_monitor::Diagnostics;

use super::{print_json, OutputFormat};
use crate::context::AppContext;

/// Read-only report of everything a working gateway needs
pub struct DiagnoseCommand {
    context: Arc<AppContext>,
}

impl DiagnoseCommand {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        // without a usable configuration only host-wide facts are checked
        let desired = self.context.desired_state().ok();
        let diagnostics = Diagnostics::new(
            self.context.apply.clone(),
            self.context.client(),
            self.context.backend().await,
        );
        let diagnosis = diagnostics.run(desired.as_ref()).await;

        match format {
            OutputFormat::Json => print_json(&diagnosis)?,
            OutputFormat::Text => print!("{}", diagnosis.render()),
        }
        if !diagnosis.is_healthy() {
            anyhow::bail!("Diagnostics found {} problems", diagnosis.problems.len());
        }
        Ok(())
    }
}
