//! Install command

use std::sync::Arc;

use anyhow::{Context, Result};
use ztnet_apply::Installer;

use super::print_steps;
use crate::context::AppContext;

/// Install the overlay client and the tools a gateway needs
pub struct InstallCommand {
    context: Arc<AppContext>,
}

impl InstallCommand {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    pub async fn execute(&self) -> Result<()> {
        let backend = self.context.backend().await.kind();
        let installer =
            Installer::new(self.context.apply.clone()).with_root_probe(self.context.root_probe);
        let records = installer
            .install(backend)
            .await
            .context("Failed to install dependencies")?;

        println!("Dependencies:");
        print_steps(&records);
        println!("✓ Dependencies installed");
        Ok(())
    }
}
