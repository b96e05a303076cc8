//! Detect command

use std::sync::Arc;

use anyhow::Result;
use ztnet_apply::install::{detect_package_manager, program_available};
use ztnet_apply::BackendDetector;

use crate::context::AppContext;

/// Report the firewall backend and tooling found on this host
pub struct DetectCommand {
    context: Arc<AppContext>,
}

impl DetectCommand {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    pub async fn execute(&self) -> Result<()> {
        let runner = self.context.runner();
        let detected = BackendDetector::new(runner.clone()).detect().await;
        println!("Detected firewall backend: {}", detected);
        if let Some(configured) = self.context.settings().backend {
            if configured != detected {
                println!("Configured firewall backend: {} (overrides detection)", configured);
            }
        }

        match detect_package_manager(runner.as_ref()).await {
            Some(manager) => println!("Package manager: {}", manager.program()),
            None => println!("Package manager: none supported"),
        }
        let client = if program_available(runner.as_ref(), "zerotier-cli", "-v").await {
            "installed"
        } else {
            "missing (run `ztnet install`)"
        };
        println!("zerotier-cli: {}", client);
        Ok(())
    }
}
