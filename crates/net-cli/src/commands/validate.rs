//! Validate command

use std::sync::Arc;

use anyhow::{Context, Result};
use ztnet_validate::GatewayValidator;

use crate::context::AppContext;

/// Check the configuration and the host without changing anything
pub struct ValidateCommand {
    context: Arc<AppContext>,
}

impl ValidateCommand {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    pub async fn execute(&self) -> Result<()> {
        let desired = self.context.desired_state()?;
        println!("Validating network {}", desired.network_id());

        let validator = GatewayValidator::new(self.context.runner().clone())
            .with_root_probe(self.context.root_probe);
        let validated = validator
            .validate(&desired)
            .await
            .context("Configuration validation failed")?;

        println!("✓ Network id:         {}", desired.network_id());
        println!(
            "✓ Physical interface: {}{}",
            validated.physical_interface,
            if validated.auto_detected {
                " (default route)"
            } else {
                ""
            }
        );
        if let Some(subnet) = desired.physical_subnet() {
            println!("✓ Physical subnet:    {}", subnet);
        }
        println!("  Role:               {}", desired.role());
        println!("  IPv6:               {}", if desired.ipv6() { "yes" } else { "no" });
        println!("Configuration is valid");
        Ok(())
    }
}
