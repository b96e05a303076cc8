//! ztnet validation
//!
//! Everything that must hold before a host is touched: field syntax, the
//! physical interface and its subnet as seen by the kernel, and root
//! privileges for live runs.

pub mod host;
pub mod privilege;
pub mod syntax;

pub use host::{HostInspector, LinkInfo, RouteEntry};
pub use privilege::{effective_root, require_root, RootProbe};
pub use syntax::SyntaxValidator;

use std::sync::Arc;

use log::{error, info};

use ztnet_core::error::ValidationError;
use ztnet_core::{DesiredState, NetworkError, Result, Topology};
use ztnet_exec::CommandRunner;

/// Facts established while validating a desired state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedGateway {
    /// Physical interface, either configured or taken from the default route
    pub physical_interface: String,
    /// Whether the interface came from the default route
    pub auto_detected: bool,
}

/// Complete pre-flight validator
pub struct GatewayValidator {
    syntax: SyntaxValidator,
    host: HostInspector,
    runner: Arc<dyn CommandRunner>,
    root_probe: RootProbe,
}

impl GatewayValidator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            syntax: SyntaxValidator::new(),
            host: HostInspector::new(runner.clone()),
            runner,
            root_probe: effective_root,
        }
    }

    /// Replace the root probe
    pub fn with_root_probe(mut self, probe: RootProbe) -> Self {
        self.root_probe = probe;
        self
    }

    pub fn host(&self) -> &HostInspector {
        &self.host
    }

    /// Field validation only
    pub fn validate_fields(&self, desired: &DesiredState) -> Result<()> {
        self.syntax.validate_desired_state(desired)
    }

    /// Field, privilege and host validation.
    ///
    /// Privileges are not required in dry-run mode since nothing is mutated.
    pub async fn validate(&self, desired: &DesiredState) -> Result<ValidatedGateway> {
        let result = self.validate_inner(desired).await;
        if let Err(e) = &result {
            error!("Validation of network {} failed: {}", desired.network_id(), e);
        }
        result
    }

    async fn validate_inner(&self, desired: &DesiredState) -> Result<ValidatedGateway> {
        self.validate_fields(desired)?;

        if !self.runner.is_dry_run() {
            require_root(self.root_probe, "configuring the gateway")?;
        }

        let (physical_interface, auto_detected) = match desired.physical_interface() {
            Some(iface) => (iface.to_string(), false),
            None => {
                let iface = self
                    .host
                    .default_route_interface()
                    .await?
                    .ok_or(NetworkError::Validation(ValidationError::NoDefaultRoute))?;
                info!("Using default route interface {}", iface);
                (iface, true)
            }
        };

        if !self.host.interface_exists(&physical_interface).await? {
            return Err(NetworkError::Validation(ValidationError::Interface {
                name: physical_interface,
                reason: "interface does not exist".to_string(),
            }));
        }

        if let Some(subnet) = desired.physical_subnet() {
            self.host
                .ensure_subnet_reachable(subnet, &physical_interface)
                .await?;
        }

        info!(
            "Network {} validated on {}",
            desired.network_id(),
            physical_interface
        );
        Ok(ValidatedGateway {
            physical_interface,
            auto_detected,
        })
    }

    /// Structural topology validation
    pub fn validate_topology(&self, topology: &Topology) -> Result<()> {
        self.syntax.validate_topology(topology)
    }
}
