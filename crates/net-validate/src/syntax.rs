//! Field validation for gateway configuration

use regex::Regex;

use ztnet_core::error::ValidationError;
use ztnet_core::{DesiredState, NetworkError, Topology};

/// Kernel limit for interface names (IFNAMSIZ - 1)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Syntax validator for desired state fields
pub struct SyntaxValidator {
    /// Valid interface name pattern
    interface_name_regex: Regex,
}

impl SyntaxValidator {
    pub fn new() -> Self {
        Self {
            interface_name_regex: Regex::new(r"^[a-zA-Z][a-zA-Z0-9_.@-]*$").unwrap(),
        }
    }

    /// Validate every field of a desired state
    pub fn validate_desired_state(&self, desired: &DesiredState) -> Result<(), NetworkError> {
        if let Some(iface) = desired.physical_interface() {
            self.validate_interface_name(iface)?;
        }

        if let Some(subnet) = desired.physical_subnet() {
            if subnet.prefix_len() == 0 {
                return Err(NetworkError::Validation(ValidationError::UnreachableSubnet {
                    subnet: subnet.to_string(),
                    interface: desired.physical_interface().unwrap_or("-").to_string(),
                    reason: "a /0 subnet would route everything through the gateway".to_string(),
                }));
            }
        }

        Ok(())
    }

    /// Validate an interface name
    pub fn validate_interface_name(&self, name: &str) -> Result<(), NetworkError> {
        let mut errors = Vec::new();

        if !self.interface_name_regex.is_match(name) {
            errors.push("invalid interface name format".to_string());
        }
        if name.len() > MAX_INTERFACE_NAME_LEN {
            errors.push(format!(
                "interface name too long (max {} characters)",
                MAX_INTERFACE_NAME_LEN
            ));
        }

        if !errors.is_empty() {
            return Err(NetworkError::Validation(ValidationError::Interface {
                name: name.to_string(),
                reason: errors.join("; "),
            }));
        }
        Ok(())
    }

    /// Structural topology checks plus the shared physical interface name
    pub fn validate_topology(&self, topology: &Topology) -> Result<(), NetworkError> {
        topology.validate()?;
        if let Some(iface) = topology.physical_interface() {
            self.validate_interface_name(iface)?;
        }
        Ok(())
    }
}

impl Default for SyntaxValidator {
    fn default() -> Self {
        Self::new()
    }
}
