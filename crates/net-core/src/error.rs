//! Error types for gateway operations

use std::time::Duration;

use thiserror::Error;

/// Main error type for ztnet operations
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Privilege error: {0}")]
    Privilege(#[from] PrivilegeError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Timeout: {0}")]
    Timeout(#[from] TimeoutError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NetworkError {
    /// Errors raised before any host mutation is attempted
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            NetworkError::Config(_) | NetworkError::Validation(_) | NetworkError::Privilege(_)
        )
    }
}

/// Bad or missing input
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid network id '{value}': expected 16 hexadecimal characters")]
    InvalidNetworkId { value: String },

    #[error("Invalid subnet '{value}': {reason}")]
    InvalidSubnet { value: String, reason: String },

    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("Cannot read configuration {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

/// Field and host-level validation failures
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Interface {name} validation failed: {reason}")]
    Interface { name: String, reason: String },

    #[error("Subnet {subnet} is not reachable via {interface}: {reason}")]
    UnreachableSubnet {
        subnet: String,
        interface: String,
        reason: String,
    },

    #[error("No default route found; set PHY_IFACE explicitly")]
    NoDefaultRoute,

    #[error("Topology validation failed: {message}")]
    Topology { message: String },

    #[error("No firewall backend on this host; a {role} gateway needs NAT and forward rules")]
    NoFirewallBackend { role: String },
}

/// Missing root privileges
#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("{operation} requires root privileges (run as root or via sudo)")]
    NotRoot { operation: String },
}

/// External command failures
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Command not found: {program}")]
    NotFound { program: String },

    #[error("Failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Command '{command}' exited with {code:?}: {stderr}")]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Unexpected output from '{command}': {reason}")]
    UnexpectedOutput { command: String, reason: String },

    #[error("{what} is not available on this host")]
    Unavailable { what: String },

    #[error("File operation failed on {path}: {reason}")]
    FileOperation { path: String, reason: String },
}

/// External call exceeded its deadline
#[derive(Debug, Error)]
#[error("'{command}' exceeded its deadline of {deadline:?}")]
pub struct TimeoutError {
    pub command: String,
    pub deadline: Duration,
}

/// Snapshot creation and restore failures
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Snapshot not found: {id}")]
    NotFound { id: String },

    #[error("Checksum mismatch for {path}")]
    ChecksumMismatch { path: String },

    #[error("Restore of {path} failed: {reason}")]
    RestoreFailed { path: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preflight_classification() {
        let err: NetworkError = ConfigError::MissingField {
            field: "ZT_NETWORK_ID".into(),
        }
        .into();
        assert!(err.is_preflight());

        let err: NetworkError = ExecutionError::NotFound {
            program: "iptables".into(),
        }
        .into();
        assert!(!err.is_preflight());
    }

    #[test]
    fn test_timeout_message() {
        let err = TimeoutError {
            command: "zerotier-cli info".into(),
            deadline: Duration::from_secs(5),
        };
        assert_eq!(
            err.to_string(),
            "'zerotier-cli info' exceeded its deadline of 5s"
        );
    }
}
