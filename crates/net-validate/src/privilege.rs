//! Root privilege checks

use log::error;

use ztnet_core::error::PrivilegeError;
use ztnet_core::{NetworkError, Result};

/// Probe answering "are we root?"
pub type RootProbe = fn() -> bool;

/// Probe backed by the effective user id
pub fn effective_root() -> bool {
    is_root::is_root()
}

/// Fail with [`PrivilegeError::NotRoot`] unless `probe` reports root
pub fn require_root(probe: RootProbe, operation: &str) -> Result<()> {
    if probe() {
        return Ok(());
    }
    error!("{} requires root privileges", operation);
    Err(NetworkError::Privilege(PrivilegeError::NotRoot {
        operation: operation.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_root() {
        assert!(require_root(|| true, "configure").is_ok());

        let err = require_root(|| false, "configure").unwrap_err();
        assert!(matches!(err, NetworkError::Privilege(_)));
        assert!(err.to_string().contains("configure requires root"));
    }
}
