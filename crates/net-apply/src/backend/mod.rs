//! Firewall backends
//!
//! One adapter per firewall system behind [`FirewallBackend`]. The detector
//! picks exactly one per run and the reconciler only ever talks to that one.

pub mod detector;
pub mod firewalld;
pub mod iptables;
pub mod nftables;
pub mod ufw;

pub use detector::BackendDetector;
pub use firewalld::FirewalldBackend;
pub use iptables::IptablesBackend;
pub use nftables::NftablesBackend;
pub use ufw::UfwBackend;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

use ztnet_core::error::ExecutionError;
use ztnet_core::{Backend, FirewallRule, NetworkError, Result};

use crate::context::ApplyContext;

/// Live rule set captured from a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDump {
    /// File name inside a snapshot directory
    pub name: String,
    pub contents: String,
}

/// Operations every firewall adapter provides
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    fn kind(&self) -> Backend;

    /// Whether `rule` is currently enforced
    async fn rule_present(&self, rule: &FirewallRule) -> Result<bool>;

    async fn add_rule(&self, rule: &FirewallRule) -> Result<()>;

    async fn remove_rule(&self, rule: &FirewallRule) -> Result<()>;

    /// Make the current runtime rules survive a reboot
    async fn persist(&self) -> Result<()>;

    /// Files holding this backend's boot-time rules
    fn persistent_files(&self) -> Vec<PathBuf>;

    /// Capture the live rule set
    async fn dump(&self) -> Result<Vec<RuleDump>>;

    /// Reload the backend after its files were restored, replaying dumps
    /// where the backend has no file of its own
    async fn reload(&self, dumps: &[RuleDump]) -> Result<()>;
}

/// Placeholder used when no firewall system is available
pub struct NoBackend;

impl NoBackend {
    fn unavailable() -> NetworkError {
        NetworkError::Execution(ExecutionError::Unavailable {
            what: "a firewall backend".to_string(),
        })
    }
}

#[async_trait]
impl FirewallBackend for NoBackend {
    fn kind(&self) -> Backend {
        Backend::None
    }

    async fn rule_present(&self, _rule: &FirewallRule) -> Result<bool> {
        Err(Self::unavailable())
    }

    async fn add_rule(&self, _rule: &FirewallRule) -> Result<()> {
        Err(Self::unavailable())
    }

    async fn remove_rule(&self, _rule: &FirewallRule) -> Result<()> {
        Err(Self::unavailable())
    }

    async fn persist(&self) -> Result<()> {
        Ok(())
    }

    fn persistent_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    async fn dump(&self) -> Result<Vec<RuleDump>> {
        Ok(Vec::new())
    }

    async fn reload(&self, _dumps: &[RuleDump]) -> Result<()> {
        Ok(())
    }
}

/// Adapter for a given backend kind
pub fn backend_for(kind: Backend, ctx: &ApplyContext) -> Arc<dyn FirewallBackend> {
    match kind {
        Backend::Iptables => Arc::new(IptablesBackend::new(ctx.clone())),
        Backend::Firewalld => Arc::new(FirewalldBackend::new(ctx.clone())),
        Backend::Ufw => Arc::new(UfwBackend::new(ctx.clone())),
        Backend::Nftables => Arc::new(NftablesBackend::new(ctx.clone())),
        Backend::None => Arc::new(NoBackend),
    }
}

/// Adapter for the configured backend, or the detected one
pub async fn select_backend(ctx: &ApplyContext) -> Arc<dyn FirewallBackend> {
    let kind = match ctx.settings().backend {
        Some(kind) => {
            info!("Using configured firewall backend {}", kind);
            kind
        }
        None => BackendDetector::new(ctx.runner().clone()).detect().await,
    };
    backend_for(kind, ctx)
}

/// `(in_iface, out_iface, established_only)` of a forward rule
pub(crate) fn forward_parts(rule: &FirewallRule) -> Option<(&str, &str, bool)> {
    match rule {
        FirewallRule::ForwardAccept {
            in_iface,
            out_iface,
            established_only,
            ..
        } => Some((in_iface, out_iface, *established_only)),
        FirewallRule::Masquerade { .. } => None,
    }
}
