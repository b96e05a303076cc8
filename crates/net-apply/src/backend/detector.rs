//! Firewall backend detection

use std::sync::Arc;

use log::{debug, info};

use ztnet_core::Backend;
use ztnet_exec::{CommandRunner, CommandSpec, RunResult};

/// Probes the host for the active firewall system.
///
/// Order is fixed: firewalld, ufw, nftables, iptables. Higher-level
/// systems win over raw iptables because they would overwrite its rules.
pub struct BackendDetector {
    runner: Arc<dyn CommandRunner>,
}

impl BackendDetector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// First matching backend, [`Backend::None`] when nothing matches
    pub async fn detect(&self) -> Backend {
        let backend = if self.firewalld_running().await {
            Backend::Firewalld
        } else if self.ufw_active().await {
            Backend::Ufw
        } else if self.nftables_in_use().await {
            Backend::Nftables
        } else if self.iptables_present().await {
            Backend::Iptables
        } else {
            Backend::None
        };

        info!("Detected firewall backend: {}", backend);
        backend
    }

    async fn firewalld_running(&self) -> bool {
        self.probe(&["firewall-cmd", "--state"])
            .await
            .is_some_and(|r| r.success())
    }

    async fn ufw_active(&self) -> bool {
        self.probe(&["ufw", "status"])
            .await
            .is_some_and(|r| r.success() && r.stdout.contains("Status: active"))
    }

    async fn nftables_in_use(&self) -> bool {
        self.probe(&["nft", "list", "tables"]).await.is_some_and(|r| {
            r.success() && r.stdout.lines().any(|l| l.trim_start().starts_with("table "))
        })
    }

    async fn iptables_present(&self) -> bool {
        self.probe(&["iptables", "--version"])
            .await
            .is_some_and(|r| r.success())
    }

    /// Probe errors (missing binary, timeout) count as "not matched"
    async fn probe(&self, command: &[&str]) -> Option<RunResult> {
        let spec = CommandSpec::query(command[0]).args(command[1..].iter().copied());
        match self.runner.run(&spec).await {
            Ok(result) => Some(result),
            Err(e) => {
                debug!("Probe '{}' failed: {}", spec.command_line(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ztnet_exec::ScriptedRunner;

    async fn detect(runner: ScriptedRunner) -> Backend {
        BackendDetector::new(Arc::new(runner)).detect().await
    }

    #[tokio::test]
    async fn test_firewalld_wins_when_everything_is_available() {
        let runner = ScriptedRunner::new();
        runner.on("firewall-cmd --state", 0, "running");
        runner.on("ufw status", 0, "Status: active");
        runner.on("nft list tables", 0, "table inet filter");
        runner.on("iptables --version", 0, "iptables v1.8.9 (nf_tables)");

        let detector = BackendDetector::new(Arc::new(runner));
        for _ in 0..3 {
            assert_eq!(detector.detect().await, Backend::Firewalld);
        }
    }

    #[tokio::test]
    async fn test_stopped_firewalld_falls_through_to_ufw() {
        let runner = ScriptedRunner::new();
        runner.on("firewall-cmd --state", 252, "not running");
        runner.on("ufw status", 0, "Status: active\n\nTo Action From");
        runner.on("iptables --version", 0, "iptables v1.8.7 (legacy)");
        assert_eq!(detect(runner).await, Backend::Ufw);
    }

    #[tokio::test]
    async fn test_inactive_ufw_and_empty_nft_fall_through_to_iptables() {
        let runner = ScriptedRunner::new();
        runner.on("ufw status", 0, "Status: inactive");
        runner.on("nft list tables", 0, "");
        runner.on("iptables --version", 0, "iptables v1.8.7 (legacy)");
        assert_eq!(detect(runner).await, Backend::Iptables);
    }

    #[tokio::test]
    async fn test_nftables_with_tables() {
        let runner = ScriptedRunner::new();
        runner.on("nft list tables", 0, "table inet filter\ntable ip nat\n");
        runner.on("iptables --version", 0, "iptables v1.8.9 (nf_tables)");
        assert_eq!(detect(runner).await, Backend::Nftables);
    }

    #[tokio::test]
    async fn test_nothing_detected_is_none() {
        let runner = ScriptedRunner::new();
        runner.on_timeout("firewall-cmd");
        assert_eq!(detect(runner).await, Backend::None);
    }
}
