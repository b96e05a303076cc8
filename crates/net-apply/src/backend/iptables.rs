//! Raw iptables/ip6tables adapter

use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, info};

use ztnet_core::error::ExecutionError;
use ztnet_core::{Backend, FirewallRule, IpFamily, NetworkError, Result};
use ztnet_exec::{CommandSpec, RunResult};

use super::{forward_parts, FirewallBackend, RuleDump};
use crate::context::ApplyContext;

const DUMP_V4: &str = "iptables-v4.rules";
const DUMP_V6: &str = "iptables-v6.rules";

/// Rule operation flag
#[derive(Debug, Clone, Copy)]
enum Op {
    Check,
    Append,
    Delete,
}

impl Op {
    fn flag(self) -> &'static str {
        match self {
            Op::Check => "-C",
            Op::Append => "-A",
            Op::Delete => "-D",
        }
    }
}

pub struct IptablesBackend {
    ctx: ApplyContext,
}

impl IptablesBackend {
    pub fn new(ctx: ApplyContext) -> Self {
        Self { ctx }
    }

    async fn save(&self, family: IpFamily) -> Result<RunResult> {
        self.ctx
            .runner()
            .run(&CommandSpec::query(save_program(family)))
            .await?
            .ensure_success()
    }

    /// `ip6tables-save` is optional on IPv4-only hosts
    async fn save_v6(&self) -> Result<Option<RunResult>> {
        match self.save(IpFamily::V6).await {
            Ok(result) => Ok(Some(result)),
            Err(NetworkError::Execution(ExecutionError::NotFound { .. })) => {
                debug!("ip6tables-save not available, skipping IPv6 rules");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn program(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "iptables",
        IpFamily::V6 => "ip6tables",
    }
}

fn save_program(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "iptables-save",
        IpFamily::V6 => "ip6tables-save",
    }
}

fn restore_program(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "iptables-restore",
        IpFamily::V6 => "ip6tables-restore",
    }
}

/// Arguments after the program name for `rule` and `op`
pub(crate) fn rule_args(rule: &FirewallRule, op: &str) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    match rule {
        FirewallRule::Masquerade { out_iface, .. } => {
            args.extend(["-t", "nat", op, "POSTROUTING", "-o"].map(String::from));
            args.push(out_iface.clone());
            args.extend(["-j", "MASQUERADE"].map(String::from));
        }
        FirewallRule::ForwardAccept { .. } => {
            if let Some((in_iface, out_iface, established)) = forward_parts(rule) {
                args.extend([op, "FORWARD", "-i", in_iface, "-o", out_iface].map(String::from));
                if established {
                    args.extend(["-m", "state", "--state", "RELATED,ESTABLISHED"].map(String::from));
                }
                args.extend(["-j", "ACCEPT"].map(String::from));
            }
        }
    }
    args
}

fn spec(rule: &FirewallRule, op: Op) -> CommandSpec {
    let base = match op {
        Op::Check => CommandSpec::query(program(rule.family())),
        Op::Append | Op::Delete => CommandSpec::mutate(program(rule.family())),
    };
    base.args(rule_args(rule, op.flag()))
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    fn kind(&self) -> Backend {
        Backend::Iptables
    }

    async fn rule_present(&self, rule: &FirewallRule) -> Result<bool> {
        let result = self.ctx.runner().run(&spec(rule, Op::Check)).await?;
        match result.status {
            Some(0) => Ok(true),
            // "Bad rule (does a matching rule exist in that chain?)"
            Some(1) => Ok(false),
            _ => result.ensure_success().map(|_| true),
        }
    }

    async fn add_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.ctx
            .runner()
            .run(&spec(rule, Op::Append))
            .await?
            .ensure_success()?;
        info!("Added {}", rule);
        Ok(())
    }

    async fn remove_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.ctx
            .runner()
            .run(&spec(rule, Op::Delete))
            .await?
            .ensure_success()?;
        info!("Removed {}", rule);
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let paths = self.ctx.paths();
        let v4 = self.save(IpFamily::V4).await?;
        self.ctx
            .runner()
            .write_file(&paths.iptables_rules_v4, &v4.stdout)
            .await?;
        if let Some(v6) = self.save_v6().await? {
            self.ctx
                .runner()
                .write_file(&paths.iptables_rules_v6, &v6.stdout)
                .await?;
        }
        info!(
            "Persisted iptables rules to {}",
            paths.iptables_rules_v4.display()
        );
        Ok(())
    }

    fn persistent_files(&self) -> Vec<PathBuf> {
        let paths = self.ctx.paths();
        vec![
            paths.iptables_rules_v4.clone(),
            paths.iptables_rules_v6.clone(),
        ]
    }

    async fn dump(&self) -> Result<Vec<RuleDump>> {
        let mut dumps = vec![RuleDump {
            name: DUMP_V4.to_string(),
            contents: self.save(IpFamily::V4).await?.stdout,
        }];
        if let Some(v6) = self.save_v6().await? {
            dumps.push(RuleDump {
                name: DUMP_V6.to_string(),
                contents: v6.stdout,
            });
        }
        Ok(dumps)
    }

    async fn reload(&self, dumps: &[RuleDump]) -> Result<()> {
        for dump in dumps {
            let family = match dump.name.as_str() {
                DUMP_V4 => IpFamily::V4,
                DUMP_V6 => IpFamily::V6,
                _ => continue,
            };
            self.ctx
                .runner()
                .run(&CommandSpec::mutate(restore_program(family)).stdin(dump.contents.clone()))
                .await?
                .ensure_success()?;
            info!("Restored {} rules from snapshot", family);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use ztnet_config::{HostPaths, ToolSettings};
    use ztnet_exec::ScriptedRunner;

    fn backend(runner: Arc<ScriptedRunner>, root: &std::path::Path) -> IptablesBackend {
        let settings = ToolSettings {
            paths: HostPaths::under(root),
            ..Default::default()
        };
        IptablesBackend::new(ApplyContext::new(runner, settings))
    }

    #[test]
    fn test_rule_arguments() {
        let masquerade = spec(&FirewallRule::masquerade("eth0"), Op::Check);
        assert_eq!(
            masquerade.command_line(),
            "iptables -t nat -C POSTROUTING -o eth0 -j MASQUERADE"
        );

        let established = spec(
            &FirewallRule::forward_established(IpFamily::V4, "eth0", "zt+"),
            Op::Append,
        );
        assert_eq!(
            established.command_line(),
            "iptables -A FORWARD -i eth0 -o zt+ -m state --state RELATED,ESTABLISHED -j ACCEPT"
        );
        assert!(established.is_mutating());

        let v6 = spec(&FirewallRule::forward(IpFamily::V6, "zt0", "eth0"), Op::Delete);
        assert_eq!(v6.command_line(), "ip6tables -D FORWARD -i zt0 -o eth0 -j ACCEPT");
    }

    #[tokio::test]
    async fn test_presence_from_exit_status() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("iptables -t nat -C POSTROUTING -o eth0", 0, "");
        runner.on("iptables -t nat -C POSTROUTING -o eth1", 1, "");
        runner.on("iptables -C FORWARD", 2, "");
        let backend = backend(runner, temp_dir.path());

        assert!(backend.rule_present(&FirewallRule::masquerade("eth0")).await.unwrap());
        assert!(!backend.rule_present(&FirewallRule::masquerade("eth1")).await.unwrap());
        assert!(backend
            .rule_present(&FirewallRule::forward(IpFamily::V4, "zt0", "eth0"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_persist_writes_rule_files() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("iptables-save", 0, "*nat\n-A POSTROUTING -o eth0 -j MASQUERADE\nCOMMIT\n");
        let backend = backend(runner, temp_dir.path());

        backend.persist().await.unwrap();
        let saved =
            std::fs::read_to_string(temp_dir.path().join("etc/iptables/rules.v4")).unwrap();
        assert!(saved.contains("MASQUERADE"));
        assert!(!temp_dir.path().join("etc/iptables/rules.v6").exists());
    }

    #[tokio::test]
    async fn test_reload_feeds_dump_to_restore() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("iptables-restore", 0, "");
        let backend = backend(runner.clone(), temp_dir.path());

        backend
            .reload(&[RuleDump {
                name: DUMP_V4.to_string(),
                contents: "*filter\nCOMMIT\n".to_string(),
            }])
            .await
            .unwrap();
        let calls = runner.calls();
        assert_eq!(calls[0].command, "iptables-restore");
        assert_eq!(calls[0].stdin.as_deref(), Some("*filter\nCOMMIT\n"));
    }
}
