//! firewalld adapter using direct rules

use std::path::PathBuf;

use async_trait::async_trait;
use log::info;

use ztnet_core::{Backend, FirewallRule, Result};
use ztnet_exec::CommandSpec;

use super::{forward_parts, FirewallBackend, RuleDump};
use crate::context::ApplyContext;

const CMD: &str = "firewall-cmd";
const DUMP: &str = "firewalld-direct.rules";

pub struct FirewalldBackend {
    ctx: ApplyContext,
}

impl FirewalldBackend {
    pub fn new(ctx: ApplyContext) -> Self {
        Self { ctx }
    }
}

/// `<family> <table> <chain> <priority> <args...>` for a direct rule
fn direct_rule(rule: &FirewallRule) -> Vec<String> {
    let mut args = vec![rule.family().as_str().to_string()];
    match rule {
        FirewallRule::Masquerade { out_iface, .. } => {
            args.extend(["nat", "POSTROUTING", "0", "-o", out_iface.as_str(), "-j", "MASQUERADE"].map(String::from));
        }
        FirewallRule::ForwardAccept { .. } => {
            if let Some((in_iface, out_iface, established)) = forward_parts(rule) {
                args.extend(["filter", "FORWARD", "0", "-i", in_iface, "-o", out_iface].map(String::from));
                if established {
                    args.extend(["-m", "state", "--state", "RELATED,ESTABLISHED"].map(String::from));
                }
                args.extend(["-j", "ACCEPT"].map(String::from));
            }
        }
    }
    args
}

#[async_trait]
impl FirewallBackend for FirewalldBackend {
    fn kind(&self) -> Backend {
        Backend::Firewalld
    }

    async fn rule_present(&self, rule: &FirewallRule) -> Result<bool> {
        let result = self
            .ctx
            .runner()
            .run(
                &CommandSpec::query(CMD)
                    .args(["--direct", "--query-rule"])
                    .args(direct_rule(rule)),
            )
            .await?;
        match result.status {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => result.ensure_success().map(|_| true),
        }
    }

    async fn add_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.ctx
            .runner()
            .run(
                &CommandSpec::mutate(CMD)
                    .args(["--direct", "--add-rule"])
                    .args(direct_rule(rule)),
            )
            .await?
            .ensure_success()?;
        info!("Added {} as firewalld direct rule", rule);
        Ok(())
    }

    async fn remove_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.ctx
            .runner()
            .run(
                &CommandSpec::mutate(CMD)
                    .args(["--direct", "--remove-rule"])
                    .args(direct_rule(rule)),
            )
            .await?
            .ensure_success()?;
        info!("Removed firewalld direct rule {}", rule);
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        self.ctx
            .runner()
            .run(&CommandSpec::mutate(CMD).arg("--runtime-to-permanent"))
            .await?
            .ensure_success()?;
        info!("Saved firewalld runtime configuration as permanent");
        Ok(())
    }

    fn persistent_files(&self) -> Vec<PathBuf> {
        vec![self.ctx.paths().firewalld_direct.clone()]
    }

    async fn dump(&self) -> Result<Vec<RuleDump>> {
        let result = self
            .ctx
            .runner()
            .run(&CommandSpec::query(CMD).args(["--direct", "--get-all-rules"]))
            .await?
            .ensure_success()?;
        Ok(vec![RuleDump {
            name: DUMP.to_string(),
            contents: result.stdout,
        }])
    }

    /// direct.xml carries the rules, so a reload is enough
    async fn reload(&self, _dumps: &[RuleDump]) -> Result<()> {
        self.ctx
            .runner()
            .run(&CommandSpec::mutate(CMD).arg("--reload"))
            .await?
            .ensure_success()?;
        info!("Reloaded firewalld");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ztnet_config::ToolSettings;
    use ztnet_core::IpFamily;
    use ztnet_exec::ScriptedRunner;

    #[test]
    fn test_direct_rule_arguments() {
        assert_eq!(
            direct_rule(&FirewallRule::masquerade("eth0")).join(" "),
            "ipv4 nat POSTROUTING 0 -o eth0 -j MASQUERADE"
        );
        assert_eq!(
            direct_rule(&FirewallRule::forward_established(IpFamily::V6, "eth0", "zt0")).join(" "),
            "ipv6 filter FORWARD 0 -i eth0 -o zt0 -m state --state RELATED,ESTABLISHED -j ACCEPT"
        );
    }

    #[tokio::test]
    async fn test_query_and_add() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("firewall-cmd --direct --query-rule", 1, "no");
        runner.on("firewall-cmd --direct --add-rule", 0, "success");
        let backend =
            FirewalldBackend::new(ApplyContext::new(runner.clone(), ToolSettings::default()));

        let rule = FirewallRule::masquerade("eth0");
        assert!(!backend.rule_present(&rule).await.unwrap());
        backend.add_rule(&rule).await.unwrap();
        assert_eq!(
            runner.executed_mutations(),
            vec!["firewall-cmd --direct --add-rule ipv4 nat POSTROUTING 0 -o eth0 -j MASQUERADE"]
        );
    }
}
