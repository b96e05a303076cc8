//! nftables adapter
//!
//! Rules live in a dedicated `inet ztnet` table so they never collide with
//! the distribution's own ruleset.

use std::path::PathBuf;

use async_trait::async_trait;
use log::info;

use ztnet_core::error::ExecutionError;
use ztnet_core::{Backend, FirewallRule, NetworkError, Result};
use ztnet_exec::CommandSpec;

use super::{forward_parts, FirewallBackend, RuleDump};
use crate::context::ApplyContext;

const FAMILY: &str = "inet";
const TABLE: &str = "ztnet";
const POSTROUTING: &str = "postrouting";
const FORWARD: &str = "forward";
const DUMP: &str = "nftables.rules";

pub struct NftablesBackend {
    ctx: ApplyContext,
}

impl NftablesBackend {
    pub fn new(ctx: ApplyContext) -> Self {
        Self { ctx }
    }

    /// Chain listing, `None` when the table or chain does not exist yet
    async fn list_chain(&self, chain: &str, with_handles: bool) -> Result<Option<String>> {
        let mut spec = CommandSpec::query("nft");
        if with_handles {
            spec = spec.arg("-a");
        }
        let result = self
            .ctx
            .runner()
            .run(&spec.args(["list", "chain", FAMILY, TABLE, chain]))
            .await?;
        Ok(result.success().then_some(result.stdout))
    }

    async fn nft(&self, args: Vec<String>) -> Result<()> {
        self.ctx
            .runner()
            .run(&CommandSpec::mutate("nft").args(args))
            .await?
            .ensure_success()?;
        Ok(())
    }

    /// Create the table and both base chains; `nft add` is a no-op when they exist
    async fn ensure_table(&self) -> Result<()> {
        let table_exists = self
            .ctx
            .runner()
            .run(&CommandSpec::query("nft").args(["list", "table", FAMILY, TABLE]))
            .await?
            .success();
        if table_exists {
            return Ok(());
        }

        self.nft(words(&["add", "table", FAMILY, TABLE])).await?;
        self.nft(words(&[
            "add",
            "chain",
            FAMILY,
            TABLE,
            POSTROUTING,
            "{ type nat hook postrouting priority 100 ; }",
        ]))
        .await?;
        self.nft(words(&[
            "add",
            "chain",
            FAMILY,
            TABLE,
            FORWARD,
            "{ type filter hook forward priority 0 ; }",
        ]))
        .await?;
        info!("Created nftables table {} {}", FAMILY, TABLE);
        Ok(())
    }
}

fn words(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Chain and expression for `rule`, written the way `nft list` prints it
pub fn rule_expression(rule: &FirewallRule) -> (&'static str, String) {
    let family = format!("meta nfproto {}", rule.family());
    match rule {
        FirewallRule::Masquerade { out_iface, .. } => (
            POSTROUTING,
            format!("{} oifname \"{}\" masquerade", family, out_iface),
        ),
        FirewallRule::ForwardAccept { .. } => {
            let (in_iface, out_iface, established) = forward_parts(rule).unwrap_or_default();
            let state = if established {
                " ct state established,related"
            } else {
                ""
            };
            (
                FORWARD,
                format!(
                    "{} iifname \"{}\" oifname \"{}\"{} accept",
                    family,
                    nft_iface(in_iface),
                    nft_iface(out_iface),
                    state
                ),
            )
        }
    }
}

/// nftables spells the `zt+` wildcard as `zt*`
fn nft_iface(iface: &str) -> String {
    match iface.strip_suffix('+') {
        Some(prefix) => format!("{}*", prefix),
        None => iface.to_string(),
    }
}

/// Strip the trailing `# handle N` comment of a listed rule
fn without_handle(line: &str) -> &str {
    match line.find(" # handle ") {
        Some(pos) => line[..pos].trim(),
        None => line.trim(),
    }
}

fn find_handle(listing: &str, expression: &str) -> Option<u64> {
    listing.lines().find_map(|line| {
        if without_handle(line) != expression {
            return None;
        }
        line.rsplit_once("# handle ")
            .and_then(|(_, handle)| handle.trim().parse().ok())
    })
}

#[async_trait]
impl FirewallBackend for NftablesBackend {
    fn kind(&self) -> Backend {
        Backend::Nftables
    }

    async fn rule_present(&self, rule: &FirewallRule) -> Result<bool> {
        let (chain, expression) = rule_expression(rule);
        Ok(self
            .list_chain(chain, false)
            .await?
            .is_some_and(|listing| listing.lines().any(|l| without_handle(l) == expression)))
    }

    async fn add_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.ensure_table().await?;
        let (chain, expression) = rule_expression(rule);
        let mut args = words(&["add", "rule", FAMILY, TABLE, chain]);
        args.extend(expression.split_whitespace().map(str::to_string));
        self.nft(args).await?;
        info!("Added {}", rule);
        Ok(())
    }

    async fn remove_rule(&self, rule: &FirewallRule) -> Result<()> {
        let (chain, expression) = rule_expression(rule);
        let listing = self.list_chain(chain, true).await?.unwrap_or_default();
        let handle = find_handle(&listing, &expression).ok_or_else(|| {
            NetworkError::Execution(ExecutionError::UnexpectedOutput {
                command: format!("nft -a list chain {} {} {}", FAMILY, TABLE, chain),
                reason: format!("no handle found for '{}'", expression),
            })
        })?;
        let handle = handle.to_string();
        self.nft(words(&["delete", "rule", FAMILY, TABLE, chain, "handle", handle.as_str()]))
        .await?;
        info!("Removed {}", rule);
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let ruleset = self
            .ctx
            .runner()
            .run(&CommandSpec::query("nft").args(["list", "ruleset"]))
            .await?
            .ensure_success()?;
        let contents = format!("#!/usr/sbin/nft -f\n\nflush ruleset\n\n{}", ruleset.stdout);
        let path = &self.ctx.paths().nftables_conf;
        self.ctx.runner().write_file(path, &contents).await?;
        info!("Persisted nftables ruleset to {}", path.display());
        Ok(())
    }

    fn persistent_files(&self) -> Vec<PathBuf> {
        vec![self.ctx.paths().nftables_conf.clone()]
    }

    async fn dump(&self) -> Result<Vec<RuleDump>> {
        let ruleset = self
            .ctx
            .runner()
            .run(&CommandSpec::query("nft").args(["list", "ruleset"]))
            .await?
            .ensure_success()?;
        Ok(vec![RuleDump {
            name: DUMP.to_string(),
            contents: ruleset.stdout,
        }])
    }

    async fn reload(&self, dumps: &[RuleDump]) -> Result<()> {
        for dump in dumps.iter().filter(|d| d.name == DUMP) {
            let script = format!("flush ruleset\n{}", dump.contents);
            self.ctx
                .runner()
                .run(&CommandSpec::mutate("nft").args(["-f", "-"]).stdin(script))
                .await?
                .ensure_success()?;
            info!("Restored nftables ruleset from snapshot");
        }
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

    const FORWARD_LISTING: &str = r#"table inet ztnet {
	chain forward {
		type filter hook forward priority filter; policy accept;
		meta nfproto ipv4 iifname "eth0" oifname "zt0" ct state established,related accept # handle 7
		meta nfproto ipv4 iifname "zt0" oifname "eth0" accept # handle 8
	}
}
"#;

    #[test]
    fn test_rule_expressions() {
        let (chain, expr) = rule_expression(&FirewallRule::masquerade("eth0"));
        assert_eq!(chain, POSTROUTING);
        assert_eq!(expr, "meta nfproto ipv4 oifname \"eth0\" masquerade");

        let (chain, expr) =
            rule_expression(&FirewallRule::forward_established(IpFamily::V6, "eth0", "zt+"));
        assert_eq!(chain, FORWARD);
        assert_eq!(
            expr,
            "meta nfproto ipv6 iifname \"eth0\" oifname \"zt*\" ct state established,related accept"
        );
    }

    #[test]
    fn test_find_handle() {
        let (_, expr) = rule_expression(&FirewallRule::forward(IpFamily::V4, "zt0", "eth0"));
        assert_eq!(find_handle(FORWARD_LISTING, &expr), Some(8));
        let (_, missing) = rule_expression(&FirewallRule::forward(IpFamily::V4, "zt1", "eth0"));
        assert_eq!(find_handle(FORWARD_LISTING, &missing), None);
    }

    #[tokio::test]
    async fn test_presence_and_removal() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("nft list chain inet ztnet forward", 0, FORWARD_LISTING);
        runner.on("nft -a list chain inet ztnet forward", 0, FORWARD_LISTING);
        runner.on("nft list chain inet ztnet postrouting", 1, "");
        runner.on("nft delete rule", 0, "");
        let backend = NftablesBackend::new(ApplyContext::new(runner.clone(), ToolSettings::default()));

        let rule = FirewallRule::forward(IpFamily::V4, "zt0", "eth0");
        assert!(backend.rule_present(&rule).await.unwrap());
        assert!(!backend.rule_present(&FirewallRule::masquerade("eth0")).await.unwrap());

        backend.remove_rule(&rule).await.unwrap();
        assert_eq!(
            runner.executed_mutations(),
            vec!["nft delete rule inet ztnet forward handle 8"]
        );
    }

    #[tokio::test]
    async fn test_add_creates_table_first() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("nft list table inet ztnet", 1, "");
        runner.on("nft add", 0, "");
        let backend = NftablesBackend::new(ApplyContext::new(runner.clone(), ToolSettings::default()));

        backend.add_rule(&FirewallRule::masquerade("eth0")).await.unwrap();
        let mutations = runner.executed_mutations();
        assert_eq!(mutations.len(), 4);
        assert_eq!(mutations[0], "nft add table inet ztnet");
        assert_eq!(
            mutations[3],
            "nft add rule inet ztnet postrouting meta nfproto ipv4 oifname \"eth0\" masquerade"
        );
    }
}
