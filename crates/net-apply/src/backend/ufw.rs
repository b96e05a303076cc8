//! ufw adapter
//!
//! ufw has no command for NAT, so masquerading lives in the `*nat` block of
//! `before.rules`. Forwarding uses `ufw route` rules.

use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, info};

use ztnet_core::error::ExecutionError;
use ztnet_core::{Backend, FirewallRule, IpFamily, NetworkError, Result};
use ztnet_exec::CommandSpec;

use super::{forward_parts, FirewallBackend, RuleDump};
use crate::context::ApplyContext;

const DUMP: &str = "ufw-added.rules";
const NAT_HEADER: &str = "# NAT rules added by ztnet";

pub struct UfwBackend {
    ctx: ApplyContext,
}

impl UfwBackend {
    pub fn new(ctx: ApplyContext) -> Self {
        Self { ctx }
    }

    async fn before_rules(&self) -> Result<String> {
        let path = &self.ctx.paths().ufw_before_rules;
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(NetworkError::Execution(ExecutionError::FileOperation {
                path: path.display().to_string(),
                reason: e.to_string(),
            })),
        }
    }

    async fn write_before_rules(&self, content: &str) -> Result<()> {
        self.ctx
            .runner()
            .write_file(&self.ctx.paths().ufw_before_rules, content)
            .await?;
        self.reload_ufw().await
    }

    async fn reload_ufw(&self) -> Result<()> {
        self.ctx
            .runner()
            .run(&CommandSpec::mutate("ufw").arg("reload"))
            .await?
            .ensure_success()?;
        Ok(())
    }

    async fn added_rules(&self) -> Result<String> {
        Ok(self
            .ctx
            .runner()
            .run(&CommandSpec::query("ufw").args(["show", "added"]))
            .await?
            .ensure_success()?
            .stdout)
    }
}

fn masquerade_line(rule: &FirewallRule) -> Result<Option<String>> {
    match rule {
        FirewallRule::Masquerade {
            family: IpFamily::V4,
            out_iface,
        } => Ok(Some(format!("-A POSTROUTING -o {} -j MASQUERADE", out_iface))),
        FirewallRule::Masquerade { .. } => {
            Err(NetworkError::Execution(ExecutionError::Unavailable {
                what: "IPv6 masquerading through ufw".to_string(),
            }))
        }
        FirewallRule::ForwardAccept { .. } => Ok(None),
    }
}

/// `in on A out on B` for a route rule
fn route_words(in_iface: &str, out_iface: &str) -> Vec<String> {
    ["in", "on", in_iface, "out", "on", out_iface]
        .map(String::from)
        .to_vec()
}

fn has_line(content: &str, line: &str) -> bool {
    content.lines().any(|l| l.trim() == line)
}

/// Add `line` to the `*nat` block, creating the block at the top if needed
pub fn insert_nat_rule(content: &str, line: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let nat_start = lines.iter().position(|l| l.trim() == "*nat");
    let commit = nat_start.and_then(|start| {
        lines[start..]
            .iter()
            .position(|l| l.trim() == "COMMIT")
            .map(|offset| start + offset)
    });

    match commit {
        Some(index) => {
            let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 1);
            out.extend_from_slice(&lines[..index]);
            out.push(line);
            out.extend_from_slice(&lines[index..]);
            let mut result = out.join("\n");
            result.push('\n');
            result
        }
        None => {
            let mut result = format!(
                "{}\n*nat\n:POSTROUTING ACCEPT [0:0]\n{}\nCOMMIT\n\n",
                NAT_HEADER, line
            );
            result.push_str(content);
            result
        }
    }
}

/// Drop every occurrence of `line`
pub fn remove_nat_rule(content: &str, line: &str) -> String {
    let mut result = content
        .lines()
        .filter(|l| l.trim() != line)
        .collect::<Vec<_>>()
        .join("\n");
    if content.ends_with('\n') {
        result.push('\n');
    }
    result
}

#[async_trait]
impl FirewallBackend for UfwBackend {
    fn kind(&self) -> Backend {
        Backend::Ufw
    }

    async fn rule_present(&self, rule: &FirewallRule) -> Result<bool> {
        if let Some(line) = masquerade_line(rule)? {
            return Ok(has_line(&self.before_rules().await?, &line));
        }
        match forward_parts(rule) {
            // ufw tracks connection state itself
            Some((_, _, true)) => Ok(true),
            Some((in_iface, out_iface, false)) => {
                let wanted = format!("ufw route allow {}", route_words(in_iface, out_iface).join(" "));
                Ok(has_line(&self.added_rules().await?, &wanted))
            }
            None => Ok(false),
        }
    }

    async fn add_rule(&self, rule: &FirewallRule) -> Result<()> {
        if let Some(line) = masquerade_line(rule)? {
            let content = self.before_rules().await?;
            self.write_before_rules(&insert_nat_rule(&content, &line))
                .await?;
            info!("Added {} to before.rules", rule);
            return Ok(());
        }
        match forward_parts(rule) {
            Some((in_iface, out_iface, false)) => {
                self.ctx
                    .runner()
                    .run(
                        &CommandSpec::mutate("ufw")
                            .args(["route", "allow"])
                            .args(route_words(in_iface, out_iface)),
                    )
                    .await?
                    .ensure_success()?;
                info!("Added {}", rule);
            }
            _ => debug!("{} is implied by ufw connection tracking", rule),
        }
        Ok(())
    }

    async fn remove_rule(&self, rule: &FirewallRule) -> Result<()> {
        if let Some(line) = masquerade_line(rule)? {
            let content = self.before_rules().await?;
            self.write_before_rules(&remove_nat_rule(&content, &line))
                .await?;
            info!("Removed {} from before.rules", rule);
            return Ok(());
        }
        if let Some((in_iface, out_iface, false)) = forward_parts(rule) {
            self.ctx
                .runner()
                .run(
                    &CommandSpec::mutate("ufw")
                        .args(["route", "delete", "allow"])
                        .args(route_words(in_iface, out_iface)),
                )
                .await?
                .ensure_success()?;
            info!("Removed {}", rule);
        }
        Ok(())
    }

    /// ufw writes its own rule files on every change
    async fn persist(&self) -> Result<()> {
        Ok(())
    }

    fn persistent_files(&self) -> Vec<PathBuf> {
        let paths = self.ctx.paths();
        vec![
            paths.ufw_before_rules.clone(),
            paths.ufw_user_rules.clone(),
            paths.ufw_user6_rules.clone(),
        ]
    }

    async fn dump(&self) -> Result<Vec<RuleDump>> {
        Ok(vec![RuleDump {
            name: DUMP.to_string(),
            contents: self.added_rules().await?,
        }])
    }

    async fn reload(&self, _dumps: &[RuleDump]) -> Result<()> {
        self.reload_ufw().await?;
        info!("Reloaded ufw");
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

    const BEFORE_RULES: &str = "#\n# rules.before\n#\n*filter\n:ufw-before-input - [0:0]\nCOMMIT\n";

    #[test]
    fn test_insert_creates_nat_block_once() {
        let line = "-A POSTROUTING -o eth0 -j MASQUERADE";
        let first = insert_nat_rule(BEFORE_RULES, line);
        assert!(first.starts_with(NAT_HEADER));
        assert!(first.ends_with(BEFORE_RULES));
        assert!(has_line(&first, line));

        let second = insert_nat_rule(&first, "-A POSTROUTING -o eth1 -j MASQUERADE");
        assert_eq!(second.matches("*nat").count(), 1);
        let nat_commit = second.find("COMMIT").unwrap();
        assert!(second.find("-o eth1").unwrap() < nat_commit);
    }

    #[test]
    fn test_remove_nat_rule() {
        let line = "-A POSTROUTING -o eth0 -j MASQUERADE";
        let with_rule = insert_nat_rule(BEFORE_RULES, line);
        let without = remove_nat_rule(&with_rule, line);
        assert!(!has_line(&without, line));
        assert!(without.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_masquerade_round_trip_through_file() {
        let temp_dir = TempDir::new().unwrap();
        let paths = HostPaths::under(temp_dir.path());
        std::fs::create_dir_all(paths.ufw_before_rules.parent().unwrap()).unwrap();
        std::fs::write(&paths.ufw_before_rules, BEFORE_RULES).unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.on("ufw reload", 0, "Firewall reloaded");
        let settings = ToolSettings {
            paths,
            ..Default::default()
        };
        let backend = UfwBackend::new(ApplyContext::new(runner.clone(), settings));

        let rule = FirewallRule::masquerade("eth0");
        assert!(!backend.rule_present(&rule).await.unwrap());
        backend.add_rule(&rule).await.unwrap();
        assert!(backend.rule_present(&rule).await.unwrap());
        assert_eq!(runner.executed_mutations(), vec!["ufw reload"]);
    }

    #[tokio::test]
    async fn test_route_rules() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "ufw show added",
            0,
            "Added user rules (see 'ufw status' for running firewall):\nufw route allow in on zt0 out on eth0\n",
        );
        let backend = UfwBackend::new(ApplyContext::new(runner, ToolSettings::default()));

        assert!(backend
            .rule_present(&FirewallRule::forward(IpFamily::V4, "zt0", "eth0"))
            .await
            .unwrap());
        assert!(!backend
            .rule_present(&FirewallRule::forward(IpFamily::V4, "eth0", "zt0"))
            .await
            .unwrap());
        assert!(backend
            .rule_present(&FirewallRule::forward_established(IpFamily::V4, "eth0", "zt0"))
            .await
            .unwrap());
    }
}
