//! Read-only diagnostics of a gateway host

use std::fmt::Write as _;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use ztnet_apply::forwarding::{forwarding_key, runtime_enabled};
use ztnet_apply::{gateway_rules, ApplyContext, FirewallBackend, Membership, OverlayClient};
use ztnet_core::{Backend, DesiredState, FirewallRule, IpFamily};
use ztnet_validate::HostInspector;

/// Whether one planned rule is enforced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCheck {
    pub rule: FirewallRule,
    /// `None` when the backend could not answer
    pub present: Option<bool>,
}

/// Everything `diagnose` found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub backend: Backend,
    pub client_version: Option<String>,
    pub node_address: Option<String>,
    pub online: bool,
    pub memberships: Vec<Membership>,
    pub leaf_peers: usize,
    pub total_peers: usize,
    pub ipv4_forwarding: Option<bool>,
    pub ipv6_forwarding: Option<bool>,
    pub default_route: Option<String>,
    pub rules: Vec<RuleCheck>,
    /// Human-readable findings; empty on a healthy gateway
    pub problems: Vec<String>,
}

impl Diagnosis {
    pub fn is_healthy(&self) -> bool {
        self.problems.is_empty()
    }

    /// Plain-text report for the terminal
    pub fn render(&self) -> String {
        let mut out = String::new();
        let yes_no = |v: Option<bool>| match v {
            Some(true) => "enabled",
            Some(false) => "disabled",
            None => "unknown",
        };

        let _ = writeln!(out, "Firewall backend: {}", self.backend);
        let _ = writeln!(
            out,
            "Overlay client:   {} (node {}, {})",
            self.client_version.as_deref().unwrap_or("not answering"),
            self.node_address.as_deref().unwrap_or("-"),
            if self.online { "online" } else { "offline" }
        );
        let _ = writeln!(out, "Memberships:");
        if self.memberships.is_empty() {
            let _ = writeln!(out, "  none");
        }
        for m in &self.memberships {
            let _ = writeln!(
                out,
                "  {} {} {} {} {}",
                m.id,
                if m.name.is_empty() { "-" } else { &m.name },
                m.status,
                m.device().unwrap_or("-"),
                m.assigned_addresses.join(",")
            );
        }
        let _ = writeln!(
            out,
            "Peers:            {} leaf of {}",
            self.leaf_peers, self.total_peers
        );
        let _ = writeln!(out, "IPv4 forwarding:  {}", yes_no(self.ipv4_forwarding));
        let _ = writeln!(out, "IPv6 forwarding:  {}", yes_no(self.ipv6_forwarding));
        let _ = writeln!(
            out,
            "Default route:    {}",
            self.default_route.as_deref().unwrap_or("none")
        );
        if !self.rules.is_empty() {
            let _ = writeln!(out, "Gateway rules:");
            for check in &self.rules {
                let state = match check.present {
                    Some(true) => "present",
                    Some(false) => "MISSING",
                    None => "unknown",
                };
                let _ = writeln!(out, "  [{}] {}", state, check.rule);
            }
        }
        if self.problems.is_empty() {
            let _ = writeln!(out, "No problems found");
        } else {
            let _ = writeln!(out, "Problems:");
            for problem in &self.problems {
                let _ = writeln!(out, "  - {}", problem);
            }
        }
        out
    }
}

/// Collects a [`Diagnosis`] without changing anything on the host
pub struct Diagnostics {
    ctx: ApplyContext,
    client: Arc<dyn OverlayClient>,
    backend: Arc<dyn FirewallBackend>,
    host: HostInspector,
}

impl Diagnostics {
    pub fn new(
        ctx: ApplyContext,
        client: Arc<dyn OverlayClient>,
        backend: Arc<dyn FirewallBackend>,
    ) -> Self {
        let host = HostInspector::new(ctx.runner().clone());
        Self {
            ctx,
            client,
            backend,
            host,
        }
    }

    /// Inspect the host; with a desired state the gateway's planned rules
    /// and membership are checked as well
    pub async fn run(&self, desired: Option<&DesiredState>) -> Diagnosis {
        let mut problems = Vec::new();

        let backend = self.backend.kind();
        if backend == Backend::None {
            problems.push("no firewall backend available".to_string());
        }

        let info = match self.client.info().await {
            Ok(info) => Some(info),
            Err(e) => {
                problems.push(format!("overlay client not answering: {}", e));
                None
            }
        };
        let online = info.as_ref().map(|i| i.online).unwrap_or(false);
        if info.is_some() && !online {
            problems.push("overlay client is offline".to_string());
        }

        let memberships = self.client.list_memberships().await.unwrap_or_else(|e| {
            warn!("Could not list memberships: {}", e);
            Vec::new()
        });
        let peers = self.client.list_peers().await.unwrap_or_else(|e| {
            warn!("Could not list peers: {}", e);
            Vec::new()
        });
        let leaf_peers = peers.iter().filter(|p| p.is_leaf()).count();

        let ipv6 = desired.map(|d| d.ipv6()).unwrap_or(false);
        let ipv4_forwarding = self.forwarding(IpFamily::V4).await;
        let ipv6_forwarding = self.forwarding(IpFamily::V6).await;
        if ipv4_forwarding == Some(false) {
            problems.push("IPv4 forwarding is disabled".to_string());
        }
        if ipv6 && ipv6_forwarding == Some(false) {
            problems.push("IPv6 forwarding is disabled".to_string());
        }

        let default_route = self.host.default_route_interface().await.unwrap_or_else(|e| {
            warn!("Could not read the default route: {}", e);
            None
        });
        if default_route.is_none() {
            problems.push("no default route".to_string());
        }

        let mut rules = Vec::new();
        if let Some(desired) = desired {
            let membership = memberships.iter().find(|m| m.matches(desired.network_id()));
            match membership {
                None => problems.push(format!("not joined to {}", desired.network_id())),
                Some(m) if !m.is_ok() => problems.push(format!(
                    "network {} status is {}",
                    desired.network_id(),
                    m.status
                )),
                Some(_) => {}
            }

            let physical = desired
                .physical_interface()
                .map(str::to_string)
                .or_else(|| default_route.clone());
            let overlay = membership.and_then(|m| m.device());
            if let (Some(physical), Some(overlay)) = (physical, overlay) {
                for rule in gateway_rules(desired.role(), ipv6, &physical, overlay) {
                    let present = match self.backend.rule_present(&rule).await {
                        Ok(present) => Some(present),
                        Err(e) => {
                            warn!("Could not check {}: {}", rule, e);
                            None
                        }
                    };
                    if present == Some(false) {
                        problems.push(format!("missing rule: {}", rule));
                    }
                    rules.push(RuleCheck { rule, present });
                }
            }
        }

        info!("Diagnostics found {} problems", problems.len());
        Diagnosis {
            backend,
            client_version: info.as_ref().map(|i| i.version.clone()),
            node_address: info.map(|i| i.address),
            online,
            memberships,
            leaf_peers,
            total_peers: peers.len(),
            ipv4_forwarding,
            ipv6_forwarding,
            default_route,
            rules,
            problems,
        }
    }

    async fn forwarding(&self, family: IpFamily) -> Option<bool> {
        runtime_enabled(&self.ctx, forwarding_key(family)).await.ok()
    }
}
