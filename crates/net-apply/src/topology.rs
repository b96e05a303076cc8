//! Multi-network topology deployment

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use ztnet_core::{
    FirewallRule, IpFamily, NetworkId, Result, Topology, TopologyKind, TopologyRole,
};
use ztnet_validate::require_root;

use crate::reconciler::{
    gateway_rules, ConfirmationPolicy, ReconcileOptions, ReconcileReport, Reconciler,
    OVERLAY_WILDCARD,
};
use crate::steps::{ensure, MembershipStep, Presence, StepRecord};

/// Forward rules in both directions between two overlay devices
pub fn overlay_link_rules(a: &str, b: &str, ipv6: bool) -> Vec<FirewallRule> {
    let mut rules = vec![
        FirewallRule::forward(IpFamily::V4, a, b),
        FirewallRule::forward(IpFamily::V4, b, a),
    ];
    if ipv6 {
        rules.push(FirewallRule::forward(IpFamily::V6, a, b));
        rules.push(FirewallRule::forward(IpFamily::V6, b, a));
    }
    rules
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyReport {
    pub kind: TopologyKind,
    pub networks: Vec<ReconcileReport>,
    /// Inter-overlay forward rules
    pub links: Vec<StepRecord>,
    pub declined: bool,
    pub error: Option<String>,
}

impl TopologyReport {
    fn new(kind: TopologyKind) -> Self {
        Self {
            kind,
            networks: Vec::new(),
            links: Vec::new(),
            declined: false,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.declined && self.error.is_none() && self.networks.iter().all(|r| r.is_success())
    }
}

/// Membership of one topology network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub network_id: NetworkId,
    pub role: TopologyRole,
    /// Client status, `None` when not joined
    pub status: Option<String>,
    pub device: Option<String>,
}

impl NetworkStatus {
    pub fn is_ok(&self) -> bool {
        self.status.as_deref() == Some(crate::zerotier::STATUS_OK)
    }
}

/// Deploys, inspects and removes a topology through a [`Reconciler`]
pub struct TopologyDeployer<'a> {
    reconciler: &'a Reconciler,
}

impl<'a> TopologyDeployer<'a> {
    pub fn new(reconciler: &'a Reconciler) -> Self {
        Self { reconciler }
    }

    pub fn validate(&self, topology: &Topology) -> Result<()> {
        self.reconciler.validator().validate_topology(topology)?;
        info!(
            "Topology {} with {} networks is valid",
            topology.kind(),
            topology.networks().len()
        );
        Ok(())
    }

    /// Reconcile every network in order, hub first, then link the overlays.
    ///
    /// The plan is confirmed once for the whole topology and a single
    /// snapshot is taken before the first network.
    pub async fn deploy(
        &self,
        topology: &Topology,
        options: &ReconcileOptions,
    ) -> Result<TopologyReport> {
        self.validate(topology)?;
        let mut report = TopologyReport::new(topology.kind());

        let plan = format!(
            "Deploy {} topology: {}",
            topology.kind(),
            topology
                .networks()
                .iter()
                .map(|n| format!("{} ({})", n.network_id, n.role))
                .collect::<Vec<_>>()
                .join(", ")
        );
        if !options.confirmation.confirm(&plan) {
            warn!("Topology deployment was declined");
            report.declined = true;
            return Ok(report);
        }

        for (index, desired) in topology.desired_states().iter().enumerate() {
            let network_options = ReconcileOptions {
                backup: options.backup && index == 0,
                confirmation: ConfirmationPolicy::AutoApprove,
            };
            let network_report = self.reconciler.reconcile(desired, &network_options).await?;
            let failed = !network_report.is_success();
            report.networks.push(network_report);
            if failed {
                report.error = Some(format!(
                    "network {} did not complete, remaining networks skipped",
                    desired.network_id()
                ));
                return Ok(report);
            }
        }

        let devices: Vec<String> = report
            .networks
            .iter()
            .map(|r| {
                r.overlay_interface
                    .clone()
                    .unwrap_or_else(|| OVERLAY_WILDCARD.to_string())
            })
            .collect();
        let rules = self.link_rules(topology, &devices);
        match self.reconciler.ensure_rules(rules, Presence::Present).await {
            Ok(records) => report.links = records,
            Err(e) => {
                error!("Linking the {} topology failed: {}", topology.kind(), e);
                report.error = Some(format!("overlay links: {}", e));
            }
        }
        Ok(report)
    }

    fn link_rules(&self, topology: &Topology, devices: &[String]) -> Vec<FirewallRule> {
        let mut rules = Vec::new();
        for (a, b) in topology.forward_pairs() {
            // dry-run wildcards would collapse into a device forwarding to itself
            if devices[a] == devices[b] {
                continue;
            }
            rules.extend(overlay_link_rules(&devices[a], &devices[b], topology.ipv6()));
        }
        rules
    }

    pub async fn status(&self, topology: &Topology) -> Result<Vec<NetworkStatus>> {
        let memberships = self.reconciler.client().list_memberships().await?;
        Ok(topology
            .networks()
            .iter()
            .map(|network| {
                let membership = memberships.iter().find(|m| m.matches(&network.network_id));
                NetworkStatus {
                    network_id: network.network_id.clone(),
                    role: network.role,
                    status: membership.map(|m| m.status.clone()),
                    device: membership.and_then(|m| m.device()).map(str::to_string),
                }
            })
            .collect())
    }

    /// Remove the overlay links and gateway rules, then leave every network
    pub async fn cleanup(&self, topology: &Topology) -> Result<Vec<StepRecord>> {
        self.validate(topology)?;
        let ctx = self.reconciler.context();
        if !ctx.is_dry_run() {
            require_root(self.reconciler.root_probe(), "cleaning up the topology")?;
        }

        let statuses = self.status(topology).await?;
        let devices: Vec<String> = statuses
            .iter()
            .map(|s| s.device.clone().unwrap_or_else(|| OVERLAY_WILDCARD.to_string()))
            .collect();

        let mut rules = self.link_rules(topology, &devices);
        let physical = match topology.physical_interface() {
            Some(iface) => Some(iface.to_string()),
            None => {
                self.reconciler
                    .validator()
                    .host()
                    .default_route_interface()
                    .await?
            }
        };
        for (desired, status) in topology.desired_states().iter().zip(&statuses) {
            match (&physical, &status.device) {
                (Some(physical), Some(device)) => rules.extend(gateway_rules(
                    desired.role(),
                    desired.ipv6(),
                    physical,
                    device,
                )),
                _ => info!(
                    "No overlay device for {}, gateway rules left alone",
                    desired.network_id()
                ),
            }
        }

        let mut records = self.reconciler.ensure_rules(rules, Presence::Absent).await?;
        for network in topology.networks() {
            let leave = MembershipStep::new(
                self.reconciler.client().clone(),
                network.network_id.clone(),
                Presence::Absent,
            );
            records.push(ensure(&leave, ctx.mode()).await?);
        }
        info!("Cleaned up {} topology", topology.kind());
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_link_rules() {
        let rules = overlay_link_rules("zt0", "zt1", false);
        assert_eq!(
            rules,
            vec![
                FirewallRule::forward(IpFamily::V4, "zt0", "zt1"),
                FirewallRule::forward(IpFamily::V4, "zt1", "zt0"),
            ]
        );
        assert_eq!(overlay_link_rules("zt0", "zt1", true).len(), 4);
    }
}
