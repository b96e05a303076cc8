//! Point-in-time health of the overlay service and its networks

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use ztnet_apply::forwarding::{forwarding_key, runtime_enabled};
use ztnet_apply::zerotier::STATUS_OK;
use ztnet_apply::{ApplyContext, Membership, NodeInfo, OverlayClient, Peer};
use ztnet_core::{DesiredState, IpFamily, NetworkId, Result};

/// Membership status of one monitored network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHealth {
    pub network_id: NetworkId,
    /// Client status, `None` when the network is not joined or the client
    /// did not answer
    pub status: Option<String>,
    pub device: Option<String>,
}

impl NetworkHealth {
    pub fn is_ok(&self) -> bool {
        self.status.as_deref() == Some(STATUS_OK)
    }

    /// Status as shown to operators
    pub fn status_label(&self) -> &str {
        self.status.as_deref().unwrap_or("NOT_JOINED")
    }
}

/// Result of one health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    /// The client answered `info` and reports itself online
    pub service_up: bool,
    pub node_address: Option<String>,
    pub networks: Vec<NetworkHealth>,
    /// Reachable leaf peers
    pub peer_count: usize,
    pub ipv4_forwarding: Option<bool>,
    /// Only checked for IPv6 gateways
    pub ipv6_forwarding: Option<bool>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.service_up
            && self.networks.iter().all(NetworkHealth::is_ok)
            && self.ipv4_forwarding != Some(false)
            && self.ipv6_forwarding != Some(false)
    }

    pub fn network(&self, id: &NetworkId) -> Option<&NetworkHealth> {
        self.networks.iter().find(|n| &n.network_id == id)
    }

    /// Single-line summary for the log and the CLI
    pub fn summary(&self) -> String {
        let networks = self
            .networks
            .iter()
            .map(|n| format!("{}={}", n.network_id, n.status_label()))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "service={} {} peers={} forwarding={}{}",
            if self.service_up { "up" } else { "down" },
            networks,
            self.peer_count,
            flag(self.ipv4_forwarding),
            match self.ipv6_forwarding {
                Some(_) => format!("/{}", flag(self.ipv6_forwarding)),
                None => String::new(),
            }
        )
    }
}

fn flag(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "on",
        Some(false) => "off",
        None => "unknown",
    }
}

/// Where health facts come from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn node_info(&self) -> Result<NodeInfo>;

    async fn memberships(&self) -> Result<Vec<Membership>>;

    async fn peers(&self) -> Result<Vec<Peer>>;

    /// Runtime kernel forwarding flag for `family`
    async fn forwarding(&self, family: IpFamily) -> Result<bool>;
}

/// [`HealthSource`] reading the live host through the overlay client and
/// `sysctl`
pub struct SystemHealthSource {
    ctx: ApplyContext,
    client: Arc<dyn OverlayClient>,
}

impl SystemHealthSource {
    pub fn new(ctx: ApplyContext, client: Arc<dyn OverlayClient>) -> Self {
        Self { ctx, client }
    }
}

#[async_trait]
impl HealthSource for SystemHealthSource {
    async fn node_info(&self) -> Result<NodeInfo> {
        self.client.info().await
    }

    async fn memberships(&self) -> Result<Vec<Membership>> {
        self.client.list_memberships().await
    }

    async fn peers(&self) -> Result<Vec<Peer>> {
        self.client.list_peers().await
    }

    async fn forwarding(&self, family: IpFamily) -> Result<bool> {
        runtime_enabled(&self.ctx, forwarding_key(family)).await
    }
}

/// Turns a [`HealthSource`] into [`HealthReport`]s.
///
/// A check never fails: whatever the source cannot answer is reported as
/// down, unknown or not joined.
pub struct HealthChecker {
    source: Arc<dyn HealthSource>,
}

impl HealthChecker {
    pub fn new(source: Arc<dyn HealthSource>) -> Self {
        Self { source }
    }

    /// Checker over the live host
    pub fn system(ctx: ApplyContext, client: Arc<dyn OverlayClient>) -> Self {
        Self::new(Arc::new(SystemHealthSource::new(ctx, client)))
    }

    pub async fn check_once(&self, desired: &DesiredState) -> HealthReport {
        self.check(std::slice::from_ref(desired.network_id()), desired.ipv6())
            .await
    }

    /// Check several networks at once, as a topology gateway needs
    pub async fn check(&self, networks: &[NetworkId], ipv6: bool) -> HealthReport {
        let info = match self.source.node_info().await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("Overlay service did not answer: {}", e);
                None
            }
        };
        let service_up = info.as_ref().map(|i| i.online).unwrap_or(false);

        let memberships = match self.source.memberships().await {
            Ok(memberships) => memberships,
            Err(e) => {
                warn!("Could not list memberships: {}", e);
                Vec::new()
            }
        };
        let networks = networks
            .iter()
            .map(|id| {
                let membership = memberships.iter().find(|m| m.matches(id));
                NetworkHealth {
                    network_id: id.clone(),
                    status: membership.map(|m| m.status.clone()),
                    device: membership.and_then(|m| m.device()).map(str::to_string),
                }
            })
            .collect();

        let peer_count = match self.source.peers().await {
            Ok(peers) => peers.iter().filter(|p| p.is_leaf()).count(),
            Err(e) => {
                warn!("Could not list peers: {}", e);
                0
            }
        };

        let report = HealthReport {
            timestamp: Utc::now(),
            service_up,
            node_address: info.map(|i| i.address),
            networks,
            peer_count,
            ipv4_forwarding: self.forwarding(IpFamily::V4).await,
            ipv6_forwarding: if ipv6 {
                self.forwarding(IpFamily::V6).await
            } else {
                None
            },
        };
        debug!("Health: {}", report.summary());
        report
    }

    async fn forwarding(&self, family: IpFamily) -> Option<bool> {
        match self.source.forwarding(family).await {
            Ok(enabled) => Some(enabled),
            Err(e) => {
                warn!("Could not read {} forwarding: {}", family, e);
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ztnet_core::error::ExecutionError;
    use ztnet_core::NetworkError;

    pub(crate) const NETWORK: &str = "a1b2c3d4e5f6a7b8";

    pub(crate) fn network_id() -> NetworkId {
        NETWORK.parse().unwrap()
    }

    pub(crate) fn node(online: bool) -> NodeInfo {
        NodeInfo {
            address: "89e92ceee5".to_string(),
            online,
            version: "1.14.0".to_string(),
        }
    }

    pub(crate) fn membership(status: &str) -> Membership {
        Membership {
            id: NETWORK.to_string(),
            name: "office".to_string(),
            status: status.to_string(),
            network_type: "PRIVATE".to_string(),
            port_device_name: Some("ztabcdef12".to_string()),
            assigned_addresses: vec!["10.147.17.5/24".to_string()],
        }
    }

    pub(crate) fn peer(role: &str) -> Peer {
        Peer {
            address: "a0b1c2d3e4".to_string(),
            role: role.to_string(),
            latency: 12,
            version: Some("1.14.0".to_string()),
        }
    }

    #[tokio::test]
    async fn test_healthy_gateway() {
        let mut source = MockHealthSource::new();
        source.expect_node_info().returning(|| Ok(node(true)));
        source
            .expect_memberships()
            .returning(|| Ok(vec![membership("OK")]));
        source
            .expect_peers()
            .returning(|| Ok(vec![peer("LEAF"), peer("PLANET"), peer("LEAF")]));
        source.expect_forwarding().returning(|_| Ok(true));

        let checker = HealthChecker::new(Arc::new(source));
        let report = checker.check_once(&DesiredState::new(network_id())).await;

        assert!(report.service_up);
        assert!(report.is_healthy());
        assert_eq!(report.peer_count, 2);
        assert_eq!(report.ipv4_forwarding, Some(true));
        assert_eq!(report.ipv6_forwarding, None);
        let network = report.network(&network_id()).unwrap();
        assert_eq!(network.device.as_deref(), Some("ztabcdef12"));
    }

    #[tokio::test]
    async fn test_service_down_reports_everything_missing() {
        let unavailable = || {
            NetworkError::Execution(ExecutionError::Unavailable {
                what: "zerotier-cli".to_string(),
            })
        };
        let mut source = MockHealthSource::new();
        source.expect_node_info().returning(move || Err(unavailable()));
        source.expect_memberships().returning(move || Err(unavailable()));
        source.expect_peers().returning(move || Err(unavailable()));
        source.expect_forwarding().returning(|_| Ok(false));

        let checker = HealthChecker::new(Arc::new(source));
        let desired = DesiredState::new(network_id()).with_ipv6(true);
        let report = checker.check_once(&desired).await;

        assert!(!report.service_up);
        assert!(!report.is_healthy());
        assert_eq!(report.peer_count, 0);
        assert_eq!(report.networks[0].status, None);
        assert_eq!(report.networks[0].status_label(), "NOT_JOINED");
        assert_eq!(report.ipv6_forwarding, Some(false));
    }

    #[test]
    fn test_summary() {
        let report = HealthReport {
            timestamp: Utc::now(),
            service_up: true,
            node_address: None,
            networks: vec![NetworkHealth {
                network_id: network_id(),
                status: Some("ACCESS_DENIED".to_string()),
                device: None,
            }],
            peer_count: 3,
            ipv4_forwarding: Some(true),
            ipv6_forwarding: None,
        };
        assert_eq!(
            report.summary(),
            "service=up a1b2c3d4e5f6a7b8=ACCESS_DENIED peers=3 forwarding=on"
        );
    }
}
