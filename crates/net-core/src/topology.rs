//! Multi-network topologies

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, NetworkError, ValidationError};
use crate::types::{DesiredState, NetworkId, TopologyRole};

/// How overlay networks of a topology forward to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyKind {
    /// The first network is the hub; spokes only forward to the hub
    #[default]
    HubSpoke,
    /// Every overlay pair forwards both ways
    Mesh,
}

impl TopologyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyKind::HubSpoke => "hub-spoke",
            TopologyKind::Mesh => "mesh",
        }
    }
}

impl FromStr for TopologyKind {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hub-spoke" | "hub_spoke" | "hubspoke" | "star" => Ok(TopologyKind::HubSpoke),
            "mesh" => Ok(TopologyKind::Mesh),
            _ => Err(NetworkError::Config(ConfigError::InvalidValue {
                field: "TOPOLOGY_TYPE".to_string(),
                value: s.to_string(),
            })),
        }
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One network of a topology with its assigned role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyNetwork {
    pub network_id: NetworkId,
    pub role: TopologyRole,
}

/// Ordered set of overlay networks deployed together on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    kind: TopologyKind,
    networks: Vec<TopologyNetwork>,
    physical_interface: Option<String>,
    ipv6: bool,
}

impl Topology {
    /// Build a topology from network ids in appearance order. In a hub-spoke
    /// topology the first id becomes the hub and the rest spokes; every mesh
    /// network is standalone.
    pub fn from_network_ids(kind: TopologyKind, ids: Vec<NetworkId>) -> Self {
        let networks = ids
            .into_iter()
            .enumerate()
            .map(|(index, network_id)| {
                let role = match (kind, index) {
                    (TopologyKind::Mesh, _) => TopologyRole::Standalone,
                    (TopologyKind::HubSpoke, 0) => TopologyRole::Hub,
                    (TopologyKind::HubSpoke, _) => TopologyRole::Spoke,
                };
                TopologyNetwork { network_id, role }
            })
            .collect();

        Self {
            kind,
            networks,
            physical_interface: None,
            ipv6: false,
        }
    }

    pub fn with_physical_interface(mut self, iface: Option<String>) -> Self {
        self.physical_interface = iface;
        self
    }

    pub fn with_ipv6(mut self, ipv6: bool) -> Self {
        self.ipv6 = ipv6;
        self
    }

    pub fn kind(&self) -> TopologyKind {
        self.kind
    }

    pub fn networks(&self) -> &[TopologyNetwork] {
        &self.networks
    }

    pub fn physical_interface(&self) -> Option<&str> {
        self.physical_interface.as_deref()
    }

    pub fn ipv6(&self) -> bool {
        self.ipv6
    }

    pub fn hub(&self) -> Option<&TopologyNetwork> {
        self.networks.first()
    }

    /// Structural checks: non-empty and free of duplicates
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.networks.is_empty() {
            return Err(NetworkError::Validation(ValidationError::Topology {
                message: "no network= entries found".to_string(),
            }));
        }

        let mut seen = HashSet::new();
        for network in &self.networks {
            if !seen.insert(&network.network_id) {
                return Err(NetworkError::Validation(ValidationError::Topology {
                    message: format!("network {} listed more than once", network.network_id),
                }));
            }
        }
        Ok(())
    }

    /// Per-network desired states in deployment order
    pub fn desired_states(&self) -> Vec<DesiredState> {
        self.networks
            .iter()
            .map(|network| {
                let mut state = DesiredState::new(network.network_id.clone())
                    .with_role(network.role)
                    .with_ipv6(self.ipv6);
                if let Some(iface) = &self.physical_interface {
                    state = state.with_physical_interface(iface.clone());
                }
                state
            })
            .collect()
    }

    /// Index pairs of networks whose overlay devices forward to each other
    pub fn forward_pairs(&self) -> Vec<(usize, usize)> {
        let count = self.networks.len();
        match self.kind {
            TopologyKind::HubSpoke => (1..count).map(|spoke| (0, spoke)).collect(),
            TopologyKind::Mesh => (0..count)
                .flat_map(|a| ((a + 1)..count).map(move |b| (a, b)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<NetworkId> {
        (0..n)
            .map(|i| format!("a1b2c3d4e5f6a7{:02x}", i).parse().unwrap())
            .collect()
    }

    #[test]
    fn test_first_network_is_hub() {
        let topology = Topology::from_network_ids(TopologyKind::HubSpoke, ids(3));
        let roles: Vec<_> = topology.networks().iter().map(|n| n.role).collect();
        assert_eq!(
            roles,
            vec![TopologyRole::Hub, TopologyRole::Spoke, TopologyRole::Spoke]
        );
        assert_eq!(topology.forward_pairs(), vec![(0, 1), (0, 2)]);
    }

    #[test]
    fn test_mesh_pairs() {
        let topology = Topology::from_network_ids(TopologyKind::Mesh, ids(3));
        assert!(topology
            .networks()
            .iter()
            .all(|n| n.role == TopologyRole::Standalone));
        assert!(topology
            .desired_states()
            .iter()
            .all(|d| d.role().is_lan_gateway()));
        assert_eq!(topology.forward_pairs(), vec![(0, 1), (0, 2), (1, 2)]);
    }

    #[test]
    fn test_validate_rejects_empty_and_duplicates() {
        let empty = Topology::from_network_ids(TopologyKind::HubSpoke, vec![]);
        assert!(empty.validate().is_err());

        let mut dup = ids(2);
        dup.push(dup[0].clone());
        let topology = Topology::from_network_ids(TopologyKind::HubSpoke, dup);
        assert!(topology.validate().is_err());
    }

    #[test]
    fn test_desired_states_carry_interface() {
        let topology = Topology::from_network_ids(TopologyKind::HubSpoke, ids(2))
            .with_physical_interface(Some("eth1".to_string()));
        let states = topology.desired_states();
        assert_eq!(states[0].physical_interface(), Some("eth1"));
        assert_eq!(states[1].role(), TopologyRole::Spoke);
    }
}
