//! Core gateway types and data structures

use std::fmt;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, NetworkError};

/// Length of a ZeroTier network identifier in hex characters
pub const NETWORK_ID_LEN: usize = 16;

/// Overlay network identifier: 16 hex characters, stored lowercase
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkId(String);

impl NetworkId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for NetworkId {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed =
            s.len() == NETWORK_ID_LEN && s.chars().all(|c| c.is_ascii_hexdigit());
        if !well_formed {
            return Err(NetworkError::Config(ConfigError::InvalidNetworkId {
                value: s.to_string(),
            }));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for NetworkId {
    type Error = NetworkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NetworkId> for String {
    fn from(id: NetworkId) -> Self {
        id.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role a network plays in a topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyRole {
    #[default]
    Standalone,
    Hub,
    Spoke,
}

impl TopologyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyRole::Standalone => "standalone",
            TopologyRole::Hub => "hub",
            TopologyRole::Spoke => "spoke",
        }
    }

    /// Whether this role routes the physical LAN through NAT
    pub fn is_lan_gateway(&self) -> bool {
        !matches!(self, TopologyRole::Spoke)
    }
}

impl FromStr for TopologyRole {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standalone" | "gateway" => Ok(TopologyRole::Standalone),
            "hub" => Ok(TopologyRole::Hub),
            "spoke" => Ok(TopologyRole::Spoke),
            _ => Err(NetworkError::Config(ConfigError::InvalidValue {
                field: "TOPOLOGY_ROLE".to_string(),
                value: s.to_string(),
            })),
        }
    }
}

impl fmt::Display for TopologyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired gateway configuration. Built once by the config loader and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    network_id: NetworkId,
    physical_interface: Option<String>,
    physical_subnet: Option<IpNet>,
    ipv6: bool,
    role: TopologyRole,
}

impl DesiredState {
    /// Create desired state for a standalone gateway on `network_id`
    pub fn new(network_id: NetworkId) -> Self {
        Self {
            network_id,
            physical_interface: None,
            physical_subnet: None,
            ipv6: false,
            role: TopologyRole::Standalone,
        }
    }

    pub fn with_physical_interface(mut self, iface: impl Into<String>) -> Self {
        self.physical_interface = Some(iface.into());
        self
    }

    pub fn with_physical_subnet(mut self, subnet: IpNet) -> Self {
        self.physical_subnet = Some(subnet);
        self
    }

    pub fn with_ipv6(mut self, ipv6: bool) -> Self {
        self.ipv6 = ipv6;
        self
    }

    pub fn with_role(mut self, role: TopologyRole) -> Self {
        self.role = role;
        self
    }

    pub fn network_id(&self) -> &NetworkId {
        &self.network_id
    }

    pub fn physical_interface(&self) -> Option<&str> {
        self.physical_interface.as_deref()
    }

    pub fn physical_subnet(&self) -> Option<&IpNet> {
        self.physical_subnet.as_ref()
    }

    pub fn ipv6(&self) -> bool {
        self.ipv6
    }

    pub fn role(&self) -> TopologyRole {
        self.role
    }
}

/// Firewall subsystem managing the host's packet filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Iptables,
    Firewalld,
    Ufw,
    Nftables,
    None,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Iptables => "iptables",
            Backend::Firewalld => "firewalld",
            Backend::Ufw => "ufw",
            Backend::Nftables => "nftables",
            Backend::None => "none",
        }
    }
}

impl FromStr for Backend {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "iptables" => Ok(Backend::Iptables),
            "firewalld" => Ok(Backend::Firewalld),
            "ufw" => Ok(Backend::Ufw),
            "nftables" | "nft" => Ok(Backend::Nftables),
            "none" => Ok(Backend::None),
            _ => Err(NetworkError::Config(ConfigError::InvalidValue {
                field: "FIREWALL_BACKEND".to_string(),
                value: s.to_string(),
            })),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IP protocol family a rule or kernel flag applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpFamily::V4 => "ipv4",
            IpFamily::V6 => "ipv6",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single gateway firewall rule, independent of the backend that enforces it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FirewallRule {
    /// Rewrite the source address of packets leaving `out_iface`
    Masquerade { family: IpFamily, out_iface: String },
    /// Accept forwarded packets from `in_iface` to `out_iface`
    ForwardAccept {
        family: IpFamily,
        in_iface: String,
        out_iface: String,
        established_only: bool,
    },
}

impl FirewallRule {
    pub fn masquerade(out_iface: &str) -> Self {
        FirewallRule::Masquerade {
            family: IpFamily::V4,
            out_iface: out_iface.to_string(),
        }
    }

    pub fn forward(family: IpFamily, in_iface: &str, out_iface: &str) -> Self {
        FirewallRule::ForwardAccept {
            family,
            in_iface: in_iface.to_string(),
            out_iface: out_iface.to_string(),
            established_only: false,
        }
    }

    pub fn forward_established(family: IpFamily, in_iface: &str, out_iface: &str) -> Self {
        FirewallRule::ForwardAccept {
            family,
            in_iface: in_iface.to_string(),
            out_iface: out_iface.to_string(),
            established_only: true,
        }
    }

    pub fn family(&self) -> IpFamily {
        match self {
            FirewallRule::Masquerade { family, .. } | FirewallRule::ForwardAccept { family, .. } => {
                *family
            }
        }
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallRule::Masquerade { family, out_iface } => {
                write!(f, "NAT masquerade on {} ({})", out_iface, family)
            }
            FirewallRule::ForwardAccept {
                family,
                in_iface,
                out_iface,
                established_only,
            } => {
                let scope = if *established_only {
                    "related/established"
                } else {
                    "all"
                };
                write!(
                    f,
                    "forward {} -> {} accept {} ({})",
                    in_iface, out_iface, scope, family
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_network_id_normalizes_case() {
        let id: NetworkId = "A1B2C3D4E5F6A7B8".parse().unwrap();
        assert_eq!(id.as_str(), "a1b2c3d4e5f6a7b8");
    }

    #[test]
    fn test_network_id_rejects_bad_shapes() {
        for bad in ["", "a1b2c3d4e5f6a7b", "a1b2c3d4e5f6a7b8c", "g1b2c3d4e5f6a7b8", " a1b2c3d4e5f6a7b"] {
            let err = bad.parse::<NetworkId>().unwrap_err();
            assert!(matches!(
                err,
                NetworkError::Config(ConfigError::InvalidNetworkId { .. })
            ));
        }
    }

    #[test]
    fn test_network_id_serde() {
        let id: NetworkId = serde_json::from_str("\"8056C2E21C000001\"").unwrap();
        assert_eq!(id.to_string(), "8056c2e21c000001");
        assert!(serde_json::from_str::<NetworkId>("\"nope\"").is_err());
    }

    #[test]
    fn test_backend_round_trip() {
        for backend in [
            Backend::Iptables,
            Backend::Firewalld,
            Backend::Ufw,
            Backend::Nftables,
            Backend::None,
        ] {
            assert_eq!(backend.as_str().parse::<Backend>().unwrap(), backend);
        }
        assert!("pf".parse::<Backend>().is_err());
    }

    #[test]
    fn test_spoke_is_not_lan_gateway() {
        assert!(TopologyRole::Standalone.is_lan_gateway());
        assert!(TopologyRole::Hub.is_lan_gateway());
        assert!(!TopologyRole::Spoke.is_lan_gateway());
    }

    #[test]
    fn test_rule_description() {
        let rule = FirewallRule::forward_established(IpFamily::V4, "eth0", "zt0");
        assert_eq!(
            rule.to_string(),
            "forward eth0 -> zt0 accept related/established (ipv4)"
        );
    }

    proptest! {
        #[test]
        fn prop_hex_ids_are_accepted(id in "[0-9a-fA-F]{16}") {
            let parsed: NetworkId = id.parse().unwrap();
            prop_assert_eq!(parsed.as_str(), id.to_ascii_lowercase());
        }

        #[test]
        fn prop_other_strings_are_rejected(id in "\\PC{0,24}") {
            let well_formed = id.len() == 16 && id.chars().all(|c| c.is_ascii_hexdigit());
            prop_assume!(!well_formed);
            let is_config_error = matches!(
                id.parse::<NetworkId>(),
                Err(NetworkError::Config(ConfigError::InvalidNetworkId { .. }))
            );
            prop_assert!(is_config_error);
        }
    }
}
