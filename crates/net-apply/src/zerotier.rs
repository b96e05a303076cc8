//! Overlay client capability backed by `zerotier-cli`
//!
//! Queries use the client's JSON mode (`-j`). When that is unavailable the
//! plain-text output is parsed instead; both paths stay inside this module.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use ztnet_core::error::ExecutionError;
use ztnet_core::{NetworkError, NetworkId, Result};
use ztnet_exec::{CommandRunner, CommandSpec, RunResult};

const CLI: &str = "zerotier-cli";

/// Membership status reported for a healthy network
pub const STATUS_OK: &str = "OK";

/// One joined network as reported by `listnetworks`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "type")]
    pub network_type: String,
    #[serde(default)]
    pub port_device_name: Option<String>,
    #[serde(default)]
    pub assigned_addresses: Vec<String>,
}

impl Membership {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Overlay device once the client has created it
    pub fn device(&self) -> Option<&str> {
        self.port_device_name
            .as_deref()
            .filter(|d| !d.is_empty() && *d != "-")
    }

    /// First assigned IPv4 address without its prefix length
    pub fn ipv4_address(&self) -> Option<&str> {
        self.assigned_addresses
            .iter()
            .map(|a| a.split('/').next().unwrap_or(a))
            .find(|a| !a.contains(':'))
    }

    pub fn matches(&self, id: &NetworkId) -> bool {
        self.id.eq_ignore_ascii_case(id.as_str())
    }
}

/// One peer as reported by `peers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub address: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub latency: i64,
    #[serde(default)]
    pub version: Option<String>,
}

impl Peer {
    /// Leaf peers are other nodes, as opposed to roots
    pub fn is_leaf(&self) -> bool {
        self.role.eq_ignore_ascii_case("LEAF")
    }
}

/// Local node status as reported by `info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub address: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub version: String,
}

/// Typed operations on the overlay networking client
#[async_trait]
pub trait OverlayClient: Send + Sync {
    async fn info(&self) -> Result<NodeInfo>;

    async fn list_memberships(&self) -> Result<Vec<Membership>>;

    async fn list_peers(&self) -> Result<Vec<Peer>>;

    async fn join(&self, network: &NetworkId) -> Result<()>;

    async fn leave(&self, network: &NetworkId) -> Result<()>;

    async fn membership(&self, network: &NetworkId) -> Result<Option<Membership>> {
        Ok(self
            .list_memberships()
            .await?
            .into_iter()
            .find(|m| m.matches(network)))
    }
}

/// [`OverlayClient`] that shells out to `zerotier-cli`
pub struct ZeroTierCli {
    runner: Arc<dyn CommandRunner>,
}

impl ZeroTierCli {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Run a query in JSON mode, falling back to text output
    async fn query<T, F>(&self, verb: &str, parse_text: F) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
        F: Fn(&str) -> Option<T>,
    {
        let json = self
            .runner
            .run(&CommandSpec::query(CLI).args(["-j", verb]))
            .await?;
        if json.success() {
            match serde_json::from_str(&json.stdout) {
                Ok(value) => return Ok(value),
                Err(e) => debug!("{} returned non-JSON output: {}", json.command, e),
            }
        }

        let text = self
            .runner
            .run(&CommandSpec::query(CLI).arg(verb))
            .await?
            .ensure_success()?;
        parse_text(&text.stdout).ok_or_else(|| unexpected(&text, "unrecognized output"))
    }

    async fn membership_change(&self, verb: &str, network: &NetworkId) -> Result<()> {
        let result = self
            .runner
            .run(&CommandSpec::mutate(CLI).args([verb, network.as_str()]))
            .await?
            .ensure_success()?;
        if !result.simulated && !result.stdout.contains("OK") {
            warn!("{} answered: {}", result.command, result.stdout.trim());
        }
        info!("{} network {}", verb, network);
        Ok(())
    }
}

#[async_trait]
impl OverlayClient for ZeroTierCli {
    async fn info(&self) -> Result<NodeInfo> {
        self.query("info", parse_info_text).await
    }

    async fn list_memberships(&self) -> Result<Vec<Membership>> {
        self.query("listnetworks", |text| Some(parse_listnetworks_text(text)))
            .await
    }

    async fn list_peers(&self) -> Result<Vec<Peer>> {
        self.query("peers", |text| Some(parse_peers_text(text))).await
    }

    async fn join(&self, network: &NetworkId) -> Result<()> {
        self.membership_change("join", network).await
    }

    async fn leave(&self, network: &NetworkId) -> Result<()> {
        self.membership_change("leave", network).await
    }
}

fn unexpected(result: &RunResult, reason: &str) -> NetworkError {
    NetworkError::Execution(ExecutionError::UnexpectedOutput {
        command: result.command.clone(),
        reason: reason.to_string(),
    })
}

/// `200 info <address> <version> ONLINE|OFFLINE|TUNNELED`
fn parse_info_text(text: &str) -> Option<NodeInfo> {
    text.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["200", "info", address, version, status, ..] => Some(NodeInfo {
                address: address.to_string(),
                online: *status != "OFFLINE",
                version: version.to_string(),
            }),
            _ => None,
        }
    })
}

/// `200 listnetworks <nwid> <name> <mac> <status> <type> <dev> <ips>`
fn parse_listnetworks_text(text: &str) -> Vec<Membership> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let rest = match fields.as_slice() {
                ["200", "listnetworks", rest @ ..] => rest,
                _ => return None,
            };
            if rest.first().map_or(true, |f| f.starts_with('<')) {
                return None;
            }
            // an unnamed network drops the name column
            let (id, name, tail) = match rest.len() {
                n if n >= 7 => (rest[0], rest[1], &rest[3..]),
                6 => (rest[0], "", &rest[2..]),
                _ => return None,
            };
            let addresses = tail
                .get(3)
                .filter(|ips| **ips != "-")
                .map(|ips| ips.split(',').map(str::to_string).collect())
                .unwrap_or_default();
            Some(Membership {
                id: id.to_ascii_lowercase(),
                name: name.to_string(),
                status: tail[0].to_string(),
                network_type: tail[1].to_string(),
                port_device_name: Some(tail[2].to_string()),
                assigned_addresses: addresses,
            })
        })
        .collect()
}

/// Rows of `<ztaddr> <ver> <role> <lat> ...`, with or without a `200 peers` prefix
fn parse_peers_text(text: &str) -> Vec<Peer> {
    text.lines()
        .filter_map(|line| {
            let mut fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 2 && fields[0] == "200" && fields[1] == "peers" {
                fields.drain(..2);
            }
            let address = *fields.first()?;
            let is_address = address.len() == 10 && address.chars().all(|c| c.is_ascii_hexdigit());
            if !is_address || fields.len() < 4 {
                return None;
            }
            Some(Peer {
                address: address.to_string(),
                version: Some(fields[1].to_string()).filter(|v| v != "-"),
                role: fields[2].to_string(),
                latency: fields[3].parse().unwrap_or(-1),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ztnet_exec::ScriptedRunner;

    const LISTNETWORKS_JSON: &str = r#"[
      {"allowDNS":false,"assignedAddresses":["10.147.17.5/24","fd80::1/88"],"id":"a1b2c3d4e5f6a7b8","mac":"aa:bb:cc:dd:ee:ff","name":"office","nwid":"a1b2c3d4e5f6a7b8","portDeviceName":"ztabcdef12","status":"OK","type":"PRIVATE"}
    ]"#;

    fn id(value: &str) -> NetworkId {
        value.parse().unwrap()
    }

    #[tokio::test]
    async fn test_listnetworks_json() {
        let runner = ScriptedRunner::new();
        runner.on("zerotier-cli -j listnetworks", 0, LISTNETWORKS_JSON);
        let client = ZeroTierCli::new(Arc::new(runner));

        let membership = client
            .membership(&id("A1B2C3D4E5F6A7B8"))
            .await
            .unwrap()
            .unwrap();
        assert!(membership.is_ok());
        assert_eq!(membership.device(), Some("ztabcdef12"));
        assert_eq!(membership.ipv4_address(), Some("10.147.17.5"));
    }

    #[tokio::test]
    async fn test_listnetworks_text_fallback() {
        let runner = ScriptedRunner::new();
        runner.on("zerotier-cli -j", 1, "");
        runner.on(
            "zerotier-cli listnetworks",
            0,
            "200 listnetworks <nwid> <name> <mac> <status> <type> <dev> <ZT assigned ips>\n\
             200 listnetworks a1b2c3d4e5f6a7b8 office aa:bb:cc:dd:ee:ff OK PRIVATE ztabcdef12 10.147.17.5/24\n\
             200 listnetworks 1111111111111111 00:11:22:33:44:55 REQUESTING_CONFIGURATION PRIVATE zt1111 -\n",
        );
        let client = ZeroTierCli::new(Arc::new(runner));

        let memberships = client.list_memberships().await.unwrap();
        assert_eq!(memberships.len(), 2);
        assert_eq!(memberships[0].device(), Some("ztabcdef12"));
        assert_eq!(memberships[0].assigned_addresses, vec!["10.147.17.5/24"]);
        assert_eq!(memberships[1].name, "");
        assert_eq!(memberships[1].status, "REQUESTING_CONFIGURATION");
        assert!(memberships[1].assigned_addresses.is_empty());
    }

    #[tokio::test]
    async fn test_peers_and_info() {
        let runner = ScriptedRunner::new();
        runner.on(
            "zerotier-cli -j peers",
            0,
            r#"[{"address":"61d294b9cb","role":"PLANET","latency":112,"version":"-1.-1.-1","paths":[]},
                {"address":"0123456789","role":"LEAF","latency":14,"version":"1.12.2","paths":[]}]"#,
        );
        runner.on(
            "zerotier-cli -j info",
            0,
            r#"{"address":"abcdef1234","online":true,"version":"1.12.2","tcpFallbackActive":false}"#,
        );
        let client = ZeroTierCli::new(Arc::new(runner));

        let peers = client.list_peers().await.unwrap();
        assert_eq!(peers.iter().filter(|p| p.is_leaf()).count(), 1);
        let info = client.info().await.unwrap();
        assert!(info.online);
        assert_eq!(info.address, "abcdef1234");
    }

    #[test]
    fn test_text_parsers() {
        let info = parse_info_text("200 info abcdef1234 1.12.2 OFFLINE\n").unwrap();
        assert!(!info.online);

        let peers = parse_peers_text(
            "200 peers\n<ztaddr>   <ver>  <role> <lat> <link> <lastTX> <lastRX> <path>\n\
             200 peers 61d294b9cb - PLANET 112 DIRECT 4028 4009 50.7.252.138/9993\n\
             0123456789 1.12.2 LEAF 14 DIRECT 1 1 192.168.1.20/9993\n",
        );
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].version, None);
        assert!(peers[1].is_leaf());
    }

    #[tokio::test]
    async fn test_join_is_mutation() {
        let runner = Arc::new(ScriptedRunner::dry_run());
        let client = ZeroTierCli::new(runner.clone());
        client.join(&id("a1b2c3d4e5f6a7b8")).await.unwrap();
        assert!(runner.executed_mutations().is_empty());
        assert_eq!(runner.command_lines(), vec!["zerotier-cli join a1b2c3d4e5f6a7b8"]);
    }
}
