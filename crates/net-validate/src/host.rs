//! Host inspection through `ip -j`

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use log::debug;
use serde::Deserialize;

use ztnet_core::error::{ExecutionError, ValidationError};
use ztnet_core::{NetworkError, Result};
use ztnet_exec::{CommandRunner, CommandSpec};

/// One entry of `ip -j route` output
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteEntry {
    pub dst: String,
    #[serde(default)]
    pub dev: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub prefsrc: Option<String>,
}

/// One address of `ip -j addr` output
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddressInfo {
    pub family: String,
    pub local: String,
    pub prefixlen: u8,
}

/// One link of `ip -j addr` output
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LinkInfo {
    pub ifname: String,
    #[serde(default)]
    pub operstate: Option<String>,
    #[serde(default)]
    pub addr_info: Vec<AddressInfo>,
}

impl LinkInfo {
    /// First IPv4 address, if any
    pub fn ipv4(&self) -> Option<IpAddr> {
        self.addr_info
            .iter()
            .filter(|a| a.family == "inet")
            .find_map(|a| a.local.parse().ok())
    }
}

/// Read-only queries against the host's interfaces and routes
pub struct HostInspector {
    runner: Arc<dyn CommandRunner>,
}

impl HostInspector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Link details, or `None` when the interface does not exist
    pub async fn interface(&self, name: &str) -> Result<Option<LinkInfo>> {
        let result = self
            .runner
            .run(&CommandSpec::query("ip").args(["-j", "addr", "show", "dev", name]))
            .await?;

        if !result.success() {
            debug!("ip addr show dev {}: {}", name, result.stderr.trim());
            return Ok(None);
        }

        let links: Vec<LinkInfo> = parse_json(&result.command, &result.stdout)?;
        Ok(links.into_iter().find(|l| l.ifname == name))
    }

    pub async fn interface_exists(&self, name: &str) -> Result<bool> {
        Ok(self.interface(name).await?.is_some())
    }

    /// Interface carrying the IPv4 default route
    pub async fn default_route_interface(&self) -> Result<Option<String>> {
        let result = self
            .runner
            .run(&CommandSpec::query("ip").args(["-j", "route", "show", "default"]))
            .await?
            .ensure_success()?;

        let routes: Vec<RouteEntry> = parse_json(&result.command, &result.stdout)?;
        Ok(routes.into_iter().find_map(|r| r.dev))
    }

    /// Route the kernel would pick for `addr`
    pub async fn route_to(&self, addr: IpAddr) -> Result<Option<RouteEntry>> {
        let target = addr.to_string();
        let result = self
            .runner
            .run(&CommandSpec::query("ip").args(["-j", "route", "get", target.as_str()]))
            .await?;

        if !result.success() {
            return Ok(None);
        }
        let routes: Vec<RouteEntry> = parse_json(&result.command, &result.stdout)?;
        Ok(routes.into_iter().next())
    }

    /// Fail unless `subnet` is routed out of `interface`
    pub async fn ensure_subnet_reachable(&self, subnet: &IpNet, interface: &str) -> Result<()> {
        let unreachable = |reason: String| {
            NetworkError::Validation(ValidationError::UnreachableSubnet {
                subnet: subnet.to_string(),
                interface: interface.to_string(),
                reason,
            })
        };

        match self.route_to(subnet.network()).await? {
            Some(route) if route.dev.as_deref() == Some(interface) => Ok(()),
            Some(route) => Err(unreachable(format!(
                "routed via {}",
                route.dev.unwrap_or_else(|| "unknown device".to_string())
            ))),
            None => Err(unreachable("no route".to_string())),
        }
    }
}

fn parse_json<T: for<'de> Deserialize<'de>>(command: &str, stdout: &str) -> Result<T> {
    // `ip -j` prints nothing at all for an empty table
    let body = if stdout.trim().is_empty() { "[]" } else { stdout };
    serde_json::from_str(body).map_err(|e| {
        NetworkError::Execution(ExecutionError::UnexpectedOutput {
            command: command.to_string(),
            reason: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ztnet_exec::ScriptedRunner;

    const ETH0: &str = r#"[{"ifindex":2,"ifname":"eth0","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],"mtu":1500,"operstate":"UP","addr_info":[{"family":"inet","local":"192.168.1.10","prefixlen":24,"scope":"global"},{"family":"inet6","local":"fe80::1","prefixlen":64,"scope":"link"}]}]"#;

    fn inspector(runner: ScriptedRunner) -> HostInspector {
        HostInspector::new(Arc::new(runner))
    }

    #[tokio::test]
    async fn test_interface_lookup() {
        let runner = ScriptedRunner::new();
        runner.on("ip -j addr show dev eth0", 0, ETH0);
        runner.on("ip -j addr show dev eth9", 1, "");
        let host = inspector(runner);

        let link = host.interface("eth0").await.unwrap().unwrap();
        assert_eq!(link.operstate.as_deref(), Some("UP"));
        assert_eq!(link.ipv4(), Some("192.168.1.10".parse().unwrap()));
        assert!(!host.interface_exists("eth9").await.unwrap());
    }

    #[tokio::test]
    async fn test_default_route_interface() {
        let runner = ScriptedRunner::new();
        runner.on(
            "ip -j route show default",
            0,
            r#"[{"dst":"default","gateway":"192.168.1.1","dev":"ens18","protocol":"dhcp","flags":[]}]"#,
        );
        let host = inspector(runner);
        assert_eq!(
            host.default_route_interface().await.unwrap().as_deref(),
            Some("ens18")
        );
    }

    #[tokio::test]
    async fn test_empty_default_route() {
        let runner = ScriptedRunner::new();
        runner.on("ip -j route show default", 0, "");
        assert_eq!(inspector(runner).default_route_interface().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subnet_reachability() {
        let runner = ScriptedRunner::new();
        runner.on(
            "ip -j route get 192.168.1.0",
            0,
            r#"[{"dst":"192.168.1.0","dev":"eth0","prefsrc":"192.168.1.10","flags":[],"uid":0,"cache":[]}]"#,
        );
        runner.on(
            "ip -j route get 10.9.0.0",
            0,
            r#"[{"dst":"10.9.0.0","gateway":"192.168.1.1","dev":"eth1","flags":[]}]"#,
        );
        let host = inspector(runner);

        host.ensure_subnet_reachable(&"192.168.1.0/24".parse().unwrap(), "eth0")
            .await
            .unwrap();
        let err = host
            .ensure_subnet_reachable(&"10.9.0.0/16".parse().unwrap(), "eth0")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("routed via eth1"));
    }

    #[tokio::test]
    async fn test_garbage_output_is_unexpected() {
        let runner = ScriptedRunner::new();
        runner.on("ip -j route show default", 0, "default via 192.168.1.1 dev eth0");
        let err = inspector(runner).default_route_interface().await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Execution(ExecutionError::UnexpectedOutput { .. })
        ));
    }
}
