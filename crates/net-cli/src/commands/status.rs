//! Status command

use std::sync::Arc;

use anyhow::Result;
use log::warn;
use serde::Serialize;

use ztnet_apply::forwarding::{forwarding_key, runtime_enabled};
use ztnet_apply::{BackupManager, Membership, NodeInfo};
use ztnet_core::{Backend, IpFamily, NetworkId};

use super::{print_json, OutputFormat};
use crate::context::AppContext;

#[derive(Debug, Serialize)]
struct StatusView {
    backend: Backend,
    node: Option<NodeInfo>,
    configured_network: Option<NetworkId>,
    memberships: Vec<Membership>,
    leaf_peers: usize,
    ipv4_forwarding: Option<bool>,
    ipv6_forwarding: Option<bool>,
    latest_snapshot: Option<String>,
}

/// Show the overlay client, memberships, forwarding and firewall backend
pub struct StatusCommand {
    context: Arc<AppContext>,
}

impl StatusCommand {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        let view = self.collect().await?;
        match format {
            OutputFormat::Json => print_json(&view),
            OutputFormat::Text => {
                self.print(&view);
                Ok(())
            }
        }
    }

    async fn collect(&self) -> Result<StatusView> {
        let client = self.context.client();
        let node = match client.info().await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("Overlay client did not answer: {}", e);
                None
            }
        };
        let memberships = if node.is_some() {
            client.list_memberships().await?
        } else {
            Vec::new()
        };
        let leaf_peers = match client.list_peers().await {
            Ok(peers) => peers.iter().filter(|p| p.is_leaf()).count(),
            Err(_) => 0,
        };

        let apply = &self.context.apply;
        let ipv4_forwarding = runtime_enabled(apply, forwarding_key(IpFamily::V4)).await.ok();
        let ipv6_forwarding = runtime_enabled(apply, forwarding_key(IpFamily::V6)).await.ok();

        let latest_snapshot = BackupManager::new(apply.clone())
            .latest()
            .await
            .unwrap_or_default()
            .map(|s| s.id);

        Ok(StatusView {
            backend: self.context.backend().await.kind(),
            node,
            configured_network: self
                .context
                .desired_state()
                .ok()
                .map(|d| d.network_id().clone()),
            memberships,
            leaf_peers,
            ipv4_forwarding,
            ipv6_forwarding,
            latest_snapshot,
        })
    }

    fn print(&self, view: &StatusView) {
        match &view.node {
            Some(node) => println!(
                "Node {} (zerotier {}) is {}",
                node.address,
                node.version,
                if node.online { "online" } else { "offline" }
            ),
            None => println!("Overlay client is not running"),
        }
        println!("Firewall backend: {}", view.backend);
        println!(
            "Forwarding: IPv4 {}, IPv6 {}",
            on_off(view.ipv4_forwarding),
            on_off(view.ipv6_forwarding)
        );
        println!("Leaf peers: {}", view.leaf_peers);
        println!();

        println!(
            "{:<18} {:<16} {:<24} {:<12} {}",
            "Network", "Name", "Status", "Device", "Addresses"
        );
        println!("{}", "-".repeat(90));
        for m in &view.memberships {
            println!(
                "{:<18} {:<16} {:<24} {:<12} {}",
                m.id,
                m.name,
                m.status,
                m.device().unwrap_or("-"),
                m.assigned_addresses.join(",")
            );
        }
        if let Some(id) = &view.configured_network {
            if !view.memberships.iter().any(|m| m.matches(id)) {
                println!("{:<18} {:<16} {:<24}", id, "-", "NOT JOINED");
            }
        }

        if let Some(snapshot) = &view.latest_snapshot {
            println!();
            println!("Latest snapshot: {}", snapshot);
        }
    }
}

fn on_off(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "on",
        Some(false) => "off",
        None => "unknown",
    }
}
