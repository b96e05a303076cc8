//! Monitor loop with edge-triggered alerts

use std::collections::HashMap;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use ztnet_core::{DesiredState, NetworkId};

use crate::alert::{Alert, AlertDispatcher};
use crate::health::{HealthChecker, HealthReport};

/// A change between two consecutive health reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    StatusFailed {
        network_id: NetworkId,
        status: Option<String>,
    },
    StatusRecovered {
        network_id: NetworkId,
    },
    PeersLost,
    PeersRestored {
        count: usize,
    },
}

impl Transition {
    /// Render the notification for this transition
    pub fn alert(&self, report: &HealthReport) -> Alert {
        let host = report.node_address.as_deref().unwrap_or("unknown node");
        let subject = match self {
            Transition::StatusFailed { network_id, status } => format!(
                "ztnet: network {} is {} on {}",
                network_id,
                status.as_deref().unwrap_or("NOT_JOINED"),
                host
            ),
            Transition::StatusRecovered { network_id } => {
                format!("ztnet: network {} is OK again on {}", network_id, host)
            }
            Transition::PeersLost => format!("ztnet: no peers reachable from {}", host),
            Transition::PeersRestored { count } => {
                format!("ztnet: {} peers reachable again from {}", count, host)
            }
        };
        let message = format!(
            "{}\n\nChecked at {}\n{}",
            subject,
            report.timestamp.to_rfc3339(),
            report.summary()
        );
        Alert::new(subject, message)
    }
}

/// Tracks the previous report and emits [`Transition`]s on change only.
///
/// Before the first report every network is assumed OK and peers reachable,
/// so a gateway that starts out broken alerts immediately.
#[derive(Debug, Default)]
pub struct EdgeDetector {
    status_ok: HashMap<NetworkId, bool>,
    peers_up: Option<bool>,
}

impl EdgeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, report: &HealthReport) -> Vec<Transition> {
        let mut transitions = Vec::new();

        for network in &report.networks {
            let now = network.is_ok();
            let before = self
                .status_ok
                .insert(network.network_id.clone(), now)
                .unwrap_or(true);
            match (before, now) {
                (true, false) => transitions.push(Transition::StatusFailed {
                    network_id: network.network_id.clone(),
                    status: network.status.clone(),
                }),
                (false, true) => transitions.push(Transition::StatusRecovered {
                    network_id: network.network_id.clone(),
                }),
                _ => {}
            }
        }

        let now = report.peer_count > 0;
        let before = self.peers_up.replace(now).unwrap_or(true);
        match (before, now) {
            (true, false) => transitions.push(Transition::PeersLost),
            (false, true) => transitions.push(Transition::PeersRestored {
                count: report.peer_count,
            }),
            _ => {}
        }

        transitions
    }
}

/// Periodic health checks feeding alerts
pub struct Monitor {
    checker: HealthChecker,
    alerts: AlertDispatcher,
}

impl Monitor {
    pub fn new(checker: HealthChecker, alerts: AlertDispatcher) -> Self {
        Self { checker, alerts }
    }

    pub fn checker(&self) -> &HealthChecker {
        &self.checker
    }

    /// Check `desired` every `interval` until `cancel` fires, alerting on
    /// each edge. `on_report` sees every report with the transitions it
    /// caused. Returns the number of checks run.
    pub async fn watch<F>(
        &self,
        desired: &DesiredState,
        interval: Duration,
        cancel: &CancellationToken,
        mut on_report: F,
    ) -> usize
    where
        F: FnMut(&HealthReport, &[Transition]),
    {
        info!(
            "Monitoring network {} every {}s",
            desired.network_id(),
            interval.as_secs()
        );
        let mut detector = EdgeDetector::new();
        let mut checks = 0;

        while !cancel.is_cancelled() {
            let report = self.checker.check_once(desired).await;
            checks += 1;

            let transitions = detector.observe(&report);
            for transition in &transitions {
                warn!("Health transition: {:?}", transition);
                self.alerts.dispatch(&transition.alert(&report)).await;
            }
            on_report(&report, &transitions);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Monitoring stopped after {} checks", checks);
        checks
    }
}
