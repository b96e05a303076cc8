//! Gateway reconciliation
//!
//! Brings one host in line with a [`DesiredState`], moving through
//! `Validated → BackedUp → Joined → ForwardingEnabled → FirewallConfigured →
//! Complete`. Nothing is mutated before validation and confirmation, and
//! every mutation is an idempotent
//! [`OperationStep`](crate::steps::OperationStep), so re-running against a
//! configured host changes nothing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};

use ztnet_core::error::{TimeoutError, ValidationError};
use ztnet_core::{
    Backend, DesiredState, FirewallRule, IpFamily, NetworkError, NetworkId, Result, TopologyRole,
};
use ztnet_validate::{GatewayValidator, RootProbe};

use crate::backend::FirewallBackend;
use crate::context::ApplyContext;
use crate::forwarding::forwarding_key;
use crate::rollback::BackupManager;
use crate::steps::{
    ensure, FirewallRuleStep, MembershipStep, PersistForwardingStep, Presence, RuntimeForwardingStep,
    StepOutcome, StepRecord,
};
use crate::zerotier::{Membership, OverlayClient};

/// Device pattern matching any overlay interface, used in dry-run previews
/// before the client has created the real one
pub const OVERLAY_WILDCARD: &str = "zt+";

const JOIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Reconciliation states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    Uninitialized,
    Validated,
    BackedUp,
    Joined,
    ForwardingEnabled,
    FirewallConfigured,
    Complete,
    Failed,
}

impl ReconcileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileState::Uninitialized => "uninitialized",
            ReconcileState::Validated => "validated",
            ReconcileState::BackedUp => "backed up",
            ReconcileState::Joined => "joined",
            ReconcileState::ForwardingEnabled => "forwarding enabled",
            ReconcileState::FirewallConfigured => "firewall configured",
            ReconcileState::Complete => "complete",
            ReconcileState::Failed => "failed",
        }
    }

    /// State reached after the current one succeeds
    fn next(self) -> ReconcileState {
        match self {
            ReconcileState::Uninitialized => ReconcileState::Validated,
            ReconcileState::Validated => ReconcileState::BackedUp,
            ReconcileState::BackedUp => ReconcileState::Joined,
            ReconcileState::Joined => ReconcileState::ForwardingEnabled,
            ReconcileState::ForwardingEnabled => ReconcileState::FirewallConfigured,
            ReconcileState::FirewallConfigured => ReconcileState::Complete,
            ReconcileState::Complete | ReconcileState::Failed => self,
        }
    }
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback deciding whether a plan may be applied
pub type ConfirmFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// How the plan is confirmed before the first mutation
#[derive(Clone, Default)]
pub enum ConfirmationPolicy {
    #[default]
    AutoApprove,
    AutoDeny,
    /// Called with the plan summary
    Callback(ConfirmFn),
}

impl ConfirmationPolicy {
    pub fn confirm(&self, plan: &str) -> bool {
        match self {
            ConfirmationPolicy::AutoApprove => true,
            ConfirmationPolicy::AutoDeny => false,
            ConfirmationPolicy::Callback(callback) => callback(plan),
        }
    }
}

impl fmt::Debug for ConfirmationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmationPolicy::AutoApprove => f.write_str("AutoApprove"),
            ConfirmationPolicy::AutoDeny => f.write_str("AutoDeny"),
            ConfirmationPolicy::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Snapshot host state before the first mutation
    pub backup: bool,
    pub confirmation: ConfirmationPolicy,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            backup: true,
            confirmation: ConfirmationPolicy::AutoApprove,
        }
    }
}

/// Result of one reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub network_id: NetworkId,
    /// Last state reached
    pub state: ReconcileState,
    /// The plan was not confirmed; nothing was changed
    pub declined: bool,
    pub dry_run: bool,
    pub steps: Vec<StepRecord>,
    /// Snapshot directory
    pub snapshot: Option<String>,
    pub physical_interface: Option<String>,
    pub overlay_interface: Option<String>,
    /// Route LAN clients need, `SUBNET via OVERLAY_ADDRESS`
    pub route_hint: Option<String>,
    /// Step and error message of a failed run
    pub error: Option<String>,
}

impl ReconcileReport {
    fn new(network_id: NetworkId, dry_run: bool) -> Self {
        Self {
            network_id,
            state: ReconcileState::Uninitialized,
            declined: false,
            dry_run,
            steps: Vec::new(),
            snapshot: None,
            physical_interface: None,
            overlay_interface: None,
            route_hint: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == ReconcileState::Complete
    }

    pub fn changed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.outcome.changed()).count()
    }

    fn record(&mut self, record: StepRecord) {
        self.steps.push(record);
    }
}

/// NAT and forwarding rules making the host a gateway between its physical
/// interface and the overlay device. Spokes carry none.
pub fn gateway_rules(
    role: TopologyRole,
    ipv6: bool,
    physical: &str,
    overlay: &str,
) -> Vec<FirewallRule> {
    if !role.is_lan_gateway() {
        return Vec::new();
    }

    let mut rules = vec![
        FirewallRule::masquerade(physical),
        FirewallRule::forward_established(IpFamily::V4, physical, overlay),
        FirewallRule::forward(IpFamily::V4, overlay, physical),
    ];
    if ipv6 {
        rules.push(FirewallRule::forward_established(IpFamily::V6, physical, overlay));
        rules.push(FirewallRule::forward(IpFamily::V6, overlay, physical));
    }
    rules
}

/// Forwarding families a desired state needs
pub fn forwarding_families(ipv6: bool) -> Vec<IpFamily> {
    if ipv6 {
        vec![IpFamily::V4, IpFamily::V6]
    } else {
        vec![IpFamily::V4]
    }
}

/// Drives a host to a [`DesiredState`]
pub struct Reconciler {
    ctx: ApplyContext,
    client: Arc<dyn OverlayClient>,
    backend: Arc<dyn FirewallBackend>,
    validator: GatewayValidator,
    backups: BackupManager,
    root_probe: RootProbe,
}

impl Reconciler {
    pub fn new(
        ctx: ApplyContext,
        client: Arc<dyn OverlayClient>,
        backend: Arc<dyn FirewallBackend>,
    ) -> Self {
        Self {
            validator: GatewayValidator::new(ctx.runner().clone()),
            backups: BackupManager::new(ctx.clone()),
            root_probe: ztnet_validate::effective_root,
            ctx,
            client,
            backend,
        }
    }

    pub fn with_root_probe(mut self, probe: RootProbe) -> Self {
        self.validator = GatewayValidator::new(self.ctx.runner().clone()).with_root_probe(probe);
        self.root_probe = probe;
        self
    }

    pub fn context(&self) -> &ApplyContext {
        &self.ctx
    }

    pub fn client(&self) -> &Arc<dyn OverlayClient> {
        &self.client
    }

    pub fn backend(&self) -> &Arc<dyn FirewallBackend> {
        &self.backend
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn validator(&self) -> &GatewayValidator {
        &self.validator
    }

    pub fn root_probe(&self) -> RootProbe {
        self.root_probe
    }

    /// Reconcile the host against `desired`.
    ///
    /// Validation and privilege problems are returned as errors before
    /// anything is touched. A failing step ends the run in
    /// [`ReconcileState::Failed`] and is reported, not rolled back.
    pub async fn reconcile(
        &self,
        desired: &DesiredState,
        options: &ReconcileOptions,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::new(desired.network_id().clone(), self.ctx.is_dry_run());

        let validated = self.validator.validate(desired).await?;
        if desired.role().is_lan_gateway() && self.backend.kind() == Backend::None {
            return Err(ValidationError::NoFirewallBackend {
                role: desired.role().to_string(),
            }
            .into());
        }
        report.physical_interface = Some(validated.physical_interface.clone());
        report.state = ReconcileState::Validated;

        let plan = self.plan_summary(desired, &validated.physical_interface);
        if !options.confirmation.confirm(&plan) {
            warn!("Plan for network {} was declined", desired.network_id());
            report.declined = true;
            return Ok(report);
        }

        if let Err(e) = self
            .run_steps(desired, &validated.physical_interface, options, &mut report)
            .await
        {
            let failed_in = report.state.next();
            error!(
                "Reconcile of network {} failed while reaching '{}': {} (snapshot: {})",
                desired.network_id(),
                failed_in,
                e,
                report.snapshot.as_deref().unwrap_or("none")
            );
            report.error = Some(format!("{}: {}", failed_in, e));
            report.state = ReconcileState::Failed;
            return Ok(report);
        }

        report.state = ReconcileState::Complete;
        info!(
            "Network {} complete: {} of {} steps changed{}",
            desired.network_id(),
            report.changed_steps(),
            report.steps.len(),
            if report.dry_run { " (dry run)" } else { "" }
        );
        if let Some(hint) = &report.route_hint {
            info!("LAN clients reach the overlay with: {}", hint);
        }
        Ok(report)
    }

    fn plan_summary(&self, desired: &DesiredState, physical: &str) -> String {
        let mut plan = format!(
            "Network {} ({}): join, enable forwarding",
            desired.network_id(),
            desired.role()
        );
        if desired.role().is_lan_gateway() {
            plan.push_str(&format!(
                ", {} NAT/forward rules between {} and the overlay",
                self.backend.kind(),
                physical
            ));
        }
        if desired.ipv6() {
            plan.push_str(", IPv6 forwarding");
        }
        plan
    }

    async fn run_steps(
        &self,
        desired: &DesiredState,
        physical: &str,
        options: &ReconcileOptions,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let mode = self.ctx.mode();

        // BackedUp
        if options.backup {
            let snapshot = self
                .backups
                .snapshot(self.backend.as_ref(), Some(desired.network_id()))
                .await?;
            report.snapshot = Some(snapshot.location.display().to_string());
        } else {
            info!("Backup disabled, no snapshot taken");
        }
        report.state = ReconcileState::BackedUp;

        // Joined
        let join = MembershipStep::new(
            self.client.clone(),
            desired.network_id().clone(),
            Presence::Present,
        );
        report.record(ensure(&join, mode).await?);
        let membership = self.wait_for_device(desired.network_id()).await?;
        let overlay = membership
            .as_ref()
            .and_then(|m| m.device())
            .unwrap_or(OVERLAY_WILDCARD)
            .to_string();
        report.overlay_interface = Some(overlay.clone());
        report.state = ReconcileState::Joined;

        // ForwardingEnabled
        for family in forwarding_families(desired.ipv6()) {
            let key = forwarding_key(family);
            let runtime = RuntimeForwardingStep::new(self.ctx.clone(), key);
            report.record(ensure(&runtime, mode).await?);
            let persist = PersistForwardingStep::new(self.ctx.clone(), key);
            report.record(ensure(&persist, mode).await?);
        }
        report.state = ReconcileState::ForwardingEnabled;

        // FirewallConfigured
        let rules = gateway_rules(desired.role(), desired.ipv6(), physical, &overlay);
        let records = self.ensure_rules(rules, Presence::Present).await?;
        report.steps.extend(records);
        report.state = ReconcileState::FirewallConfigured;

        report.route_hint = match (desired.physical_subnet(), membership.as_ref()) {
            (Some(subnet), Some(m)) => m
                .ipv4_address()
                .map(|address| format!("{} via {}", subnet, address)),
            _ => None,
        };
        Ok(())
    }

    /// Ensure each rule is present (or absent) and persist the backend when
    /// anything changed
    pub async fn ensure_rules(
        &self,
        rules: Vec<FirewallRule>,
        presence: Presence,
    ) -> Result<Vec<StepRecord>> {
        let mode = self.ctx.mode();
        let mut records = Vec::with_capacity(rules.len() + 1);
        for rule in rules {
            let step = FirewallRuleStep::new(self.backend.clone(), rule, presence);
            records.push(ensure(&step, mode).await?);
        }

        if records.iter().any(|r| r.outcome.changed()) {
            self.backend.persist().await?;
            records.push(StepRecord {
                description: format!("persist {} rules", self.backend.kind()),
                outcome: if self.ctx.is_dry_run() {
                    StepOutcome::Previewed
                } else {
                    StepOutcome::Applied
                },
            });
        }
        Ok(records)
    }

    /// Wait until the client reports an overlay device for `network`.
    ///
    /// In dry run the join was only simulated, so the current membership is
    /// returned as is.
    async fn wait_for_device(&self, network: &NetworkId) -> Result<Option<Membership>> {
        let limit = self.ctx.settings().join_timeout;
        let deadline = Instant::now() + limit;
        loop {
            let membership = self.client.membership(network).await?;
            if membership.as_ref().is_some_and(|m| m.device().is_some()) {
                return Ok(membership);
            }
            if self.ctx.is_dry_run() {
                return Ok(membership);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(NetworkError::Timeout(TimeoutError {
                    command: format!("waiting for the overlay device of {}", network),
                    deadline: limit,
                }));
            }
            sleep(JOIN_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}
