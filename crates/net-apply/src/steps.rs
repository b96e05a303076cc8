//! Idempotent operation steps
//!
//! Every host change is expressed as an [`OperationStep`]: a `check`
//! predicate and an `apply` effect. [`ensure`] only applies a step whose
//! check fails, so running the same steps twice mutates the host once.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use ztnet_core::{FirewallRule, NetworkId, Result};
use ztnet_exec::ExecMode;

use crate::backend::FirewallBackend;
use crate::context::ApplyContext;
use crate::forwarding::{self, SysctlFile};
use crate::zerotier::OverlayClient;

/// Single idempotent action
#[async_trait]
pub trait OperationStep: Send + Sync {
    fn description(&self) -> String;

    /// Whether the host already matches what `apply` would produce
    async fn check(&self) -> Result<bool>;

    async fn apply(&self) -> Result<()>;
}

/// What [`ensure`] did with a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    AlreadySatisfied,
    Applied,
    /// Would have been applied; dry run
    Previewed,
}

impl StepOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, StepOutcome::AlreadySatisfied)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::AlreadySatisfied => "already satisfied",
            StepOutcome::Applied => "applied",
            StepOutcome::Previewed => "would apply",
        }
    }
}

/// Outcome of one step, kept for the run summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub description: String,
    pub outcome: StepOutcome,
}

/// Check `step` and apply it when unsatisfied.
///
/// In dry run the step is still applied so the runner can log the commands
/// it would have issued; those are simulated and reported as `Previewed`.
pub async fn ensure(step: &dyn OperationStep, mode: ExecMode) -> Result<StepRecord> {
    let description = step.description();
    if step.check().await? {
        debug!("{}: already satisfied", description);
        return Ok(StepRecord {
            description,
            outcome: StepOutcome::AlreadySatisfied,
        });
    }

    step.apply().await?;
    let outcome = match mode {
        ExecMode::Live => StepOutcome::Applied,
        ExecMode::DryRun => StepOutcome::Previewed,
    };
    info!("{}: {}", description, outcome.as_str());
    Ok(StepRecord {
        description,
        outcome,
    })
}

/// Whether a step adds or removes its object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
}

pub struct MembershipStep {
    client: Arc<dyn OverlayClient>,
    network: NetworkId,
    presence: Presence,
}

impl MembershipStep {
    pub fn new(client: Arc<dyn OverlayClient>, network: NetworkId, presence: Presence) -> Self {
        Self {
            client,
            network,
            presence,
        }
    }
}

#[async_trait]
impl OperationStep for MembershipStep {
    fn description(&self) -> String {
        match self.presence {
            Presence::Present => format!("join network {}", self.network),
            Presence::Absent => format!("leave network {}", self.network),
        }
    }

    async fn check(&self) -> Result<bool> {
        let member = self.client.membership(&self.network).await?.is_some();
        Ok(member == (self.presence == Presence::Present))
    }

    async fn apply(&self) -> Result<()> {
        match self.presence {
            Presence::Present => self.client.join(&self.network).await,
            Presence::Absent => self.client.leave(&self.network).await,
        }
    }
}

/// Runtime forwarding flag via `sysctl -w`
pub struct RuntimeForwardingStep {
    ctx: ApplyContext,
    key: &'static str,
}

impl RuntimeForwardingStep {
    pub fn new(ctx: ApplyContext, key: &'static str) -> Self {
        Self { ctx, key }
    }
}

#[async_trait]
impl OperationStep for RuntimeForwardingStep {
    fn description(&self) -> String {
        format!("enable {} at runtime", self.key)
    }

    async fn check(&self) -> Result<bool> {
        forwarding::runtime_enabled(&self.ctx, self.key).await
    }

    async fn apply(&self) -> Result<()> {
        forwarding::enable_runtime(&self.ctx, self.key).await
    }
}

/// Boot-time forwarding flag in the sysctl configuration file
pub struct PersistForwardingStep {
    ctx: ApplyContext,
    file: SysctlFile,
    key: &'static str,
}

impl PersistForwardingStep {
    pub fn new(ctx: ApplyContext, key: &'static str) -> Self {
        let file = SysctlFile::new(ctx.paths().sysctl_conf.clone());
        Self { ctx, file, key }
    }
}

#[async_trait]
impl OperationStep for PersistForwardingStep {
    fn description(&self) -> String {
        format!("persist {}=1 in {}", self.key, self.file.path().display())
    }

    async fn check(&self) -> Result<bool> {
        self.file.is_persisted(self.key, "1").await
    }

    async fn apply(&self) -> Result<()> {
        self.file.persist(&self.ctx, self.key, "1").await
    }
}

pub struct FirewallRuleStep {
    backend: Arc<dyn FirewallBackend>,
    rule: FirewallRule,
    presence: Presence,
}

impl FirewallRuleStep {
    pub fn new(backend: Arc<dyn FirewallBackend>, rule: FirewallRule, presence: Presence) -> Self {
        Self {
            backend,
            rule,
            presence,
        }
    }
}

#[async_trait]
impl OperationStep for FirewallRuleStep {
    fn description(&self) -> String {
        match self.presence {
            Presence::Present => format!("{} rule {}", self.backend.kind(), self.rule),
            Presence::Absent => format!("remove {} rule {}", self.backend.kind(), self.rule),
        }
    }

    async fn check(&self) -> Result<bool> {
        let present = self.backend.rule_present(&self.rule).await?;
        Ok(present == (self.presence == Presence::Present))
    }

    async fn apply(&self) -> Result<()> {
        match self.presence {
            Presence::Present => self.backend.add_rule(&self.rule).await,
            Presence::Absent => self.backend.remove_rule(&self.rule).await,
        }
    }
}
