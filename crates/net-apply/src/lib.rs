//! ztnet apply
//!
//! Idempotent gateway reconciliation with snapshot and restore: the overlay
//! client, firewall backends, kernel forwarding, the reconciler itself and
//! the topology and dependency tooling built on top of it.

pub mod backend;
pub mod context;
pub mod forwarding;
pub mod install;
pub mod reconciler;
pub mod rollback;
pub mod steps;
pub mod topology;
pub mod zerotier;


pub use backend::{backend_for, select_backend, BackendDetector, FirewallBackend, RuleDump};
pub use context::ApplyContext;
pub use install::{Installer, PackageManager};
pub use reconciler::{
    gateway_rules, ConfirmationPolicy, ReconcileOptions, ReconcileReport, ReconcileState,
    Reconciler, OVERLAY_WILDCARD,
};
pub use rollback::{BackupManager, Snapshot};
pub use steps::{OperationStep, Presence, StepOutcome, StepRecord};
pub use topology::{NetworkStatus, TopologyDeployer, TopologyReport};
pub use zerotier::{Membership, NodeInfo, OverlayClient, Peer, ZeroTierCli};
