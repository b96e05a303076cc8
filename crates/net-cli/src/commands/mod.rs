//! CLI commands

pub mod configure;
pub mod detect;
pub mod diagnose;
pub mod install;
pub mod monitor;
pub mod rollback;
pub mod status;
pub mod topology;
pub mod validate;

pub use configure::ConfigureCommand;
pub use detect::DetectCommand;
pub use diagnose::DiagnoseCommand;
pub use install::InstallCommand;
pub use monitor::MonitorCommand;
pub use rollback::RollbackCommand;
pub use status::StatusCommand;
pub use topology::{TopologyAction, TopologyCommand};
pub use validate::ValidateCommand;

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;

use ztnet_apply::{ReconcileReport, StepRecord};

/// How results are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn print_steps(steps: &[StepRecord]) {
    for step in steps {
        println!("  [{}] {}", step.outcome.as_str(), step.description);
    }
}

pub(crate) fn print_report(report: &ReconcileReport) {
    println!(
        "Network {}: {}{}",
        report.network_id,
        report.state,
        if report.dry_run { " (dry run)" } else { "" }
    );
    print_steps(&report.steps);
    if let Some(physical) = &report.physical_interface {
        println!("  physical interface: {}", physical);
    }
    if let Some(overlay) = &report.overlay_interface {
        println!("  overlay interface:  {}", overlay);
    }
    if let Some(snapshot) = &report.snapshot {
        println!("  snapshot:           {}", snapshot);
    }
    if let Some(hint) = &report.route_hint {
        println!("  LAN route:          {}", hint);
    }
}

/// Turn a finished report into the command result
pub(crate) fn ensure_reconciled(report: &ReconcileReport) -> Result<()> {
    if report.declined {
        anyhow::bail!("Plan for network {} was declined", report.network_id);
    }
    if let Some(error) = &report.error {
        anyhow::bail!(
            "Network {} failed at {}{}",
            report.network_id,
            error,
            report
                .snapshot
                .as_deref()
                .map(|s| format!("; restore with `ztnet rollback` (snapshot {})", s))
                .unwrap_or_default()
        );
    }
    println!(
        "✓ Network {} configured, {} of {} steps changed",
        report.network_id,
        report.changed_steps(),
        report.steps.len()
    );
    Ok(())
}
