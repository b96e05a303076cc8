//! Monitor command

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::info;
use ztnet_monitor::{AlertDispatcher, CancellationToken, HealthChecker, Monitor};

use super::{print_json, OutputFormat};
use crate::context::AppContext;

/// Periodic health checks with alerts, or a single check with `--once`
pub struct MonitorCommand {
    context: Arc<AppContext>,
}

impl MonitorCommand {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    fn checker(&self) -> HealthChecker {
        HealthChecker::system(self.context.apply.clone(), self.context.client())
    }

    /// One check; fails when the gateway is unhealthy
    pub async fn check_once(&self, format: OutputFormat) -> Result<()> {
        let desired = self.context.desired_state()?;
        let report = self.checker().check_once(&desired).await;
        match format {
            OutputFormat::Json => print_json(&report)?,
            OutputFormat::Text => println!("{}", report.summary()),
        }
        if !report.is_healthy() {
            anyhow::bail!("Network {} is unhealthy", desired.network_id());
        }
        Ok(())
    }

    /// Loop until Ctrl-C
    pub async fn execute(&self, interval: Option<u64>) -> Result<()> {
        let desired = self.context.desired_state()?;
        let interval = interval
            .map(Duration::from_secs)
            .unwrap_or(self.context.settings().check_interval);
        let alerts =
            AlertDispatcher::from_settings(self.context.settings(), self.context.runner().clone())?;
        info!("Alert sinks: {}", alerts.sink_names().join(", "));

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping the monitor");
                on_signal.cancel();
            }
        });

        let monitor = Monitor::new(self.checker(), alerts);
        monitor
            .watch(&desired, interval, &cancel, |report, transitions| {
                let marker = if transitions.is_empty() { " " } else { "!" };
                println!(
                    "{} {} {}",
                    report.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    marker,
                    report.summary()
                );
            })
            .await;
        Ok(())
    }
}
