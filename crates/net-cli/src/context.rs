//! Shared state for one CLI invocation

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use ztnet_apply::{
    select_backend, ApplyContext, ConfirmationPolicy, FirewallBackend, OverlayClient,
    ReconcileOptions, Reconciler, ZeroTierCli,
};
use ztnet_config::{ConfigLoader, Overrides, ToolSettings};
use ztnet_core::{Backend, DesiredState, Topology};
use ztnet_exec::{CommandRunner, ExecMode, SystemRunner};
use ztnet_validate::{effective_root, RootProbe};

/// Flags shared by every action
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub verbose: bool,
    pub dry_run: bool,
    pub config: Option<PathBuf>,
    pub network_id: Option<String>,
    pub interface: Option<String>,
    pub subnet: Option<String>,
    pub ipv6: bool,
    pub no_backup: bool,
    pub yes: bool,
    /// `auto` or a backend name
    pub backend: Option<String>,
}

impl GlobalOptions {
    pub fn loader(&self) -> ConfigLoader {
        match &self.config {
            Some(path) => ConfigLoader::from_path(path),
            None => ConfigLoader::new(),
        }
    }

    /// Settings from the configuration file with `--backend` applied
    pub fn settings(&self, loader: &ConfigLoader) -> Result<ToolSettings> {
        let mut settings = loader
            .load_settings()
            .with_context(|| format!("Failed to load settings from {}", loader.path().display()))?;
        match self.backend.as_deref() {
            None => {}
            Some("auto") => settings.backend = None,
            Some(name) => settings.backend = Some(name.parse::<Backend>()?),
        }
        Ok(settings)
    }

    pub fn overrides(&self) -> Overrides {
        Overrides {
            network_id: self.network_id.clone(),
            physical_interface: self.interface.clone(),
            physical_subnet: self.subnet.clone(),
            ipv6: self.ipv6,
            role: None,
        }
    }

    pub fn mode(&self) -> ExecMode {
        if self.dry_run {
            ExecMode::DryRun
        } else {
            ExecMode::Live
        }
    }
}

/// Everything a command needs, built once in `main`
pub struct AppContext {
    pub options: GlobalOptions,
    pub loader: ConfigLoader,
    pub apply: ApplyContext,
    pub root_probe: RootProbe,
}

impl AppContext {
    /// Context running real commands
    pub fn bootstrap(
        options: GlobalOptions,
        loader: ConfigLoader,
        settings: ToolSettings,
    ) -> Arc<Self> {
        let runner = Arc::new(SystemRunner::with_timeout(
            options.mode(),
            settings.command_timeout,
        ));
        Arc::new(Self::with_runner(options, loader, settings, runner))
    }

    pub fn with_runner(
        options: GlobalOptions,
        loader: ConfigLoader,
        settings: ToolSettings,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            options,
            loader,
            apply: ApplyContext::new(runner, settings),
            root_probe: effective_root,
        }
    }

    pub fn with_root_probe(mut self, probe: RootProbe) -> Self {
        self.root_probe = probe;
        self
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        self.apply.runner()
    }

    pub fn settings(&self) -> &ToolSettings {
        self.apply.settings()
    }

    pub fn is_dry_run(&self) -> bool {
        self.apply.is_dry_run()
    }

    pub fn desired_state(&self) -> Result<DesiredState> {
        self.loader
            .load_with(&self.options.overrides())
            .with_context(|| format!("Failed to load {}", self.loader.path().display()))
    }

    pub fn topology(&self) -> Result<Topology> {
        self.loader
            .load_topology(&self.options.overrides())
            .with_context(|| format!("Failed to load topology from {}", self.loader.path().display()))
    }

    pub fn client(&self) -> Arc<dyn OverlayClient> {
        Arc::new(ZeroTierCli::new(self.runner().clone()))
    }

    /// Configured or detected firewall backend
    pub async fn backend(&self) -> Arc<dyn FirewallBackend> {
        select_backend(&self.apply).await
    }

    pub async fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.apply.clone(), self.client(), self.backend().await)
            .with_root_probe(self.root_probe)
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            backup: !self.options.no_backup,
            confirmation: self.confirmation(),
        }
    }

    /// Prompt on the terminal unless `--yes` was given or nothing will change
    pub fn confirmation(&self) -> ConfirmationPolicy {
        if self.options.yes || self.is_dry_run() {
            ConfirmationPolicy::AutoApprove
        } else {
            ConfirmationPolicy::Callback(Arc::new(confirm_on_terminal))
        }
    }
}

fn confirm_on_terminal(plan: &str) -> bool {
    eprintln!("{}", plan);
    eprint!("Proceed? [y/N] ");
    let _ = io::stderr().flush();

    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => is_yes(&answer),
        Err(_) => false,
    }
}

pub(crate) fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
