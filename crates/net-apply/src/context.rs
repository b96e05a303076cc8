//! Explicit run context threaded through every component

use std::path::Path;
use std::sync::Arc;

use ztnet_config::{HostPaths, ToolSettings};
use ztnet_exec::{CommandRunner, ExecMode};

/// Runner and settings shared by one invocation
#[derive(Clone)]
pub struct ApplyContext {
    runner: Arc<dyn CommandRunner>,
    settings: Arc<ToolSettings>,
}

impl ApplyContext {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: ToolSettings) -> Self {
        Self {
            runner,
            settings: Arc::new(settings),
        }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn settings(&self) -> &ToolSettings {
        &self.settings
    }

    pub fn paths(&self) -> &HostPaths {
        &self.settings.paths
    }

    pub fn backup_root(&self) -> &Path {
        &self.settings.backup_root
    }

    pub fn mode(&self) -> ExecMode {
        self.runner.mode()
    }

    pub fn is_dry_run(&self) -> bool {
        self.runner.is_dry_run()
    }
}
