//! Dependency installation: package manager detection, required tools and
//! the overlay client service

use async_trait::async_trait;
use log::{info, warn};

use ztnet_core::error::ExecutionError;
use ztnet_core::{Backend, NetworkError, Result};
use ztnet_exec::{CommandRunner, CommandSpec};
use ztnet_validate::{require_root, RootProbe};

use crate::context::ApplyContext;
use crate::steps::{ensure, OperationStep, StepRecord};

/// Fallback installer published by ZeroTier
pub const ZEROTIER_INSTALL_SCRIPT: &str = "curl -s https://install.zerotier.com | bash";

const ZEROTIER_PACKAGE: &str = "zerotier-one";
const ZEROTIER_SERVICE: &str = "zerotier-one";

/// Supported package managers, in detection order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Pacman,
    Zypper,
    Apk,
}

impl PackageManager {
    pub const ALL: [PackageManager; 6] = [
        PackageManager::Apt,
        PackageManager::Dnf,
        PackageManager::Yum,
        PackageManager::Pacman,
        PackageManager::Zypper,
        PackageManager::Apk,
    ];

    pub fn program(&self) -> &'static str {
        match self {
            PackageManager::Apt => "apt-get",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Pacman => "pacman",
            PackageManager::Zypper => "zypper",
            PackageManager::Apk => "apk",
        }
    }

    /// Non-interactive install command for `package`
    pub fn install_command(&self, package: &str) -> CommandSpec {
        let args: &[&str] = match self {
            PackageManager::Apt | PackageManager::Dnf | PackageManager::Yum => &["install", "-y"],
            PackageManager::Pacman => &["-S", "--noconfirm"],
            PackageManager::Zypper => &["--non-interactive", "install"],
            PackageManager::Apk => &["add"],
        };
        CommandSpec::mutate(self.program())
            .args(args.iter().copied())
            .arg(package)
    }

    /// Probe flag printing the manager's version
    fn version_flag(&self) -> &'static str {
        match self {
            PackageManager::Pacman => "-V",
            _ => "--version",
        }
    }
}

/// Whether `program` can be started at all
pub async fn program_available(runner: &dyn CommandRunner, program: &str, flag: &str) -> bool {
    matches!(
        runner.run(&CommandSpec::query(program).arg(flag)).await,
        Ok(result) if result.success()
    )
}

/// First package manager answering its version probe
pub async fn detect_package_manager(runner: &dyn CommandRunner) -> Option<PackageManager> {
    for manager in PackageManager::ALL {
        if program_available(runner, manager.program(), manager.version_flag()).await {
            info!("Detected package manager {}", manager.program());
            return Some(manager);
        }
    }
    None
}

/// Install `package` unless `probe` is already on the host
struct PackageStep {
    ctx: ApplyContext,
    manager: PackageManager,
    package: &'static str,
    /// Program and flag proving the package is installed
    probe: (&'static str, &'static str),
    /// Shell command tried when the package manager cannot install it
    fallback: Option<&'static str>,
}

#[async_trait]
impl OperationStep for PackageStep {
    fn description(&self) -> String {
        format!("install {}", self.package)
    }

    async fn check(&self) -> Result<bool> {
        let (program, flag) = self.probe;
        Ok(program_available(self.ctx.runner().as_ref(), program, flag).await)
    }

    async fn apply(&self) -> Result<()> {
        let installed = self
            .ctx
            .runner()
            .run(&self.manager.install_command(self.package))
            .await
            .and_then(|r| r.ensure_success());
        match (installed, self.fallback) {
            (Ok(_), _) => Ok(()),
            (Err(e), Some(script)) => {
                warn!(
                    "{} could not install {}: {}; using the installer script",
                    self.manager.program(),
                    self.package,
                    e
                );
                self.ctx
                    .runner()
                    .run(&CommandSpec::mutate("sh").args(["-c", script]))
                    .await?
                    .ensure_success()?;
                Ok(())
            }
            (Err(e), None) => Err(e),
        }
    }
}

/// Enable and start a systemd unit
struct ServiceStep {
    ctx: ApplyContext,
    unit: &'static str,
}

#[async_trait]
impl OperationStep for ServiceStep {
    fn description(&self) -> String {
        format!("enable and start {}", self.unit)
    }

    async fn check(&self) -> Result<bool> {
        let enabled = self
            .ctx
            .runner()
            .run(&CommandSpec::query("systemctl").args(["is-enabled", self.unit]))
            .await?;
        let active = self
            .ctx
            .runner()
            .run(&CommandSpec::query("systemctl").args(["is-active", self.unit]))
            .await?;
        Ok(enabled.success() && active.success())
    }

    async fn apply(&self) -> Result<()> {
        self.ctx
            .runner()
            .run(&CommandSpec::mutate("systemctl").args(["enable", "--now", self.unit]))
            .await?
            .ensure_success()?;
        Ok(())
    }
}

/// Installs the tools a gateway needs
pub struct Installer {
    ctx: ApplyContext,
    root_probe: RootProbe,
}

impl Installer {
    pub fn new(ctx: ApplyContext) -> Self {
        Self {
            ctx,
            root_probe: ztnet_validate::effective_root,
        }
    }

    pub fn with_root_probe(mut self, probe: RootProbe) -> Self {
        self.root_probe = probe;
        self
    }

    /// Install curl, iptables when `backend` is none, the overlay client and
    /// enable its service
    pub async fn install(&self, backend: Backend) -> Result<Vec<StepRecord>> {
        if !self.ctx.is_dry_run() {
            require_root(self.root_probe, "installing dependencies")?;
        }

        let runner = self.ctx.runner();
        let manager = detect_package_manager(runner.as_ref()).await.ok_or_else(|| {
            NetworkError::Execution(ExecutionError::Unavailable {
                what: "a supported package manager".to_string(),
            })
        })?;

        let package = |package: &'static str,
                       probe: (&'static str, &'static str),
                       fallback: Option<&'static str>|
         -> Box<dyn OperationStep> {
            Box::new(PackageStep {
                ctx: self.ctx.clone(),
                manager,
                package,
                probe,
                fallback,
            })
        };
        let mut steps = vec![package("curl", ("curl", "--version"), None)];
        if backend == Backend::None {
            steps.push(package("iptables", ("iptables", "--version"), None));
        }
        steps.push(package(
            ZEROTIER_PACKAGE,
            ("zerotier-cli", "-v"),
            Some(ZEROTIER_INSTALL_SCRIPT),
        ));
        steps.push(Box::new(ServiceStep {
            ctx: self.ctx.clone(),
            unit: ZEROTIER_SERVICE,
        }));

        let mut records = Vec::with_capacity(steps.len());
        for step in &steps {
            records.push(ensure(step.as_ref(), self.ctx.mode()).await?);
        }
        info!("Dependencies installed");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ztnet_config::ToolSettings;
    use ztnet_exec::ScriptedRunner;

    use crate::steps::StepOutcome;

    #[tokio::test]
    async fn test_detection_order() {
        let runner = ScriptedRunner::new();
        runner.on("yum --version", 0, "4.2");
        runner.on("dnf --version", 0, "4.14");
        assert_eq!(detect_package_manager(&runner).await, Some(PackageManager::Dnf));

        let empty = ScriptedRunner::new();
        assert_eq!(detect_package_manager(&empty).await, None);
    }

    #[test]
    fn test_install_commands() {
        assert_eq!(
            PackageManager::Apt.install_command("curl").command_line(),
            "apt-get install -y curl"
        );
        assert_eq!(
            PackageManager::Pacman.install_command("curl").command_line(),
            "pacman -S --noconfirm curl"
        );
        assert!(PackageManager::Apk.install_command("curl").is_mutating());
    }

    #[tokio::test]
    async fn test_falls_back_to_installer_script() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("apt-get --version", 0, "apt 2.6");
        runner.on("curl --version", 0, "curl 8.0");
        runner.on("apt-get install -y zerotier-one", 100, "");
        runner.on("sh -c", 0, "");
        runner.on("systemctl", 1, "");
        runner.on("systemctl enable", 0, "");
        let installer = Installer::new(ApplyContext::new(runner.clone(), ToolSettings::default()))
            .with_root_probe(|| true);

        let records = installer.install(Backend::Iptables).await.unwrap();
        assert_eq!(records[0].outcome, StepOutcome::AlreadySatisfied);
        assert_eq!(records.len(), 3);
        assert_eq!(
            runner.executed_mutations(),
            vec![
                "apt-get install -y zerotier-one".to_string(),
                format!("sh -c {}", ZEROTIER_INSTALL_SCRIPT),
                "systemctl enable --now zerotier-one".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_requires_root_unless_dry_run() {
        let runner = Arc::new(ScriptedRunner::new());
        let installer = Installer::new(ApplyContext::new(runner, ToolSettings::default()))
            .with_root_probe(|| false);
        assert!(matches!(
            installer.install(Backend::Iptables).await,
            Err(NetworkError::Privilege(_))
        ));
    }
}
