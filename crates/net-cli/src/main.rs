//! ztnet - declarative ZeroTier gateway reconciler

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;
use ztnet::commands::{
    ConfigureCommand, DetectCommand, DiagnoseCommand, InstallCommand, MonitorCommand,
    OutputFormat, RollbackCommand, StatusCommand, TopologyAction, TopologyCommand,
    ValidateCommand,
};
use ztnet::context::{AppContext, GlobalOptions};
use ztnet::exit::{report_failure, SUCCESS};
use ztnet::logging;

#[derive(Parser)]
#[command(name = "ztnet")]
#[command(about = "Declarative ZeroTier gateway reconciler")]
#[command(version)]
#[command(long_about = "
Declarative ZeroTier gateway reconciler

Joins a ZeroTier network and routes between it and the local LAN: kernel
forwarding, NAT and forward rules on whichever firewall the host runs, with
a snapshot taken before every change.

Examples:
  ztnet configure -n a1b2c3d4e5f6a7b8 -p eth0 -s 192.168.1.0/24
  ztnet configure --dry-run                # Show what would change
  ztnet validate -c /etc/ztnet/ztnet.conf  # Check config and host
  ztnet status                             # Memberships and forwarding
  ztnet diagnose                           # Read-only health report
  ztnet monitor --interval 30              # Alert on status changes
  ztnet rollback --list                    # Available snapshots
  ztnet rollback                           # Restore the newest snapshot
  ztnet topology deploy -c topology.conf   # Hub and spokes on one host
")]
struct Cli {
    /// Enable debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log changes instead of making them
    #[arg(short, long, global = true)]
    dry_run: bool,

    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// ZeroTier network id (16 hex characters)
    #[arg(short = 'n', long, global = true)]
    network_id: Option<String>,

    /// Physical interface, default route interface when unset
    #[arg(short = 'p', long = "interface", global = true)]
    interface: Option<String>,

    /// Physical LAN subnet in CIDR notation
    #[arg(short = 's', long, global = true)]
    subnet: Option<String>,

    /// Also forward IPv6
    #[arg(long, global = true)]
    ipv6: bool,

    /// Skip the snapshot before changes
    #[arg(long, global = true)]
    no_backup: bool,

    /// Do not ask for confirmation
    #[arg(short, long, global = true)]
    yes: bool,

    /// Firewall backend (auto, iptables, firewalld, ufw, nftables)
    #[arg(long, global = true)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the host as a gateway for the network
    Configure,

    /// Validate configuration and host without changing anything
    Validate,

    /// Show memberships, forwarding and firewall backend
    Status {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Read-only diagnostics
    Diagnose {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Watch network health and alert on changes
    Monitor {
        /// Seconds between checks
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,

        /// Check once and exit
        #[arg(long)]
        once: bool,

        /// Output format for --once
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Restore a snapshot
    Rollback {
        /// List available snapshots
        #[arg(short, long)]
        list: bool,

        /// Snapshot to restore, the newest when unset
        #[arg(long, conflicts_with = "list")]
        snapshot: Option<String>,
    },

    /// Detect the firewall backend and installed tooling
    Detect,

    /// Install zerotier-one and required tools
    Install,

    /// Multi-network topologies
    Topology {
        #[command(subcommand)]
        action: TopologyAction,
    },
}

impl Cli {
    fn options(&self) -> GlobalOptions {
        GlobalOptions {
            verbose: self.verbose,
            dry_run: self.dry_run,
            config: self.config.clone(),
            network_id: self.network_id.clone(),
            interface: self.interface.clone(),
            subnet: self.subnet.clone(),
            ipv6: self.ipv6,
            no_backup: self.no_backup,
            yes: self.yes,
            backend: self.backend.clone(),
        }
    }
}

async fn run(command: Commands, options: GlobalOptions) -> anyhow::Result<()> {
    let loader = options.loader();
    let settings = options.settings(&loader)?;
    let context = AppContext::bootstrap(options, loader, settings);

    match command {
        Commands::Configure => ConfigureCommand::new(context).execute().await,
        Commands::Validate => ValidateCommand::new(context).execute().await,
        Commands::Status { format } => StatusCommand::new(context).execute(format).await,
        Commands::Diagnose { format } => DiagnoseCommand::new(context).execute(format).await,
        Commands::Monitor {
            interval,
            once,
            format,
        } => {
            let cmd = MonitorCommand::new(context);
            if once {
                cmd.check_once(format).await
            } else {
                cmd.execute(interval).await
            }
        }
        Commands::Rollback { list, snapshot } => {
            let cmd = RollbackCommand::new(context);
            if list {
                cmd.list().await
            } else {
                cmd.execute(snapshot.as_deref()).await
            }
        }
        Commands::Detect => DetectCommand::new(context).execute().await,
        Commands::Install => InstallCommand::new(context).execute().await,
        Commands::Topology { action } => TopologyCommand::new(context).execute(&action).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let options = cli.options();

    // LOG_FILE comes from the configuration, which may itself be broken
    let log_file = options
        .settings(&options.loader())
        .ok()
        .and_then(|s| s.log_file);
    if let Some(path) = logging::init(options.verbose, log_file.as_deref()) {
        info!("Logging to {}", path.display());
    }

    let code = match run(cli.command, options).await {
        Ok(()) => SUCCESS,
        Err(e) => report_failure(&e),
    };
    std::process::exit(code);
}
