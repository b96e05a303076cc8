//! CLI tests

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use anyhow::Context;
    use chrono::{Local, TimeZone};
    use tempfile::TempDir;

    use ztnet_apply::ConfirmationPolicy;
    use ztnet_config::{ConfigLoader, HostPaths, ToolSettings};
    use ztnet_core::error::{ConfigError, PrivilegeError, ValidationError};
    use ztnet_core::{Backend, NetworkError};
    use ztnet_exec::ScriptedRunner;

    use crate::commands::ConfigureCommand;
    use crate::context::{is_yes, AppContext, GlobalOptions};
    use crate::exit::{exit_code, FAILURE, INVALID, PRIVILEGE};
    use crate::logging::{default_log_path, format_line};

    const ETH0: &str = r#"[{"ifindex":2,"ifname":"eth0","operstate":"UP","addr_info":[{"family":"inet","local":"192.168.1.10","prefixlen":24}]}]"#;

    /// Write a configuration file into a fresh temp directory
    fn config_file(content: &str) -> TempDir {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        fs::write(temp_dir.path().join("ztnet.conf"), content).expect("Failed to write config");
        temp_dir
    }

    fn options_for(dir: &Path) -> GlobalOptions {
        GlobalOptions {
            config: Some(dir.join("ztnet.conf")),
            ..GlobalOptions::default()
        }
    }

    #[test]
    fn test_exit_codes() {
        let config = anyhow::Error::from(NetworkError::Config(ConfigError::MissingField {
            field: "ZT_NETWORK_ID".to_string(),
        }));
        assert_eq!(exit_code(&config), INVALID);

        let validation: anyhow::Result<()> =
            Err(NetworkError::Validation(ValidationError::NoDefaultRoute).into());
        let wrapped = validation.context("Configuration validation failed").unwrap_err();
        assert_eq!(exit_code(&wrapped), INVALID);

        let privilege = anyhow::Error::from(NetworkError::Privilege(PrivilegeError::NotRoot {
            operation: "configuring the gateway".to_string(),
        }));
        assert_eq!(exit_code(&privilege), PRIVILEGE);

        assert_eq!(exit_code(&anyhow::anyhow!("Plan was declined")), FAILURE);
    }

    #[test]
    fn test_confirmation_answers() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("no"));
    }

    #[test]
    fn test_backend_flag_overrides_file() {
        let dir = config_file("ZT_NETWORK_ID=a1b2c3d4e5f6a7b8\nFIREWALL_BACKEND=ufw\n");
        let mut options = options_for(dir.path());
        let loader = options.loader();
        assert_eq!(options.settings(&loader).unwrap().backend, Some(Backend::Ufw));

        options.backend = Some("nftables".to_string());
        assert_eq!(
            options.settings(&loader).unwrap().backend,
            Some(Backend::Nftables)
        );

        options.backend = Some("auto".to_string());
        assert_eq!(options.settings(&loader).unwrap().backend, None);

        options.backend = Some("pf".to_string());
        let err = options.settings(&loader).unwrap_err();
        assert_eq!(exit_code(&err), INVALID);
    }

    #[test]
    fn test_flags_override_configuration() {
        let dir = config_file("ZT_NETWORK_ID=a1b2c3d4e5f6a7b8\nPHY_IFACE=eth0\n");
        let options = GlobalOptions {
            interface: Some("enp3s0".to_string()),
            subnet: Some("10.0.0.0/24".to_string()),
            ipv6: true,
            ..options_for(dir.path())
        };
        let loader = options.loader();
        let settings = options.settings(&loader).unwrap();
        let context = AppContext::with_runner(
            options,
            loader,
            settings,
            Arc::new(ScriptedRunner::new()),
        );

        let desired = context.desired_state().unwrap();
        assert_eq!(desired.network_id().as_str(), "a1b2c3d4e5f6a7b8");
        assert_eq!(desired.physical_interface(), Some("enp3s0"));
        assert_eq!(desired.physical_subnet().unwrap().to_string(), "10.0.0.0/24");
        assert!(desired.ipv6());
    }

    #[test]
    fn test_missing_explicit_config_is_invalid() {
        let options = GlobalOptions {
            config: Some("/nonexistent/ztnet.conf".into()),
            ..GlobalOptions::default()
        };
        let err = options.settings(&options.loader()).unwrap_err();
        assert_eq!(exit_code(&err), INVALID);
    }

    #[test]
    fn test_prompt_only_for_live_unconfirmed_runs() {
        let context = |options: GlobalOptions, runner: ScriptedRunner| {
            AppContext::with_runner(
                options,
                ConfigLoader::new(),
                ToolSettings::default(),
                Arc::new(runner),
            )
        };

        let live = context(GlobalOptions::default(), ScriptedRunner::new());
        assert!(matches!(live.confirmation(), ConfirmationPolicy::Callback(_)));

        let confirmed = context(
            GlobalOptions {
                yes: true,
                ..GlobalOptions::default()
            },
            ScriptedRunner::new(),
        );
        assert!(matches!(
            confirmed.confirmation(),
            ConfirmationPolicy::AutoApprove
        ));

        let dry = context(GlobalOptions::default(), ScriptedRunner::dry_run());
        assert!(matches!(dry.confirmation(), ConfirmationPolicy::AutoApprove));
        assert!(dry.reconcile_options().backup);
    }

    #[tokio::test]
    async fn test_dry_run_configure_changes_nothing() {
        let dir = config_file("ZT_NETWORK_ID=a1b2c3d4e5f6a7b8\nPHY_IFACE=eth0\n");
        let options = GlobalOptions {
            dry_run: true,
            no_backup: true,
            ..options_for(dir.path())
        };
        let loader = options.loader();
        let settings = ToolSettings {
            backend: Some(Backend::Iptables),
            backup_root: dir.path().join("backups"),
            paths: HostPaths::under(dir.path()),
            ..options.settings(&loader).unwrap()
        };

        let runner = Arc::new(ScriptedRunner::dry_run());
        runner.on("ip -j addr show dev eth0", 0, ETH0);
        runner.on("zerotier-cli -j listnetworks", 0, "[]");
        runner.on("sysctl -n", 0, "0\n");
        runner.on("iptables", 1, "");
        runner.on("iptables-save", 0, "*filter\nCOMMIT\n");

        let context = Arc::new(
            AppContext::with_runner(options, loader, settings, runner.clone())
                .with_root_probe(|| false),
        );
        ConfigureCommand::new(context).execute().await.unwrap();

        assert!(runner.executed_mutations().is_empty());
        assert!(runner.writes().is_empty());
        assert!(runner
            .calls()
            .iter()
            .any(|c| c.simulated && c.command.starts_with("zerotier-cli join")));
        assert!(!dir.path().join("etc/sysctl.conf").exists());
    }

    #[test]
    fn test_log_line_format() {
        let now = Local.with_ymd_and_hms(2024, 3, 1, 14, 5, 9).unwrap();
        let line = format_line(now, log::Level::Warn, "ztnet::exec", "slow command");
        assert!(line.starts_with("2024-03-01T14:05:09"));
        assert!(line.ends_with(" WARN ztnet::exec: slow command"));

        let path = default_log_path(now);
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "ztnet-20240301-140509.log"
        );
    }
}
