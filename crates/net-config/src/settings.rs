//! Tool settings: host paths, timeouts and alert targets

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ztnet_core::error::ConfigError;
use ztnet_core::{Backend, NetworkError, Result};

use crate::parser::ConfigDocument;

/// Host files ztnet reads, rewrites or snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    /// Boot-time forwarding configuration
    pub sysctl_conf: PathBuf,
    pub iptables_rules_v4: PathBuf,
    pub iptables_rules_v6: PathBuf,
    pub nftables_conf: PathBuf,
    pub ufw_before_rules: PathBuf,
    pub ufw_user_rules: PathBuf,
    pub ufw_user6_rules: PathBuf,
    pub firewalld_direct: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self::under(Path::new("/"))
    }
}

impl HostPaths {
    /// Standard locations rebased under `root`
    pub fn under(root: &Path) -> Self {
        Self {
            sysctl_conf: root.join("etc/sysctl.conf"),
            iptables_rules_v4: root.join("etc/iptables/rules.v4"),
            iptables_rules_v6: root.join("etc/iptables/rules.v6"),
            nftables_conf: root.join("etc/nftables.conf"),
            ufw_before_rules: root.join("etc/ufw/before.rules"),
            ufw_user_rules: root.join("etc/ufw/user.rules"),
            ufw_user6_rules: root.join("etc/ufw/user6.rules"),
            firewalld_direct: root.join("etc/firewalld/direct.xml"),
        }
    }
}

/// Everything besides the desired state that a run needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSettings {
    pub backup_root: PathBuf,
    /// Explicit log file; a timestamped temp file is used when unset
    pub log_file: Option<PathBuf>,
    pub command_timeout: Duration,
    /// How long to wait for the overlay device after joining
    pub join_timeout: Duration,
    pub check_interval: Duration,
    pub alert_email: Option<String>,
    pub alert_webhook: Option<String>,
    /// Forced firewall backend, bypassing detection
    pub backend: Option<Backend>,
    pub paths: HostPaths,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("/var/backups/ztnet"),
            log_file: None,
            command_timeout: Duration::from_secs(60),
            join_timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(60),
            alert_email: None,
            alert_webhook: None,
            backend: None,
            paths: HostPaths::default(),
        }
    }
}

impl ToolSettings {
    /// Read settings from a document, falling back to defaults
    pub fn from_document(doc: &ConfigDocument) -> Result<Self> {
        let mut settings = ToolSettings::default();

        if let Some(dir) = non_empty(doc.get("BACKUP_DIR")) {
            settings.backup_root = PathBuf::from(dir);
        }
        if let Some(file) = non_empty(doc.get("LOG_FILE")) {
            settings.log_file = Some(PathBuf::from(file));
        }
        if let Some(value) = non_empty(doc.get("COMMAND_TIMEOUT")) {
            settings.command_timeout = parse_seconds("COMMAND_TIMEOUT", value)?;
        }
        if let Some(value) = non_empty(doc.get("JOIN_TIMEOUT")) {
            settings.join_timeout = parse_seconds("JOIN_TIMEOUT", value)?;
        }
        if let Some(value) = non_empty(doc.get("CHECK_INTERVAL")) {
            settings.check_interval = parse_seconds("CHECK_INTERVAL", value)?;
        }
        settings.alert_email = non_empty(doc.get("ALERT_EMAIL")).map(str::to_string);
        settings.alert_webhook = non_empty(doc.get("ALERT_WEBHOOK")).map(str::to_string);
        if let Some(value) = non_empty(doc.get("FIREWALL_BACKEND")) {
            if value != "auto" {
                settings.backend = Some(Backend::from_str(value)?);
            }
        }

        let paths = &mut settings.paths;
        for (key, target) in [
            ("SYSCTL_CONF", &mut paths.sysctl_conf),
            ("IPTABLES_RULES_V4", &mut paths.iptables_rules_v4),
            ("IPTABLES_RULES_V6", &mut paths.iptables_rules_v6),
            ("NFTABLES_CONF", &mut paths.nftables_conf),
            ("UFW_BEFORE_RULES", &mut paths.ufw_before_rules),
        ] {
            if let Some(value) = non_empty(doc.get(key)) {
                *target = PathBuf::from(value);
            }
        }

        Ok(settings)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Parse `30`, `30s` or `5m` into a duration
pub fn parse_seconds(field: &str, value: &str) -> Result<Duration> {
    let invalid = || {
        NetworkError::Config(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        })
    };

    let (number, multiplier) = if let Some(minutes) = value.strip_suffix('m') {
        (minutes, 60)
    } else if let Some(seconds) = value.strip_suffix('s') {
        (seconds, 1)
    } else {
        (value, 1)
    };

    let amount: u64 = number.trim().parse().map_err(|_| invalid())?;
    if amount == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(amount * multiplier))
}

/// Parse shell-style booleans
pub fn parse_bool(field: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(NetworkError::Config(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ToolSettings::from_document(&ConfigDocument::default()).unwrap();
        assert_eq!(settings, ToolSettings::default());
        assert_eq!(settings.paths.sysctl_conf, PathBuf::from("/etc/sysctl.conf"));
    }

    #[test]
    fn test_overrides_from_document() {
        let doc = ConfigDocument::parse(
            "BACKUP_DIR=/srv/backups\nCHECK_INTERVAL=5m\nCOMMAND_TIMEOUT=10s\nFIREWALL_BACKEND=nft\nSYSCTL_CONF=/etc/sysctl.d/99-ztnet.conf\nALERT_EMAIL=ops@example.com\n",
        )
        .unwrap();
        let settings = ToolSettings::from_document(&doc).unwrap();
        assert_eq!(settings.backup_root, PathBuf::from("/srv/backups"));
        assert_eq!(settings.check_interval, Duration::from_secs(300));
        assert_eq!(settings.command_timeout, Duration::from_secs(10));
        assert_eq!(settings.backend, Some(Backend::Nftables));
        assert_eq!(
            settings.paths.sysctl_conf,
            PathBuf::from("/etc/sysctl.d/99-ztnet.conf")
        );
        assert_eq!(settings.alert_email.as_deref(), Some("ops@example.com"));
    }

    #[test]
    fn test_invalid_numbers_are_config_errors() {
        let doc = ConfigDocument::parse("CHECK_INTERVAL=soon\n").unwrap();
        assert!(matches!(
            ToolSettings::from_document(&doc),
            Err(NetworkError::Config(ConfigError::InvalidValue { .. }))
        ));
        assert!(parse_seconds("JOIN_TIMEOUT", "0").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("IPV6", "Yes").unwrap());
        assert!(!parse_bool("IPV6", "off").unwrap());
        assert!(parse_bool("IPV6", "maybe").is_err());
    }
}
