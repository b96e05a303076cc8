//! Desired state and topology loading

use std::path::{Path, PathBuf};
use std::str::FromStr;

use ipnet::IpNet;
use log::{debug, info};

use ztnet_core::error::ConfigError;
use ztnet_core::{
    DesiredState, NetworkError, NetworkId, Result, Topology, TopologyKind, TopologyRole,
};

use crate::parser::ConfigDocument;
use crate::settings::{parse_bool, ToolSettings};

/// Default configuration file, read only when it exists
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ztnet/ztnet.conf";

const NETWORK_ID_KEYS: &[&str] = &["ZT_NETWORK_ID", "NETWORK_ID"];
const IPV6_KEYS: &[&str] = &["ENABLE_IPV6", "IPV6"];

/// Command-line values taking precedence over the file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub network_id: Option<String>,
    pub physical_interface: Option<String>,
    pub physical_subnet: Option<String>,
    /// `--ipv6` can only switch IPv6 on
    pub ipv6: bool,
    pub role: Option<TopologyRole>,
}

/// Configuration loader
pub struct ConfigLoader {
    path: PathBuf,
    required: bool,
}

impl ConfigLoader {
    /// Loader for the default location; a missing file yields an empty document
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_CONFIG_PATH),
            required: false,
        }
    }

    /// Loader for an explicit file, which must exist
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            required: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the configuration document
    pub fn document(&self) -> Result<ConfigDocument> {
        if !self.required && !self.path.exists() {
            debug!("No configuration at {}, using defaults", self.path.display());
            return Ok(ConfigDocument::default());
        }
        Self::load_file(&self.path)
    }

    /// Parse a configuration file
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<ConfigDocument> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            NetworkError::Config(ConfigError::Unreadable {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        })?;
        info!("Loaded configuration from {}", path.display());
        ConfigDocument::parse(&content)
    }

    /// Desired state from the configuration alone
    pub fn load(&self) -> Result<DesiredState> {
        self.load_with(&Overrides::default())
    }

    /// Desired state with command-line overrides applied
    pub fn load_with(&self, overrides: &Overrides) -> Result<DesiredState> {
        self.document()?.desired_state(overrides)
    }

    pub fn load_topology(&self, overrides: &Overrides) -> Result<Topology> {
        self.document()?.topology(overrides)
    }

    pub fn load_settings(&self) -> Result<ToolSettings> {
        self.document()?.settings()
    }

    /// Desired state from in-memory content
    pub fn load_str(content: &str) -> Result<DesiredState> {
        ConfigDocument::parse(content)?.desired_state(&Overrides::default())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigDocument {
    /// Build the desired gateway state
    pub fn desired_state(&self, overrides: &Overrides) -> Result<DesiredState> {
        let raw_id = overrides
            .network_id
            .as_deref()
            .filter(|v| !v.is_empty())
            .or_else(|| self.get_any(NETWORK_ID_KEYS))
            .ok_or_else(|| {
                NetworkError::Config(ConfigError::MissingField {
                    field: "ZT_NETWORK_ID".to_string(),
                })
            })?;
        let network_id = NetworkId::from_str(raw_id)?;

        let mut state = DesiredState::new(network_id)
            .with_ipv6(self.ipv6(overrides)?)
            .with_role(self.role(overrides)?);

        let iface = overrides
            .physical_interface
            .as_deref()
            .filter(|v| !v.is_empty())
            .or_else(|| self.get_any(&["PHY_IFACE"]));
        if let Some(iface) = iface {
            state = state.with_physical_interface(iface);
        }

        let subnet = overrides
            .physical_subnet
            .as_deref()
            .filter(|v| !v.is_empty())
            .or_else(|| self.get_any(&["PHY_SUBNET"]));
        if let Some(subnet) = subnet {
            state = state.with_physical_subnet(parse_subnet(subnet)?);
        }

        Ok(state)
    }

    /// Build a topology from the `network=` lines in appearance order
    pub fn topology(&self, overrides: &Overrides) -> Result<Topology> {
        let kind = match self.get_any(&["TOPOLOGY_TYPE"]) {
            Some(value) => TopologyKind::from_str(value)?,
            None => TopologyKind::default(),
        };

        let mut ids = Vec::with_capacity(self.networks().len());
        for entry in self.networks() {
            let id = NetworkId::from_str(&entry.value).map_err(|_| {
                NetworkError::Config(ConfigError::Parse {
                    line: entry.line,
                    message: format!(
                        "invalid network id '{}': expected 16 hexadecimal characters",
                        entry.value
                    ),
                })
            })?;
            ids.push(id);
        }

        let iface = overrides
            .physical_interface
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| self.get_any(&["PHY_IFACE"]).map(str::to_string));

        Ok(Topology::from_network_ids(kind, ids)
            .with_physical_interface(iface)
            .with_ipv6(self.ipv6(overrides)?))
    }

    pub fn settings(&self) -> Result<ToolSettings> {
        ToolSettings::from_document(self)
    }

    fn ipv6(&self, overrides: &Overrides) -> Result<bool> {
        if overrides.ipv6 {
            return Ok(true);
        }
        match self.get_any(IPV6_KEYS) {
            Some(value) => parse_bool("ENABLE_IPV6", value),
            None => Ok(false),
        }
    }

    fn role(&self, overrides: &Overrides) -> Result<TopologyRole> {
        if let Some(role) = overrides.role {
            return Ok(role);
        }
        match self.get_any(&["TOPOLOGY_ROLE"]) {
            Some(value) => TopologyRole::from_str(value),
            None => Ok(TopologyRole::default()),
        }
    }
}

fn parse_subnet(value: &str) -> Result<IpNet> {
    if !value.contains('/') {
        return Err(NetworkError::Config(ConfigError::InvalidSubnet {
            value: value.to_string(),
            reason: "missing prefix length".to_string(),
        }));
    }
    value.parse::<IpNet>().map_err(|e| {
        NetworkError::Config(ConfigError::InvalidSubnet {
            value: value.to_string(),
            reason: e.to_string(),
        })
    })
}
