//! `KEY=VALUE` document parser

use indexmap::IndexMap;
use log::warn;
use regex::Regex;

use ztnet_core::Result;

/// Keys understood by ztnet; anything else is reported once and ignored
pub const KNOWN_KEYS: &[&str] = &[
    "ZT_NETWORK_ID",
    "NETWORK_ID",
    "PHY_IFACE",
    "PHY_SUBNET",
    "ENABLE_IPV6",
    "IPV6",
    "TOPOLOGY_ROLE",
    "TOPOLOGY_TYPE",
    "network",
    "BACKUP_DIR",
    "LOG_FILE",
    "SYSCTL_CONF",
    "COMMAND_TIMEOUT",
    "JOIN_TIMEOUT",
    "CHECK_INTERVAL",
    "ALERT_EMAIL",
    "ALERT_WEBHOOK",
    "FIREWALL_BACKEND",
    "IPTABLES_RULES_V4",
    "IPTABLES_RULES_V6",
    "NFTABLES_CONF",
    "UFW_BEFORE_RULES",
];

/// Key repeated once per topology network
pub const NETWORK_LIST_KEY: &str = "network";

/// Represents a line in a configuration document
#[derive(Debug, Clone, PartialEq)]
enum ConfigLine {
    Empty,
    Comment,
    Assignment { key: String, value: String },
    Malformed(String),
}

/// A value and the line it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: String,
    pub line: usize,
}

/// Parsed configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    values: IndexMap<String, Entry>,
    networks: Vec<Entry>,
    unknown: Vec<String>,
}

impl ConfigDocument {
    /// Parse document content. Malformed lines are skipped with a warning.
    pub fn parse(content: &str) -> Result<Self> {
        let key_regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex");
        let mut document = ConfigDocument::default();

        for (index, raw) in content.lines().enumerate() {
            let line_number = index + 1;
            match parse_line(raw, &key_regex) {
                ConfigLine::Empty | ConfigLine::Comment => {}
                ConfigLine::Malformed(text) => {
                    warn!("Ignoring malformed config line {}: {}", line_number, text);
                }
                ConfigLine::Assignment { key, value } => {
                    let entry = Entry {
                        value,
                        line: line_number,
                    };
                    if key == NETWORK_LIST_KEY {
                        document.networks.push(entry);
                        continue;
                    }
                    if !KNOWN_KEYS.contains(&key.as_str()) && !document.unknown.contains(&key) {
                        warn!("Ignoring unknown config key '{}' at line {}", key, line_number);
                        document.unknown.push(key.clone());
                    }
                    document.values.insert(key, entry);
                }
            }
        }

        Ok(document)
    }

    /// Last value assigned to `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|e| e.value.as_str())
    }

    /// First of `keys` that has a non-empty value
    pub fn get_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|key| self.get(key))
            .find(|value| !value.is_empty())
    }

    pub fn entry(&self, key: &str) -> Option<&Entry> {
        self.values.get(key)
    }

    /// `network=` values in appearance order
    pub fn networks(&self) -> &[Entry] {
        &self.networks
    }

    /// Keys that ztnet does not understand
    pub fn unknown_keys(&self) -> &[String] {
        &self.unknown
    }
}

fn parse_line(line: &str, key_regex: &Regex) -> ConfigLine {
    let line = line.trim();

    if line.is_empty() {
        return ConfigLine::Empty;
    }
    if line.starts_with('#') {
        return ConfigLine::Comment;
    }

    let line = line.strip_prefix("export ").map(str::trim).unwrap_or(line);

    let Some((key, value)) = line.split_once('=') else {
        return ConfigLine::Malformed(line.to_string());
    };

    let key = key.trim();
    if !key_regex.is_match(key) {
        return ConfigLine::Malformed(line.to_string());
    }

    ConfigLine::Assignment {
        key: key.to_string(),
        value: unquote(value.trim()),
    }
}

/// Strip matching single or double quotes; drop trailing comments on bare values
fn unquote(value: &str) -> String {
    for quote in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(quote) {
            if let Some(end) = inner.find(quote) {
                return inner[..end].to_string();
            }
        }
    }

    match value.find(" #") {
        Some(pos) => value[..pos].trim_end().to_string(),
        None => value.to_string(),
    }
}
