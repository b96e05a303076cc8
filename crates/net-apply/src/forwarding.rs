//! Kernel forwarding flags

use std::path::{Path, PathBuf};

use log::info;

use ztnet_core::error::ExecutionError;
use ztnet_core::{IpFamily, NetworkError, Result};
use ztnet_exec::CommandSpec;

use crate::context::ApplyContext;

pub const IPV4_FORWARD: &str = "net.ipv4.ip_forward";
pub const IPV6_FORWARD: &str = "net.ipv6.conf.all.forwarding";

/// sysctl key of the forwarding flag for `family`
pub fn forwarding_key(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => IPV4_FORWARD,
        IpFamily::V6 => IPV6_FORWARD,
    }
}

/// Runtime value of a sysctl key
pub async fn runtime_value(ctx: &ApplyContext, key: &str) -> Result<String> {
    let result = ctx
        .runner()
        .run(&CommandSpec::query("sysctl").args(["-n", key]))
        .await?
        .ensure_success()?;
    Ok(result.stdout.trim().to_string())
}

pub async fn runtime_enabled(ctx: &ApplyContext, key: &str) -> Result<bool> {
    Ok(runtime_value(ctx, key).await? == "1")
}

pub async fn enable_runtime(ctx: &ApplyContext, key: &str) -> Result<()> {
    let assignment = format!("{}=1", key);
    ctx.runner()
        .run(&CommandSpec::mutate("sysctl").args(["-w", assignment.as_str()]))
        .await?
        .ensure_success()?;
    info!("Enabled {} at runtime", key);
    Ok(())
}

/// Current content of a config file, empty when it does not exist
pub async fn read_optional(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(NetworkError::Execution(ExecutionError::FileOperation {
            path: path.display().to_string(),
            reason: e.to_string(),
        })),
    }
}

/// Boot-time persistence of forwarding flags in a sysctl.conf-style file
pub struct SysctlFile {
    path: PathBuf,
}

impl SysctlFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn is_persisted(&self, key: &str, value: &str) -> Result<bool> {
        let content = read_optional(&self.path).await?;
        let (_, changed) = upsert_sysctl_line(&content, key, value);
        Ok(!changed)
    }

    pub async fn persist(&self, ctx: &ApplyContext, key: &str, value: &str) -> Result<()> {
        let content = read_optional(&self.path).await?;
        let (updated, changed) = upsert_sysctl_line(&content, key, value);
        if changed {
            ctx.runner().write_file(&self.path, &updated).await?;
            info!("Persisted {}={} in {}", key, value, self.path.display());
        }
        Ok(())
    }
}

/// Key of a sysctl line, also for commented-out assignments
fn line_key(line: &str) -> Option<&str> {
    let uncommented = line.trim().trim_start_matches(['#', ';']).trim();
    let (key, _) = uncommented.split_once('=')?;
    let key = key.trim();
    (!key.is_empty() && !key.contains(char::is_whitespace)).then_some(key)
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('#') || trimmed.starts_with(';')
}

/// Set `key=value`, rewriting the first existing line for `key` (even a
/// commented one) in place and dropping later active duplicates. Appends
/// when no line mentions the key. Returns the new content and whether it
/// differs from the input.
pub fn upsert_sysctl_line(content: &str, key: &str, value: &str) -> (String, bool) {
    let wanted = format!("{}={}", key, value);
    let is_active = |l: &str| !is_comment(l) && line_key(l) == Some(key);

    let active: Vec<&str> = content.lines().filter(|l| is_active(l)).collect();
    if active.len() == 1 && normalized(active[0]) == wanted {
        return (content.to_string(), false);
    }

    // an active assignment wins over a commented one
    let target = content
        .lines()
        .position(|l| is_active(l))
        .or_else(|| content.lines().position(|l| line_key(l) == Some(key)));

    let mut lines: Vec<String> = Vec::new();
    let mut replaced = false;
    for (index, line) in content.lines().enumerate() {
        if Some(index) == target {
            lines.push(wanted.clone());
            replaced = true;
        } else if replaced && is_active(line) {
            continue;
        } else {
            lines.push(line.to_string());
        }
    }
    if !replaced {
        lines.push(wanted);
    }

    let mut updated = lines.join("\n");
    updated.push('\n');
    (updated, true)
}

/// `key = value` with spaces removed around `=`
fn normalized(line: &str) -> String {
    match line.split_once('=') {
        Some((k, v)) => format!("{}={}", k.trim(), v.trim()),
        None => line.trim().to_string(),
    }
}
