//! Rollback command

use std::sync::Arc;

use anyhow::{Context, Result};
use ztnet_apply::BackupManager;
use ztnet_validate::require_root;

use crate::context::AppContext;

/// List snapshots or restore one
pub struct RollbackCommand {
    context: Arc<AppContext>,
}

impl RollbackCommand {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    fn backups(&self) -> BackupManager {
        BackupManager::new(self.context.apply.clone())
    }

    /// Restore `snapshot`, or the newest one
    pub async fn execute(&self, snapshot: Option<&str>) -> Result<()> {
        if !self.context.is_dry_run() {
            require_root(self.context.root_probe, "restoring a snapshot")?;
        }

        let backups = self.backups();
        let snapshot = match snapshot {
            Some(id) => backups.load(id).await?,
            None => backups.latest().await?.with_context(|| {
                format!("No snapshots found in {}", backups.root().display())
            })?,
        };

        let plan = format!(
            "Restore snapshot {} from {} ({} files, {} backend)",
            snapshot.id,
            snapshot.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            snapshot.files.len(),
            snapshot.backend
        );
        if !self.context.confirmation().confirm(&plan) {
            anyhow::bail!("Restore of snapshot {} was declined", snapshot.id);
        }

        backups
            .restore(&snapshot)
            .await
            .with_context(|| format!("Failed to restore snapshot {}", snapshot.id))?;
        println!(
            "✓ Restored snapshot {}{}",
            snapshot.id,
            if self.context.is_dry_run() {
                " (dry run)"
            } else {
                ""
            }
        );
        Ok(())
    }

    pub async fn list(&self) -> Result<()> {
        let snapshots = self.backups().list().await?;
        if snapshots.is_empty() {
            println!("No snapshots available.");
            return Ok(());
        }

        println!(
            "{:<28} {:<20} {:<10} {:<18} {}",
            "Snapshot", "Created", "Backend", "Network", "Files"
        );
        println!("{}", "-".repeat(86));
        for snapshot in snapshots {
            println!(
                "{:<28} {:<20} {:<10} {:<18} {}",
                snapshot.id,
                snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
                snapshot.backend.as_str(),
                snapshot
                    .network_id
                    .as_ref()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                snapshot.files.len()
            );
        }
        Ok(())
    }
}
