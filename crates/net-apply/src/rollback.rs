//! Snapshots of gateway state and restore from them

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use ztnet_core::error::{BackupError, ExecutionError};
use ztnet_core::{Backend, NetworkError, NetworkId, Result};
use ztnet_exec::CommandSpec;

use crate::backend::{backend_for, FirewallBackend, RuleDump};
use crate::context::ApplyContext;

/// Manifest file inside every snapshot directory
pub const MANIFEST: &str = "snapshot.json";

const SNAPSHOT_PREFIX: &str = "ztnet-";
const FILES_DIR: &str = "files";
const DUMPS_DIR: &str = "dumps";

/// Copy of one host file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    /// Where the file lives on the host
    pub original_path: PathBuf,
    /// Copy name under `files/`
    pub backup_name: String,
    /// md5 of the copied bytes
    pub checksum: String,
    pub size: u64,
}

/// Backend rule dump stored under `dumps/`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpFile {
    pub name: String,
    pub checksum: String,
}

/// Snapshot manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Directory name, `ztnet-YYYYmmdd-HHMMSS[-n]`
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Backend active when the snapshot was taken
    pub backend: Backend,
    pub network_id: Option<NetworkId>,
    pub files: Vec<BackupFile>,
    /// Captured paths that did not exist yet; restore deletes them
    #[serde(default)]
    pub absent: Vec<PathBuf>,
    pub dumps: Vec<DumpFile>,
    #[serde(skip)]
    pub location: PathBuf,
}

impl Snapshot {
    fn file_path(&self, file: &BackupFile) -> PathBuf {
        self.location.join(FILES_DIR).join(&file.backup_name)
    }

    fn dump_path(&self, dump: &DumpFile) -> PathBuf {
        self.location.join(DUMPS_DIR).join(&dump.name)
    }
}

fn checksum(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

fn restore_failed(path: &Path, reason: impl ToString) -> NetworkError {
    NetworkError::Backup(BackupError::RestoreFailed {
        path: path.display().to_string(),
        reason: reason.to_string(),
    })
}

/// Creates, lists and restores snapshots under the backup root
pub struct BackupManager {
    ctx: ApplyContext,
    root: PathBuf,
}

impl BackupManager {
    pub fn new(ctx: ApplyContext) -> Self {
        let root = ctx.backup_root().to_path_buf();
        Self { ctx, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Capture the sysctl file, `backend`'s persistent rule files and its
    /// live rule set. Files missing on the host are recorded as absent.
    pub async fn snapshot(
        &self,
        backend: &dyn FirewallBackend,
        network_id: Option<&NetworkId>,
    ) -> Result<Snapshot> {
        let mut sources = vec![self.ctx.paths().sysctl_conf.clone()];
        sources.extend(backend.persistent_files());
        sources.dedup();

        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        if self.ctx.is_dry_run() {
            let location = self.root.join(format!("{}{}", SNAPSHOT_PREFIX, stamp));
            info!(
                "[dry-run] would snapshot {} files and the {} rules to {}",
                sources.iter().filter(|p| p.exists()).count(),
                backend.kind(),
                location.display()
            );
            return Ok(Snapshot {
                id: format!("{}{}", SNAPSHOT_PREFIX, stamp),
                created_at: Utc::now(),
                backend: backend.kind(),
                network_id: network_id.cloned(),
                files: Vec::new(),
                absent: Vec::new(),
                dumps: Vec::new(),
                location,
            });
        }

        let (id, location) = self.create_directory(&stamp).await?;
        fs::create_dir_all(location.join(FILES_DIR)).await?;
        fs::create_dir_all(location.join(DUMPS_DIR)).await?;

        let mut files = Vec::new();
        let mut absent = Vec::new();
        for (index, source) in sources.iter().enumerate() {
            match self.copy_file(source, &location, index).await {
                Ok(Some(file)) => files.push(file),
                Ok(None) => {
                    debug!("{} does not exist, recorded as absent", source.display());
                    absent.push(source.clone());
                }
                Err(e) => {
                    error!("Failed to back up {}: {}", source.display(), e);
                    return Err(e);
                }
            }
        }

        let mut dumps = Vec::new();
        for dump in backend.dump().await? {
            fs::write(location.join(DUMPS_DIR).join(&dump.name), &dump.contents).await?;
            dumps.push(DumpFile {
                checksum: checksum(dump.contents.as_bytes()),
                name: dump.name,
            });
        }

        let snapshot = Snapshot {
            id,
            created_at: Utc::now(),
            backend: backend.kind(),
            network_id: network_id.cloned(),
            files,
            absent,
            dumps,
            location,
        };
        let manifest = serde_json::to_string_pretty(&snapshot)?;
        fs::write(snapshot.location.join(MANIFEST), manifest).await?;

        info!(
            "Created snapshot {} ({} files, {} rule dumps)",
            snapshot.location.display(),
            snapshot.files.len(),
            snapshot.dumps.len()
        );
        Ok(snapshot)
    }

    /// Fresh directory, suffixed `-n` when the timestamp is taken
    async fn create_directory(&self, stamp: &str) -> Result<(String, PathBuf)> {
        fs::create_dir_all(&self.root).await?;
        let mut attempt = 0;
        loop {
            let id = match attempt {
                0 => format!("{}{}", SNAPSHOT_PREFIX, stamp),
                n => format!("{}{}-{}", SNAPSHOT_PREFIX, stamp, n),
            };
            let location = self.root.join(&id);
            match fs::create_dir(&location).await {
                Ok(()) => return Ok((id, location)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn copy_file(
        &self,
        source: &Path,
        location: &Path,
        index: usize,
    ) -> Result<Option<BackupFile>> {
        let content = match fs::read(source).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file");
        let backup_name = format!("{:02}-{}", index, file_name);
        fs::write(location.join(FILES_DIR).join(&backup_name), &content).await?;

        Ok(Some(BackupFile {
            original_path: source.to_path_buf(),
            backup_name,
            checksum: checksum(&content),
            size: content.len() as u64,
        }))
    }

    /// Snapshots newest first; unreadable manifests are skipped with a warning
    pub async fn list(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(SNAPSHOT_PREFIX) || !entry.path().join(MANIFEST).exists() {
                continue;
            }
            match self.load(&name).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!("Ignoring snapshot {}: {}", name, e),
            }
        }

        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(snapshots)
    }

    pub async fn latest(&self) -> Result<Option<Snapshot>> {
        Ok(self.list().await?.into_iter().next())
    }

    pub async fn load(&self, id: &str) -> Result<Snapshot> {
        let not_found = || {
            NetworkError::Backup(BackupError::NotFound {
                id: id.to_string(),
            })
        };
        if id.is_empty() || id.contains('/') || id.contains("..") {
            return Err(not_found());
        }

        let location = self.root.join(id);
        let content = match fs::read_to_string(location.join(MANIFEST)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        let mut snapshot: Snapshot = serde_json::from_str(&content)?;
        snapshot.location = location;
        Ok(snapshot)
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let snapshot = self.load(id).await?;
        if self.ctx.is_dry_run() {
            info!("[dry-run] would remove snapshot {}", snapshot.location.display());
            return Ok(());
        }
        fs::remove_dir_all(&snapshot.location).await?;
        info!("Removed snapshot {}", snapshot.id);
        Ok(())
    }

    /// Put the captured files back, delete the ones that did not exist at
    /// snapshot time and reload the snapshot's backend.
    ///
    /// Every checksum is verified before the first file is touched.
    pub async fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        info!("Restoring snapshot {}", snapshot.id);

        let mut contents = Vec::with_capacity(snapshot.files.len());
        for file in &snapshot.files {
            let path = snapshot.file_path(file);
            let bytes = fs::read(&path)
                .await
                .map_err(|e| restore_failed(&path, e))?;
            if checksum(&bytes) != file.checksum {
                error!("Checksum mismatch for {}", path.display());
                return Err(NetworkError::Backup(BackupError::ChecksumMismatch {
                    path: path.display().to_string(),
                }));
            }
            let text = String::from_utf8(bytes).map_err(|e| restore_failed(&path, e))?;
            contents.push((file, text));
        }

        let mut dumps = Vec::with_capacity(snapshot.dumps.len());
        for dump in &snapshot.dumps {
            let path = snapshot.dump_path(dump);
            let text = fs::read_to_string(&path)
                .await
                .map_err(|e| restore_failed(&path, e))?;
            if checksum(text.as_bytes()) != dump.checksum {
                error!("Checksum mismatch for {}", path.display());
                return Err(NetworkError::Backup(BackupError::ChecksumMismatch {
                    path: path.display().to_string(),
                }));
            }
            dumps.push(RuleDump {
                name: dump.name.clone(),
                contents: text,
            });
        }

        for (file, text) in &contents {
            self.ctx
                .runner()
                .write_file(&file.original_path, text)
                .await
                .map_err(|e| {
                    error!("Failed to restore {}: {}", file.original_path.display(), e);
                    e
                })?;
            debug!("Restored {}", file.original_path.display());
        }

        for path in &snapshot.absent {
            self.ctx.runner().remove_file(path).await.map_err(|e| {
                error!("Failed to remove {}: {}", path.display(), e);
                e
            })?;
            debug!("Removed {}, absent at snapshot time", path.display());
        }

        let backend = backend_for(snapshot.backend, &self.ctx);
        backend.reload(&dumps).await.map_err(|e| {
            error!("Failed to reload {} after restore: {}", snapshot.backend, e);
            e
        })?;

        let sysctl_conf = &self.ctx.paths().sysctl_conf;
        if contents.iter().any(|(f, _)| &f.original_path == sysctl_conf) {
            self.reload_sysctl(sysctl_conf).await?;
        }

        info!("Restored snapshot {}", snapshot.id);
        Ok(())
    }

    async fn reload_sysctl(&self, path: &Path) -> Result<()> {
        let path_arg = path.to_str().ok_or_else(|| {
            NetworkError::Execution(ExecutionError::FileOperation {
                path: path.display().to_string(),
                reason: "path is not valid UTF-8".to_string(),
            })
        })?;
        self.ctx
            .runner()
            .run(&CommandSpec::mutate("sysctl").args(["-p", path_arg]))
            .await?
            .ensure_success()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use ztnet_config::{HostPaths, ToolSettings};
    use ztnet_exec::ScriptedRunner;

    use crate::backend::IptablesBackend;

    fn context(runner: Arc<ScriptedRunner>, root: &Path) -> ApplyContext {
        let settings = ToolSettings {
            backup_root: root.join("backups"),
            paths: HostPaths::under(root),
            ..Default::default()
        };
        ApplyContext::new(runner, settings)
    }

    fn seed_host(root: &Path) {
        std::fs::create_dir_all(root.join("etc/iptables")).unwrap();
        std::fs::write(root.join("etc/sysctl.conf"), "#net.ipv4.ip_forward=1\n").unwrap();
        std::fs::write(root.join("etc/iptables/rules.v4"), "*filter\nCOMMIT\n").unwrap();
    }

    fn scripted() -> Arc<ScriptedRunner> {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("iptables-save", 0, "*nat\nCOMMIT\n");
        runner.on("iptables-restore", 0, "");
        runner.on("sysctl -p", 0, "");
        runner
    }

    #[tokio::test]
    async fn test_snapshot_and_list() {
        let temp_dir = TempDir::new().unwrap();
        seed_host(temp_dir.path());
        let ctx = context(scripted(), temp_dir.path());
        let backend = IptablesBackend::new(ctx.clone());
        let manager = BackupManager::new(ctx);

        let id: NetworkId = "a1b2c3d4e5f6a7b8".parse().unwrap();
        let first = manager.snapshot(&backend, Some(&id)).await.unwrap();
        let second = manager.snapshot(&backend, None).await.unwrap();

        assert_ne!(first.id, second.id);
        assert!(first.id.starts_with("ztnet-"));
        // rules.v6 does not exist on this host
        assert_eq!(first.files.len(), 2);
        assert_eq!(
            first.absent,
            vec![temp_dir.path().join("etc/iptables/rules.v6")]
        );
        assert_eq!(first.dumps.len(), 1);
        assert!(first.location.join(MANIFEST).exists());

        let listed = manager.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(manager.latest().await.unwrap().unwrap().id, second.id);
        assert_eq!(manager.load(&first.id).await.unwrap().network_id, Some(id));
    }

    #[tokio::test]
    async fn test_restore_rewrites_files_and_reloads() {
        let temp_dir = TempDir::new().unwrap();
        seed_host(temp_dir.path());
        let runner = scripted();
        let ctx = context(runner.clone(), temp_dir.path());
        let backend = IptablesBackend::new(ctx.clone());
        let manager = BackupManager::new(ctx);

        let snapshot = manager.snapshot(&backend, None).await.unwrap();
        let sysctl = temp_dir.path().join("etc/sysctl.conf");
        std::fs::write(&sysctl, "net.ipv4.ip_forward=1\n").unwrap();

        manager.restore(&snapshot).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&sysctl).unwrap(),
            "#net.ipv4.ip_forward=1\n"
        );
        let mutations = runner.executed_mutations();
        assert!(mutations.contains(&"iptables-restore".to_string()));
        assert!(mutations.iter().any(|m| m.starts_with("sysctl -p")));
    }

    #[tokio::test]
    async fn test_restore_removes_files_created_after_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        seed_host(temp_dir.path());
        let runner = scripted();
        let ctx = context(runner.clone(), temp_dir.path());
        let backend = IptablesBackend::new(ctx.clone());
        let manager = BackupManager::new(ctx);

        let snapshot = manager.snapshot(&backend, None).await.unwrap();
        let rules_v6 = temp_dir.path().join("etc/iptables/rules.v6");
        std::fs::write(&rules_v6, "*filter\n-A FORWARD -i zt0 -o eth0 -j ACCEPT\nCOMMIT\n").unwrap();

        let reloaded = manager.load(&snapshot.id).await.unwrap();
        manager.restore(&reloaded).await.unwrap();
        assert!(!rules_v6.exists());
        assert_eq!(runner.removals(), vec![rules_v6]);
        assert!(temp_dir.path().join("etc/iptables/rules.v4").exists());
    }

    #[tokio::test]
    async fn test_corrupted_copy_is_rejected_before_writing() {
        let temp_dir = TempDir::new().unwrap();
        seed_host(temp_dir.path());
        let runner = scripted();
        let ctx = context(runner.clone(), temp_dir.path());
        let backend = IptablesBackend::new(ctx.clone());
        let manager = BackupManager::new(ctx);

        let snapshot = manager.snapshot(&backend, None).await.unwrap();
        let copy = snapshot.file_path(&snapshot.files[1]);
        std::fs::write(&copy, "tampered\n").unwrap();

        let err = manager.restore(&snapshot).await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Backup(BackupError::ChecksumMismatch { .. })
        ));
        assert!(runner.writes().is_empty());
        assert!(runner.removals().is_empty());
        assert!(runner.executed_mutations().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        seed_host(temp_dir.path());
        let ctx = context(Arc::new(ScriptedRunner::dry_run()), temp_dir.path());
        let backend = IptablesBackend::new(ctx.clone());
        let manager = BackupManager::new(ctx);

        let snapshot = manager.snapshot(&backend, None).await.unwrap();
        assert!(!snapshot.location.exists());
        assert!(manager.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_and_removed_snapshots() {
        let temp_dir = TempDir::new().unwrap();
        seed_host(temp_dir.path());
        let ctx = context(scripted(), temp_dir.path());
        let backend = IptablesBackend::new(ctx.clone());
        let manager = BackupManager::new(ctx);

        assert!(matches!(
            manager.load("ztnet-19700101-000000").await,
            Err(NetworkError::Backup(BackupError::NotFound { .. }))
        ));
        assert!(manager.load("../etc").await.is_err());

        let snapshot = manager.snapshot(&backend, None).await.unwrap();
        manager.remove(&snapshot.id).await.unwrap();
        assert!(manager.list().await.unwrap().is_empty());
    }
}
