//! Process execution with deadlines and dry-run interception

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use ztnet_core::error::{ExecutionError, TimeoutError};
use ztnet_core::{NetworkError, Result};

use crate::command::{CommandSpec, RunResult};

/// Default deadline applied to every external command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

const LOG_TARGET: &str = "ztnet::exec";

/// Execution mode threaded through every call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Live,
    DryRun,
}

/// Runs external commands and writes host files.
///
/// In [`ExecMode::DryRun`] mutating commands and file writes are logged and
/// skipped; read-only queries still run.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    fn mode(&self) -> ExecMode;

    async fn run(&self, spec: &CommandSpec) -> Result<RunResult>;

    /// Write `contents` to `path`, creating parent directories
    async fn write_file(&self, path: &Path, contents: &str) -> Result<()>;

    /// Delete `path`; a file that is already gone is not an error
    async fn remove_file(&self, path: &Path) -> Result<()>;

    fn is_dry_run(&self) -> bool {
        self.mode() == ExecMode::DryRun
    }
}

/// [`CommandRunner`] backed by real processes
pub struct SystemRunner {
    mode: ExecMode,
    default_timeout: Duration,
}

impl SystemRunner {
    pub fn new(mode: ExecMode) -> Self {
        Self {
            mode,
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mode: ExecMode, default_timeout: Duration) -> Self {
        Self {
            mode,
            default_timeout,
        }
    }

    async fn execute(&self, spec: &CommandSpec, command_line: &str) -> Result<RunResult> {
        let deadline = spec.timeout.unwrap_or(self.default_timeout);
        let start_time = Instant::now();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if spec.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        debug!(target: LOG_TARGET, "executing: {}", command_line);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NetworkError::Execution(ExecutionError::NotFound {
                    program: spec.program.clone(),
                })
            } else {
                NetworkError::Execution(ExecutionError::Spawn {
                    program: spec.program.clone(),
                    reason: e.to_string(),
                })
            }
        })?;

        // the stdin write shares the deadline with the wait
        let pipe = child.stdin.take();
        let completion = async move {
            if let (Some(input), Some(mut pipe)) = (&spec.stdin, pipe) {
                pipe.write_all(input.as_bytes()).await?;
                // closing stdin lets the child see EOF
                drop(pipe);
            }
            child.wait_with_output().await
        };

        let output = match timeout(deadline, completion).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(target: LOG_TARGET, "{} failed to execute: {}", command_line, e);
                return Err(NetworkError::Execution(ExecutionError::Spawn {
                    program: spec.program.clone(),
                    reason: e.to_string(),
                }));
            }
            Err(_) => {
                error!(target: LOG_TARGET, "{} timed out after {:?}", command_line, deadline);
                return Err(NetworkError::Timeout(TimeoutError {
                    command: command_line.to_string(),
                    deadline,
                }));
            }
        };

        let duration = start_time.elapsed();
        let result = RunResult {
            command: command_line.to_string(),
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration,
            simulated: false,
        };

        if result.success() {
            info!(
                target: LOG_TARGET,
                "exec '{}' -> 0 in {}ms",
                command_line,
                duration.as_millis()
            );
        } else {
            warn!(
                target: LOG_TARGET,
                "exec '{}' -> {:?} in {}ms: {}",
                command_line,
                result.status,
                duration.as_millis(),
                result.stderr.trim()
            );
        }

        Ok(result)
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(ExecMode::Live)
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    fn mode(&self) -> ExecMode {
        self.mode
    }

    async fn run(&self, spec: &CommandSpec) -> Result<RunResult> {
        let command_line = spec.command_line();

        if self.mode == ExecMode::DryRun && spec.is_mutating() {
            info!(target: LOG_TARGET, "[dry-run] would execute: {}", command_line);
            return Ok(RunResult::simulated(&command_line));
        }

        self.execute(spec, &command_line).await
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        if self.mode == ExecMode::DryRun {
            info!(
                target: LOG_TARGET,
                "[dry-run] would write {} bytes to {}",
                contents.len(),
                path.display()
            );
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, contents).await.map_err(|e| {
            NetworkError::Execution(ExecutionError::FileOperation {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        })?;

        info!(
            target: LOG_TARGET,
            "wrote {} bytes to {}",
            contents.len(),
            path.display()
        );
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        if self.mode == ExecMode::DryRun {
            info!(target: LOG_TARGET, "[dry-run] would remove {}", path.display());
            return Ok(());
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(target: LOG_TARGET, "removed {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(target: LOG_TARGET, "{} already absent", path.display());
                Ok(())
            }
            Err(e) => Err(NetworkError::Execution(ExecutionError::FileOperation {
                path: path.display().to_string(),
                reason: e.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_binary_is_not_found() {
        let runner = SystemRunner::default();
        let err = runner
            .run(&CommandSpec::query("ztnet-definitely-missing-binary"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Execution(ExecutionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_captures_output_and_status() {
        let runner = SystemRunner::default();
        let result = runner
            .run(&CommandSpec::query("sh").args(["-c", "echo hello; exit 3"]))
            .await
            .unwrap();
        assert_eq!(result.status, Some(3));
        assert_eq!(result.stdout.trim(), "hello");
        assert!(!result.simulated);
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let runner = SystemRunner::default();
        let result = runner
            .run(&CommandSpec::query("cat").stdin("line one\n"))
            .await
            .unwrap();
        assert_eq!(result.stdout, "line one\n");
    }

    #[tokio::test]
    async fn test_deadline_produces_timeout() {
        let runner = SystemRunner::default();
        let err = runner
            .run(&CommandSpec::query("sleep").arg("5").timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_undrained_stdin_is_bounded_by_deadline() {
        let runner = SystemRunner::default();
        // far beyond a pipe buffer, and the child never reads it
        let input = "x".repeat(4 * 1024 * 1024);
        let err = runner
            .run(
                &CommandSpec::mutate("sleep")
                    .arg("5")
                    .stdin(input)
                    .timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_dry_run_skips_mutations_and_writes() {
        let temp_dir = TempDir::new().unwrap();
        let marker = temp_dir.path().join("marker");
        let runner = SystemRunner::new(ExecMode::DryRun);

        let result = runner
            .run(&CommandSpec::mutate("touch").arg(marker.to_str().unwrap()))
            .await
            .unwrap();
        assert!(result.simulated);
        assert!(result.success());
        assert!(!marker.exists());

        runner.write_file(&marker, "data").await.unwrap();
        assert!(!marker.exists());

        let existing = temp_dir.path().join("existing");
        std::fs::write(&existing, "keep").unwrap();
        runner.remove_file(&existing).await.unwrap();
        assert!(existing.exists());

        // queries still run for real
        let query = runner
            .run(&CommandSpec::query("sh").args(["-c", "echo probe"]))
            .await
            .unwrap();
        assert!(!query.simulated);
        assert_eq!(query.stdout.trim(), "probe");
    }

    #[tokio::test]
    async fn test_remove_file_tolerates_missing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rules.v4");
        std::fs::write(&path, "*nat\nCOMMIT\n").unwrap();
        let runner = SystemRunner::default();

        runner.remove_file(&path).await.unwrap();
        assert!(!path.exists());
        runner.remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_file_creates_parents() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/dir/file.conf");
        let runner = SystemRunner::default();
        runner.write_file(&path, "net.ipv4.ip_forward=1\n").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "net.ipv4.ip_forward=1\n"
        );
    }
}
