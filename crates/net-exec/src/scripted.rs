//! Canned-response runner for tests

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use ztnet_core::error::{ExecutionError, TimeoutError};
use ztnet_core::{NetworkError, Result};

use crate::command::{CommandKind, CommandSpec, RunResult};
use crate::runner::{CommandRunner, ExecMode};

#[derive(Debug, Clone)]
enum Scripted {
    Reply { status: i32, stdout: String },
    Missing,
    Hang,
}

/// A call seen by [`ScriptedRunner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub command: String,
    pub kind: CommandKind,
    pub stdin: Option<String>,
    pub simulated: bool,
}

/// Runner answering commands from prefix-matched scripts.
///
/// The most recently registered matching prefix wins. Unmatched commands
/// behave like a missing binary. Dry-run semantics match [`SystemRunner`].
///
/// [`SystemRunner`]: crate::SystemRunner
pub struct ScriptedRunner {
    mode: ExecMode,
    scripts: Mutex<Vec<(String, Scripted)>>,
    calls: Mutex<Vec<RecordedCall>>,
    writes: Mutex<Vec<PathBuf>>,
    removals: Mutex<Vec<PathBuf>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::with_mode(ExecMode::Live)
    }

    pub fn dry_run() -> Self {
        Self::with_mode(ExecMode::DryRun)
    }

    pub fn with_mode(mode: ExecMode) -> Self {
        Self {
            mode,
            scripts: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            removals: Mutex::new(Vec::new()),
        }
    }

    /// Answer commands starting with `prefix` with `status` and `stdout`
    pub fn on(&self, prefix: &str, status: i32, stdout: &str) -> &Self {
        self.push(
            prefix,
            Scripted::Reply {
                status,
                stdout: stdout.to_string(),
            },
        )
    }

    /// Treat commands starting with `prefix` as a missing binary
    pub fn on_missing(&self, prefix: &str) -> &Self {
        self.push(prefix, Scripted::Missing)
    }

    /// Make commands starting with `prefix` exceed their deadline
    pub fn on_timeout(&self, prefix: &str) -> &Self {
        self.push(prefix, Scripted::Hang)
    }

    fn push(&self, prefix: &str, scripted: Scripted) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .push((prefix.to_string(), scripted));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }

    /// Mutating commands that were actually executed
    pub fn executed_mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.kind == CommandKind::Mutate && !c.simulated)
            .map(|c| c.command)
            .collect()
    }

    pub fn writes(&self) -> Vec<PathBuf> {
        self.writes.lock().unwrap().clone()
    }

    /// Files deleted outside dry run
    pub fn removals(&self) -> Vec<PathBuf> {
        self.removals.lock().unwrap().clone()
    }
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    fn mode(&self) -> ExecMode {
        self.mode
    }

    async fn run(&self, spec: &CommandSpec) -> Result<RunResult> {
        let command_line = spec.command_line();
        let simulated = self.mode == ExecMode::DryRun && spec.is_mutating();
        self.calls.lock().unwrap().push(RecordedCall {
            command: command_line.clone(),
            kind: spec.kind,
            stdin: spec.stdin.clone(),
            simulated,
        });

        if simulated {
            return Ok(RunResult::simulated(&command_line));
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(prefix, _)| command_line.starts_with(prefix.as_str()))
            .map(|(_, scripted)| scripted.clone());

        match scripted {
            Some(Scripted::Reply { status, stdout }) => Ok(RunResult {
                command: command_line,
                status: Some(status),
                stdout,
                stderr: String::new(),
                duration: Duration::ZERO,
                simulated: false,
            }),
            Some(Scripted::Hang) => Err(NetworkError::Timeout(TimeoutError {
                command: command_line,
                deadline: spec.timeout.unwrap_or(Duration::from_secs(60)),
            })),
            Some(Scripted::Missing) | None => {
                Err(NetworkError::Execution(ExecutionError::NotFound {
                    program: spec.program.clone(),
                }))
            }
        }
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        if self.mode == ExecMode::DryRun {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        self.writes.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        if self.mode == ExecMode::DryRun {
            return Ok(());
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.removals.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latest_script_wins() {
        let runner = ScriptedRunner::new();
        runner.on("ufw status", 0, "Status: inactive");
        runner.on("ufw status", 0, "Status: active");

        let result = runner.run(&CommandSpec::query("ufw").arg("status")).await.unwrap();
        assert_eq!(result.stdout, "Status: active");
    }

    #[tokio::test]
    async fn test_unmatched_is_missing_binary() {
        let runner = ScriptedRunner::new();
        let err = runner.run(&CommandSpec::query("nft")).await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Execution(ExecutionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_dry_run_records_simulated_mutations() {
        let runner = ScriptedRunner::dry_run();
        runner
            .run(&CommandSpec::mutate("zerotier-cli").args(["join", "a1b2c3d4e5f6a7b8"]))
            .await
            .unwrap();
        assert_eq!(runner.calls().len(), 1);
        assert!(runner.executed_mutations().is_empty());
    }
}
