//! Command descriptions and their captured results

use std::time::Duration;

use serde::{Deserialize, Serialize};

use ztnet_core::error::ExecutionError;
use ztnet_core::{NetworkError, Result};

/// Whether a command changes host state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Read-only probe, executed even in dry-run mode
    Query,
    /// Changes host state, simulated in dry-run mode
    Mutate,
}

/// A single external command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    pub kind: CommandKind,
}

impl CommandSpec {
    fn new(program: &str, kind: CommandKind) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdin: None,
            timeout: None,
            kind,
        }
    }

    /// Read-only command
    pub fn query(program: &str) -> Self {
        Self::new(program, CommandKind::Query)
    }

    /// State-changing command
    pub fn mutate(program: &str) -> Self {
        Self::new(program, CommandKind::Mutate)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_mutating(&self) -> bool {
        self.kind == CommandKind::Mutate
    }

    /// Program and arguments joined for logs and error messages
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Outcome of one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Command line that produced this result
    pub command: String,
    /// Exit code, `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// Set when the command was not executed because of dry-run mode
    pub simulated: bool,
}

impl RunResult {
    /// Synthetic success returned for a mutating command in dry-run mode
    pub fn simulated(command: &str) -> Self {
        Self {
            command: command.to_string(),
            status: Some(0),
            stdout: format!("[dry-run] would execute: {}", command),
            stderr: String::new(),
            duration: Duration::ZERO,
            simulated: true,
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turn a non-zero exit into an [`ExecutionError::NonZeroExit`]
    pub fn ensure_success(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(NetworkError::Execution(ExecutionError::NonZeroExit {
                command: self.command,
                code: self.status,
                stderr: self.stderr.trim().to_string(),
            }))
        }
    }
}
