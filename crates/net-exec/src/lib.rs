//! ztnet exec
//!
//! Every external program ztnet touches (zerotier-cli, sysctl, the firewall
//! tools, package managers) is started through a [`CommandRunner`]. The
//! runner owns the dry-run decision, the per-call deadline and the
//! invocation log, so nothing else in the workspace spawns processes.

pub mod command;
pub mod runner;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;

pub use command::{CommandKind, CommandSpec, RunResult};
pub use runner::{CommandRunner, ExecMode, SystemRunner, DEFAULT_COMMAND_TIMEOUT};
#[cfg(any(test, feature = "test-util"))]
pub use scripted::ScriptedRunner;
