//! ztnet CLI
//!
//! Command-line surface of the gateway reconciler: flag parsing, the log
//! bootstrap, terminal confirmation and exit codes. All host changes go
//! through the library crates.

pub mod commands;
pub mod context;
pub mod exit;
pub mod logging;

#[cfg(test)]
mod tests;
