//! Process exit codes

use log::error;
use ztnet_core::NetworkError;

pub const SUCCESS: i32 = 0;
/// Step failures, execution errors, timeouts and declined plans
pub const FAILURE: i32 = 1;
/// Bad configuration or failed validation
pub const INVALID: i32 = 2;
pub const PRIVILEGE: i32 = 3;

/// Exit code for an error, found by the first [`NetworkError`] in its chain
pub fn exit_code(err: &anyhow::Error) -> i32 {
    let network = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<NetworkError>());
    match network {
        Some(NetworkError::Config(_)) | Some(NetworkError::Validation(_)) => INVALID,
        Some(NetworkError::Privilege(_)) => PRIVILEGE,
        _ => FAILURE,
    }
}

/// Log a fatal error with its cause chain and pick the exit code.
///
/// The logger already tees to stderr, so this is the only place the error is
/// printed.
pub fn report_failure(err: &anyhow::Error) -> i32 {
    error!("{:#}", err);
    exit_code(err)
}
