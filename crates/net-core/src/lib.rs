//! ztnet core
//!
//! Error taxonomy and the typed model shared by every ztnet crate: overlay
//! network identifiers, the desired gateway state, topologies, firewall
//! backends and the rules they carry.

pub mod error;
pub mod topology;
pub mod types;

pub use error::NetworkError;
pub use topology::{Topology, TopologyKind, TopologyNetwork};
pub use types::*;

/// Result type for ztnet operations
pub type Result<T> = std::result::Result<T, NetworkError>;
