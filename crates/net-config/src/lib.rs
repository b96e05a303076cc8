//! ztnet configuration
//!
//! Line-oriented `KEY=VALUE` documents: the gateway's desired state,
//! repeated `network=` lines for topologies, and the tool settings (paths,
//! timeouts, alert targets).

pub mod loader;
pub mod parser;
pub mod settings;

pub use loader::{ConfigLoader, Overrides, DEFAULT_CONFIG_PATH};
pub use parser::ConfigDocument;
pub use settings::{HostPaths, ToolSettings};
