//! Extension Host Library
//!
//! Loads community-authored JavaScript plugins described by a remote
//! registry and runs their methods inside an isolated execution runtime.

pub mod core;
pub mod plugin;

// Re-export commonly used types
pub use crate::core::{Config, HostError, Logger};
pub use plugin::{CallOptions, Manifest, PluginManager};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias for the library
pub type Result<T> = anyhow::Result<T>;
