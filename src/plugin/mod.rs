//! Plugin system module
//!
//! This module provides the plugin host implementation including:
//! - Manifest registry client and validated manifest model
//! - Source loader with an in-memory and on-disk cache
//! - Sandboxed JavaScript execution engine and its host bindings
//! - Request/response bridge to the execution runtime
//! - Plugin manager facade tying the pieces together

pub mod bindings;
pub mod bridge;
pub mod capability;
pub mod fetcher;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod sandbox;

#[cfg(test)]
mod test_support;

pub use bridge::{BridgeClient, BridgeState, CallOptions};
pub use capability::{Capabilities, CapabilityContext, HostServices, NestedPlugin, NetworkPolicy, SessionStore};
pub use fetcher::{FetchError, HttpFetcher, SourceFetcher};
pub use loader::SourceLoader;
pub use manager::{ManagerOptions, PluginManager};
pub use manifest::{ExtractorRef, Manifest, PluginCategory};
pub use protocol::{ErrorKind, ExecutePayload, HostMessage, RequestId, RuntimeMessage};
pub use registry::{ManifestRegistry, RegistryClient, RegistrySnapshot};
pub use sandbox::SandboxEngine;
