//! Error type system for the extension host
//!
//! This module provides the error taxonomy shared by every layer:
//! - Registry and source loading failures
//! - Plugin contract violations detected at load time
//! - Execution failures raised inside the sandbox
//! - Bridge failures (timeouts, cancellation, a dead execution runtime)

use std::time::Duration;

use crate::plugin::protocol::{ErrorKind, RequestId};

/// Main error type for the extension host
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    // System-level errors
    #[error("Runtime initialization failed: {0}")]
    InitializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Registry and loader errors
    #[error("Manifest error: {0}")]
    ManifestError(String),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Source fetch failed for {id}: {message}")]
    SourceFetchError { id: String, message: String },

    // Sandbox errors
    #[error("Export contract violated: {0}")]
    ExportContractError(String),

    #[error("Method not found: {0}")]
    MethodNotFoundError(String),

    #[error("Plugin execution error: {message}")]
    ExecutionError {
        message: String,
        stack: Option<String>,
    },

    // Bridge errors
    #[error("Request {id} timed out after {after:?}")]
    BridgeTimeoutError { id: RequestId, after: Duration },

    #[error("Request {0} was cancelled")]
    Cancelled(RequestId),

    #[error("Bridge closed: {0}")]
    BridgeClosed(String),

    // Security-related errors
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // I/O errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl HostError {
    /// Rebuild a host error from the kind and message carried by an error response
    pub fn from_remote(kind: ErrorKind, message: String, stack: Option<String>) -> Self {
        match kind {
            ErrorKind::ExportContract => HostError::ExportContractError(message),
            ErrorKind::MethodNotFound => HostError::MethodNotFoundError(message),
            ErrorKind::Execution => HostError::ExecutionError { message, stack },
            ErrorKind::Runtime => HostError::BridgeClosed(message),
        }
    }

    /// Get the error type name used in logs and CLI output
    pub fn error_type(&self) -> &'static str {
        match self {
            HostError::InitializationError(_) => "InitializationError",
            HostError::ConfigError(_) => "ConfigError",
            HostError::ManifestError(_) => "ManifestError",
            HostError::PluginNotFound(_) => "PluginNotFound",
            HostError::SourceFetchError { .. } => "SourceFetchError",
            HostError::ExportContractError(_) => "ExportContractError",
            HostError::MethodNotFoundError(_) => "MethodNotFoundError",
            HostError::ExecutionError { .. } => "ExecutionError",
            HostError::BridgeTimeoutError { .. } => "BridgeTimeoutError",
            HostError::Cancelled(_) => "Cancelled",
            HostError::BridgeClosed(_) => "BridgeClosed",
            HostError::PermissionDenied(_) => "PermissionDenied",
            HostError::IoError(_) => "IoError",
            HostError::SerializationError(_) => "SerializationError",
        }
    }
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> Self {
        HostError::SerializationError(err.to_string())
    }
}

/// Result type alias for operations that can fail with HostError
pub type Result<T> = std::result::Result<T, HostError>;
