//! Bridge message schema
//!
//! Envelopes exchanged between the host and the execution runtime. Requests are
//! `{type, id, payload}`; responses are `{type, id, success, result?, error?}`.
//! Lifecycle events (`ready`, an `error` without `id`) carry no correlation id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::capability::CapabilityContext;
use crate::core::error::{HostError, Result};

/// Correlation id of an in-flight request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which stage of the sandbox contract failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Factory export missing, not callable, or the instance breaks its category contract
    ExportContract,
    /// Requested method absent on the instance; nothing was invoked
    MethodNotFound,
    /// Plugin code threw or rejected
    Execution,
    /// The execution runtime itself failed
    Runtime,
}

/// Body of an `execute` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayload {
    /// Plugin source text to evaluate
    pub source_text: String,
    /// Name of the exported factory
    pub factory_name: String,
    /// Method to invoke on the instance the factory returns
    pub method_name: String,
    /// Positional arguments for the method
    #[serde(default)]
    pub args: Vec<Value>,
    /// Capabilities granted for this call
    pub context: CapabilityContext,
    /// Methods the instance must expose before anything is invoked
    #[serde(default)]
    pub required_methods: Vec<MethodContract>,
}

/// A method a plugin instance must expose
///
/// `max_arity` is the most arguments the host ever passes; a method declaring
/// more leading parameters would be called with some of them `undefined`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodContract {
    pub name: String,
    pub max_arity: u32,
}

impl MethodContract {
    pub fn new(name: impl Into<String>, max_arity: u32) -> Self {
        Self {
            name: name.into(),
            max_arity,
        }
    }
}

/// Messages sent from the host to the execution runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    Execute { id: RequestId, payload: ExecutePayload },
    Ping { id: RequestId },
    /// The host stopped waiting; the runtime drops the eventual result
    Cancel { id: RequestId },
}

impl HostMessage {
    pub fn id(&self) -> RequestId {
        match self {
            HostMessage::Execute { id, .. } | HostMessage::Ping { id } | HostMessage::Cancel { id } => *id,
        }
    }
}

/// Messages sent from the execution runtime to the host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuntimeMessage {
    /// Emitted once after the runtime finished its own initialization
    Ready,
    ExecuteResult {
        id: RequestId,
        success: bool,
        result: Value,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        success: bool,
        error: String,
        #[serde(rename = "errorKind")]
        error_kind: ErrorKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    Pong { id: RequestId },
}

impl RuntimeMessage {
    pub fn success(id: RequestId, result: Value) -> Self {
        RuntimeMessage::ExecuteResult {
            id,
            success: true,
            result,
        }
    }

    pub fn failure(id: RequestId, kind: ErrorKind, error: String, stack: Option<String>) -> Self {
        RuntimeMessage::Error {
            id: Some(id),
            success: false,
            error,
            error_kind: kind,
            stack,
        }
    }

    /// Lifecycle failure with no correlation id
    pub fn fatal(error: String) -> Self {
        RuntimeMessage::Error {
            id: None,
            success: false,
            error,
            error_kind: ErrorKind::Runtime,
            stack: None,
        }
    }

    /// The request this message answers, if any
    pub fn correlation_id(&self) -> Option<RequestId> {
        match self {
            RuntimeMessage::Ready => None,
            RuntimeMessage::ExecuteResult { id, .. } | RuntimeMessage::Pong { id } => Some(*id),
            RuntimeMessage::Error { id, .. } => *id,
        }
    }

    /// Unwrap a response into the value the caller awaits
    pub fn into_result(self) -> Result<Value> {
        match self {
            RuntimeMessage::ExecuteResult { result, .. } => Ok(result),
            RuntimeMessage::Pong { .. } => Ok(Value::Null),
            RuntimeMessage::Error {
                error,
                error_kind,
                stack,
                ..
            } => Err(HostError::from_remote(error_kind, error, stack)),
            RuntimeMessage::Ready => Err(HostError::BridgeClosed(
                "lifecycle event delivered as a response".to_string(),
            )),
        }
    }
}
