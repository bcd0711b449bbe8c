//! Error types for Flowgate.
//!
//! All errors are represented by the `FlowgateError` enum. The gateway-facing
//! variants mirror the failure classes external systems report; the graph and
//! session variants cover pipeline validation and tool dispatch.

use std::{io::ErrorKind, string::FromUtf8Error};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all Flowgate operations.
#[derive(Deserialize, Serialize, Error, Debug, Clone, PartialEq)]
pub enum FlowgateError {
    /// Input rejected before any external call was made.
    #[error("validation: {0}")]
    Validation(String),

    /// The external system rejected the caller's credentials.
    #[error("authentication: {0}")]
    Authentication(String),

    /// The addressed system, resource, action, or entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The external system throttled the call.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// Retry-after hint in seconds, when the upstream supplied one.
        retry_after: Option<u64>,
    },

    /// An external call exceeded its time budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The external system reported a failure.
    #[error("remote error (status {status}): {message}")]
    Remote {
        status: u16,
        message: String,
    },

    /// A template reference could not be resolved against the context.
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    /// The step reference graph contains a cycle. Always fatal, detected
    /// before any step runs.
    #[error("cycle: {0}")]
    Cycle(String),

    /// A step required output from a step that branching skipped.
    #[error("skipped dependency: {0}")]
    SkippedDependency(String),

    /// The session's permission mode does not allow the requested tool.
    #[error("permission: {0}")]
    Permission(String),

    /// Engine-level errors (startup, shutdown, lifecycle).
    #[error("{0}")]
    Engine(String),

    /// Configuration parsing or validation errors.
    #[error("{0}")]
    Config(String),

    /// Data conversion errors.
    #[error("{0}")]
    Convert(String),

    /// Embedded script execution errors.
    #[error("{0}")]
    Script(String),

    /// Pipeline definition errors.
    #[error("{0}")]
    Pipeline(String),

    /// Step definition or execution errors.
    #[error("{0}")]
    Step(String),

    /// Runtime execution errors.
    #[error("{0}")]
    Runtime(String),

    /// Storage operation errors.
    #[error("{0}")]
    Store(String),

    /// Message queue errors.
    #[error("{0}")]
    Queue(String),

    /// I/O operation errors.
    #[error("{0}")]
    IoError(String),
}

impl FlowgateError {
    /// Whether the error class is worth retrying under a retry policy.
    /// Validation, permission, and graph errors never succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlowgateError::RateLimited { .. } | FlowgateError::Timeout(_) | FlowgateError::Remote { .. } | FlowgateError::Runtime(_)
        )
    }
}

impl From<FlowgateError> for String {
    fn from(val: FlowgateError) -> Self {
        val.to_string()
    }
}

impl From<std::io::Error> for FlowgateError {
    fn from(error: std::io::Error) -> Self {
        FlowgateError::IoError(error.to_string())
    }
}

impl From<FlowgateError> for std::io::Error {
    fn from(val: FlowgateError) -> Self {
        std::io::Error::new(ErrorKind::Other, val.to_string())
    }
}

impl From<FromUtf8Error> for FlowgateError {
    fn from(_: FromUtf8Error) -> Self {
        FlowgateError::Runtime("Error with utf-8 string convert".to_string())
    }
}

impl From<serde_json::Error> for FlowgateError {
    fn from(error: serde_json::Error) -> Self {
        FlowgateError::Convert(error.to_string())
    }
}

impl From<jsonschema::ValidationError<'_>> for FlowgateError {
    fn from(error: jsonschema::ValidationError<'_>) -> Self {
        FlowgateError::Validation(error.to_string())
    }
}
