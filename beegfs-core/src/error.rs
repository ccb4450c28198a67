//! Error types for BeeGFS daemons
//!
//! One error kind is threaded through registry, sync and resync call chains.
//! Lookups that merely miss return `Option`; everything that talks to a peer
//! returns one of these.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{GroupId, NumNodeId, TargetId};

/// Result type alias for BeeGFS operations
pub type Result<T> = std::result::Result<T, BeegfsError>;

/// Unified error type for BeeGFS operations
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeegfsError {
    // ===== Topology Errors =====
    #[error("Unknown node: {0}")]
    UnknownNode(NumNodeId),

    #[error("Unknown target: {0}")]
    UnknownTarget(TargetId),

    #[error("Unknown buddy group: {0}")]
    UnknownBuddyGroup(GroupId),

    #[error("Invalid node ID: {0}")]
    InvalidNodeId(String),

    // ===== Registry Errors =====
    #[error("Entry already exists: {0}")]
    Exists(String),

    #[error("Entry in use: {0}")]
    InUse(String),

    #[error("Invalid argument: {0}")]
    Inval(String),

    #[error("State changed concurrently, try again")]
    Again,

    // ===== Communication Errors =====
    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    // ===== Storage Errors =====
    #[error("Path does not exist: {0}")]
    PathNotExists(String),

    #[error("I/O error: {0}")]
    Io(String),

    // ===== Control Errors =====
    #[error("Operation interrupted")]
    Interrupted,

    #[error("Already running: {0}")]
    AlreadyRunning(String),

    #[error("Topology changed: {0}")]
    TopologyChanged(String),

    // ===== Configuration Errors =====
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BeegfsError {
    /// Whether a retry against the same peer may succeed
    pub fn is_communication(&self) -> bool {
        matches!(self, Self::Communication(_) | Self::Timeout(_))
    }
}

impl From<std::io::Error> for BeegfsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => BeegfsError::PathNotExists(err.to_string()),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => BeegfsError::Communication(err.to_string()),
            _ => BeegfsError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for BeegfsError {
    fn from(err: serde_json::Error) -> Self {
        BeegfsError::Communication(format!("malformed message: {}", err))
    }
}
