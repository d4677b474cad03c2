//! Synchronization error types

use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised by the synchronization engine.
///
/// Transport failures (`TransportUnreachable`, `MessageTimeout`) are expected
/// conditions: the delivery layer converts them into a durable fallback and they
/// are not meant to reach the caller of a coordinator operation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// The peer is not currently reachable over the immediate channel
    #[error("Peer unreachable")]
    TransportUnreachable,

    /// An immediate send did not complete within its timeout
    #[error("Message timed out after {timeout:?}")]
    MessageTimeout { timeout: Duration },

    /// A message exceeded the channel's payload ceiling
    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// A reconciliation conflict that the active policy could not resolve
    #[error("Reconciliation conflict on key {key}")]
    ReconciliationConflict { key: String },

    /// The same selection generated different sessions on two devices
    #[error("Generation inconsistency for {compilation_id}: local digest {local:016x}, peer digest {remote:016x}")]
    GenerationInconsistency {
        compilation_id: String,
        local: u64,
        remote: u64,
    },

    /// A message failed validation at the deserialization boundary
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// The requested program selection is not valid
    #[error("Invalid selection: {reason}")]
    InvalidSelection { reason: String },

    /// A connection state transition that the state machine does not allow
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The authoritative remote store could not be read
    #[error("Remote store error: {reason}")]
    RemoteStore { reason: String },

    /// Persistence errors
    #[error("Storage error: {operation} - {reason}")]
    Storage { operation: String, reason: String },

    /// Encoding errors
    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    /// Invalid configuration
    #[error("Invalid configuration: {parameter} - {reason}")]
    InvalidConfig { parameter: String, reason: String },
}

impl SyncError {
    /// Whether the delivery layer should route the message to the durable channel
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            SyncError::TransportUnreachable | SyncError::MessageTimeout { .. }
        )
    }

    /// Check if error is recoverable without user intervention
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::TransportUnreachable => true,
            SyncError::MessageTimeout { .. } => true,
            SyncError::ReconciliationConflict { .. } => true,
            SyncError::RemoteStore { .. } => true,
            SyncError::Storage { .. } => true,

            SyncError::PayloadTooLarge { .. } => false,
            SyncError::GenerationInconsistency { .. } => false,
            SyncError::InvalidMessage { .. } => false,
            SyncError::InvalidSelection { .. } => false,
            SyncError::InvalidTransition { .. } => false,
            SyncError::Serialization { .. } => false,
            SyncError::InvalidConfig { .. } => false,
        }
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::TransportUnreachable => "unreachable",
            SyncError::MessageTimeout { .. } => "timeout",
            SyncError::PayloadTooLarge { .. } => "payload_too_large",
            SyncError::ReconciliationConflict { .. } => "conflict",
            SyncError::GenerationInconsistency { .. } => "generation",
            SyncError::InvalidMessage { .. } => "invalid_message",
            SyncError::InvalidSelection { .. } => "invalid_selection",
            SyncError::InvalidTransition { .. } => "transition",
            SyncError::RemoteStore { .. } => "remote_store",
            SyncError::Storage { .. } => "storage",
            SyncError::Serialization { .. } => "serialization",
            SyncError::InvalidConfig { .. } => "config",
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage {
            operation: "io".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization {
            reason: err.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SyncError::MessageTimeout {
            timeout: Duration::from_secs(0),
        }
    }
}
