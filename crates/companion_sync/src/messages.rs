//! Wire schema exchanged between the phone and the wearable
//!
//! Every message is a tagged union variant. Decoding validates the whole
//! envelope up front, so a missing or mistyped field is rejected here instead of
//! turning into a silent no-op further down.

use crate::error::{SyncError, SyncResult};
use crate::program::{CompilationId, ProgramDigest, SessionRecord, TrainingLevel};
use crate::types::{ChangeOp, DeltaChange, SyncOperation, SyncPriority, TimestampMs};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Announces a newly compiled program ahead of its sessions
    TrainingSync {
        compilation_id: CompilationId,
        level: TrainingLevel,
        days: u8,
        session_count: usize,
        digest: u64,
        timestamp: TimestampMs,
    },
    /// One chunk of a program's sessions
    TrainingSessionsBatch {
        batch_index: usize,
        total_batches: usize,
        sessions: Vec<SessionRecord>,
        timestamp: TimestampMs,
    },
    /// Sent after the last chunk was attempted, regardless of chunk outcomes
    TrainingSessionsComplete {
        total_sessions: usize,
        total_batches: usize,
        timestamp: TimestampMs,
    },
    DeltaUpdate {
        change_id: Uuid,
        op: ChangeOp,
        entity: String,
        data: Option<Value>,
        timestamp: TimestampMs,
    },
    /// A queued producer operation
    Operation {
        id: Uuid,
        op_kind: String,
        priority: SyncPriority,
        payload: Value,
        created_at: TimestampMs,
    },
    Ping {
        timestamp: TimestampMs,
    },
    Pong {
        echo: TimestampMs,
        timestamp: TimestampMs,
    },
}

impl SyncMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::TrainingSync { .. } => "training_sync",
            SyncMessage::TrainingSessionsBatch { .. } => "training_sessions_batch",
            SyncMessage::TrainingSessionsComplete { .. } => "training_sessions_complete",
            SyncMessage::DeltaUpdate { .. } => "delta_update",
            SyncMessage::Operation { .. } => "operation",
            SyncMessage::Ping { .. } => "ping",
            SyncMessage::Pong { .. } => "pong",
        }
    }

    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Size of the encoded message, as checked against the payload ceilings
    pub fn encoded_len(&self) -> SyncResult<usize> {
        Ok(self.encode()?.len())
    }

    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        serde_json::from_slice(bytes).map_err(|err| SyncError::InvalidMessage {
            reason: err.to_string(),
        })
    }

    pub fn training_sync(digest: &ProgramDigest, level: TrainingLevel, days: u8, timestamp: TimestampMs) -> Self {
        SyncMessage::TrainingSync {
            compilation_id: digest.compilation_id.clone(),
            level,
            days,
            session_count: digest.session_count,
            digest: digest.digest,
            timestamp,
        }
    }

    pub fn from_change(change: &DeltaChange) -> Self {
        SyncMessage::DeltaUpdate {
            change_id: change.id,
            op: change.op,
            entity: change.entity.clone(),
            data: change.payload.clone(),
            timestamp: change.timestamp,
        }
    }

    pub fn from_operation(operation: &SyncOperation) -> Self {
        SyncMessage::Operation {
            id: operation.id,
            op_kind: operation.kind.clone(),
            priority: operation.priority,
            payload: operation.payload.clone(),
            created_at: operation.created_at,
        }
    }

    /// The delta change carried by a `delta_update`, if this is one
    pub fn as_change(&self) -> Option<DeltaChange> {
        match self {
            SyncMessage::DeltaUpdate {
                change_id,
                op,
                entity,
                data,
                timestamp,
            } => Some(DeltaChange {
                id: *change_id,
                op: *op,
                entity: entity.clone(),
                payload: data.clone(),
                timestamp: *timestamp,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_tag_is_on_the_wire() {
        let bytes = SyncMessage::Ping { timestamp: 42 }.encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["kind"], "ping");
        assert_eq!(value["timestamp"], 42);
        assert_eq!(SyncMessage::Ping { timestamp: 42 }.encoded_len().unwrap(), bytes.len());
    }

    #[test]
    fn missing_fields_fail_loudly() {
        let err = SyncMessage::decode(br#"{"kind":"training_sessions_batch","batch_index":0}"#).unwrap_err();
        assert!(matches!(err, SyncError::InvalidMessage { .. }));

        let err = SyncMessage::decode(br#"{"kind":"weather_update","timestamp":1}"#).unwrap_err();
        assert!(matches!(err, SyncError::InvalidMessage { .. }));
    }

    #[test]
    fn delta_update_preserves_the_change() {
        let change = DeltaChange::upsert("progress.current_week", json!(5), true, 1_000);
        let decoded = SyncMessage::decode(&SyncMessage::from_change(&change).encode().unwrap()).unwrap();
        assert_eq!(decoded.kind(), "delta_update");
        assert_eq!(decoded.as_change(), Some(change));
    }
}
