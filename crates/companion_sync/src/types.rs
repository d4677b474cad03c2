//! Shared data model for queued operations, delta changes and link telemetry

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Milliseconds since the Unix epoch
pub type TimestampMs = u64;

/// Delivery priority of a queued operation. Declaration order is dequeue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPriority {
    /// Data the wearable needs for the next workout
    NextSession,
    /// Progress recorded by the user
    UserProgress,
    /// Cosmetic or bookkeeping data
    Metadata,
}

impl SyncPriority {
    pub const ALL: [SyncPriority; 3] = [
        SyncPriority::NextSession,
        SyncPriority::UserProgress,
        SyncPriority::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPriority::NextSession => "next_session",
            SyncPriority::UserProgress => "user_progress",
            SyncPriority::Metadata => "metadata",
        }
    }

    pub(crate) fn lane(&self) -> usize {
        match self {
            SyncPriority::NextSession => 0,
            SyncPriority::UserProgress => 1,
            SyncPriority::Metadata => 2,
        }
    }
}

/// An operation produced locally and pending delivery to the peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: Uuid,
    pub kind: String,
    pub payload: Value,
    pub priority: SyncPriority,
    pub created_at: TimestampMs,
    /// Failed delivery attempts so far; never decreases
    pub attempts: u32,
}

impl SyncOperation {
    pub fn new(
        kind: impl Into<String>,
        payload: Value,
        priority: SyncPriority,
        created_at: TimestampMs,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            priority,
            created_at,
            attempts: 0,
        }
    }

    pub fn record_failure(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }
}

/// Kind of change carried by a [`DeltaChange`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }
}

/// A single entity-level change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaChange {
    pub id: Uuid,
    pub op: ChangeOp,
    /// Key of the entity in the mirrored state, e.g. `progress.current_week`
    pub entity: String,
    /// New value; `None` for deletes
    pub payload: Option<Value>,
    pub timestamp: TimestampMs,
}

impl DeltaChange {
    pub fn new(op: ChangeOp, entity: impl Into<String>, payload: Option<Value>, timestamp: TimestampMs) -> Self {
        Self {
            id: Uuid::new_v4(),
            op,
            entity: entity.into(),
            payload,
            timestamp,
        }
    }

    /// Upsert-style change: insert when the entity is unknown, update otherwise
    pub fn upsert(entity: impl Into<String>, value: Value, exists: bool, timestamp: TimestampMs) -> Self {
        let op = if exists { ChangeOp::Update } else { ChangeOp::Insert };
        Self::new(op, entity, Some(value), timestamp)
    }

    pub fn delete(entity: impl Into<String>, timestamp: TimestampMs) -> Self {
        Self::new(ChangeOp::Delete, entity, None, timestamp)
    }
}

/// Link state. Mutated only by the connection monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Initializing,
    Connected,
    Syncing,
    Offline,
    Error { reason: String },
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Initializing => "initializing",
            ConnectionState::Connected => "connected",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Offline => "offline",
            ConnectionState::Error { .. } => "error",
        }
    }

    /// Whether the peer can currently be sent to
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Syncing)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error { .. })
    }

    /// Numeric code exported on the connection state gauge
    pub fn code(&self) -> i64 {
        match self {
            ConnectionState::Initializing => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Syncing => 2,
            ConnectionState::Offline => 3,
            ConnectionState::Error { .. } => 4,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Error { reason } => write!(f, "error({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Link quality derived from ping round-trip time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    /// No measurement yet
    Unknown,
}

impl ConnectionQuality {
    pub fn classify(rtt: Duration, excellent_below: Duration, good_up_to: Duration) -> Self {
        if rtt < excellent_below {
            ConnectionQuality::Excellent
        } else if rtt <= good_up_to {
            ConnectionQuality::Good
        } else {
            ConnectionQuality::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Unknown => "unknown",
        }
    }
}

/// Age of the last successful sync, bucketed for the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFreshness {
    Current,
    Recent,
    Stale,
}

impl DataFreshness {
    /// Classify a sync age. A peer that never synced is stale.
    pub fn classify(age: Option<Duration>, current_below: Duration, recent_up_to: Duration) -> Self {
        match age {
            Some(age) if age < current_below => DataFreshness::Current,
            Some(age) if age <= recent_up_to => DataFreshness::Recent,
            _ => DataFreshness::Stale,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataFreshness::Current => "current",
            DataFreshness::Recent => "recent",
            DataFreshness::Stale => "stale",
        }
    }
}
