//! Reconciliation against the authoritative remote store
//!
//! A backstop for drift the incremental path missed: compare the remote state
//! with the local mirror, resolve every differing key through a
//! [`ConflictResolver`] and turn the winners into ordinary [`DeltaChange`]s so
//! they flow through the same idempotent apply-and-push path as local edits.

use crate::error::{SyncError, SyncResult};
use crate::metrics::SYNC_ERRORS;
use crate::types::{DeltaChange, TimestampMs};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::*;

/// Authoritative remote store
#[async_trait]
pub trait RemoteStateSource: Send + Sync {
    /// Latest state keyed like the mirror cache; `None` when the store holds
    /// nothing for this user yet
    async fn fetch_latest_state(&self) -> SyncResult<Option<BTreeMap<String, Value>>>;
}

/// Remote store held in memory, for simulation and tests
#[derive(Debug, Default)]
pub struct InMemoryRemoteState {
    state: RwLock<Option<BTreeMap<String, Value>>>,
}

impl InMemoryRemoteState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.state
            .write()
            .await
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
    }

    pub async fn clear(&self) {
        *self.state.write().await = None;
    }
}

#[async_trait]
impl RemoteStateSource for InMemoryRemoteState {
    async fn fetch_latest_state(&self) -> SyncResult<Option<BTreeMap<String, Value>>> {
        Ok(self.state.read().await.clone())
    }
}

/// Named conflict policies selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    ServerWins,
    ClientWins,
    FieldMerge,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::ServerWins => "server_wins",
            ConflictPolicy::ClientWins => "client_wins",
            ConflictPolicy::FieldMerge => "field_merge",
        }
    }

    pub fn resolver(&self) -> Arc<dyn ConflictResolver> {
        match self {
            ConflictPolicy::ServerWins => Arc::new(ServerWins),
            ConflictPolicy::ClientWins => Arc::new(ClientWins),
            ConflictPolicy::FieldMerge => Arc::new(FieldMerge),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "server_wins" => Ok(ConflictPolicy::ServerWins),
            "client_wins" => Ok(ConflictPolicy::ClientWins),
            "field_merge" => Ok(ConflictPolicy::FieldMerge),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

/// A key whose remote value differs from the mirrored one
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub key: String,
    /// Mirrored value; `None` when the key is unknown locally
    pub local: Option<Value>,
    pub remote: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    TakeRemote,
    KeepLocal,
    Merged(Value),
}

pub trait ConflictResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick a winner for `conflict`. An error means the policy cannot decide
    /// and the remote value is taken.
    fn resolve(&self, conflict: &Conflict) -> SyncResult<Resolution>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerWins;

impl ConflictResolver for ServerWins {
    fn name(&self) -> &'static str {
        "server_wins"
    }

    fn resolve(&self, _conflict: &Conflict) -> SyncResult<Resolution> {
        Ok(Resolution::TakeRemote)
    }
}

/// Local values win; keys missing locally are still taken from the remote
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientWins;

impl ConflictResolver for ClientWins {
    fn name(&self) -> &'static str {
        "client_wins"
    }

    fn resolve(&self, conflict: &Conflict) -> SyncResult<Resolution> {
        Ok(match conflict.local {
            Some(_) => Resolution::KeepLocal,
            None => Resolution::TakeRemote,
        })
    }
}

/// Object values are merged field by field with remote fields winning and
/// local-only fields kept. Keys unknown locally take the remote value; any
/// other pair cannot be merged.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMerge;

impl ConflictResolver for FieldMerge {
    fn name(&self) -> &'static str {
        "field_merge"
    }

    fn resolve(&self, conflict: &Conflict) -> SyncResult<Resolution> {
        match (&conflict.local, &conflict.remote) {
            (Some(Value::Object(local)), Value::Object(remote)) => {
                let mut merged = local.clone();
                for (field, value) in remote {
                    merged.insert(field.clone(), value.clone());
                }
                Ok(Resolution::Merged(Value::Object(merged)))
            }
            (None, _) => Ok(Resolution::TakeRemote),
            _ => Err(SyncError::ReconciliationConflict {
                key: conflict.key.clone(),
            }),
        }
    }
}

/// Outcome of comparing remote and mirrored state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationPlan {
    pub conflicts: Vec<Conflict>,
    /// Winning values to apply locally and push to the peer
    pub changes: Vec<DeltaChange>,
}

impl ReconciliationPlan {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    resolver: Arc<dyn ConflictResolver>,
}

impl fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("resolver", &self.resolver.name())
            .finish()
    }
}

impl ReconciliationEngine {
    pub fn new(resolver: Arc<dyn ConflictResolver>) -> Self {
        Self { resolver }
    }

    pub fn with_policy(policy: ConflictPolicy) -> Self {
        Self::new(policy.resolver())
    }

    pub fn resolver_name(&self) -> &'static str {
        self.resolver.name()
    }

    /// Compare `remote` against the mirrored `local` values.
    ///
    /// Keys absent from the remote are not conflicts: the remote store is
    /// partial and only speaks for the keys it holds.
    pub fn plan(
        &self,
        local: &BTreeMap<String, Value>,
        remote: &BTreeMap<String, Value>,
        now: TimestampMs,
    ) -> ReconciliationPlan {
        let mut plan = ReconciliationPlan::default();

        for (key, remote_value) in remote {
            let local_value = local.get(key);
            if local_value == Some(remote_value) {
                continue;
            }
            let conflict = Conflict {
                key: key.clone(),
                local: local_value.cloned(),
                remote: remote_value.clone(),
            };

            let resolution = self.resolver.resolve(&conflict).unwrap_or_else(|err| {
                SYNC_ERRORS.with_label_values(&[err.category()]).inc();
                warn!(%err, policy = self.resolver.name(), "Unresolved conflict, taking the remote value");
                Resolution::TakeRemote
            });
            let winner = match resolution {
                Resolution::TakeRemote => Some(remote_value.clone()),
                Resolution::KeepLocal => None,
                Resolution::Merged(value) => Some(value),
            };
            if let Some(value) = winner.filter(|v| Some(v) != local_value) {
                plan.changes
                    .push(DeltaChange::upsert(key.clone(), value, local_value.is_some(), now));
            }

            debug!(key = %key, policy = self.resolver.name(), "Reconciliation conflict resolved");
            plan.conflicts.push(conflict);
        }

        plan
    }
}
