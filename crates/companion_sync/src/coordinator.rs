//! Synchronization coordinator
//!
//! The single owner of sync state on the phone. Queue, delta log, mirror cache
//! and connection monitor live behind one lock; every mutation goes through it
//! and the lock is never held across a transport call, so sends run
//! concurrently while state changes stay serialized.
//!
//! Consumers observe progress through a [`watch`] channel carrying
//! [`SyncStatus`] and a [`broadcast`] channel of typed [`SyncEvent`]s.

use crate::batch::{BatchTransfer, ChunkOutcome, TransferReport};
use crate::cache::{ApplyOutcome, MirrorCache};
use crate::clock::Clock;
use crate::config::{SyncConfig, Validate};
use crate::delta::{diff_snapshots, DeltaTracker};
use crate::error::{SyncError, SyncResult};
use crate::guard::ExclusiveFlag;
use crate::messages::SyncMessage;
use crate::metrics::{
    DELTA_RESYNCS, PENDING_OPERATIONS, QUEUE_DELIVERED, QUEUE_ENQUEUED, RECONCILIATION_CONFLICTS,
    SYNC_ERRORS,
};
use crate::monitor::{ConnectionMonitor, ReachabilityChange};
use crate::program::{
    generate_program, CompilationId, ProgramDigest, SessionGenerator, SessionRecord, Selection,
    TrainingLevel,
};
use crate::queue::SyncQueue;
use crate::reconcile::{ConflictResolver, ReconciliationEngine, RemoteStateSource};
use crate::store::{PersistedState, StateStore};
use crate::transport::{Delivery, PeerLink, PeerTransport};
use crate::types::{
    ConnectionQuality, ConnectionState, DataFreshness, DeltaChange, SyncOperation, SyncPriority,
    TimestampMs,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::*;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;
const SESSION_PREFIX: &str = "session.";

/// Snapshot published to UI consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub connection: ConnectionState,
    /// Progress of the current program transfer, in `[0, 1]`
    pub progress: f64,
    pub pending_operations: usize,
    pub quality: ConnectionQuality,
    pub freshness: DataFreshness,
    pub last_sync_at: Option<TimestampMs>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncTrigger {
    Startup,
    Reconnect,
    LocalChange,
    Reconciliation,
    Retry,
}

impl ResyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResyncTrigger::Startup => "startup",
            ResyncTrigger::Reconnect => "reconnect",
            ResyncTrigger::LocalChange => "local_change",
            ResyncTrigger::Reconciliation => "reconciliation",
            ResyncTrigger::Retry => "retry",
        }
    }
}

/// Ready signal for a program selection
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramReady {
    pub compilation_id: CompilationId,
    pub session_count: usize,
    pub digest: u64,
    pub total_batches: usize,
    pub durable_batches: usize,
    pub failed_batches: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    ProgramReady(ProgramReady),
    ResyncFired {
        trigger: ResyncTrigger,
        delivered: usize,
    },
    ReconciliationCompleted {
        conflicts: usize,
        changes: usize,
    },
    OperationDelivered {
        id: Uuid,
        priority: SyncPriority,
    },
    /// An operation produced on the peer
    PeerOperation(SyncOperation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain holds the guard
    Busy,
    /// Nothing queued, or the peer is not connected
    Idle,
    Ran {
        delivered: usize,
        failed: usize,
        remaining: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncReport {
    pub trigger: ResyncTrigger,
    pub attempted: usize,
    pub delivered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Busy,
    /// No remote source configured, or it holds nothing
    NoRemoteState,
    Completed { conflicts: usize, changes: usize },
}

/// A compiled program; regenerated from the selection after a restart
#[derive(Debug, Clone, PartialEq)]
struct ActiveProgram {
    selection: Selection,
    sessions: Vec<SessionRecord>,
    digest: ProgramDigest,
}

impl ActiveProgram {
    fn compile(generator: &dyn SessionGenerator, selection: Selection) -> SyncResult<Self> {
        let sessions = generate_program(generator, selection);
        let digest = ProgramDigest::compute(selection.compilation_id(), &sessions)?;
        Ok(Self {
            selection,
            sessions,
            digest,
        })
    }

    fn session_entries(&self) -> SyncResult<BTreeMap<String, Value>> {
        self.sessions
            .iter()
            .map(|s| Ok((s.entity_key(), serde_json::to_value(s)?)))
            .collect()
    }

    fn metadata(&self) -> BTreeMap<String, Value> {
        [
            ("program.compilation_id", json!(self.digest.compilation_id)),
            ("program.level", json!(self.selection.level)),
            ("program.frequency", json!(self.selection.frequency)),
            ("program.session_count", json!(self.digest.session_count)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

struct CoordinatorState {
    monitor: ConnectionMonitor,
    queue: SyncQueue,
    tracker: DeltaTracker,
    cache: MirrorCache,
    /// Phone-side source of truth for mirrored keys
    local: BTreeMap<String, Value>,
    program: Option<Arc<ActiveProgram>>,
    failed_drains: u32,
}

impl CoordinatorState {
    fn persisted(&self) -> PersistedState {
        PersistedState {
            selection: self.program.as_ref().map(|p| p.selection),
            local: self.local.clone(),
            cache: self.cache.snapshot().clone(),
            queue: self.queue.to_vec(),
            tracker: self.tracker.clone(),
        }
    }

    fn status(&self, now: TimestampMs, progress: f64) -> SyncStatus {
        SyncStatus {
            connection: self.monitor.state().clone(),
            progress,
            pending_operations: self.queue.len(),
            quality: self.monitor.quality(),
            freshness: self.monitor.freshness(now),
            last_sync_at: self.monitor.last_sync_at(),
        }
    }

    /// Timestamp for a new change to `entity`. Always later than any change
    /// already held or pending for it, so edits within one clock tick keep
    /// their order on every replica.
    fn stamp(&self, entity: &str, now: TimestampMs) -> TimestampMs {
        match self.cache.updated_at(entity).max(self.tracker.latest_pending(entity)) {
            Some(latest) if latest >= now => latest + 1,
            _ => now,
        }
    }

    fn set_local(&mut self, change: &DeltaChange) {
        match &change.payload {
            Some(value) => {
                self.local.insert(change.entity.clone(), value.clone());
            }
            None => {
                self.local.remove(&change.entity);
            }
        }
    }
}

pub struct SyncCoordinator {
    config: SyncConfig,
    link: PeerLink,
    generator: Arc<dyn SessionGenerator>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    remote: Option<Arc<dyn RemoteStateSource>>,
    engine: ReconciliationEngine,
    batch: BatchTransfer,
    state: Mutex<CoordinatorState>,
    drain_guard: ExclusiveFlag,
    reconcile_guard: ExclusiveFlag,
    status_tx: watch::Sender<SyncStatus>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("link", &self.link)
            .field("engine", &self.engine)
            .field("status", &*self.status_tx.borrow())
            .finish()
    }
}

impl SyncCoordinator {
    /// Build a coordinator, restoring queue, delta log and cache from `store`
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn PeerTransport>,
        generator: Arc<dyn SessionGenerator>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        config.validate().map_err(|e| SyncError::InvalidConfig {
            parameter: "sync".to_string(),
            reason: e.to_string(),
        })?;

        let persisted = store.load()?.unwrap_or_default();
        let program = persisted
            .selection
            .map(|selection| ActiveProgram::compile(generator.as_ref(), selection).map(Arc::new))
            .transpose()?;

        let state = CoordinatorState {
            monitor: ConnectionMonitor::new(config.monitor.clone()),
            queue: SyncQueue::from_operations(persisted.queue),
            tracker: persisted.tracker,
            cache: MirrorCache::from_snapshot(persisted.cache),
            local: persisted.local,
            program,
            failed_drains: 0,
        };
        info!(
            queued_operations = state.queue.len(),
            pending_changes = state.tracker.pending_len(),
            cached_entries = state.cache.values().len(),
            "Sync state restored"
        );
        PENDING_OPERATIONS.set(state.queue.len() as i64);

        let (status_tx, _) = watch::channel(state.status(clock.now_ms(), 0.0));
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            link: PeerLink::new(transport, config.transport.clone()),
            engine: ReconciliationEngine::with_policy(config.reconciliation.policy),
            batch: BatchTransfer::new(config.batch.clone()),
            config,
            generator,
            store,
            clock,
            remote: None,
            state: Mutex::new(state),
            drain_guard: ExclusiveFlag::new(),
            reconcile_guard: ExclusiveFlag::new(),
            status_tx,
            events_tx,
        })
    }

    pub fn with_remote_source(mut self, remote: Arc<dyn RemoteStateSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Replace the configured conflict policy with a custom resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.engine = ReconciliationEngine::new(resolver);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn link(&self) -> &PeerLink {
        &self.link
    }

    pub fn status(&self) -> SyncStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events_tx.subscribe()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.lock().await.monitor.state().clone()
    }

    pub async fn pending_operations(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Offline-to-connected resyncs fired so far
    pub async fn resync_count(&self) -> u64 {
        self.state.lock().await.monitor.resyncs_fired()
    }

    pub async fn cached_value(&self, key: &str) -> Option<Value> {
        self.state.lock().await.cache.get(key).cloned()
    }

    pub async fn local_value(&self, key: &str) -> Option<Value> {
        self.state.lock().await.local.get(key).cloned()
    }

    pub async fn program_digest(&self) -> Option<ProgramDigest> {
        self.state.lock().await.program.as_ref().map(|p| p.digest.clone())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn publish(&self, state: &CoordinatorState) {
        let progress = self.status_tx.borrow().progress;
        let status = state.status(self.clock.now_ms(), progress);
        PENDING_OPERATIONS.set(status.pending_operations as i64);
        let previous = self.status_tx.send_replace(status.clone());
        if previous.connection != status.connection {
            self.emit(SyncEvent::StateChanged {
                from: previous.connection,
                to: status.connection,
            });
        }
    }

    fn persist(&self, state: &CoordinatorState) {
        if let Err(err) = self.store.save(&state.persisted()) {
            SYNC_ERRORS.with_label_values(&[err.category()]).inc();
            error!(%err, "Failed to persist sync state");
        }
    }

    fn set_progress(&self, progress: f64) {
        self.status_tx.send_modify(|status| status.progress = progress.clamp(0.0, 1.0));
    }

    /// Apply the transport's current reachability and catch up on anything
    /// left over from a previous run.
    pub async fn start(&self) -> SyncResult<ReachabilityChange> {
        let change = self.handle_reachability(self.link.is_reachable()).await?;
        info!(state = %self.connection_state().await, "Sync coordinator started");
        Ok(change)
    }

    /// Compile the program for a selection, mirror it locally and hand it to
    /// the batch transfer. Resolves once both are done.
    pub async fn select_program(&self, level: TrainingLevel, frequency: u8) -> SyncResult<ProgramReady> {
        let selection = Selection::new(level, frequency)?;
        let program = Arc::new(ActiveProgram::compile(self.generator.as_ref(), selection)?);
        info!(
            compilation_id = %program.digest.compilation_id,
            sessions = program.sessions.len(),
            "Program compiled"
        );

        {
            let mut state = self.state.lock().await;
            let now = self.clock.now_ms();

            let before: BTreeMap<String, Value> = state
                .cache
                .keys_with_prefix(SESSION_PREFIX)
                .filter_map(|key| state.cache.get(key).map(|v| (key.clone(), v.clone())))
                .collect();
            let after = program.session_entries()?;
            for mut change in diff_snapshots(&before, &after, now) {
                change.timestamp = state.stamp(&change.entity, now);
                state.cache.apply(&change);
            }
            for (key, value) in program.metadata() {
                let exists = state.cache.contains(&key);
                let timestamp = state.stamp(&key, now);
                let change = DeltaChange::upsert(key, value, exists, timestamp);
                state.cache.apply(&change);
                state.set_local(&change);
            }

            state.program = Some(program.clone());
            self.persist(&state);
            self.set_progress(0.0);
            self.publish(&state);
        }

        let report = self.transfer_program(&program).await;
        let ready = ProgramReady {
            compilation_id: program.digest.compilation_id.clone(),
            session_count: program.sessions.len(),
            digest: program.digest.digest,
            total_batches: report.total_batches,
            durable_batches: report.count(ChunkOutcome::Delivered(Delivery::Durable)),
            failed_batches: report.failed_batches(),
        };
        info!(
            compilation_id = %ready.compilation_id,
            total_batches = ready.total_batches,
            durable_batches = ready.durable_batches,
            "Program ready"
        );
        self.emit(SyncEvent::ProgramReady(ready.clone()));
        Ok(ready)
    }

    async fn transfer_program(&self, program: &ActiveProgram) -> TransferReport {
        let bracketed = {
            let mut state = self.state.lock().await;
            let bracketed = state.monitor.begin_sync();
            self.publish(&state);
            bracketed
        };

        let announce = SyncMessage::training_sync(
            &program.digest,
            program.selection.level,
            program.selection.frequency,
            self.clock.now_ms(),
        );
        if let Err(err) = self.link.deliver(&announce).await {
            warn!(%err, "Program announcement refused by both channels");
        }

        let report = self
            .batch
            .send_sessions(&self.link, self.clock.as_ref(), &program.sessions, |done, total| {
                self.set_progress(done as f64 / total.max(1) as f64)
            })
            .await;

        let mut state = self.state.lock().await;
        if bracketed {
            state.monitor.end_sync();
        }
        let all_immediate = report.count(ChunkOutcome::Delivered(Delivery::Immediate)) == report.total_batches;
        if all_immediate && state.monitor.is_connected() {
            state.monitor.mark_synced(self.clock.now_ms());
        }
        self.set_progress(1.0);
        self.publish(&state);
        report
    }

    /// Hand an operation to the sync layer.
    ///
    /// Sent when the peer is connected and nothing is queued ahead of it;
    /// otherwise queued for the next drain. Transport failures never reach the
    /// caller. An operation too large for either channel is rejected with
    /// `PayloadTooLarge` and never queued.
    pub async fn submit(
        &self,
        kind: impl Into<String>,
        payload: Value,
        priority: SyncPriority,
    ) -> SyncResult<Uuid> {
        let operation = SyncOperation::new(kind, payload, priority, self.clock.now_ms());
        let id = operation.id;
        let message = SyncMessage::from_operation(&operation);

        let size = message.encoded_len()?;
        let limit = self.config.transport.max_durable_payload_bytes;
        if size > limit {
            SYNC_ERRORS.with_label_values(&["payload_too_large"]).inc();
            error!(operation_id = %id, kind = %operation.kind, size, limit, "Operation exceeds every channel's payload ceiling");
            return Err(SyncError::PayloadTooLarge { size, limit });
        }

        let send_now = {
            let state = self.state.lock().await;
            state.queue.is_empty() && state.monitor.is_connected()
        };
        if send_now {
            match self.link.deliver(&message).await {
                Ok(delivery) => {
                    QUEUE_DELIVERED.with_label_values(&[priority.as_str()]).inc();
                    debug!(operation_id = %id, kind = %operation.kind, channel = delivery.as_str(), "Operation delivered without queueing");
                    let mut state = self.state.lock().await;
                    if delivery == Delivery::Immediate {
                        state.monitor.mark_synced(self.clock.now_ms());
                    }
                    self.publish(&state);
                    self.emit(SyncEvent::OperationDelivered { id, priority });
                    return Ok(id);
                }
                Err(err) => {
                    debug!(operation_id = %id, %err, "Operation refused by both channels, queueing it");
                }
            }
        }

        let mut state = self.state.lock().await;
        debug!(operation_id = %id, priority = priority.as_str(), "Operation queued");
        state.queue.enqueue(operation);
        QUEUE_ENQUEUED.with_label_values(&[priority.as_str()]).inc();
        self.persist(&state);
        self.publish(&state);
        Ok(id)
    }

    /// Attempt every queued operation in priority order, each with durable
    /// fallback.
    ///
    /// Stops at the first operation neither channel accepts so nothing
    /// overtakes it.
    pub async fn drain_queue(&self) -> DrainOutcome {
        let Some(_guard) = self.drain_guard.try_acquire() else {
            trace!("Drain already in progress");
            return DrainOutcome::Busy;
        };

        let pending = {
            let mut state = self.state.lock().await;
            if state.queue.is_empty() || !state.monitor.is_connected() {
                return DrainOutcome::Idle;
            }
            state.monitor.begin_sync();
            self.publish(&state);
            state.queue.to_vec()
        };

        let mut delivered = 0;
        let mut immediate = 0;
        let mut failed = 0;
        for operation in pending {
            let result = self.link.deliver(&SyncMessage::from_operation(&operation)).await;
            let mut state = self.state.lock().await;
            match result {
                Ok(delivery) => {
                    state.queue.remove(operation.id);
                    QUEUE_DELIVERED.with_label_values(&[operation.priority.as_str()]).inc();
                    delivered += 1;
                    if delivery == Delivery::Immediate {
                        immediate += 1;
                    }
                    self.persist(&state);
                    self.emit(SyncEvent::OperationDelivered {
                        id: operation.id,
                        priority: operation.priority,
                    });
                }
                Err(err @ SyncError::PayloadTooLarge { .. }) => {
                    // Too large for either channel
                    state.queue.remove(operation.id);
                    SYNC_ERRORS.with_label_values(&[err.category()]).inc();
                    error!(operation_id = %operation.id, %err, "Dropping undeliverable operation");
                    self.persist(&state);
                }
                Err(err) => {
                    let attempts = state.queue.record_failure(operation.id).unwrap_or_default();
                    failed += 1;
                    warn!(operation_id = %operation.id, attempts, %err, "Queued operation not delivered");
                    self.persist(&state);
                    break;
                }
            }
        }

        let mut state = self.state.lock().await;
        state.monitor.end_sync();
        if delivered > 0 {
            state.failed_drains = 0;
            if immediate > 0 {
                state.monitor.mark_synced(self.clock.now_ms());
            }
        } else if failed > 0 {
            state.failed_drains += 1;
            if state.failed_drains >= self.config.queue.max_failed_drains && !state.monitor.state().is_error() {
                SYNC_ERRORS.with_label_values(&["repeated_failure"]).inc();
                state.monitor.fail("repeated delivery failure");
            }
        }
        let remaining = state.queue.len();
        self.publish(&state);
        debug!(delivered, failed, remaining, "Queue drain finished");
        DrainOutcome::Ran {
            delivered,
            failed,
            remaining,
        }
    }

    /// Record a local change to a mirrored key and push it if connected.
    /// `None` deletes the key.
    pub async fn record_change(&self, key: impl Into<String>, value: Option<Value>) -> Uuid {
        let key = key.into();
        let (id, connected) = {
            let mut state = self.state.lock().await;
            let timestamp = state.stamp(&key, self.clock.now_ms());
            let change = match value {
                Some(value) => {
                    let exists = state.local.contains_key(&key);
                    DeltaChange::upsert(key, value, exists, timestamp)
                }
                None => DeltaChange::delete(key, timestamp),
            };
            debug!(entity = %change.entity, op = change.op.as_str(), timestamp, "Local change recorded");
            state.set_local(&change);
            let id = change.id;
            state.tracker.record(change);
            self.persist(&state);
            (id, state.monitor.is_connected())
        };
        if connected {
            self.delta_resync(ResyncTrigger::LocalChange).await;
        }
        id
    }

    /// Push every unacknowledged change. Delivered changes are applied to the
    /// mirror cache and acknowledged.
    pub async fn delta_resync(&self, trigger: ResyncTrigger) -> ResyncReport {
        DELTA_RESYNCS.with_label_values(&[trigger.as_str()]).inc();
        let (pending, bracketed) = {
            let mut state = self.state.lock().await;
            let pending = state.tracker.pending();
            let bracketed = !pending.is_empty() && state.monitor.begin_sync();
            self.publish(&state);
            (pending, bracketed)
        };

        let attempted = pending.len();
        let mut delivered = Vec::with_capacity(attempted);
        for entry in pending.changes {
            match self.link.deliver(&SyncMessage::from_change(&entry.change)).await {
                Ok(_) => delivered.push(entry),
                Err(err) => {
                    warn!(entity = %entry.change.entity, %err, "Delta change not accepted, keeping it pending");
                    break;
                }
            }
        }

        let mut state = self.state.lock().await;
        for entry in &delivered {
            state.cache.apply(&entry.change);
        }
        if let Some(last) = delivered.last() {
            state.tracker.acknowledge(last.seq);
        }
        if bracketed {
            state.monitor.end_sync();
        }
        if delivered.len() == attempted && state.monitor.is_connected() {
            state.monitor.mark_synced(self.clock.now_ms());
        }
        self.persist(&state);
        self.publish(&state);
        drop(state);

        info!(trigger = trigger.as_str(), attempted, delivered = delivered.len(), "Delta resync finished");
        self.emit(SyncEvent::ResyncFired {
            trigger,
            delivered: delivered.len(),
        });
        ResyncReport {
            trigger,
            attempted,
            delivered: delivered.len(),
        }
    }

    /// Feed a reachability signal into the monitor. Reconnecting after an
    /// offline period fires exactly one delta resync.
    pub async fn handle_reachability(&self, reachable: bool) -> SyncResult<ReachabilityChange> {
        let (change, has_pending) = {
            let mut state = self.state.lock().await;
            let change = state.monitor.on_reachability(reachable)?;
            self.publish(&state);
            (change, state.tracker.has_pending())
        };

        match change {
            ReachabilityChange::Reconnected => {
                info!("Peer reachable again");
                self.delta_resync(ResyncTrigger::Reconnect).await;
                self.drain_queue().await;
            }
            ReachabilityChange::Connected => {
                if has_pending {
                    self.delta_resync(ResyncTrigger::Startup).await;
                }
                self.drain_queue().await;
            }
            ReachabilityChange::WentOffline => info!("Peer went offline"),
            ReachabilityChange::Unchanged => {}
        }
        Ok(change)
    }

    /// Coarse polling fallback for platforms without reachability callbacks
    pub async fn poll_reachability(&self) -> SyncResult<ReachabilityChange> {
        self.handle_reachability(self.link.is_reachable()).await
    }

    /// Ping the peer and update link quality. A failed ping only degrades
    /// quality.
    pub async fn measure_latency(&self) -> ConnectionQuality {
        {
            let state = self.state.lock().await;
            if !state.monitor.is_connected() {
                return state.monitor.quality();
            }
        }

        let sent_at = self.clock.now_ms();
        let started = tokio::time::Instant::now();
        let result = self.link.send_immediate(&SyncMessage::Ping { timestamp: sent_at }).await;

        let mut state = self.state.lock().await;
        let quality = match result {
            Ok(Some(SyncMessage::Pong { echo, .. })) if echo == sent_at => {
                state.monitor.record_ping(started.elapsed())
            }
            Ok(reply) => {
                warn!(reply = ?reply.map(|m| m.kind()), "Unexpected ping reply");
                state.monitor.record_ping_failure()
            }
            Err(err) => {
                debug!(%err, "Ping failed");
                state.monitor.record_ping_failure()
            }
        };
        self.publish(&state);
        quality
    }

    /// Re-evaluate data freshness. Crossing into stale runs a silent
    /// reconciliation pass.
    pub async fn check_freshness(&self) -> DataFreshness {
        let (freshness, crossed) = {
            let mut state = self.state.lock().await;
            let now = self.clock.now_ms();
            let crossed = state.monitor.observe_staleness(now);
            let freshness = state.monitor.freshness(now);
            self.publish(&state);
            (freshness, crossed)
        };

        if crossed && self.config.reconciliation.enabled {
            info!("Synced data went stale, reconciling");
            if let Err(err) = self.reconcile().await {
                warn!(%err, "Background reconciliation failed");
            }
        }
        freshness
    }

    /// Merge the authoritative remote state into the mirror and push the
    /// winners to the peer.
    pub async fn reconcile(&self) -> SyncResult<ReconcileOutcome> {
        let Some(_guard) = self.reconcile_guard.try_acquire() else {
            return Ok(ReconcileOutcome::Busy);
        };
        let Some(remote) = self.remote.as_ref() else {
            return Ok(ReconcileOutcome::NoRemoteState);
        };

        let remote_state = match remote.fetch_latest_state().await {
            Ok(Some(remote_state)) => remote_state,
            Ok(None) => return Ok(ReconcileOutcome::NoRemoteState),
            Err(err) => {
                SYNC_ERRORS.with_label_values(&[err.category()]).inc();
                return Err(err);
            }
        };

        let (conflicts, changes) = {
            let mut state = self.state.lock().await;
            let now = self.clock.now_ms();
            let plan = self.engine.plan(&state.cache.values(), &remote_state, now);
            let (conflicts, changes) = (plan.conflicts.len(), plan.changes.len());
            for mut change in plan.changes {
                change.timestamp = state.stamp(&change.entity, now);
                state.cache.apply(&change);
                state.set_local(&change);
                state.tracker.record(change);
            }
            RECONCILIATION_CONFLICTS.inc_by(conflicts as u64);
            self.persist(&state);
            self.publish(&state);
            (conflicts, changes)
        };

        if changes > 0 {
            self.delta_resync(ResyncTrigger::Reconciliation).await;
        }
        info!(
            conflicts,
            changes,
            policy = self.engine.resolver_name(),
            "Reconciliation finished"
        );
        self.emit(SyncEvent::ReconciliationCompleted { conflicts, changes });
        Ok(ReconcileOutcome::Completed { conflicts, changes })
    }

    /// User-triggered retry: reset the monitor and resend everything. In-flight
    /// sends are left to finish or time out.
    pub async fn retry(&self) -> SyncResult<ReachabilityChange> {
        let (change, program) = {
            let mut state = self.state.lock().await;
            let change = state.monitor.retry(self.link.is_reachable())?;
            state.failed_drains = 0;

            let now = self.clock.now_ms();
            let full: Vec<DeltaChange> = state
                .local
                .iter()
                .map(|(key, value)| {
                    DeltaChange::upsert(key.clone(), value.clone(), true, state.stamp(key, now))
                })
                .collect();
            for change in full {
                state.tracker.record(change);
            }
            self.persist(&state);
            self.publish(&state);
            (change, state.program.clone())
        };

        if change == ReachabilityChange::Connected {
            if let Some(program) = program {
                self.transfer_program(&program).await;
            }
            self.delta_resync(ResyncTrigger::Retry).await;
            self.drain_queue().await;
        }
        Ok(change)
    }

    /// Compare the peer's digest of the active program with ours. A mismatch
    /// for the same compilation id moves the connection to error.
    pub async fn verify_peer_program(&self, remote: &ProgramDigest) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        let Some(program) = state.program.clone() else {
            return Ok(());
        };
        if program.digest.compilation_id != remote.compilation_id {
            debug!(
                local = %program.digest.compilation_id,
                peer = %remote.compilation_id,
                "Peer holds a different program"
            );
            return Ok(());
        }
        if program.digest == *remote {
            return Ok(());
        }

        let err = SyncError::GenerationInconsistency {
            compilation_id: remote.compilation_id.to_string(),
            local: program.digest.digest,
            remote: remote.digest,
        };
        SYNC_ERRORS.with_label_values(&[err.category()]).inc();
        state.monitor.fail(format!("generation inconsistency for {}", remote.compilation_id));
        self.publish(&state);
        Err(err)
    }

    /// Handle a message sent by the peer; returns the reply, if any
    pub async fn receive(&self, bytes: &[u8]) -> SyncResult<Option<SyncMessage>> {
        let message = SyncMessage::decode(bytes)?;
        match message {
            SyncMessage::Ping { timestamp } => Ok(Some(SyncMessage::Pong {
                echo: timestamp,
                timestamp: self.clock.now_ms(),
            })),
            SyncMessage::Pong { .. } => Ok(None),
            SyncMessage::DeltaUpdate { .. } => {
                if let Some(change) = message.as_change() {
                    let mut state = self.state.lock().await;
                    if state.cache.apply(&change) == ApplyOutcome::Applied {
                        let newer_local = state
                            .tracker
                            .latest_pending(&change.entity)
                            .is_some_and(|ts| ts > change.timestamp);
                        if !newer_local {
                            state.set_local(&change);
                        }
                    }
                    self.persist(&state);
                    self.publish(&state);
                }
                Ok(None)
            }
            SyncMessage::TrainingSync {
                compilation_id,
                session_count,
                digest,
                ..
            } => {
                self.verify_peer_program(&ProgramDigest {
                    compilation_id,
                    session_count,
                    digest,
                })
                .await?;
                Ok(None)
            }
            SyncMessage::Operation {
                id,
                op_kind,
                priority,
                payload,
                created_at,
            } => {
                self.emit(SyncEvent::PeerOperation(SyncOperation {
                    id,
                    kind: op_kind,
                    payload,
                    priority,
                    created_at,
                    attempts: 0,
                }));
                Ok(None)
            }
            other @ (SyncMessage::TrainingSessionsBatch { .. } | SyncMessage::TrainingSessionsComplete { .. }) => {
                Err(SyncError::InvalidMessage {
                    reason: format!("{} is only sent towards the peer", other.kind()),
                })
            }
        }
    }
}
