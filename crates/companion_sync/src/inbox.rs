//! Receiving half of the protocol, as run on the wearable
//!
//! Every handler tolerates redelivery: deltas are idempotent by change id,
//! operations are deduplicated by id and a re-sent batch chunk replaces the
//! earlier copy.

use crate::batch::{AssembledBatch, BatchAssembler};
use crate::cache::{ApplyOutcome, MirrorCache};
use crate::error::SyncResult;
use crate::messages::SyncMessage;
use crate::program::{generate_program, ProgramDigest, SessionGenerator, Selection, SessionRecord};
use crate::types::SyncOperation;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::*;
use uuid::Uuid;

/// Batches announced by a completion marker but never received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchGap {
    pub total_batches: usize,
    pub missing: Vec<usize>,
}

#[derive(Default)]
pub struct PeerInbox {
    cache: MirrorCache,
    assembler: BatchAssembler<SessionRecord>,
    generator: Option<Arc<dyn SessionGenerator>>,
    announced: Option<ProgramDigest>,
    local_digest: Option<ProgramDigest>,
    last_program: Option<AssembledBatch<SessionRecord>>,
    gaps: Vec<BatchGap>,
    operations: Vec<SyncOperation>,
    seen_operations: HashSet<Uuid>,
    duplicate_operations: usize,
}

impl fmt::Debug for PeerInbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerInbox")
            .field("entries", &self.cache.values().len())
            .field("announced", &self.announced)
            .field("operations", &self.operations.len())
            .field("gaps", &self.gaps)
            .finish()
    }
}

impl PeerInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Regenerate announced programs locally so their digest can be compared
    pub fn with_generator(generator: Arc<dyn SessionGenerator>) -> Self {
        Self {
            generator: Some(generator),
            ..Self::default()
        }
    }

    pub fn cache(&self) -> &MirrorCache {
        &self.cache
    }

    /// Program announced by the last `training_sync`
    pub fn announced(&self) -> Option<&ProgramDigest> {
        self.announced.as_ref()
    }

    /// Digest of the program as regenerated on this side
    pub fn local_digest(&self) -> Option<&ProgramDigest> {
        self.local_digest.as_ref()
    }

    pub fn last_program(&self) -> Option<&AssembledBatch<SessionRecord>> {
        self.last_program.as_ref()
    }

    pub fn gaps(&self) -> &[BatchGap] {
        &self.gaps
    }

    pub fn operations(&self) -> &[SyncOperation] {
        &self.operations
    }

    pub fn duplicate_operations(&self) -> usize {
        self.duplicate_operations
    }

    pub fn handle_bytes(&mut self, bytes: &[u8]) -> SyncResult<Option<SyncMessage>> {
        let message = SyncMessage::decode(bytes)?;
        self.handle(message)
    }

    /// Apply one message; the return value is the reply, if any
    pub fn handle(&mut self, message: SyncMessage) -> SyncResult<Option<SyncMessage>> {
        trace!(kind = message.kind(), "Peer received message");
        match message {
            SyncMessage::DeltaUpdate { .. } => {
                if let Some(change) = message.as_change() {
                    if self.cache.apply(&change) == ApplyOutcome::Duplicate {
                        debug!(change_id = %change.id, "Duplicate delta ignored");
                    }
                }
                Ok(None)
            }
            SyncMessage::TrainingSync {
                compilation_id,
                level,
                days,
                session_count,
                digest,
                ..
            } => {
                self.assembler.reset();
                self.local_digest = match &self.generator {
                    Some(generator) => {
                        let selection = Selection::new(level, days)?;
                        let sessions = generate_program(generator.as_ref(), selection);
                        Some(ProgramDigest::compute(selection.compilation_id(), &sessions)?)
                    }
                    None => None,
                };
                self.announced = Some(ProgramDigest {
                    compilation_id,
                    session_count,
                    digest,
                });
                Ok(None)
            }
            SyncMessage::TrainingSessionsBatch {
                batch_index,
                total_batches,
                sessions,
                ..
            } => {
                self.assembler.accept(batch_index, total_batches, sessions);
                Ok(None)
            }
            SyncMessage::TrainingSessionsComplete {
                total_sessions,
                total_batches,
                ..
            } => {
                let assembled = self.assembler.finish(total_batches, total_sessions);
                if !assembled.missing.is_empty() {
                    warn!(
                        total_batches,
                        missing = ?assembled.missing,
                        "Program transfer completed with missing batches"
                    );
                    self.gaps.push(BatchGap {
                        total_batches,
                        missing: assembled.missing.clone(),
                    });
                } else {
                    info!(sessions = assembled.items.len(), "Program received");
                }
                self.last_program = Some(assembled);
                Ok(None)
            }
            SyncMessage::Operation {
                id,
                op_kind,
                priority,
                payload,
                created_at,
            } => {
                if self.seen_operations.insert(id) {
                    self.operations.push(SyncOperation {
                        id,
                        kind: op_kind,
                        payload,
                        priority,
                        created_at,
                        attempts: 0,
                    });
                } else {
                    self.duplicate_operations += 1;
                    debug!(operation_id = %id, "Duplicate operation ignored");
                }
                Ok(None)
            }
            SyncMessage::Ping { timestamp } => Ok(Some(SyncMessage::Pong {
                echo: timestamp,
                timestamp,
            })),
            SyncMessage::Pong { .. } => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{ProgramGenerator, TrainingLevel};
    use crate::types::{DeltaChange, SyncPriority};
    use serde_json::json;

    #[test]
    fn duplicate_delta_is_a_noop() {
        let mut inbox = PeerInbox::new();
        let change = DeltaChange::upsert("progress.current_week", json!(6), false, 5);
        let message = SyncMessage::from_change(&change);

        inbox.handle(message.clone()).unwrap();
        let once = inbox.cache().clone();
        inbox.handle(message).unwrap();
        assert_eq!(inbox.cache(), &once);
    }

    #[test]
    fn operations_are_deduplicated_by_id() {
        let mut inbox = PeerInbox::new();
        let op = SyncOperation::new("complete_session", json!({"id": "w01d1"}), SyncPriority::UserProgress, 1);
        let message = SyncMessage::from_operation(&op);

        inbox.handle(message.clone()).unwrap();
        inbox.handle(message).unwrap();
        assert_eq!(inbox.operations().len(), 1);
        assert_eq!(inbox.duplicate_operations(), 1);
    }

    #[test]
    fn completion_with_missing_chunk_is_reported_as_gap() {
        let mut inbox = PeerInbox::new();
        let generator = ProgramGenerator;
        let session = generator.generate(TrainingLevel::Beginner, 2, 1, 1);

        inbox
            .handle(SyncMessage::TrainingSessionsBatch {
                batch_index: 0,
                total_batches: 2,
                sessions: vec![session],
                timestamp: 1,
            })
            .unwrap();
        inbox
            .handle(SyncMessage::TrainingSessionsComplete {
                total_sessions: 2,
                total_batches: 2,
                timestamp: 2,
            })
            .unwrap();

        assert_eq!(
            inbox.gaps(),
            &[BatchGap {
                total_batches: 2,
                missing: vec![1]
            }]
        );
        assert!(!inbox.last_program().unwrap().is_complete());
    }

    #[test]
    fn announcement_is_regenerated_locally() {
        let generator: Arc<dyn SessionGenerator> = Arc::new(ProgramGenerator);
        let mut inbox = PeerInbox::with_generator(generator.clone());
        let selection = Selection::new(TrainingLevel::Intermediate, 3).unwrap();
        let sessions = generate_program(generator.as_ref(), selection);
        let digest = ProgramDigest::compute(selection.compilation_id(), &sessions).unwrap();

        inbox
            .handle(SyncMessage::training_sync(&digest, TrainingLevel::Intermediate, 3, 10))
            .unwrap();
        assert_eq!(inbox.announced(), Some(&digest));
        assert_eq!(inbox.local_digest(), Some(&digest));
    }

    #[test]
    fn ping_is_answered() {
        let mut inbox = PeerInbox::new();
        let reply = inbox.handle(SyncMessage::Ping { timestamp: 99 }).unwrap();
        assert_eq!(reply, Some(SyncMessage::Pong { echo: 99, timestamp: 99 }));
    }
}
