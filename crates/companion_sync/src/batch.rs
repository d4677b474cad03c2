//! Batch transfer protocol
//!
//! Collections too large for one immediate message are split into fixed-size
//! chunks and sent strictly in order with a short pause between chunks. A chunk
//! that fails the immediate channel is routed to the durable channel on its
//! own; the transfer is never aborted midway. A completion marker is sent after
//! the last chunk whatever the per-chunk outcomes were.

use crate::config::BatchConfig;
use crate::clock::Clock;
use crate::messages::SyncMessage;
use crate::metrics::BATCH_CHUNKS;
use crate::program::SessionRecord;
use crate::transport::{Delivery, PeerLink};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::*;

/// One chunk of an ordered collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch<T> {
    pub batch_index: usize,
    pub total_batches: usize,
    pub items: Vec<T>,
}

/// Split `items` into chunks of at most `chunk_size`, preserving order.
///
/// An empty collection yields no chunks.
pub fn split_into_batches<T: Clone>(items: &[T], chunk_size: usize) -> Vec<Batch<T>> {
    let chunk_size = chunk_size.max(1);
    let total_batches = items.len().div_ceil(chunk_size);
    items
        .chunks(chunk_size)
        .enumerate()
        .map(|(batch_index, chunk)| Batch {
            batch_index,
            total_batches,
            items: chunk.to_vec(),
        })
        .collect()
}

/// Reassemble chunks by `batch_index`, whatever order they arrived in
pub fn reassemble<T>(mut batches: Vec<Batch<T>>) -> Vec<T> {
    batches.sort_by_key(|b| b.batch_index);
    batches.into_iter().flat_map(|b| b.items).collect()
}

/// Per-chunk outcome of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Delivered(Delivery),
    /// Both channels refused the chunk
    Failed,
}

/// Send-side summary of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub total_items: usize,
    pub total_batches: usize,
    pub chunks: Vec<ChunkOutcome>,
    /// Whether the completion marker was accepted by either channel
    pub completion_sent: bool,
}

impl TransferReport {
    pub fn count(&self, outcome: ChunkOutcome) -> usize {
        self.chunks.iter().filter(|c| **c == outcome).count()
    }

    pub fn failed_batches(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == ChunkOutcome::Failed)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Sends session collections in chunks over a [`PeerLink`]
#[derive(Debug, Clone)]
pub struct BatchTransfer {
    config: BatchConfig,
}

impl BatchTransfer {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Send `sessions` chunk by chunk. `on_chunk(done, total)` is called after
    /// every attempted chunk.
    pub async fn send_sessions<F>(
        &self,
        link: &PeerLink,
        clock: &dyn Clock,
        sessions: &[SessionRecord],
        mut on_chunk: F,
    ) -> TransferReport
    where
        F: FnMut(usize, usize) + Send,
    {
        let batches = split_into_batches(sessions, self.config.chunk_size);
        let total_batches = batches.len();
        let mut chunks = Vec::with_capacity(total_batches);

        for batch in batches {
            if batch.batch_index > 0 && !self.config.inter_chunk_delay.is_zero() {
                tokio::time::sleep(self.config.inter_chunk_delay).await;
            }

            let index = batch.batch_index;
            let message = SyncMessage::TrainingSessionsBatch {
                batch_index: batch.batch_index,
                total_batches: batch.total_batches,
                sessions: batch.items,
                timestamp: clock.now_ms(),
            };
            let outcome = match link.deliver(&message).await {
                Ok(delivery) => ChunkOutcome::Delivered(delivery),
                Err(err) => {
                    error!(batch_index = index, total_batches, %err, "Batch chunk refused by both channels");
                    ChunkOutcome::Failed
                }
            };
            let label = match outcome {
                ChunkOutcome::Delivered(delivery) => delivery.as_str(),
                ChunkOutcome::Failed => "failed",
            };
            BATCH_CHUNKS.with_label_values(&[label]).inc();
            debug!(batch_index = index, total_batches, outcome = label, "Batch chunk attempted");

            chunks.push(outcome);
            on_chunk(chunks.len(), total_batches);
        }

        let complete = SyncMessage::TrainingSessionsComplete {
            total_sessions: sessions.len(),
            total_batches,
            timestamp: clock.now_ms(),
        };
        let completion_sent = match link.deliver(&complete).await {
            Ok(_) => true,
            Err(err) => {
                error!(%err, "Batch completion marker refused by both channels");
                false
            }
        };

        let report = TransferReport {
            total_items: sessions.len(),
            total_batches,
            chunks,
            completion_sent,
        };
        info!(
            total_items = report.total_items,
            total_batches,
            immediate = report.count(ChunkOutcome::Delivered(Delivery::Immediate)),
            durable = report.count(ChunkOutcome::Delivered(Delivery::Durable)),
            failed = report.count(ChunkOutcome::Failed),
            "Batch transfer finished"
        );
        report
    }
}

/// Receiver-side reassembly of a chunked transfer
#[derive(Debug, Clone)]
pub struct BatchAssembler<T> {
    expected_batches: Option<usize>,
    received: BTreeMap<usize, Vec<T>>,
}

impl<T> Default for BatchAssembler<T> {
    fn default() -> Self {
        Self {
            expected_batches: None,
            received: BTreeMap::new(),
        }
    }
}

/// Result of closing a transfer on the receiver
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledBatch<T> {
    pub items: Vec<T>,
    /// Batch indices announced but never received
    pub missing: Vec<usize>,
    /// Item count announced by the sender
    pub expected_items: usize,
}

impl<T> AssembledBatch<T> {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.items.len() == self.expected_items
    }
}

impl<T: Clone> BatchAssembler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.expected_batches = None;
        self.received.clear();
    }

    /// Store a chunk. Re-delivery of the same index replaces it.
    pub fn accept(&mut self, batch_index: usize, total_batches: usize, items: Vec<T>) {
        self.expected_batches = Some(total_batches);
        self.received.insert(batch_index, items);
    }

    pub fn received_batches(&self) -> usize {
        self.received.len()
    }

    /// Close the transfer on the completion marker
    pub fn finish(&mut self, total_batches: usize, total_items: usize) -> AssembledBatch<T> {
        let missing = (0..total_batches)
            .filter(|i| !self.received.contains_key(i))
            .collect();
        let items = self
            .received
            .range(..total_batches)
            .flat_map(|(_, items)| items.iter().cloned())
            .collect();
        self.reset();
        AssembledBatch {
            items,
            missing,
            expected_items: total_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TransportConfig;
    use crate::inbox::PeerInbox;
    use crate::program::{generate_program, ProgramGenerator, Selection, TrainingLevel};
    use crate::transport::LoopbackTransport;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    proptest! {
        #[test]
        fn split_then_reassemble_is_identity(items in proptest::collection::vec(any::<u32>(), 0..200), k in 1usize..16) {
            let batches = split_into_batches(&items, k);
            prop_assert_eq!(batches.len(), items.len().div_ceil(k));
            for batch in &batches {
                prop_assert!(batch.items.len() <= k);
                prop_assert_eq!(batch.total_batches, batches.len());
            }
            let mut shuffled = batches.clone();
            shuffled.reverse();
            prop_assert_eq!(reassemble(shuffled), items);
        }
    }

    #[test]
    fn empty_collection_has_no_chunks() {
        assert!(split_into_batches::<u8>(&[], 4).is_empty());
    }

    #[test]
    fn assembler_reports_gaps() {
        let mut assembler = BatchAssembler::new();
        assembler.accept(0, 3, vec![1, 2]);
        assembler.accept(2, 3, vec![5]);
        let assembled = assembler.finish(3, 5);
        assert_eq!(assembled.items, vec![1, 2, 5]);
        assert_eq!(assembled.missing, vec![1]);
        assert!(!assembled.is_complete());
        assert_eq!(assembler.received_batches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transfer_sends_chunks_then_completion() {
        let peer = Arc::new(Mutex::new(PeerInbox::new()));
        let transport = Arc::new(LoopbackTransport::new(peer.clone()));
        let link = PeerLink::new(transport.clone(), TransportConfig::default());
        let clock = ManualClock::new(1_000);
        let sessions = generate_program(
            &ProgramGenerator,
            Selection::new(TrainingLevel::Intermediate, 3).unwrap(),
        );

        let transfer = BatchTransfer::new(BatchConfig {
            chunk_size: 4,
            inter_chunk_delay: Duration::from_millis(100),
        });
        let mut progress = Vec::new();
        let report = transfer
            .send_sessions(&link, &clock, &sessions, |done, total| progress.push((done, total)))
            .await;

        assert_eq!(report.total_batches, 9);
        assert_eq!(report.chunks.len(), 9);
        assert!(report.completion_sent);
        assert_eq!(progress.last(), Some(&(9, 9)));

        let kinds: Vec<&'static str> = transport
            .sent_messages()
            .await
            .iter()
            .map(|(_, m)| m.kind())
            .collect();
        assert_eq!(kinds.len(), 10);
        assert_eq!(kinds.last(), Some(&"training_sessions_complete"));

        let received = peer.lock().await.last_program().cloned().unwrap();
        assert!(received.is_complete());
        assert_eq!(received.items, sessions);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_chunks_fall_back_individually() {
        let peer = Arc::new(Mutex::new(PeerInbox::new()));
        let transport = Arc::new(LoopbackTransport::new(peer.clone()));
        transport.set_reachable(false).await;
        let link = PeerLink::new(transport.clone(), TransportConfig::default());
        let sessions = generate_program(
            &ProgramGenerator,
            Selection::new(TrainingLevel::Beginner, 2).unwrap(),
        );

        let report = BatchTransfer::new(BatchConfig::default())
            .send_sessions(&link, &ManualClock::new(0), &sessions, |_, _| {})
            .await;

        assert_eq!(report.count(ChunkOutcome::Delivered(Delivery::Durable)), report.total_batches);
        assert!(report.failed_batches().is_empty());
        assert_eq!(transport.durable_backlog_len().await, report.total_batches + 1);
    }
}
