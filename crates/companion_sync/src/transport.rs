//! Peer transport abstraction
//!
//! The underlying link offers two primitives:
//! - an immediate channel that needs the peer to be reachable, is size bounded
//!   and may return a reply
//! - a durable channel that accepts a message for delivery whenever the peer
//!   becomes reachable, with no confirmation and no ordering guarantee
//!
//! [`PeerLink`] wraps a [`PeerTransport`] with the size ceilings and timeouts
//! and implements the fallback policy: a failed immediate send is retried once
//! on the durable channel, and success then only means "accepted for delivery".

use crate::config::TransportConfig;
use crate::error::{SyncError, SyncResult};
use crate::inbox::PeerInbox;
use crate::messages::SyncMessage;
use crate::metrics::TRANSPORT_SENDS;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::*;

/// Raw delivery primitives offered by the platform link
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Current reachability as reported by the platform
    fn is_reachable(&self) -> bool;

    /// Send now and wait for the peer's optional reply
    async fn send_immediate(&self, payload: Vec<u8>) -> SyncResult<Option<Vec<u8>>>;

    /// Hand the payload to the platform for eventual delivery
    async fn send_durable(&self, payload: Vec<u8>) -> SyncResult<()>;
}

/// Channel a message was ultimately accepted on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Immediate,
    Durable,
}

impl Delivery {
    pub fn as_str(&self) -> &'static str {
        match self {
            Delivery::Immediate => "immediate",
            Delivery::Durable => "durable",
        }
    }
}

/// Size- and time-bounded access to a [`PeerTransport`]
#[derive(Clone)]
pub struct PeerLink {
    transport: Arc<dyn PeerTransport>,
    config: TransportConfig,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink").field("config", &self.config).finish()
    }
}

impl PeerLink {
    pub fn new(transport: Arc<dyn PeerTransport>, config: TransportConfig) -> Self {
        Self { transport, config }
    }

    pub fn is_reachable(&self) -> bool {
        self.transport.is_reachable()
    }

    pub fn max_immediate_payload(&self) -> usize {
        self.config.max_immediate_payload_bytes
    }

    /// Send over the immediate channel.
    ///
    /// Oversized messages fail before touching the transport so callers can
    /// fall back to batching.
    pub async fn send_immediate(&self, message: &SyncMessage) -> SyncResult<Option<SyncMessage>> {
        match self.send_immediate_raw(message).await? {
            Some(reply) => SyncMessage::decode(&reply).map(Some),
            None => Ok(None),
        }
    }

    /// Immediate send returning the undecoded reply
    async fn send_immediate_raw(&self, message: &SyncMessage) -> SyncResult<Option<Vec<u8>>> {
        let result = self.try_send_immediate(message).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.category(),
        };
        TRANSPORT_SENDS.with_label_values(&["immediate", outcome]).inc();
        result
    }

    async fn try_send_immediate(&self, message: &SyncMessage) -> SyncResult<Option<Vec<u8>>> {
        let payload = message.encode()?;
        if payload.len() > self.config.max_immediate_payload_bytes {
            return Err(SyncError::PayloadTooLarge {
                size: payload.len(),
                limit: self.config.max_immediate_payload_bytes,
            });
        }
        if !self.transport.is_reachable() {
            return Err(SyncError::TransportUnreachable);
        }

        let timeout = self.config.immediate_timeout;
        match tokio::time::timeout(timeout, self.transport.send_immediate(payload)).await {
            Err(_) => Err(SyncError::MessageTimeout { timeout }),
            Ok(result) => result,
        }
    }

    /// Queue on the durable channel
    pub async fn send_durable(&self, message: &SyncMessage) -> SyncResult<()> {
        let result = self.try_send_durable(message).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.category(),
        };
        TRANSPORT_SENDS.with_label_values(&["durable", outcome]).inc();
        result
    }

    async fn try_send_durable(&self, message: &SyncMessage) -> SyncResult<()> {
        let payload = message.encode()?;
        if payload.len() > self.config.max_durable_payload_bytes {
            return Err(SyncError::PayloadTooLarge {
                size: payload.len(),
                limit: self.config.max_durable_payload_bytes,
            });
        }
        let timeout = self.config.immediate_timeout;
        tokio::time::timeout(timeout, self.transport.send_durable(payload))
            .await
            .map_err(|_| SyncError::MessageTimeout { timeout })?
    }

    /// Immediate send with durable fallback.
    ///
    /// Only an unreachable peer, a timeout or an oversized payload moves the
    /// message to the durable channel. Any reply is discarded undecoded: once
    /// the immediate send went through the message must not be sent again.
    pub async fn deliver(&self, message: &SyncMessage) -> SyncResult<Delivery> {
        match self.send_immediate_raw(message).await {
            Ok(_) => Ok(Delivery::Immediate),
            Err(SyncError::PayloadTooLarge { size, limit }) => {
                error!(kind = message.kind(), size, limit, "Message exceeds immediate payload ceiling, sending durably");
                self.send_durable(message).await?;
                Ok(Delivery::Durable)
            }
            Err(err) if err.triggers_fallback() => {
                debug!(kind = message.kind(), %err, "Immediate send failed, falling back to durable channel");
                self.send_durable(message).await?;
                Ok(Delivery::Durable)
            }
            Err(err) => Err(err),
        }
    }
}

/// Record of a payload handed to [`LoopbackTransport`]
#[derive(Debug, Clone)]
pub struct SentPayload {
    pub channel: Delivery,
    pub payload: Vec<u8>,
}

impl SentPayload {
    pub fn message(&self) -> Option<SyncMessage> {
        SyncMessage::decode(&self.payload).ok()
    }
}

/// In-process transport wired straight to a [`PeerInbox`].
///
/// Used for simulation and tests: reachability, latency and hanging sends can
/// be toggled, and durable payloads are held back while the peer is
/// unreachable and flushed once it comes back.
#[derive(Debug)]
pub struct LoopbackTransport {
    peer: Arc<Mutex<PeerInbox>>,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
    hang_immediate: AtomicBool,
    durable_available: AtomicBool,
    durable_backlog: Mutex<VecDeque<Vec<u8>>>,
    sent: Mutex<Vec<SentPayload>>,
}

impl LoopbackTransport {
    pub fn new(peer: Arc<Mutex<PeerInbox>>) -> Self {
        Self {
            peer,
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            hang_immediate: AtomicBool::new(false),
            durable_available: AtomicBool::new(true),
            durable_backlog: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn peer(&self) -> Arc<Mutex<PeerInbox>> {
        self.peer.clone()
    }

    /// Change reachability; coming back online flushes the durable backlog
    pub async fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if reachable {
            let backlog: Vec<Vec<u8>> = self.durable_backlog.lock().await.drain(..).collect();
            for payload in backlog {
                self.deliver_to_peer(&payload).await;
            }
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Make immediate sends never complete, to exercise timeouts
    pub fn set_hang_immediate(&self, hang: bool) {
        self.hang_immediate.store(hang, Ordering::SeqCst);
    }

    /// Make the durable channel refuse payloads, as a platform does when its
    /// outgoing transfer queue is unavailable
    pub fn set_durable_available(&self, available: bool) {
        self.durable_available.store(available, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<SentPayload> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_messages(&self) -> Vec<(Delivery, SyncMessage)> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(|p| p.message().map(|m| (p.channel, m)))
            .collect()
    }

    pub async fn clear_sent(&self) {
        self.sent.lock().await.clear();
    }

    pub async fn durable_backlog_len(&self) -> usize {
        self.durable_backlog.lock().await.len()
    }

    async fn deliver_to_peer(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let mut peer = self.peer.lock().await;
        match peer.handle_bytes(payload) {
            Ok(reply) => reply.and_then(|m| m.encode().ok()),
            Err(err) => {
                warn!(%err, "Peer rejected payload");
                None
            }
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn send_immediate(&self, payload: Vec<u8>) -> SyncResult<Option<Vec<u8>>> {
        if !self.is_reachable() {
            return Err(SyncError::TransportUnreachable);
        }
        if self.hang_immediate.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.sent.lock().await.push(SentPayload {
            channel: Delivery::Immediate,
            payload: payload.clone(),
        });
        Ok(self.deliver_to_peer(&payload).await)
    }

    async fn send_durable(&self, payload: Vec<u8>) -> SyncResult<()> {
        if !self.durable_available.load(Ordering::SeqCst) {
            return Err(SyncError::TransportUnreachable);
        }
        self.sent.lock().await.push(SentPayload {
            channel: Delivery::Durable,
            payload: payload.clone(),
        });
        if self.is_reachable() {
            let _ = self.deliver_to_peer(&payload).await;
        } else {
            self.durable_backlog.lock().await.push_back(payload);
        }
        Ok(())
    }
}
