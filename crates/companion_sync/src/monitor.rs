//! Connection state monitor
//!
//! Owns the [`ConnectionState`] machine, link quality from ping round trips and
//! data freshness from the time since the last successful sync.
//!
//! ```text
//! initializing -> connected | offline | error
//! connected    -> offline | syncing | error
//! syncing      -> connected | offline | error
//! offline      -> connected | error
//! error        -> initializing   (explicit retry only)
//! ```

use crate::config::MonitorConfig;
use crate::error::{SyncError, SyncResult};
use crate::metrics::{CONNECTION_STATE, PING_RTT_SECONDS};
use crate::types::{ConnectionQuality, ConnectionState, DataFreshness, TimestampMs};
use std::time::Duration;
use tracing::*;

/// Effect of a reachability signal on the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityChange {
    Unchanged,
    /// First connection after start or retry
    Connected,
    WentOffline,
    /// `offline -> connected`; the caller owes exactly one delta resync
    Reconnected,
}

impl ReachabilityChange {
    pub fn requires_resync(&self) -> bool {
        matches!(self, ReachabilityChange::Reconnected)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    config: MonitorConfig,
    state: ConnectionState,
    quality: ConnectionQuality,
    last_rtt: Option<Duration>,
    last_sync_at: Option<TimestampMs>,
    last_freshness: Option<DataFreshness>,
    active_syncs: u32,
    resyncs_fired: u64,
}

fn transition_allowed(from: &ConnectionState, to: &ConnectionState) -> bool {
    use ConnectionState::*;
    match (from, to) {
        (_, Error { .. }) => true,
        (Initializing, Connected | Offline) => true,
        (Connected, Offline | Syncing) => true,
        (Syncing, Connected | Offline) => true,
        (Offline, Connected) => true,
        (Error { .. }, Initializing) => true,
        _ => false,
    }
}

impl ConnectionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        CONNECTION_STATE.set(ConnectionState::Initializing.code());
        Self {
            config,
            state: ConnectionState::Initializing,
            quality: ConnectionQuality::Unknown,
            last_rtt: None,
            last_sync_at: None,
            last_freshness: None,
            active_syncs: 0,
            resyncs_fired: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.quality
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    pub fn last_sync_at(&self) -> Option<TimestampMs> {
        self.last_sync_at
    }

    /// Number of `offline -> connected` transitions observed
    pub fn resyncs_fired(&self) -> u64 {
        self.resyncs_fired
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Move to `to`, rejecting transitions the state machine does not allow
    pub fn transition(&mut self, to: ConnectionState) -> SyncResult<()> {
        if !transition_allowed(&self.state, &to) {
            return Err(SyncError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        if self.state != to {
            info!(from = %self.state, to = %to, "Connection state transition");
        }
        self.state = to;
        CONNECTION_STATE.set(self.state.code());
        Ok(())
    }

    /// Apply a reachability signal from the platform. Ignored while in error.
    pub fn on_reachability(&mut self, reachable: bool) -> SyncResult<ReachabilityChange> {
        let change = match (&self.state, reachable) {
            (ConnectionState::Error { .. }, _) => ReachabilityChange::Unchanged,
            (ConnectionState::Initializing, true) => {
                self.transition(ConnectionState::Connected)?;
                ReachabilityChange::Connected
            }
            (ConnectionState::Offline, true) => {
                self.transition(ConnectionState::Connected)?;
                self.resyncs_fired += 1;
                ReachabilityChange::Reconnected
            }
            (ConnectionState::Connected | ConnectionState::Syncing, true) => ReachabilityChange::Unchanged,
            (ConnectionState::Offline, false) => ReachabilityChange::Unchanged,
            (_, false) => {
                self.active_syncs = 0;
                self.transition(ConnectionState::Offline)?;
                ReachabilityChange::WentOffline
            }
        };
        Ok(change)
    }

    /// Open a sync bracket. Returns false when not connected.
    pub fn begin_sync(&mut self) -> bool {
        match self.state {
            ConnectionState::Connected => {
                self.active_syncs = 1;
                self.state = ConnectionState::Syncing;
                CONNECTION_STATE.set(self.state.code());
                debug!("Sync started");
                true
            }
            ConnectionState::Syncing => {
                self.active_syncs += 1;
                true
            }
            _ => false,
        }
    }

    /// Close a sync bracket opened by [`Self::begin_sync`]
    pub fn end_sync(&mut self) {
        self.active_syncs = self.active_syncs.saturating_sub(1);
        if self.active_syncs == 0 && self.state == ConnectionState::Syncing {
            self.state = ConnectionState::Connected;
            CONNECTION_STATE.set(self.state.code());
            debug!("Sync finished");
        }
    }

    /// Unrecoverable failure; only [`Self::retry`] leaves this state
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(%reason, "Connection entering error state");
        self.active_syncs = 0;
        self.state = ConnectionState::Error { reason };
        CONNECTION_STATE.set(self.state.code());
    }

    /// User-triggered retry: reset to `initializing`, then apply the current
    /// reachability.
    pub fn retry(&mut self, reachable: bool) -> SyncResult<ReachabilityChange> {
        info!(from = %self.state, "Retrying connection");
        self.active_syncs = 0;
        self.quality = ConnectionQuality::Unknown;
        self.last_rtt = None;
        self.state = ConnectionState::Initializing;
        CONNECTION_STATE.set(self.state.code());
        self.on_reachability(reachable)
    }

    pub fn record_ping(&mut self, rtt: Duration) -> ConnectionQuality {
        PING_RTT_SECONDS.observe(rtt.as_secs_f64());
        self.last_rtt = Some(rtt);
        self.quality = ConnectionQuality::classify(rtt, self.config.excellent_rtt, self.config.good_rtt);
        debug!(rtt_ms = rtt.as_millis() as u64, quality = self.quality.as_str(), "Ping measured");
        self.quality
    }

    /// A lost ping degrades quality; the connection state is left alone
    pub fn record_ping_failure(&mut self) -> ConnectionQuality {
        self.quality = ConnectionQuality::Poor;
        self.quality
    }

    pub fn mark_synced(&mut self, now: TimestampMs) {
        self.last_sync_at = Some(self.last_sync_at.map_or(now, |prev| prev.max(now)));
    }

    pub fn freshness(&self, now: TimestampMs) -> DataFreshness {
        let age = self
            .last_sync_at
            .map(|at| Duration::from_millis(now.saturating_sub(at)));
        DataFreshness::classify(age, self.config.current_window, self.config.recent_window)
    }

    /// Re-evaluate freshness; true exactly when it just crossed into stale
    pub fn observe_staleness(&mut self, now: TimestampMs) -> bool {
        let freshness = self.freshness(now);
        let crossed = freshness == DataFreshness::Stale && self.last_freshness != Some(DataFreshness::Stale);
        self.last_freshness = Some(freshness);
        crossed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ConnectionMonitor {
        ConnectionMonitor::new(MonitorConfig::default())
    }

    #[test]
    fn one_resync_per_offline_to_connected() {
        let mut m = monitor();
        assert_eq!(m.on_reachability(true).unwrap(), ReachabilityChange::Connected);
        assert_eq!(m.resyncs_fired(), 0);

        assert_eq!(m.on_reachability(false).unwrap(), ReachabilityChange::WentOffline);
        assert_eq!(m.on_reachability(false).unwrap(), ReachabilityChange::Unchanged);
        assert_eq!(m.on_reachability(true).unwrap(), ReachabilityChange::Reconnected);
        assert_eq!(m.on_reachability(true).unwrap(), ReachabilityChange::Unchanged);
        assert_eq!(m.resyncs_fired(), 1);

        m.on_reachability(false).unwrap();
        assert!(m.on_reachability(true).unwrap().requires_resync());
        assert_eq!(m.resyncs_fired(), 2);
    }

    #[test]
    fn sync_brackets_nest() {
        let mut m = monitor();
        assert!(!m.begin_sync());
        m.on_reachability(true).unwrap();

        assert!(m.begin_sync());
        assert!(m.begin_sync());
        assert_eq!(m.state(), &ConnectionState::Syncing);
        m.end_sync();
        assert_eq!(m.state(), &ConnectionState::Syncing);
        m.end_sync();
        assert_eq!(m.state(), &ConnectionState::Connected);
    }

    #[test]
    fn going_offline_mid_sync_closes_the_bracket() {
        let mut m = monitor();
        m.on_reachability(true).unwrap();
        m.begin_sync();
        m.on_reachability(false).unwrap();
        m.end_sync();
        assert_eq!(m.state(), &ConnectionState::Offline);
    }

    #[test]
    fn rejects_transitions_outside_the_machine() {
        let mut m = monitor();
        m.on_reachability(false).unwrap();
        let err = m.transition(ConnectionState::Syncing).unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));
        assert!(m.transition(ConnectionState::Initializing).is_err());
    }

    #[test]
    fn error_is_sticky_until_retry() {
        let mut m = monitor();
        m.on_reachability(true).unwrap();
        m.fail("generation inconsistency");
        assert!(m.state().is_error());

        assert_eq!(m.on_reachability(false).unwrap(), ReachabilityChange::Unchanged);
        assert_eq!(m.on_reachability(true).unwrap(), ReachabilityChange::Unchanged);
        assert!(m.state().is_error());

        assert_eq!(m.retry(true).unwrap(), ReachabilityChange::Connected);
        assert_eq!(m.state(), &ConnectionState::Connected);
    }

    #[test]
    fn ping_quality_thresholds() {
        let mut m = monitor();
        assert_eq!(m.quality(), ConnectionQuality::Unknown);
        assert_eq!(m.record_ping(Duration::from_millis(40)), ConnectionQuality::Excellent);
        assert_eq!(m.record_ping(Duration::from_millis(100)), ConnectionQuality::Good);
        assert_eq!(m.record_ping(Duration::from_millis(300)), ConnectionQuality::Good);
        assert_eq!(m.record_ping(Duration::from_millis(301)), ConnectionQuality::Poor);

        m.on_reachability(true).unwrap();
        assert_eq!(m.record_ping_failure(), ConnectionQuality::Poor);
        assert_eq!(m.state(), &ConnectionState::Connected);
    }

    #[test]
    fn freshness_windows_and_stale_edge() {
        let mut m = monitor();
        assert_eq!(m.freshness(0), DataFreshness::Stale);
        assert!(m.observe_staleness(0));
        assert!(!m.observe_staleness(1));

        m.mark_synced(10_000);
        assert_eq!(m.freshness(69_999), DataFreshness::Current);
        assert_eq!(m.freshness(70_000), DataFreshness::Recent);
        assert_eq!(m.freshness(310_000), DataFreshness::Recent);
        assert!(!m.observe_staleness(20_000));

        assert!(m.observe_staleness(310_001));
        assert!(!m.observe_staleness(400_000));
    }
}
