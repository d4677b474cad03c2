//! Periodic task driver
//!
//! One loop drives the queue drain, the latency ping and the freshness check
//! on their own intervals and reacts to reachability changes as they arrive.
//! Each pass is spawned so a slow send never delays the other timers; the
//! coordinator's guards keep drain and reconciliation passes exclusive.

use crate::config::SyncConfig;
use crate::coordinator::SyncCoordinator;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::*;

/// Running scheduler; dropping it leaves the loop running until
/// [`SchedulerHandle::shutdown`] is called.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            error!(%err, "Sync scheduler task failed");
        }
    }
}

/// Spawn the scheduler. `reachability` carries platform reachability signals;
/// the transport is also polled on every drain tick in case a signal is missed.
pub fn spawn_scheduler(
    coordinator: Arc<SyncCoordinator>,
    reachability: watch::Receiver<bool>,
) -> SchedulerHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let config = coordinator.config().clone();
    let task = tokio::spawn(run(coordinator, config, reachability, shutdown_rx));
    SchedulerHandle { shutdown, task }
}

async fn run(
    coordinator: Arc<SyncCoordinator>,
    config: SyncConfig,
    mut reachability: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut drain = interval(config.queue.drain_interval);
    let mut ping = interval(config.monitor.ping_interval);
    let mut freshness = interval(config.monitor.freshness_check_interval);
    for timer in [&mut drain, &mut ping, &mut freshness] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    }
    let mut reachability_open = true;

    info!(
        drain_ms = config.queue.drain_interval.as_millis() as u64,
        ping_ms = config.monitor.ping_interval.as_millis() as u64,
        freshness_ms = config.monitor.freshness_check_interval.as_millis() as u64,
        "Sync scheduler started"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = reachability.changed(), if reachability_open => {
                if changed.is_err() {
                    debug!("Reachability source closed, relying on polling");
                    reachability_open = false;
                    continue;
                }
                let reachable = *reachability.borrow_and_update();
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    if let Err(err) = coordinator.handle_reachability(reachable).await {
                        warn!(%err, "Reachability change rejected");
                    }
                });
            }
            _ = drain.tick() => {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    if let Err(err) = coordinator.poll_reachability().await {
                        warn!(%err, "Reachability poll rejected");
                    }
                    coordinator.drain_queue().await;
                });
            }
            _ = ping.tick() => {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    coordinator.measure_latency().await;
                });
            }
            _ = freshness.tick() => {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    coordinator.check_freshness().await;
                });
            }
        }
    }

    info!("Sync scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::inbox::PeerInbox;
    use crate::program::ProgramGenerator;
    use crate::store::MemoryStore;
    use crate::transport::LoopbackTransport;
    use crate::types::{ConnectionState, SyncPriority};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn drains_on_interval_after_reconnect() {
        let transport = Arc::new(LoopbackTransport::new(Arc::new(Mutex::new(PeerInbox::new()))));
        transport.set_reachable(false).await;
        let coordinator = Arc::new(
            SyncCoordinator::new(
                SyncConfig::default(),
                transport.clone(),
                Arc::new(ProgramGenerator),
                Arc::new(MemoryStore::new()),
                Arc::new(ManualClock::new(0)),
            )
            .unwrap(),
        );
        coordinator.start().await.unwrap();
        coordinator.submit("week", json!(2), SyncPriority::UserProgress).await.unwrap();

        let (reachable_tx, reachable_rx) = watch::channel(false);
        let handle = spawn_scheduler(coordinator.clone(), reachable_rx);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(coordinator.pending_operations().await, 1);

        transport.set_reachable(true).await;
        reachable_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(coordinator.pending_operations().await, 0);
        assert_eq!(coordinator.connection_state().await, ConnectionState::Connected);
        assert_eq!(coordinator.resync_count().await, 1);
        handle.shutdown().await;
    }
}
