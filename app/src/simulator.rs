//! Simulated wearable environment for running the companion without hardware:
//! periodic link outages and a stream of local progress updates.

use companion_sync::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::*;

/// Flip the link between reachable and unreachable every `period`, reporting
/// each flip on `reachability` the way a platform callback would.
pub fn spawn_outages(
    transport: Arc<LoopbackTransport>,
    reachability: watch::Sender<bool>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        let mut reachable = true;
        loop {
            ticker.tick().await;
            reachable = !reachable;
            transport.set_reachable(reachable).await;
            info!(reachable, "Simulated link change");
            if reachability.send(reachable).is_err() {
                debug!("Reachability receiver dropped, stopping outage simulation");
                break;
            }
        }
    })
}

/// Record one completed session per `period`, the way the phone UI would
/// after a workout is logged.
pub fn spawn_progress(
    coordinator: Arc<SyncCoordinator>,
    total_sessions: usize,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        for completed in 1..=total_sessions {
            ticker.tick().await;
            let week = (completed - 1) / sessions_per_week(total_sessions) + 1;

            coordinator
                .record_change("progress.completed_sessions", Some(json!(completed)))
                .await;
            coordinator
                .record_change("progress.current_week", Some(json!(week)))
                .await;
            match coordinator
                .submit(
                    "session_completed",
                    json!({ "completed": completed, "week": week }),
                    SyncPriority::UserProgress,
                )
                .await
            {
                Ok(id) => debug!(%id, completed, week, "Recorded simulated progress"),
                Err(err) => warn!(%err, completed, "Simulated progress rejected"),
            }
        }
        info!(total_sessions, "Simulated program finished");
    })
}

fn sessions_per_week(total_sessions: usize) -> usize {
    (total_sessions / companion_sync::program::PROGRAM_WEEKS as usize).max(1)
}
