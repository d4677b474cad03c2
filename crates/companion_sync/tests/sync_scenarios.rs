use companion_sync::coordinator::{ReconcileOutcome, ResyncTrigger};
use companion_sync::monitor::ReachabilityChange;
use companion_sync::prelude::*;
use companion_sync::program::{SessionRecord, PROGRAM_WEEKS};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

struct Fixture {
    coordinator: SyncCoordinator,
    transport: Arc<LoopbackTransport>,
    peer: Arc<Mutex<PeerInbox>>,
}

fn fixture_with_peer(peer: PeerInbox) -> Fixture {
    let peer = Arc::new(Mutex::new(peer));
    let transport = Arc::new(LoopbackTransport::new(peer.clone()));
    let coordinator = SyncCoordinator::new(
        SyncConfig::default(),
        transport.clone(),
        Arc::new(ProgramGenerator),
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::new(1_700_000_000_000)),
    )
    .unwrap();
    Fixture {
        coordinator,
        transport,
        peer,
    }
}

fn fixture() -> Fixture {
    fixture_with_peer(PeerInbox::with_generator(Arc::new(ProgramGenerator)))
}

fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Generator that disagrees with the phone on session notes
struct DivergentGenerator;

impl SessionGenerator for DivergentGenerator {
    fn generate(&self, level: TrainingLevel, frequency: u8, week: u8, day: u8) -> SessionRecord {
        let mut session = ProgramGenerator.generate(level, frequency, week, day);
        session.notes = Some("different build".to_string());
        session
    }
}

#[tokio::test(start_paused = true)]
async fn intermediate_three_days_delivers_thirty_six_sessions() {
    let f = fixture();
    f.coordinator.start().await.unwrap();

    let ready = f
        .coordinator
        .select_program(TrainingLevel::Intermediate, 3)
        .await
        .unwrap();
    assert_eq!(ready.compilation_id.as_str(), "intermediate-3d");
    assert_eq!(ready.session_count, 36);
    assert_eq!(ready.total_batches, 9);
    assert!(ready.failed_batches.is_empty());
    assert_eq!(f.coordinator.status().progress, 1.0);

    let peer = f.peer.lock().await;
    let program = peer.last_program().unwrap();
    assert!(program.is_complete());
    assert_eq!(program.items.len(), 36);
    for session in &program.items {
        assert!((1..=PROGRAM_WEEKS).contains(&session.week));
        assert!((1..=3).contains(&session.day));
    }
    assert_eq!(peer.local_digest(), peer.announced());
    drop(peer);

    assert_eq!(
        f.coordinator.cached_value("session.w12d3").await.map(|v| v["week"].clone()),
        Some(json!(12))
    );
}

#[tokio::test]
async fn unreachable_submit_is_queued_and_silent() {
    let f = fixture();
    f.transport.set_reachable(false).await;
    f.coordinator.start().await.unwrap();

    let before = f.coordinator.status().pending_operations;
    f.coordinator
        .submit("next_session", json!({"id": "w02d1"}), SyncPriority::NextSession)
        .await
        .unwrap();
    assert_eq!(f.coordinator.status().pending_operations, before + 1);
    assert!(f.peer.lock().await.operations().is_empty());
}

#[tokio::test]
async fn each_reconnect_fires_exactly_one_resync() {
    let f = fixture();
    let mut events = f.coordinator.events();
    f.coordinator.start().await.unwrap();

    for round in 1..=3u64 {
        f.transport.set_reachable(false).await;
        f.coordinator.handle_reachability(false).await.unwrap();
        f.coordinator
            .record_change("progress.current_week", Some(json!(round)))
            .await;

        f.transport.set_reachable(true).await;
        assert_eq!(
            f.coordinator.handle_reachability(true).await.unwrap(),
            ReachabilityChange::Reconnected
        );
        // Repeated signals without an offline period are not transitions
        f.coordinator.handle_reachability(true).await.unwrap();
        f.coordinator.poll_reachability().await.unwrap();
        assert_eq!(f.coordinator.resync_count().await, round);
    }

    let reconnect_resyncs = drain_events(&mut events)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                SyncEvent::ResyncFired {
                    trigger: ResyncTrigger::Reconnect,
                    ..
                }
            )
        })
        .count();
    assert_eq!(reconnect_resyncs, 3);
    assert_eq!(
        f.peer.lock().await.cache().get("progress.current_week"),
        Some(&json!(3))
    );
}

#[tokio::test]
async fn server_wins_reconciliation_pushes_remote_week() {
    let remote = Arc::new(InMemoryRemoteState::new());
    let f = fixture();
    let coordinator = f.coordinator.with_remote_source(remote.clone());
    coordinator.start().await.unwrap();

    coordinator
        .record_change("progress.current_week", Some(json!(4)))
        .await;
    assert_eq!(coordinator.cached_value("progress.current_week").await, Some(json!(4)));

    remote.set("progress.current_week", json!(5)).await;
    let outcome = coordinator.reconcile().await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Completed {
            conflicts: 1,
            changes: 1
        }
    );

    assert_eq!(coordinator.cached_value("progress.current_week").await, Some(json!(5)));
    assert_eq!(coordinator.local_value("progress.current_week").await, Some(json!(5)));
    assert_eq!(
        f.peer.lock().await.cache().get("progress.current_week"),
        Some(&json!(5))
    );

    // Nothing left to push, nothing left to resolve
    let again = coordinator.reconcile().await.unwrap();
    assert_eq!(
        again,
        ReconcileOutcome::Completed {
            conflicts: 0,
            changes: 0
        }
    );
}

#[tokio::test]
async fn delta_resync_is_quiescent_after_delivery() {
    let f = fixture();
    f.transport.set_reachable(false).await;
    f.coordinator.start().await.unwrap();

    f.coordinator.record_change("settings.units", Some(json!("yards"))).await;
    f.coordinator.record_change("notes.today", Some(json!("tight calves"))).await;
    f.coordinator.record_change("notes.today", None).await;

    f.transport.set_reachable(true).await;
    f.coordinator.handle_reachability(true).await.unwrap();

    let report = f.coordinator.delta_resync(ResyncTrigger::LocalChange).await;
    assert_eq!(report.attempted, 0);

    let peer = f.peer.lock().await;
    assert_eq!(peer.cache().get("settings.units"), Some(&json!("yards")));
    assert!(!peer.cache().contains("notes.today"));
}

#[tokio::test(start_paused = true)]
async fn generation_inconsistency_needs_retry() {
    let f = fixture_with_peer(PeerInbox::with_generator(Arc::new(DivergentGenerator)));
    f.coordinator.start().await.unwrap();
    f.coordinator
        .select_program(TrainingLevel::Intermediate, 3)
        .await
        .unwrap();

    let peer_digest = f.peer.lock().await.local_digest().cloned().unwrap();
    let err = f
        .coordinator
        .verify_peer_program(&peer_digest)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::GenerationInconsistency { .. }));
    assert!(f.coordinator.connection_state().await.is_error());

    // Reachability alone does not clear the error
    f.coordinator.handle_reachability(true).await.unwrap();
    assert!(f.coordinator.connection_state().await.is_error());

    f.transport.clear_sent().await;
    assert_eq!(
        f.coordinator.retry().await.unwrap(),
        ReachabilityChange::Connected
    );
    assert_eq!(
        f.coordinator.connection_state().await,
        ConnectionState::Connected
    );
    let resent = f
        .transport
        .sent_messages()
        .await
        .iter()
        .filter(|(_, m)| m.kind() == "training_sessions_batch")
        .count();
    assert_eq!(resent, 9);
}

#[tokio::test(start_paused = true)]
async fn peer_reported_digest_is_checked_on_receive() {
    let f = fixture();
    f.coordinator.start().await.unwrap();
    f.coordinator
        .select_program(TrainingLevel::Beginner, 1)
        .await
        .unwrap();

    let mut digest = f.coordinator.program_digest().await.unwrap();
    let matching = companion_sync::SyncMessage::training_sync(&digest, TrainingLevel::Beginner, 1, 0);
    assert!(f.coordinator.receive(&matching.encode().unwrap()).await.is_ok());

    digest.digest ^= 1;
    let diverged = companion_sync::SyncMessage::training_sync(&digest, TrainingLevel::Beginner, 1, 0);
    assert!(f.coordinator.receive(&diverged.encode().unwrap()).await.is_err());
    assert!(f.coordinator.status().connection.is_error());
}
