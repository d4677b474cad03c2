use crate::remote::JsonRemoteState;
use crate::simulator::{spawn_outages, spawn_progress};
use clap::Parser;
use companion_sync::prelude::*;
use companion_sync::program::MAX_FREQUENCY;
use companion_sync::spawn_scheduler;
use eyre::Result;
use futures::pin_mut;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::{future::Future, sync::Arc};
use tokio::sync::{broadcast, watch};
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

#[derive(Parser, Debug)]
#[command(author, about = "Training companion sync engine", long_about = None)]
pub struct App {
    /// TOML configuration file; `COMPANION_SYNC_*` variables override it
    #[arg(long = "config", env = "COMPANION_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for persisted sync state; in-memory only when unset
    #[arg(long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, default_value = "intermediate")]
    pub level: TrainingLevel,

    /// Training days per week
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=MAX_FREQUENCY as i64))]
    pub frequency: u8,

    #[arg(long = "conflict-policy")]
    pub conflict_policy: Option<ConflictPolicy>,

    #[arg(
        long = "full-log-context",
        env = "FULL_LOG_CONTEXT",
        default_value_t = false
    )]
    pub full_log_context: bool,

    #[clap(long, help = "Port for the metrics server")]
    pub metrics_port: Option<u16>,

    /// JSON document holding the authoritative remote state
    #[arg(long = "remote-state")]
    pub remote_state: Option<PathBuf>,

    /// Toggle simulated link outages at this period
    #[arg(long = "outage-every-secs")]
    pub outage_every_secs: Option<u64>,

    /// Simulated one-way latency of the immediate channel
    #[arg(long = "peer-latency-ms", default_value_t = 20)]
    pub peer_latency_ms: u64,

    /// Record a simulated completed session at this period
    #[arg(long = "progress-every-secs")]
    pub progress_every_secs: Option<u64>,
}

impl App {
    pub fn run(self) -> Result<()> {
        self.init_tracing();
        let tokio_runtime = tokio_runtime()?;
        tokio_runtime.block_on(run_until_ctrl_c(self.execute()))?;
        Ok(())
    }

    fn init_tracing(&self) {
        let rust_log_level = std::env::var("RUST_LOG")
            .ok()
            .and_then(|level| Level::from_str(&level).ok())
            .unwrap_or(Level::INFO);

        let filter = if self.full_log_context {
            EnvFilter::builder().parse_lossy(rust_log_level.as_str())
        } else {
            let filter_tag = format!("companion={rust_log_level},companion_sync={rust_log_level}");
            EnvFilter::builder().parse_lossy(filter_tag.as_str())
        };

        let main_layer = tracing_subscriber::fmt::layer().with_target(true);

        let layers = if rust_log_level == Level::DEBUG || rust_log_level == Level::TRACE {
            vec![main_layer
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed()]
        } else {
            vec![main_layer.with_filter(filter).boxed()]
        };

        tracing_subscriber::registry().with(layers).init();
    }

    fn load_config(&self) -> Result<SyncConfig> {
        let mut config = SyncConfig::load_layered(self.config.as_deref())?;
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = Some(dir.clone());
        }
        if let Some(policy) = self.conflict_policy {
            config.reconciliation.policy = policy;
        }
        Ok(config)
    }

    async fn execute(self) -> Result<()> {
        let config = self.load_config()?;

        let store: Arc<dyn StateStore> = match &config.storage.data_dir {
            Some(dir) => {
                let store = JsonFileStore::open(dir)?;
                info!(path = %store.path().display(), "Persisting sync state");
                Arc::new(store)
            }
            None => {
                warn!("No data directory configured, sync state will not survive restarts");
                Arc::new(MemoryStore::new())
            }
        };

        let generator = Arc::new(ProgramGenerator);
        let peer = Arc::new(tokio::sync::Mutex::new(PeerInbox::with_generator(
            generator.clone(),
        )));
        let transport = Arc::new(LoopbackTransport::new(peer.clone()));
        transport.set_latency(Duration::from_millis(self.peer_latency_ms));

        let mut coordinator = SyncCoordinator::new(
            config,
            transport.clone(),
            generator,
            store,
            Arc::new(SystemClock),
        )?;
        if let Some(path) = &self.remote_state {
            info!(path = %path.display(), "Reconciling against remote state file");
            coordinator = coordinator.with_remote_source(Arc::new(JsonRemoteState::new(path)));
        }
        let coordinator = Arc::new(coordinator);

        crate::metrics::start_server(self.metrics_port, coordinator.clone()).await;
        spawn_status_logger(coordinator.subscribe());
        spawn_event_logger(coordinator.events());

        coordinator.start().await?;

        let ready = coordinator.select_program(self.level, self.frequency).await?;
        info!(
            compilation_id = %ready.compilation_id,
            sessions = ready.session_count,
            batches = ready.total_batches,
            durable = ready.durable_batches,
            "Program selected"
        );

        let peer_digest = peer.lock().await.local_digest().cloned();
        if let Some(digest) = peer_digest {
            if let Err(err) = coordinator.verify_peer_program(&digest).await {
                error!(%err, "Wearable generated a different program, retrying");
                coordinator.retry().await?;
            }
        }

        let (reachability_tx, reachability_rx) = watch::channel(true);
        let _scheduler = spawn_scheduler(coordinator.clone(), reachability_rx);

        // held until shutdown so the scheduler keeps listening
        let _reachability = match self.outage_every_secs {
            Some(secs) => {
                info!(period_secs = secs, "Simulating link outages");
                spawn_outages(transport, reachability_tx, Duration::from_secs(secs));
                None
            }
            None => Some(reachability_tx),
        };

        if let Some(secs) = self.progress_every_secs {
            spawn_progress(coordinator.clone(), ready.session_count, Duration::from_secs(secs));
        }

        futures::future::pending::<()>().await;
        Ok(())
    }
}

fn spawn_status_logger(mut status: watch::Receiver<SyncStatus>) {
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            debug!(
                connection = %snapshot.connection,
                progress = snapshot.progress,
                pending = snapshot.pending_operations,
                quality = snapshot.quality.as_str(),
                freshness = snapshot.freshness.as_str(),
                "Sync status"
            );
        }
    });
}

fn spawn_event_logger(mut events: broadcast::Receiver<SyncEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::StateChanged { from, to }) => {
                    info!(%from, %to, "Connection state changed")
                }
                Ok(SyncEvent::ResyncFired { trigger, delivered }) => {
                    info!(trigger = trigger.as_str(), delivered, "Delta resync")
                }
                Ok(SyncEvent::ReconciliationCompleted { conflicts, changes }) => {
                    info!(conflicts, changes, "Reconciliation completed")
                }
                Ok(SyncEvent::PeerOperation(operation)) => {
                    info!(id = %operation.id, kind = %operation.kind, "Operation from wearable")
                }
                Ok(event) => debug!(?event, "Sync event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

// when we add more complexity we should adopt a task manager
// to handle thread spawning and graceful shutdown
pub fn tokio_runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

async fn run_until_ctrl_c<F, E>(fut: F) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
    E: Send + Sync + 'static + From<std::io::Error>,
{
    let ctrl_c = tokio::signal::ctrl_c();

    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let sigterm = stream.recv();
    pin_mut!(sigterm, ctrl_c, fut);

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
        },
        _ = sigterm => {
            info!("Received SIGTERM");
        },
        res = fut => res?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_select_intermediate_three_days() {
        let app = App::try_parse_from(["companion"]).unwrap();
        assert_eq!(app.level, TrainingLevel::Intermediate);
        assert_eq!(app.frequency, 3);
        assert!(app.data_dir.is_none());
    }

    #[test]
    fn frequency_is_bounded() {
        assert!(App::try_parse_from(["companion", "--frequency", "0"]).is_err());
        assert!(App::try_parse_from(["companion", "--frequency", "8"]).is_err());
        let app = App::try_parse_from(["companion", "--level", "elite", "--frequency", "7"]).unwrap();
        assert_eq!(app.level, TrainingLevel::Elite);
    }

    #[test]
    fn cli_overrides_configured_storage_and_policy() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::try_parse_from([
            "companion",
            "--data-dir",
            dir.path().to_str().unwrap(),
            "--conflict-policy",
            "field-merge",
        ])
        .unwrap();

        let config = app.load_config().unwrap();
        assert_eq!(config.storage.data_dir.as_deref(), Some(dir.path()));
        assert_eq!(config.reconciliation.policy, ConflictPolicy::FieldMerge);
    }
}
