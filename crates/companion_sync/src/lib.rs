//! Phone-to-wearable synchronization engine
//!
//! Keeps a generated training program and its progress state consistent with
//! a paired wearable over an intermittently reachable, size-constrained link.

pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod delta;
pub mod error;
pub mod guard;
pub mod inbox;
pub mod messages;
pub mod metrics;
pub mod monitor;
pub mod program;
pub mod queue;
pub mod reconcile;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod types;

pub use config::{ConfigError, SyncConfig, Validate};
pub use coordinator::{
    DrainOutcome, ProgramReady, ReconcileOutcome, ResyncReport, ResyncTrigger, SyncCoordinator,
    SyncEvent, SyncStatus,
};
pub use error::{SyncError, SyncResult};
pub use messages::SyncMessage;
pub use scheduler::{spawn_scheduler, SchedulerHandle};

pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::SyncConfig;
    pub use crate::coordinator::{SyncCoordinator, SyncEvent, SyncStatus};
    pub use crate::error::{SyncError, SyncResult};
    pub use crate::inbox::PeerInbox;
    pub use crate::program::{ProgramGenerator, SessionGenerator, TrainingLevel};
    pub use crate::reconcile::{ConflictPolicy, InMemoryRemoteState, RemoteStateSource};
    pub use crate::store::{JsonFileStore, MemoryStore, StateStore};
    pub use crate::transport::{LoopbackTransport, PeerTransport};
    pub use crate::types::{
        ConnectionQuality, ConnectionState, DataFreshness, SyncOperation, SyncPriority,
    };
}
