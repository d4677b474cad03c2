//! Prometheus metrics for the sync engine

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, Histogram,
    IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};

// Create a new registry named `companion_sync`
lazy_static! {
    pub static ref SYNC_REGISTRY: Registry =
        Registry::new_custom(Some("companion_sync".to_string()), None).unwrap();
}

lazy_static! {
    pub static ref PENDING_OPERATIONS: IntGauge = register_int_gauge_with_registry!(
        "pending_operations",
        "Operations buffered in the sync queue",
        SYNC_REGISTRY
    )
    .unwrap();
    pub static ref QUEUE_ENQUEUED: IntCounterVec = register_int_counter_vec_with_registry!(
        "queue_enqueued_total",
        "Operations added to the sync queue",
        &["priority"],
        SYNC_REGISTRY
    )
    .unwrap();
    pub static ref QUEUE_DELIVERED: IntCounterVec = register_int_counter_vec_with_registry!(
        "queue_delivered_total",
        "Operations removed from the sync queue after delivery",
        &["priority"],
        SYNC_REGISTRY
    )
    .unwrap();
    pub static ref TRANSPORT_SENDS: IntCounterVec = register_int_counter_vec_with_registry!(
        "transport_sends_total",
        "Messages handed to the transport by channel and outcome",
        &["channel", "outcome"],
        SYNC_REGISTRY
    )
    .unwrap();
    pub static ref PING_RTT_SECONDS: Histogram = register_histogram_with_registry!(
        "ping_rtt_seconds",
        "Round-trip time of latency pings",
        vec![0.025, 0.05, 0.1, 0.2, 0.3, 0.5, 1.0, 2.5],
        SYNC_REGISTRY
    )
    .unwrap();
    pub static ref BATCH_CHUNKS: IntCounterVec = register_int_counter_vec_with_registry!(
        "batch_chunks_total",
        "Batch chunks attempted by delivery channel",
        &["outcome"],
        SYNC_REGISTRY
    )
    .unwrap();
    pub static ref DELTA_RESYNCS: IntCounterVec = register_int_counter_vec_with_registry!(
        "delta_resyncs_total",
        "Delta resync passes by trigger",
        &["trigger"],
        SYNC_REGISTRY
    )
    .unwrap();
    pub static ref RECONCILIATION_CONFLICTS: IntCounter = register_int_counter_with_registry!(
        "reconciliation_conflicts_total",
        "Keys that differed between the remote store and the local cache",
        SYNC_REGISTRY
    )
    .unwrap();
    pub static ref CONNECTION_STATE: IntGauge = register_int_gauge_with_registry!(
        "connection_state",
        "Current connection state (0=initializing, 1=connected, 2=syncing, 3=offline, 4=error)",
        SYNC_REGISTRY
    )
    .unwrap();
    pub static ref SYNC_ERRORS: IntCounterVec = register_int_counter_vec_with_registry!(
        "errors_total",
        "Errors observed by the sync engine by category",
        &["category"],
        SYNC_REGISTRY
    )
    .unwrap();
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&SYNC_REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_renders_prefixed_names() {
        QUEUE_ENQUEUED.with_label_values(&["metadata"]).inc();
        let text = gather_text().unwrap();
        assert!(text.contains("companion_sync_queue_enqueued_total"));
    }
}
