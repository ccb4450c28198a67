//! Prometheus Metrics for the management daemon
//!
//! Uses the `metrics` crate with the prometheus exporter's built-in HTTP
//! listener. Recording is a no-op until a recorder is installed.

use beegfs_core::NodeType;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder and serve `/metrics` on `addr`
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    Ok(())
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a node registration by outcome ("added", "rejected")
pub fn record_registration(outcome: &str) {
    counter!("beegfs_mgmtd_registrations_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn set_registered_nodes(node_type: NodeType, count: usize) {
    gauge!("beegfs_mgmtd_registered_nodes", "type" => node_type.to_string()).set(count as f64);
}

pub fn record_targets_offline(count: usize) {
    counter!("beegfs_mgmtd_targets_offline_total").increment(count as u64);
}

pub fn record_switchover() {
    counter!("beegfs_mgmtd_buddy_switchovers_total").increment(1);
}

pub fn record_monitor_cycle(duration_ms: u64) {
    counter!("beegfs_mgmtd_monitor_cycles_total").increment(1);
    gauge!("beegfs_mgmtd_monitor_cycle_duration_ms").set(duration_ms as f64);
}
