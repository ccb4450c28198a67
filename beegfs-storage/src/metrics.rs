//! Prometheus metrics for the storage daemon
//!
//! Covers the InternodeSyncer cycle and buddy mirror resync jobs. Recording
//! is a no-op until [`install_exporter`] has installed a recorder.

use beegfs_core::NodeType;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric names as constants
pub mod names {
    // Syncer metrics
    pub const SYNC_CYCLES_TOTAL: &str = "beegfs_storage_sync_cycles_total";
    pub const SYNC_FAILURES_TOTAL: &str = "beegfs_storage_sync_failures_total";
    pub const SYNC_CONSECUTIVE_FAILURES: &str = "beegfs_storage_sync_consecutive_failures";
    pub const SYNC_CYCLE_DURATION: &str = "beegfs_storage_sync_cycle_duration_seconds";
    pub const NODES_ADDED_TOTAL: &str = "beegfs_storage_nodes_added_total";
    pub const NODES_REMOVED_TOTAL: &str = "beegfs_storage_nodes_removed_total";
    pub const KNOWN_NODES: &str = "beegfs_storage_known_nodes";
    pub const TOPOLOGY_CHANGES_TOTAL: &str = "beegfs_storage_topology_changes_total";

    // Resync metrics
    pub const RESYNC_JOBS_RUNNING: &str = "beegfs_storage_resync_jobs_running";
    pub const RESYNC_JOBS_TOTAL: &str = "beegfs_storage_resync_jobs_total";
    pub const RESYNC_DIRS_SYNCED: &str = "beegfs_storage_resync_dirs_synced_total";
    pub const RESYNC_FILES_SYNCED: &str = "beegfs_storage_resync_files_synced_total";
    pub const RESYNC_ERRORS: &str = "beegfs_storage_resync_errors_total";

    // Registration metrics
    pub const HEARTBEAT_SUCCESS: &str = "beegfs_storage_heartbeat_success_total";
    pub const HEARTBEAT_FAILURE: &str = "beegfs_storage_heartbeat_failure_total";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    describe_counter!(names::SYNC_CYCLES_TOTAL, "Completed topology sync cycles");
    describe_counter!(
        names::SYNC_FAILURES_TOTAL,
        "Sync cycles skipped because a download failed"
    );
    describe_gauge!(
        names::SYNC_CONSECUTIVE_FAILURES,
        "Failed sync cycles since the last success"
    );
    describe_histogram!(
        names::SYNC_CYCLE_DURATION,
        "Duration of a topology sync cycle in seconds"
    );
    describe_counter!(names::NODES_ADDED_TOTAL, "Nodes added by the syncer");
    describe_counter!(names::NODES_REMOVED_TOTAL, "Nodes removed by the syncer");
    describe_gauge!(names::KNOWN_NODES, "Nodes currently known per type");
    describe_counter!(
        names::TOPOLOGY_CHANGES_TOTAL,
        "Removed or remapped nodes, targets and buddy groups seen by the syncer"
    );

    describe_gauge!(names::RESYNC_JOBS_RUNNING, "Buddy resync jobs currently running");
    describe_counter!(names::RESYNC_JOBS_TOTAL, "Finished buddy resync jobs by status");
    describe_counter!(names::RESYNC_DIRS_SYNCED, "Directories reconciled by resync jobs");
    describe_counter!(names::RESYNC_FILES_SYNCED, "Chunks pushed by resync jobs");
    describe_counter!(names::RESYNC_ERRORS, "Errors seen by resync jobs");

    describe_counter!(names::HEARTBEAT_SUCCESS, "Heartbeats acknowledged by mgmtd");
    describe_counter!(names::HEARTBEAT_FAILURE, "Heartbeats that failed");
}

/// Install the Prometheus recorder and serve `/metrics` on `addr`
pub fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(addr = %addr, "Prometheus exporter listening");
    Ok(())
}

/// Recorder for InternodeSyncer statistics
#[derive(Debug, Clone)]
pub struct SyncMetrics {
    node_id: String,
}

impl SyncMetrics {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    pub fn record_cycle(&self, duration: Duration) {
        counter!(names::SYNC_CYCLES_TOTAL, "node_id" => self.node_id.clone()).increment(1);
        histogram!(names::SYNC_CYCLE_DURATION, "node_id" => self.node_id.clone())
            .record(duration.as_secs_f64());
        gauge!(names::SYNC_CONSECUTIVE_FAILURES, "node_id" => self.node_id.clone()).set(0.0);
    }

    pub fn record_failure(&self, consecutive: u32) {
        counter!(names::SYNC_FAILURES_TOTAL, "node_id" => self.node_id.clone()).increment(1);
        gauge!(names::SYNC_CONSECUTIVE_FAILURES, "node_id" => self.node_id.clone())
            .set(consecutive as f64);
    }

    pub fn record_node_changes(&self, node_type: NodeType, added: usize, removed: usize, known: usize) {
        let labels = [
            ("node_id", self.node_id.clone()),
            ("type", node_type.to_string()),
        ];
        if added > 0 {
            counter!(names::NODES_ADDED_TOTAL, &labels).increment(added as u64);
        }
        if removed > 0 {
            counter!(names::NODES_REMOVED_TOTAL, &labels).increment(removed as u64);
        }
        gauge!(names::KNOWN_NODES, &labels).set(known as f64);
    }

    pub fn record_topology_changes(&self, count: usize) {
        counter!(names::TOPOLOGY_CHANGES_TOTAL, "node_id" => self.node_id.clone())
            .increment(count as u64);
    }

    pub fn record_heartbeat(&self, success: bool) {
        let name = if success {
            names::HEARTBEAT_SUCCESS
        } else {
            names::HEARTBEAT_FAILURE
        };
        counter!(name, "node_id" => self.node_id.clone()).increment(1);
    }
}

// ============================================================================
// Resync Recording Helpers
// ============================================================================

pub fn resync_job_started() {
    gauge!(names::RESYNC_JOBS_RUNNING).increment(1.0);
}

/// Record a finished job; `status` is the lowercase job status
pub fn resync_job_finished(status: &str, dirs_synced: u64, files_synced: u64, errors: u64) {
    gauge!(names::RESYNC_JOBS_RUNNING).decrement(1.0);
    counter!(names::RESYNC_JOBS_TOTAL, "status" => status.to_string()).increment(1);
    counter!(names::RESYNC_DIRS_SYNCED).increment(dirs_synced);
    counter!(names::RESYNC_FILES_SYNCED).increment(files_synced);
    counter!(names::RESYNC_ERRORS).increment(errors);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        init_metrics();
        let metrics = SyncMetrics::new("storage01");
        metrics.record_cycle(Duration::from_millis(12));
        metrics.record_failure(3);
        metrics.record_node_changes(NodeType::Meta, 1, 2, 4);
        metrics.record_heartbeat(false);
        resync_job_started();
        resync_job_finished("success", 3, 4, 0);
    }
}
