//! Target State Monitor
//!
//! Background task that drives target state transitions:
//! - online -> probably-offline (half the offline timeout without reports)
//! - probably-offline -> offline (full offline timeout)
//! - offline primary -> switchover to a good secondary
//! - primary needing a resync -> switchover to a good secondary

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics;
use crate::mgmt_states::MgmtTargetStates;

/// Target state monitor configuration
#[derive(Debug, Clone)]
pub struct StateMonitorConfig {
    /// How often to run the monitoring loop
    pub check_interval: Duration,
}

impl StateMonitorConfig {
    /// Check often enough that a target is never more than a sixth of the
    /// offline timeout late in changing state
    pub fn for_offline_timeout(offline_timeout: Duration) -> Self {
        Self {
            check_interval: offline_timeout / 6,
        }
    }
}

impl Default for StateMonitorConfig {
    fn default() -> Self {
        Self::for_offline_timeout(Duration::from_secs(180))
    }
}

/// Counters of state monitor activity
#[derive(Debug, Default, Clone)]
pub struct MonitorMetrics {
    pub targets_marked_offline: u64,
    pub offline_switchovers: u64,
    pub resync_switchovers: u64,
    pub last_check_at: Option<Instant>,
    pub last_check_duration_ms: u64,
    pub check_cycles_completed: u64,
}

pub struct TargetStateMonitor {
    config: StateMonitorConfig,
    states: Arc<MgmtTargetStates>,
    metrics: Arc<RwLock<MonitorMetrics>>,
}

impl TargetStateMonitor {
    pub fn new(config: StateMonitorConfig, states: Arc<MgmtTargetStates>) -> Self {
        Self {
            config,
            states,
            metrics: Arc::new(RwLock::new(MonitorMetrics::default())),
        }
    }

    /// Start the background monitoring loop
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let monitor = self;
        let check_interval = monitor.config.check_interval;

        tokio::spawn(async move {
            let mut check_timer = interval(check_interval);

            info!(
                interval_secs = check_interval.as_secs(),
                offline_timeout_secs = monitor.states.store().config().offline_timeout.as_secs(),
                "Target state monitor started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Target state monitor stopped");
                        break;
                    }
                    _ = check_timer.tick() => {
                        monitor.run_check_cycle(Instant::now()).await;
                    }
                }
            }
        })
    }

    /// Run a single check cycle
    pub async fn run_check_cycle(&self, now: Instant) {
        let start = Instant::now();

        // Step 1: Apply timeouts and switch over from offline primaries
        let report = self.states.run_auto_offline(now);

        // Step 2: Switch over from primaries that need a resync
        let resync_switched = self.states.resolve_primary_resync();

        let duration = start.elapsed();
        {
            let mut m = self.metrics.write().await;
            m.targets_marked_offline += report.newly_offline.len() as u64;
            m.offline_switchovers += report.switched_groups.len() as u64;
            m.resync_switchovers += u64::from(resync_switched);
            m.last_check_at = Some(start);
            m.last_check_duration_ms = duration.as_millis() as u64;
            m.check_cycles_completed += 1;
        }
        metrics::record_monitor_cycle(duration.as_millis() as u64);

        if report.is_modified() || resync_switched {
            info!(
                duration_ms = duration.as_millis(),
                marked_offline = report.newly_offline.len(),
                switched_groups = report.switched_groups.len(),
                resync_switched,
                "Target state check cycle complete with changes"
            );
        } else {
            debug!(
                duration_ms = duration.as_millis(),
                "Target state check cycle complete (no changes)"
            );
        }
    }

    /// Get current metrics
    pub async fn get_metrics(&self) -> MonitorMetrics {
        self.metrics.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beegfs_core::{CombinedTargetState, ConsistencyState, ReachabilityState};
    use beegfs_topology::{MirrorBuddyGroupMapper, TargetStateConfig, TargetStateStore};

    fn states() -> Arc<MgmtTargetStates> {
        let store = Arc::new(TargetStateStore::new(TargetStateConfig::from_secs(60)).unwrap());
        let groups = Arc::new(MirrorBuddyGroupMapper::new());
        groups.map_mirror_buddy_group(1, 1, 2, false).unwrap();
        Arc::new(MgmtTargetStates::new(store, groups))
    }

    #[test]
    fn test_monitor_config_default() {
        let config = StateMonitorConfig::default();
        assert_eq!(config.check_interval.as_secs(), 30);
        assert_eq!(
            StateMonitorConfig::for_offline_timeout(Duration::from_secs(60)).check_interval,
            Duration::from_secs(10)
        );
    }

    #[tokio::test]
    async fn test_check_cycle_updates_metrics() {
        let states = states();
        let start = Instant::now();
        states.store().set_state(
            1,
            CombinedTargetState::new(ReachabilityState::Online, ConsistencyState::Good),
        );
        states.store().report_online_at(2, start + Duration::from_secs(50));

        let monitor = TargetStateMonitor::new(StateMonitorConfig::default(), states.clone());
        monitor.run_check_cycle(start + Duration::from_secs(70)).await;

        let m = monitor.get_metrics().await;
        assert_eq!(m.check_cycles_completed, 1);
        assert_eq!(m.targets_marked_offline, 1);
        assert_eq!(m.offline_switchovers, 1);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_cancel() {
        let monitor = Arc::new(TargetStateMonitor::new(
            StateMonitorConfig {
                check_interval: Duration::from_millis(10),
            },
            states(),
        ));
        let cancel = CancellationToken::new();
        let handle = monitor.clone().start(cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(monitor.get_metrics().await.check_cycles_completed >= 1);
    }
}
