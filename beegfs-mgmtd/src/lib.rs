//! BeeGFS Management Daemon Library
//!
//! The management daemon is the authority on cluster topology:
//! - Node registration and heartbeats, with the new-server policy
//! - Storage target registration
//! - Target reachability timeouts and consistency states
//! - Buddy group switchover when a primary fails or needs a resync
//! - Serving the topology to every other daemon

pub mod config;
pub mod metrics;
pub mod mgmt_states;
pub mod registration;
pub mod service;
pub mod state_monitor;

pub use config::{ConfigError, MgmtConfig};
pub use mgmt_states::{AutoOfflineReport, MgmtTargetStates};
pub use registration::{HeartbeatBroadcaster, LoggingNotifier, NodeNotifier, RegistrationHandler};
pub use service::MgmtMessageService;
pub use state_monitor::{MonitorMetrics, StateMonitorConfig, TargetStateMonitor};

use beegfs_core::{MessagingConfig, NodeType, NumNodeId};
use beegfs_topology::{Node, Topology};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// All parts of a running management daemon
pub struct MgmtDaemon {
    pub config: MgmtConfig,
    pub topology: Arc<Topology>,
    pub registration: Arc<RegistrationHandler>,
    pub states: Arc<MgmtTargetStates>,
    pub monitor: Arc<TargetStateMonitor>,
}

impl MgmtDaemon {
    pub fn new(config: MgmtConfig) -> beegfs_core::Result<Self> {
        let topology = Arc::new(Topology::new(config.sys.target_state_config())?);

        // Peers reach the management daemon through its configured address,
        // so its own node entry carries no interfaces
        topology.mgmt_nodes.set_local_node(Node::new(
            NumNodeId(config.mgmt.num_id),
            config.mgmt.string_id.clone(),
            NodeType::Mgmt,
            config.mgmt.port,
            config.mgmt.port,
            Vec::new(),
        ));

        let notifier = Arc::new(HeartbeatBroadcaster::new(
            topology.clone(),
            MessagingConfig::default(),
        ));
        let registration = Arc::new(RegistrationHandler::new(
            topology.clone(),
            config.sys.allow_new_servers,
            notifier,
        ));

        let states = Arc::new(MgmtTargetStates::new(
            topology.target_states.clone(),
            topology.storage_buddy_groups.clone(),
        ));

        let monitor_config = match config.monitor.interval_secs {
            Some(secs) => StateMonitorConfig {
                check_interval: Duration::from_secs(secs.max(1)),
            },
            None => StateMonitorConfig::for_offline_timeout(config.sys.target_offline_timeout()),
        };
        let monitor = Arc::new(TargetStateMonitor::new(monitor_config, states.clone()));

        Ok(Self {
            config,
            topology,
            registration,
            states,
            monitor,
        })
    }

    pub fn message_service(&self) -> Arc<MgmtMessageService> {
        Arc::new(MgmtMessageService::new(
            self.topology.clone(),
            self.registration.clone(),
            self.states.clone(),
        ))
    }

    /// Run the state monitor and serve requests until `cancel` fires
    pub async fn run(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> beegfs_core::Result<()> {
        let monitor_handle = self.monitor.clone().start(cancel.clone());

        info!(
            string_id = %self.config.mgmt.string_id,
            allow_new_servers = self.config.sys.allow_new_servers,
            "Management daemon running"
        );

        let result = beegfs_core::serve(listener, self.message_service(), cancel.clone()).await;

        cancel.cancel();
        if let Err(e) = monitor_handle.await {
            error!(error = %e, "Target state monitor task failed");
        }

        result
    }
}
