//! BeeGFS Storage Daemon Library
//!
//! Components of a storage server that take part in buddy mirroring:
//! - Configuration and the local storage targets
//! - Registration and heartbeats with the management daemon
//! - InternodeSyncer keeping the local topology in line with mgmtd
//! - Buddy mirror resync of local primaries, and the secondary side of it
//! - Prometheus metrics

pub mod buddy_comm;
pub mod chunk_locks;
pub mod chunk_store;
pub mod config;
pub mod handlers;
pub mod internode_syncer;
pub mod metrics;
pub mod mgmt_client;
pub mod resync;
pub mod targets;

pub use buddy_comm::{BuddyCommClient, TcpBuddyCommClient};
pub use chunk_locks::{ChunkLockGuard, ChunkLockStore};
pub use chunk_store::{ChunkStore, DirEntry, EntryMeta, FsChunkStore};
pub use config::{ConfigError, StorageConfig};
pub use handlers::StorageMessageHandler;
pub use internode_syncer::{
    detect_topology_changes, CycleReport, InternodeSyncer, LocalNicSource, NicSource, SyncError,
    SyncerConfig, TopologyChangePolicy,
};
pub use metrics::SyncMetrics;
pub use mgmt_client::{MgmtClient, TcpMgmtClient};
pub use resync::{BuddyResyncer, JobStats, JobStatus, ResyncConfig, ResyncerState};
pub use targets::StorageTargets;

use anyhow::{bail, Context};
use beegfs_core::{
    Backoff, BeegfsError, MessagingConfig, NicAddress, NodeType, NumNodeId, Result,
};
use beegfs_topology::{Node, Topology};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long to wait for mgmtd to list a mgmt node after registering
const MGMT_NODE_WAIT: Duration = Duration::from_secs(300);

/// All parts of a running storage daemon
pub struct StorageDaemon {
    pub config: StorageConfig,
    pub topology: Arc<Topology>,
    pub targets: Arc<StorageTargets>,
    pub chunk_store: Arc<dyn ChunkStore>,
    pub locks: Arc<ChunkLockStore>,
    pub mgmt: Arc<dyn MgmtClient>,
    pub syncer: Arc<InternodeSyncer>,
    pub resyncer: Arc<BuddyResyncer>,
    nic_source: Arc<dyn NicSource>,
    metrics: SyncMetrics,
}

impl StorageDaemon {
    /// Daemon talking TCP to the configured management daemon
    pub fn new(config: StorageConfig) -> anyhow::Result<Self> {
        let mgmt_addr = config.mgmt.resolve()?;
        Self::with_clients(
            config,
            Arc::new(TcpMgmtClient::new(mgmt_addr, MessagingConfig::default())),
            Arc::new(TcpBuddyCommClient::default()),
            Arc::new(LocalNicSource),
        )
    }

    pub fn with_clients(
        config: StorageConfig,
        mgmt: Arc<dyn MgmtClient>,
        buddy: Arc<dyn BuddyCommClient>,
        nic_source: Arc<dyn NicSource>,
    ) -> anyhow::Result<Self> {
        let topology = Arc::new(Topology::new(config.sys.target_state_config())?);
        let targets = Arc::new(StorageTargets::from_config(&config.targets));
        let chunk_store: Arc<dyn ChunkStore> = Arc::new(FsChunkStore::new(targets.clone()));
        let locks = Arc::new(ChunkLockStore::new());
        let metrics = SyncMetrics::new(config.node.string_id.clone());

        let mut syncer = InternodeSyncer::new(
            config.syncer_config(),
            topology.clone(),
            mgmt.clone(),
            nic_source.clone(),
            metrics.clone(),
        );
        if let Some(first) = targets.target_ids().first() {
            syncer = syncer.with_local_target(*first);
        }

        let resyncer = Arc::new(BuddyResyncer::new(
            config.resync_config(),
            topology.clone(),
            targets.clone(),
            chunk_store.clone(),
            buddy,
            locks.clone(),
        ));

        Ok(Self {
            config,
            topology,
            targets,
            chunk_store,
            locks,
            mgmt,
            syncer: Arc::new(syncer),
            resyncer,
            nic_source,
            metrics,
        })
    }

    pub fn message_handler(&self) -> Arc<StorageMessageHandler> {
        Arc::new(StorageMessageHandler::new(
            self.topology.clone(),
            self.targets.clone(),
            self.chunk_store.clone(),
            self.locks.clone(),
            self.mgmt.clone(),
        ))
    }

    /// Register the local node and its targets with mgmtd, retrying while
    /// it is unreachable. Returns the numeric ID of the local node.
    pub async fn register(&self, cancel: &CancellationToken) -> anyhow::Result<NumNodeId> {
        let node = &self.config.node;
        let nics = self.local_nics().await;

        let info = Node::new(
            NumNodeId(node.num_id),
            node.string_id.clone(),
            NodeType::Storage,
            node.port,
            node.port,
            nics.clone(),
        )
        .to_info();

        let num_id = retry_while_unreachable(cancel, "node registration", || {
            self.mgmt.register_node(info.clone())
        })
        .await?;
        if !num_id.is_valid() {
            bail!("management daemon rejected node {}", node.string_id);
        }

        self.topology.storage_nodes.set_local_node(Node::new(
            num_id,
            node.string_id.clone(),
            NodeType::Storage,
            node.port,
            node.port,
            nics,
        ));
        info!(string_id = %node.string_id, num_id = %num_id, "Node registered");

        for target_id in self.targets.target_ids() {
            let assigned = retry_while_unreachable(cancel, "target registration", || {
                self.mgmt.register_target(target_id, num_id)
            })
            .await
            .with_context(|| format!("registering target {}", target_id))?;
            if assigned != target_id {
                bail!(
                    "management daemon assigned ID {} to target {}",
                    assigned,
                    target_id
                );
            }
            info!(target_id, "Target registered");
        }

        Ok(num_id)
    }

    async fn local_nics(&self) -> Vec<NicAddress> {
        match self.nic_source.list_interfaces().await {
            Ok(nics) if !nics.is_empty() => nics,
            Ok(_) => {
                warn!("No usable network interfaces found, advertising loopback");
                vec![NicAddress::ethernet("lo", IpAddr::V4(Ipv4Addr::LOCALHOST))]
            }
            Err(e) => {
                warn!(error = %e, "Unable to list network interfaces, advertising loopback");
                vec![NicAddress::ethernet("lo", IpAddr::V4(Ipv4Addr::LOCALHOST))]
            }
        }
    }

    /// Periodic heartbeat carrying the current local node info
    fn start_heartbeat(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mgmt = self.mgmt.clone();
        let topology = self.topology.clone();
        let metrics = self.metrics.clone();
        let period = Duration::from_secs(self.config.sync.interval_secs);

        tokio::spawn(async move {
            let mut timer = interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        let Some(local) = topology.storage_nodes.local_node() else {
                            continue;
                        };
                        match mgmt.heartbeat(local.to_info()).await {
                            Ok(accepted) => {
                                metrics.record_heartbeat(accepted);
                                if !accepted {
                                    warn!("Heartbeat rejected by management daemon");
                                }
                            }
                            Err(e) => {
                                metrics.record_heartbeat(false);
                                warn!(error = %e, "Heartbeat failed");
                            }
                        }
                    }
                }
            }
            debug!("Heartbeat loop stopped");
        })
    }

    /// Register, sync and serve until `cancel` fires or the syncer gives up
    pub async fn run(&self, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
        // Step 1: Register with mgmtd
        self.register(&cancel).await?;

        // Step 2: Wait until the mgmt node is known
        self.syncer.wait_for_mgmt_node(&cancel, MGMT_NODE_WAIT).await?;

        // Step 3: Start background tasks
        let heartbeat_handle = self.start_heartbeat(cancel.clone());
        let syncer_handle = self.syncer.clone().start(cancel.clone());
        let resync_handle = self.resyncer.clone().start(
            Duration::from_secs(self.config.resync.check_interval_secs.max(1)),
            cancel.clone(),
        );

        info!(
            string_id = %self.config.node.string_id,
            targets = self.targets.len(),
            "Storage daemon running"
        );

        // Step 4: Serve until shutdown
        let served = beegfs_core::serve(listener, self.message_handler(), cancel.clone()).await;

        cancel.cancel();
        if let Err(e) = heartbeat_handle.await {
            error!(error = %e, "Heartbeat task failed");
        }
        if let Err(e) = resync_handle.await {
            error!(error = %e, "Resync task failed");
        }
        match syncer_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => error!(error = %e, "Internode syncer task failed"),
        }

        served.map_err(Into::into)
    }
}

/// Run `op` until it succeeds or fails with something other than a
/// communication error, waiting per the retry table in between
async fn retry_while_unreachable<T, F, Fut>(
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new();
    loop {
        match op().await {
            Err(e) if e.is_communication() => {
                let delay = backoff.next_delay();
                warn!(
                    what,
                    attempts = backoff.attempts(),
                    retry_ms = delay.as_millis(),
                    error = %e,
                    "Management daemon unreachable, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BeegfsError::Interrupted),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            other => return other,
        }
    }
}
