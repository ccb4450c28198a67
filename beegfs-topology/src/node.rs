//! Node descriptors and their connection pools

use beegfs_core::{NicAddress, NicCapabilities, NicType, NodeInfo, NodeType, NumNodeId};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared handle to a registered node; dropping it releases the reference
pub type NodeHandle = Arc<Node>;

#[derive(Debug, Clone)]
struct PoolState {
    port_udp: u16,
    port_tcp: u16,
    nics: Vec<NicAddress>,
    local_caps: NicCapabilities,
}

/// Addresses and transport preferences used to reach one node
#[derive(Debug)]
pub struct ConnectionPool {
    state: RwLock<PoolState>,
}

impl ConnectionPool {
    fn new(port_udp: u16, port_tcp: u16, nics: Vec<NicAddress>) -> Self {
        Self {
            state: RwLock::new(PoolState {
                port_udp,
                port_tcp,
                nics,
                local_caps: NicCapabilities::default(),
            }),
        }
    }

    /// Replace ports and interfaces; returns whether anything changed
    pub fn update_interfaces(&self, port_udp: u16, port_tcp: u16, nics: &[NicAddress]) -> bool {
        let mut state = self.state.write();
        let changed =
            state.port_udp != port_udp || state.port_tcp != port_tcp || state.nics != nics;

        if changed {
            state.port_udp = port_udp;
            state.port_tcp = port_tcp;
            state.nics = nics.to_vec();
        }

        changed
    }

    pub fn set_local_nic_caps(&self, caps: NicCapabilities) {
        self.state.write().local_caps = caps;
    }

    pub fn local_nic_caps(&self) -> NicCapabilities {
        self.state.read().local_caps
    }

    /// First interface usable with the local transport capabilities
    pub fn preferred_addr(&self) -> Option<SocketAddr> {
        let state = self.state.read();
        state
            .nics
            .iter()
            .find(|nic| match nic.kind {
                NicType::Ethernet => true,
                NicType::Rdma => state.local_caps.supports_rdma,
                NicType::Sdp => state.local_caps.supports_sdp,
            })
            .map(|nic| SocketAddr::new(nic.addr, state.port_tcp))
    }
}

/// A registered daemon
#[derive(Debug)]
pub struct Node {
    num_id: NumNodeId,
    string_id: String,
    node_type: NodeType,
    conn_pool: ConnectionPool,
    last_heartbeat: Mutex<Instant>,
    active: AtomicBool,
}

impl Node {
    pub fn new(
        num_id: NumNodeId,
        string_id: impl Into<String>,
        node_type: NodeType,
        port_udp: u16,
        port_tcp: u16,
        nics: Vec<NicAddress>,
    ) -> Self {
        Self {
            num_id,
            string_id: string_id.into(),
            node_type,
            conn_pool: ConnectionPool::new(port_udp, port_tcp, nics),
            last_heartbeat: Mutex::new(Instant::now()),
            active: AtomicBool::new(false),
        }
    }

    pub fn from_info(info: &NodeInfo) -> Self {
        Self::new(
            info.num_id,
            info.string_id.clone(),
            info.node_type,
            info.port_udp,
            info.port_tcp,
            info.nics.clone(),
        )
    }

    pub fn to_info(&self) -> NodeInfo {
        let state = self.conn_pool.state.read();
        NodeInfo {
            num_id: self.num_id,
            string_id: self.string_id.clone(),
            node_type: self.node_type,
            port_udp: state.port_udp,
            port_tcp: state.port_tcp,
            nics: state.nics.clone(),
        }
    }

    pub fn num_id(&self) -> NumNodeId {
        self.num_id
    }

    pub fn string_id(&self) -> &str {
        &self.string_id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// "<string id> [ID: <num id>]", for log messages
    pub fn typed_id(&self) -> String {
        format!("{} {} [ID: {}]", self.node_type, self.string_id, self.num_id)
    }

    pub fn port_udp(&self) -> u16 {
        self.conn_pool.state.read().port_udp
    }

    pub fn port_tcp(&self) -> u16 {
        self.conn_pool.state.read().port_tcp
    }

    pub fn nics(&self) -> Vec<NicAddress> {
        self.conn_pool.state.read().nics.clone()
    }

    pub fn conn_pool(&self) -> &ConnectionPool {
        &self.conn_pool
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.conn_pool.preferred_addr()
    }

    pub fn update_last_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    /// Refresh ports and interfaces; returns whether anything changed
    pub fn update_interfaces(&self, port_udp: u16, port_tcp: u16, nics: &[NicAddress]) -> bool {
        self.conn_pool.update_interfaces(port_udp, port_tcp, nics)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub(crate) fn set_node_type(&mut self, node_type: NodeType) {
        self.node_type = node_type;
    }
}
