//! Identifiers and state enums shared by every daemon

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Storage target ID. 0 is never a valid target.
pub type TargetId = u16;

/// Mirror buddy group ID. 0 is never a valid group.
pub type GroupId = u16;

/// Numeric node ID, stable for the lifetime of a node. 0 is invalid.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NumNodeId(pub u32);

impl NumNodeId {
    pub const INVALID: NumNodeId = NumNodeId(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for NumNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NumNodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Kind of daemon a node entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Meta,
    Storage,
    Mgmt,
    Client,
}

impl NodeType {
    /// Server types are subject to the new-server registration policy
    pub fn is_server(&self) -> bool {
        matches!(self, Self::Meta | Self::Storage)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meta => write!(f, "meta"),
            Self::Storage => write!(f, "storage"),
            Self::Mgmt => write!(f, "mgmt"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Network interface transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NicType {
    Ethernet,
    Rdma,
    Sdp,
}

/// One advertised network interface of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NicAddress {
    pub name: String,
    pub addr: IpAddr,
    pub kind: NicType,
}

impl NicAddress {
    pub fn ethernet(name: impl Into<String>, addr: IpAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            kind: NicType::Ethernet,
        }
    }
}

/// Transport capabilities of the local node, applied to connection pools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicCapabilities {
    pub supports_rdma: bool,
    pub supports_sdp: bool,
}

impl NicCapabilities {
    pub fn from_nics(nics: &[NicAddress]) -> Self {
        Self {
            supports_rdma: nics.iter().any(|n| n.kind == NicType::Rdma),
            supports_sdp: nics.iter().any(|n| n.kind == NicType::Sdp),
        }
    }
}

/// Whether a target answers heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReachabilityState {
    Online,
    /// Probably offline: reports missed, but not yet for the full offline timeout
    POffline,
    Offline,
}

impl fmt::Display for ReachabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::POffline => write!(f, "probably-offline"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Whether a target's mirrored data matches its buddy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsistencyState {
    Good,
    NeedsResync,
    Bad,
}

impl fmt::Display for ConsistencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Good => write!(f, "good"),
            Self::NeedsResync => write!(f, "needs-resync"),
            Self::Bad => write!(f, "bad"),
        }
    }
}

/// How a primary treats a mirrored write towards a secondary in a given state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorRouting {
    /// Forward normally
    Forward,
    /// Forward, but tag the request so the secondary knows to reconcile
    ForwardTagged,
    /// Do not forward; the secondary is excluded from routing
    Skip,
}

/// Reachability and consistency of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CombinedTargetState {
    pub reachability: ReachabilityState,
    pub consistency: ConsistencyState,
}

impl CombinedTargetState {
    pub fn new(reachability: ReachabilityState, consistency: ConsistencyState) -> Self {
        Self {
            reachability,
            consistency,
        }
    }

    /// State assigned to a freshly mapped target before its first report
    pub fn initial() -> Self {
        Self::new(ReachabilityState::POffline, ConsistencyState::Good)
    }

    pub fn is_online_and_good(&self) -> bool {
        self.reachability == ReachabilityState::Online
            && self.consistency == ConsistencyState::Good
    }

    pub fn mirror_routing(&self) -> MirrorRouting {
        if self.reachability == ReachabilityState::Offline {
            return MirrorRouting::Skip;
        }

        match self.consistency {
            ConsistencyState::Good => MirrorRouting::Forward,
            ConsistencyState::NeedsResync => MirrorRouting::ForwardTagged,
            ConsistencyState::Bad => MirrorRouting::Skip,
        }
    }
}

impl fmt::Display for CombinedTargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.reachability, self.consistency)
    }
}
