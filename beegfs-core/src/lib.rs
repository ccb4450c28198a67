//! BeeGFS Core Library
//!
//! Types shared by the management and storage daemons:
//! - Node, target and buddy group identifiers and state enums
//! - The common error type
//! - Staged retry delays for polling loops
//! - Request/response messages and their TCP transport

pub mod error;
pub mod msg;
pub mod net;
pub mod retry;
pub mod types;

pub use error::{BeegfsError, Result};
pub use msg::{
    BuddyGroupLists, ChunkDirPage, EntryKind, MessageType, NetMessage, NodeInfo,
    TargetStateLists,
};
pub use net::{request_response, serve, MessageHandler, MessagingConfig};
pub use retry::{retry_delay, retry_delay_ms, Backoff};
pub use types::{
    CombinedTargetState, ConsistencyState, GroupId, MirrorRouting, NicAddress, NicCapabilities,
    NicType, NodeType, NumNodeId, ReachabilityState, TargetId,
};

/// Default TCP/UDP port of the management daemon
pub const DEFAULT_MGMT_PORT: u16 = 8008;

/// Default TCP/UDP port of a storage daemon
pub const DEFAULT_STORAGE_PORT: u16 = 8003;
