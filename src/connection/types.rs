use std::fmt;
use std::net::Ipv4Addr;

use crate::registry::NodeId;
use crate::registry::layout::{ANONYMOUS_NODE, MAX_CONNECTIONS};

/// Index into the connection table.
///
/// Slot 0 is the UDP socket, slot 1 the listening socket (and "this daemon"
/// wherever a master or deputy slot is recorded). Peers start at 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u16);

impl ConnId {
    pub const UDP: ConnId = ConnId(0);
    pub const SELF: ConnId = ConnId(1);
    pub const FIRST_PEER: u16 = 2;

    pub fn is_peer(self) -> bool {
        self.0 >= Self::FIRST_PEER && (self.0 as usize) < MAX_CONNECTIONS
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Accepted or connected, no valid frame seen yet.
    JustConnected,
    Ok,
    /// Last write would have blocked; retried on a later loop pass.
    WriteWait,
    NotAvailable,
    /// Outgoing connect still in flight.
    WaitingAccept,
    Removed,
}

impl ConnStatus {
    /// Code published in the registry's connection snapshot.
    pub fn code(self) -> u8 {
        match self {
            ConnStatus::Ok => 0,
            ConnStatus::WriteWait => 1,
            ConnStatus::NotAvailable => 2,
            ConnStatus::WaitingAccept => 3,
            ConnStatus::Removed => 5,
            ConnStatus::JustConnected => 6,
        }
    }

    /// Frames may be written now.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            ConnStatus::JustConnected | ConnStatus::Ok | ConnStatus::WriteWait
        )
    }

    /// Frames may still be queued; they go out once connected.
    pub fn accepts_frames(self) -> bool {
        self.is_writable() || self == ConnStatus::WaitingAccept
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Udp,
    Listen,
    /// A client process on this host.
    Local,
    /// Another daemon.
    Daemon,
}

impl ConnKind {
    pub fn code(self) -> u8 {
        match self {
            ConnKind::Udp => 0,
            ConnKind::Listen => 1,
            ConnKind::Local => 2,
            ConnKind::Daemon => 3,
        }
    }
}

/// Which node a local connection speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeSlot {
    #[default]
    Unjoined,
    Anonymous,
    Node(NodeId),
}

impl NodeSlot {
    pub fn wire_id(self) -> Option<u16> {
        match self {
            NodeSlot::Unjoined => None,
            NodeSlot::Anonymous => Some(ANONYMOUS_NODE),
            NodeSlot::Node(id) => Some(id.0),
        }
    }

    pub fn node(self) -> Option<NodeId> {
        match self {
            NodeSlot::Node(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnId,
    pub kind: ConnKind,
    pub status: ConnStatus,
    pub peer: Ipv4Addr,
    pub node: NodeSlot,
    pub pid: i32,
    pub priority: i32,
    pub started_at: u64,
    /// The peer daemon finished replicating and announced itself.
    pub ready: bool,
    /// This side opened the connection.
    pub outgoing: bool,
    pub last_heard: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_frames: u32,
    pub tx_frames: u32,
}

impl Connection {
    pub fn new(id: ConnId, kind: ConnKind, peer: Ipv4Addr, now: u64) -> Self {
        Self {
            id,
            kind,
            status: ConnStatus::JustConnected,
            peer,
            node: NodeSlot::Unjoined,
            pid: 0,
            priority: 0,
            started_at: 0,
            ready: false,
            outgoing: false,
            last_heard: now,
            rx_bytes: 0,
            tx_bytes: 0,
            rx_frames: 0,
            tx_frames: 0,
        }
    }

    pub fn is_daemon(&self) -> bool {
        self.kind == ConnKind::Daemon
    }

    pub fn is_local(&self) -> bool {
        self.kind == ConnKind::Local
    }
}
