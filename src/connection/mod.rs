//! Connection Manager Module
//!
//! Tracks every socket a daemon holds, from the UDP discovery socket to
//! client and peer-daemon TCP streams, and owns the single outbound queue
//! all frames pass through.
//!
//! ## Core Mechanisms
//! - **Slots**: A fixed table indexed by `ConnId`; slot 0 is UDP, slot 1 is this daemon.
//! - **Status machine**: `JustConnected -> Ok <-> WriteWait`, with `NotAvailable`,
//!   `WaitingAccept` and `Removed` as the non-deliverable states.
//! - **Write queue**: One attempt per loop pass, partial writes resume, registry
//!   pushes to the same peer merge while unsent.
//! - **Wake-ups**: Local clients are poked through a `ProcessProbe` after each frame.

pub mod notify;
pub mod queue;
pub mod table;
pub mod types;

pub use notify::{ChannelProbe, Delivery, ProcessProbe, SignalProbe};
pub use queue::{Flushed, Payload, QueueEntry, StoreRegion, WriteQueue};
pub use table::ConnectionTable;
pub use types::{ConnId, ConnKind, ConnStatus, Connection, NodeSlot};
