//! The seam between the daemon core and real (or simulated) sockets.

use std::io;
use std::net::Ipv4Addr;

use bytes::Bytes;

use crate::connection::ConnId;
use crate::wire::{CodecError, Frame};

/// Where a datagram goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpTarget {
    /// The broadcast address and every configured seed.
    Discovery,
    Peer(Ipv4Addr),
}

/// Socket operations the daemon needs. All of them return immediately;
/// outcomes come back later as [`NetEvent`]s.
pub trait Transport {
    fn send_datagram(&mut self, target: UdpTarget, data: &[u8]);

    /// Starts connecting `conn` to the daemon at `ip`. Answered by
    /// `Connected` or `Closed`.
    fn connect(&mut self, conn: ConnId, ip: Ipv4Addr);

    /// Non-blocking write; `WouldBlock` when the socket is full.
    fn write(&mut self, conn: ConnId, data: &[u8]) -> io::Result<usize>;

    fn close(&mut self, conn: ConnId);
}

#[derive(Debug)]
pub enum NetEvent {
    Datagram { from: Ipv4Addr, data: Bytes },
    Connected(ConnId),
    Frame { conn: ConnId, frame: Frame },
    Malformed { conn: ConnId, error: CodecError },
    /// Peer hung up, a read failed, or a connect attempt gave up.
    Closed(ConnId),
}
