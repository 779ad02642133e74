//! Per-instance daemon state and its event entry points.
//!
//! A `Daemon` owns everything one daemon process knows: its registry copy and
//! arena, the connection table, the write queue, the election state, the
//! schedule. It never blocks and never touches a socket directly; the driver
//! feeds it [`NetEvent`]s and the current time, and it answers through its
//! [`Transport`].

use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::net::{NetEvent, Transport, UdpTarget};
use super::schedule::{CAST_TICK, SILENT_SWEEPS, SWEEP_INTERVAL, Schedule, Task};
use crate::connection::{
    ConnId, ConnKind, ConnStatus, ConnectionTable, Delivery, Flushed, ProcessProbe, QueueEntry,
    WriteQueue,
};
use crate::dispatch::RefusedLog;
use crate::fatal;
use crate::membership::{Election, Role};
use crate::registry::layout::*;
use crate::registry::{DataArena, Store};
use crate::replication::SyncCursor;
use crate::wire::codes::{Command, is_application};
use crate::wire::frame::HEADER_LEN;
use crate::wire::{Datagram, Frame, NO_NODE};

pub(crate) fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Identity of this daemon.
#[derive(Debug, Clone)]
pub struct Settings {
    pub ip: Ipv4Addr,
    pub priority: i32,
    pub pid: i32,
    /// Fixes the discovery jitter, for reproducible runs.
    pub jitter_seed: Option<u64>,
}

pub struct Daemon<T: Transport> {
    pub(crate) settings: Settings,
    pub(crate) transport: T,
    pub(crate) store: Store,
    pub(crate) arena: DataArena,
    pub(crate) conns: ConnectionTable,
    pub(crate) queue: WriteQueue,
    pub(crate) election: Election,
    pub(crate) sync: SyncCursor,
    pub(crate) schedule: Schedule,
    /// Local connection of each node registered through this daemon.
    pub(crate) node_conns: Vec<Option<ConnId>>,
    /// Next broadcast time of each segment owned on this host.
    pub(crate) cast_due: Vec<Option<u64>>,
    pub(crate) refused: RefusedLog,
    pub(crate) probe: Box<dyn ProcessProbe>,
    pub(crate) started_at: u64,
    pub(crate) now: u64,
    seq: u16,
    stopping: bool,
}

impl<T: Transport> Daemon<T> {
    pub fn new(
        settings: Settings,
        transport: T,
        store: Store,
        arena: DataArena,
        probe: Box<dyn ProcessProbe>,
        now: u64,
    ) -> Self {
        let mut schedule = Schedule::new();
        schedule.push(now, Task::DiscoveryBroadcast);
        schedule.push(now + millis(SWEEP_INTERVAL), Task::LivenessSweep);
        schedule.push(now + millis(CAST_TICK), Task::SegmentCast);

        info!(
            "Daemon {} starting (priority {}, pid {})",
            settings.ip, settings.priority, settings.pid
        );
        let mut daemon = Self {
            election: Election::new(settings.jitter_seed),
            conns: ConnectionTable::new(settings.ip, now),
            settings,
            transport,
            store,
            arena,
            queue: WriteQueue::new(),
            sync: SyncCursor::new(),
            schedule,
            node_conns: vec![None; MAX_NODES],
            cast_due: vec![None; MAX_SEGMENTS],
            refused: RefusedLog::new(),
            probe,
            started_at: now,
            now,
            seq: 0,
            stopping: false,
        };
        daemon.publish_status();
        daemon
    }

    // -- accessors ----------------------------------------------------------

    pub fn ip(&self) -> Ipv4Addr {
        self.settings.ip
    }

    pub fn role(&self) -> Role {
        self.election.role()
    }

    pub fn election(&self) -> &Election {
        &self.election
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn arena(&self) -> &DataArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut DataArena {
        &mut self.arena
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.conns
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Earliest scheduled task.
    pub fn next_deadline(&self) -> Option<u64> {
        self.schedule.next_at()
    }

    pub fn is_ready(&self) -> bool {
        self.election.ready
    }

    // -- entry points -------------------------------------------------------

    /// Registers an accepted TCP connection. Peers on this host are
    /// clients, anything else is another daemon.
    pub fn accept(&mut self, peer: Ipv4Addr) -> Option<ConnId> {
        let kind = if peer == self.settings.ip || peer.is_loopback() {
            ConnKind::Local
        } else {
            ConnKind::Daemon
        };
        match self.conns.open(kind, peer, self.now) {
            Some(id) => {
                debug!("Accepted {:?} connection {} from {}", kind, id, peer);
                Some(id)
            }
            None => {
                warn!("Connection table full, refusing {}", peer);
                None
            }
        }
    }

    pub fn handle(&mut self, event: NetEvent) {
        match event {
            NetEvent::Datagram { from, data } => self.on_datagram(from, &data),
            NetEvent::Connected(conn) => {
                if self.conns.status(conn) == ConnStatus::WaitingAccept {
                    self.conns.set_status(conn, ConnStatus::JustConnected);
                    debug!("Connected {}", conn);
                }
            }
            NetEvent::Frame { conn, frame } => self.on_frame(conn, frame),
            NetEvent::Malformed { conn, error } => {
                warn!("Malformed frame on {}: {}", conn, error);
                self.close_conn(conn, "malformed frame");
            }
            NetEvent::Closed(conn) => self.lost_conn(conn, "closed"),
        }
        self.after_event();
    }

    /// Advances the clock, fires every due task and drains the write queue.
    pub fn poll(&mut self, now: u64) {
        self.now = self.now.max(now);
        while let Some(task) = self.schedule.pop_due(self.now) {
            self.fire(task);
        }
        self.after_event();
        self.flush();
    }

    /// Writes queued frames until the queue is empty or every remaining
    /// destination would block.
    pub fn flush(&mut self) {
        for _ in 0..=self.queue.len() {
            let mut sent = 0usize;
            let Self {
                queue,
                store,
                arena,
                conns,
                transport,
                ..
            } = self;
            let flushed = queue.flush_one(
                store.bytes(),
                arena.bytes(),
                |c| conns.status(c).is_writable(),
                |c| conns.status(c) == ConnStatus::WriteWait,
                |c, data| {
                    let written = transport.write(c, data);
                    if let Ok(n) = &written {
                        sent += *n;
                    }
                    written
                },
            );
            match flushed {
                Flushed::Idle => break,
                Flushed::Partial(c) => self.wrote(c, sent, false),
                Flushed::Complete(c) => self.wrote(c, sent, true),
                Flushed::WouldBlock(c) => {
                    if self.conns.status(c) == ConnStatus::WriteWait {
                        break;
                    }
                    self.conns.set_status(c, ConnStatus::WriteWait);
                }
                Flushed::Failed(c, e) => {
                    warn!("Write to {} failed: {}", c, e);
                    self.close_conn(c, "write failed");
                }
            }
        }
    }

    fn wrote(&mut self, conn: ConnId, sent: usize, complete: bool) {
        let Some(c) = self.conns.get_mut(conn) else {
            return;
        };
        if c.status == ConnStatus::WriteWait {
            c.status = ConnStatus::Ok;
        }
        c.tx_bytes += sent as u64;
        if !complete {
            return;
        }
        c.tx_frames += 1;
        if c.is_local() && c.pid > 0 {
            let pid = c.pid;
            if self.probe.notify(pid) == Delivery::Gone {
                self.close_conn(conn, "client process gone");
            }
        }
    }

    // -- helpers for the handlers -------------------------------------------

    pub(crate) fn next_seq(&mut self) -> u16 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// A fresh frame from this daemon.
    pub(crate) fn frame(&mut self, cmd: Command) -> Frame {
        let seq = self.next_seq();
        Frame::new(cmd.code()).with_seq(seq)
    }

    pub(crate) fn send(&mut self, conn: ConnId, frame: Frame) {
        self.send_entry(QueueEntry::new(conn, frame));
    }

    pub(crate) fn send_entry(&mut self, entry: QueueEntry) {
        let status = self.conns.status(entry.conn);
        if !entry.conn.is_peer() || !status.accepts_frames() {
            debug!(
                "Dropping {} for {} ({:?})",
                entry.frame.describe(),
                entry.conn,
                status
            );
            return;
        }
        debug!("send {} => {}", entry.frame.describe(), entry.conn);
        self.queue.push(entry);
    }

    pub(crate) fn send_udp(&mut self, target: UdpTarget, datagram: Datagram) {
        match datagram.encode() {
            Ok(bytes) => self.transport.send_datagram(target, &bytes),
            Err(e) => warn!("Cannot encode {:?} datagram: {}", datagram.command, e),
        }
    }

    pub(crate) fn is_local(&self, conn: ConnId) -> bool {
        self.conns.get(conn).is_some_and(|c| c.is_local())
    }

    /// Host a request arriving on `conn` speaks for.
    pub(crate) fn host_of(&self, conn: ConnId) -> Option<Ipv4Addr> {
        let c = self.conns.get(conn)?;
        Some(if c.is_local() { self.settings.ip } else { c.peer })
    }

    /// Address of whoever holds a master or deputy slot.
    pub(crate) fn slot_ip(&self, slot: Option<ConnId>) -> Option<Ipv4Addr> {
        match slot? {
            ConnId::SELF => Some(self.settings.ip),
            conn => self.conns.get(conn).map(|c| c.peer),
        }
    }

    pub(crate) fn close_conn(&mut self, conn: ConnId, reason: &str) {
        if self.conns.get(conn).is_none() {
            return;
        }
        self.transport.close(conn);
        self.lost_conn(conn, reason);
    }

    /// Forgets a connection and runs the departure or failover it implies.
    fn lost_conn(&mut self, conn: ConnId, reason: &str) {
        let Some(c) = self.conns.remove(conn) else {
            return;
        };
        self.queue.drop_conn(conn);
        self.schedule
            .cancel(|t| matches!(t, Task::PenaltyReply { conn: pc, .. } if *pc == conn));
        info!("Connection {} to {} gone: {}", conn, c.peer, reason);

        match c.kind {
            ConnKind::Local => self.client_gone(&c),
            ConnKind::Daemon => self.daemon_lost(conn, c.peer),
            ConnKind::Udp | ConnKind::Listen => {}
        }
    }

    pub(crate) fn stop(&mut self, reason: &str) {
        if !self.stopping {
            info!("Stopping daemon: {}", reason);
            self.stopping = true;
        }
    }

    // -- dispatch -------------------------------------------------------------

    fn on_datagram(&mut self, from: Ipv4Addr, data: &[u8]) {
        if from == self.settings.ip {
            return;
        }
        match Datagram::decode(data) {
            Ok(Some(datagram)) => match datagram.command {
                Command::NewDaemon => self.on_new_daemon(from, datagram),
                Command::AckDaemon => self.on_ack_daemon(from, datagram),
                Command::UsrCpyMem => self.on_usr_cpy_mem(from, datagram),
                other => debug!("Ignoring {} datagram from {}", other.name(), from),
            },
            Ok(None) => debug!("Foreign datagram from {}", from),
            Err(e) => warn!("Bad datagram from {}: {}", from, e),
        }
    }

    fn on_frame(&mut self, conn: ConnId, frame: Frame) {
        let Some(c) = self.conns.get_mut(conn) else {
            debug!("Frame for vanished connection {}", conn);
            return;
        };
        c.last_heard = self.now;
        c.rx_frames += 1;
        c.rx_bytes += (HEADER_LEN + 4 * frame.params.len() + frame.body.len()) as u64;
        if c.status == ConnStatus::JustConnected {
            c.status = ConnStatus::Ok;
        }

        let valid_node = |n: u16| n == NO_NODE || n <= ANONYMOUS_NODE;
        if !valid_node(frame.src) || !valid_node(frame.dest) {
            fatal!("invalid node id in {} from {}", frame.describe(), conn);
        }
        debug!("recv {} <= {}", frame.describe(), conn);

        match Command::from_code(frame.code) {
            Some(Command::NewClient) => self.on_new_client(conn, frame),
            Some(Command::DelClient) => self.on_del_client(conn, frame),
            Some(Command::AllocMem) => self.on_alloc_mem(conn, frame),
            Some(Command::OpenMem) => self.on_open_mem(conn, frame),
            Some(Command::CloseMem) => self.on_close_mem(conn, frame),
            Some(Command::FlushMem) => self.on_flush_mem(conn, frame),
            Some(Command::NewReq) => self.on_new_req(conn, frame),
            Some(Command::DelReq) => self.on_del_req(conn, frame),
            Some(Command::KillDaemon) => self.on_kill_daemon(conn, frame),
            Some(Command::Ping) => {
                let pong = self.frame(Command::Pong);
                self.send(conn, pong);
            }
            Some(Command::Pong) | Some(Command::Nop) => {}
            Some(Command::NewMaster) => self.on_new_master(conn, frame),
            Some(Command::Ready) => self.on_ready(conn, frame),
            Some(Command::ReqCpyMem) => self.on_req_cpy_mem(conn, frame),
            Some(Command::SysCpyMem) => self.on_sys_cpy_mem(conn, frame),
            Some(udp @ (Command::NewDaemon | Command::AckDaemon | Command::UsrCpyMem)) => {
                warn!("{} arrived over TCP from {}", udp.name(), conn);
                self.close_conn(conn, "datagram command over TCP");
            }
            None if is_application(frame.code) => self.on_application(conn, frame),
            None => fatal!("unknown request code {:#06x} from {}", frame.code, conn),
        }
    }

    fn fire(&mut self, task: Task) {
        match task {
            Task::DiscoveryBroadcast => self.on_discovery_tick(),
            Task::LivenessSweep => self.on_liveness_sweep(),
            Task::SegmentCast => self.on_segment_cast(),
            Task::PenaltyReply { conn, pid, frame } => {
                if self.conns.get(conn).is_some_and(|c| c.pid == pid) {
                    self.send(conn, frame);
                }
            }
        }
    }

    /// Pings daemons, drops the silent ones and clients whose process is gone.
    fn on_liveness_sweep(&mut self) {
        let silent_after = SILENT_SWEEPS * millis(SWEEP_INTERVAL);
        let mut silent = Vec::new();
        let mut alive = Vec::new();
        let mut vanished = Vec::new();
        for c in self.conns.peers() {
            if c.is_daemon() && c.status.is_writable() {
                if self.now.saturating_sub(c.last_heard) > silent_after {
                    silent.push(c.id);
                } else {
                    alive.push(c.id);
                }
            } else if c.is_local() && c.pid > 0 && !self.probe.is_alive(c.pid) {
                vanished.push(c.id);
            }
        }

        for conn in silent {
            self.close_conn(conn, "silent for three sweeps");
        }
        for conn in vanished {
            self.close_conn(conn, "client process gone");
        }
        for conn in alive {
            let ping = self.frame(Command::Ping);
            self.send(conn, ping);
        }
        self.schedule
            .push(self.now + millis(SWEEP_INTERVAL), Task::LivenessSweep);
    }

    fn after_event(&mut self) {
        self.push_touches();
        self.publish_status();
    }

    /// Mirrors the election state and connection table into the registry's
    /// local tail for observers on this host.
    fn publish_status(&mut self) {
        let master = self.slot_ip(self.election.master).map_or(0, u32::from);
        let deputy = self.slot_ip(self.election.deputy).map_or(0, u32::from);
        self.store.set_u8(ST_ROLE, self.election.role().code());
        self.store.set_u8(ST_READY, self.election.ready as u8);
        self.store.set_u32(ST_GENERATION, self.election.generation);
        self.store.set_u32(ST_MASTER_IP, master);
        self.store.set_u32(ST_DEPUTY_IP, deputy);
        self.store.set_u64(ST_NET_STARTED_AT, self.election.net_started_at);
        self.store.set_i32(ST_PRIORITY, self.settings.priority);
        self.conns.publish(&mut self.store);
    }
}
