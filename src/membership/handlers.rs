//! Discovery, election and failover as seen by one daemon.

use std::net::Ipv4Addr;

use tracing::{debug, info, warn};

use super::election::{Lost, Tick};
use super::types::*;
use crate::connection::{ConnId, ConnKind, ConnStatus, Connection};
use crate::daemon::context::millis;
use crate::daemon::net::{Transport, UdpTarget};
use crate::daemon::schedule::Task;
use crate::daemon::Daemon;
use crate::fatal;
use crate::wire::codes::PROTOCOL_VERSION;
use crate::wire::{Command, Datagram, Frame};

impl<T: Transport> Daemon<T> {
    /// The arrangement this daemon currently believes in.
    pub(crate) fn current_view(&self) -> Option<View> {
        Some(View {
            master: self.slot_ip(self.election.master)?,
            deputy: self.slot_ip(self.election.deputy),
            master_started: self.slot_started(self.election.master),
            deputy_started: self.slot_started(self.election.deputy),
            net_started: self.election.net_started_at,
            generation: self.election.generation,
        })
    }

    fn slot_started(&self, slot: Option<ConnId>) -> u64 {
        match slot {
            Some(ConnId::SELF) => self.started_at,
            Some(conn) => self.conns.get(conn).map_or(0, |c| c.started_at),
            None => 0,
        }
    }

    fn send_new_daemon(&mut self, target: UdpTarget) {
        let datagram = Datagram::new(Command::NewDaemon)
            .with_params(vec![PROTOCOL_VERSION, self.settings.priority]);
        self.send_udp(target, datagram);
    }

    pub(crate) fn on_discovery_tick(&mut self) {
        match self.election.tick(self.now) {
            Tick::Broadcast { next } | Tick::Advertise { next } => {
                self.send_new_daemon(UdpTarget::Discovery);
                self.schedule
                    .reschedule(self.now + millis(next), Task::DiscoveryBroadcast);
            }
            Tick::Claimed => {
                self.sync.reset();
                self.advertise_later();
            }
            Tick::Idle if self.election.is_master() => self.advertise_later(),
            Tick::Idle => {}
        }
    }

    fn advertise_later(&mut self) {
        self.schedule.reschedule(
            self.now + millis(ADVERTISE_INTERVAL),
            Task::DiscoveryBroadcast,
        );
    }

    /// NEWDAEMON: someone is looking for a master.
    pub(crate) fn on_new_daemon(&mut self, from: Ipv4Addr, datagram: Datagram) {
        let (Some(&version), Some(&priority)) = (datagram.params.first(), datagram.params.get(1))
        else {
            warn!("NEWDAEMON from {} without version and priority", from);
            return;
        };
        if version > PROTOCOL_VERSION {
            warn!(
                "Daemon {} speaks protocol {} (mine is {})",
                from, version, PROTOCOL_VERSION
            );
            self.stop("newer protocol version on the network");
            return;
        }
        if version < PROTOCOL_VERSION {
            warn!("Daemon {} speaks outdated protocol {}", from, version);
            self.send_new_daemon(UdpTarget::Peer(from));
            return;
        }

        if self.election.role().is_established() {
            if self.election.is_serving() {
                self.send_ack(from);
            }
            return;
        }
        self.election.hear_candidate(
            (priority, from),
            (self.settings.priority, self.settings.ip),
        );
    }

    fn send_ack(&mut self, to: Ipv4Addr) {
        let Some(view) = self.current_view() else {
            return;
        };
        debug!("Answering discovery from {} with {}", to, view);
        let datagram = Datagram::new(Command::AckDaemon).with_params(view.to_params());
        self.send_udp(UdpTarget::Peer(to), datagram);
    }

    /// ACKDAEMON: an established daemon told us who runs the network.
    pub(crate) fn on_ack_daemon(&mut self, from: Ipv4Addr, datagram: Datagram) {
        let Some(view) = View::from_params(&datagram.params) else {
            warn!("Malformed ACKDAEMON from {}", from);
            return;
        };
        if self.election.is_master() {
            if view.master != self.settings.ip {
                warn!("Foreign master {} answered via {}", view.master, from);
            }
            return;
        }
        if self.election.role().is_established() {
            return;
        }
        if view.generation < self.election.generation {
            debug!(
                "Stale ACKDAEMON from {} (g={}, mine {})",
                from, view.generation, self.election.generation
            );
            return;
        }
        if from != view.master && view.deputy != Some(from) {
            warn!("ACKDAEMON from {} which is not in its own view {}", from, view);
            return;
        }
        if view.master == self.settings.ip || view.deputy == Some(self.settings.ip) {
            warn!("ACKDAEMON from {} names this daemon: {}", from, view);
            return;
        }

        let Some(master) = self.place(view.master, view.master_started) else {
            return;
        };
        let deputy = match view.deputy {
            Some(ip) => self.place(ip, view.deputy_started),
            None => None,
        };
        info!("Joining network {} (answered by {})", view, from);
        self.election.master = Some(master);
        self.election.deputy = deputy;
        self.election.generation = view.generation;
        self.election.net_started_at = view.net_started;
        self.election.ready = false;
        self.election.settle();
        self.schedule.cancel(|t| *t == Task::DiscoveryBroadcast);

        let first = self.sync.start();
        self.request_sync(first);
    }

    /// A connection to the daemon at `ip`, reusing an existing one.
    fn open_daemon_conn(&mut self, ip: Ipv4Addr, started: u64) -> Option<ConnId> {
        if let Some(conn) = self.conns.find_daemon(ip) {
            if let Some(c) = self.conns.get_mut(conn)
                && started != 0
            {
                c.started_at = started;
            }
            return Some(conn);
        }
        let Some(conn) = self.conns.open(ConnKind::Daemon, ip, self.now) else {
            warn!("Connection table full, cannot reach daemon {}", ip);
            return None;
        };
        if let Some(c) = self.conns.get_mut(conn) {
            c.status = ConnStatus::WaitingAccept;
            c.outgoing = true;
            c.started_at = started;
        }
        debug!("Connecting {} to daemon {}", conn, ip);
        self.transport.connect(conn, ip);
        Some(conn)
    }

    /// Master or deputy slot for the daemon at `ip`; a new connection
    /// introduces this daemon with a READY(opt 0).
    fn place(&mut self, ip: Ipv4Addr, started: u64) -> Option<ConnId> {
        if ip == self.settings.ip {
            return Some(ConnId::SELF);
        }
        let fresh = self.conns.find_daemon(ip).is_none();
        let conn = self.open_daemon_conn(ip, started)?;
        if fresh {
            let (hi, lo) = split_u64(self.started_at);
            let ready = self.election.ready as i32;
            let frame = self
                .frame(Command::Ready)
                .with_opt(0)
                .with_params(vec![self.settings.priority, hi, lo, ready]);
            self.send(conn, frame);
        }
        Some(conn)
    }

    /// READY: opt 1 when a joiner finished replicating, opt 0 when a daemon
    /// introduces itself on a new connection.
    pub(crate) fn on_ready(&mut self, conn: ConnId, frame: Frame) {
        let (Some(priority), Some(hi), Some(lo)) = (frame.param(0), frame.param(1), frame.param(2))
        else {
            warn!("READY without priority and start time on {}", conn);
            self.close_conn(conn, "malformed READY");
            return;
        };
        let replicated = frame.opt == 1;
        let Some(c) = self.conns.get_mut(conn) else {
            return;
        };
        if !c.is_daemon() {
            warn!("READY from non-daemon connection {}", conn);
            return;
        }
        c.priority = priority;
        c.started_at = join_u64(hi, lo);
        c.ready = replicated || frame.param(3) == Some(1);
        let peer = c.peer;
        if !replicated {
            debug!("Daemon {} introduced itself (priority {})", peer, priority);
            // Announcements made before the connection existed never reached it.
            if self.election.is_master()
                && let Some(view) = self.current_view()
            {
                let frame = self.frame(Command::NewMaster).with_params(view.to_params());
                self.send(conn, frame);
            }
            return;
        }
        info!("Daemon {} is ready (priority {})", peer, priority);
        if !self.election.is_master() {
            return;
        }

        if outranks(priority, peer, self.settings.priority, self.settings.ip) {
            info!("Daemon {} outranks this master, handing over", peer);
            self.election.master = Some(conn);
            self.election.deputy = Some(ConnId::SELF);
        } else if self.deputy_outranked_by(priority, peer) {
            self.election.deputy = Some(conn);
        } else {
            return;
        }
        self.election.generation += 1;
        self.announce_view();
        self.election.settle();
        if !self.election.is_master() {
            self.schedule.cancel(|t| *t == Task::DiscoveryBroadcast);
        }
    }

    fn deputy_outranked_by(&self, priority: i32, ip: Ipv4Addr) -> bool {
        match self.election.deputy {
            None => true,
            Some(deputy) => self
                .conns
                .get(deputy)
                .is_none_or(|d| outranks(priority, ip, d.priority, d.peer)),
        }
    }

    /// Sends the current view to every daemon connection.
    pub(crate) fn announce_view(&mut self) {
        let Some(view) = self.current_view() else {
            return;
        };
        info!("Announcing {}", view);
        let targets: Vec<ConnId> = self
            .conns
            .daemons()
            .filter(|c| c.status.accepts_frames())
            .map(|c| c.id)
            .collect();
        for conn in targets {
            let frame = self
                .frame(Command::NewMaster)
                .with_params(view.to_params());
            self.send(conn, frame);
        }
    }

    /// NEWMASTER: the master announced a changed view.
    pub(crate) fn on_new_master(&mut self, conn: ConnId, frame: Frame) {
        let Some(view) = View::from_params(&frame.params) else {
            warn!("Malformed NEWMASTER on {}", conn);
            self.close_conn(conn, "malformed NEWMASTER");
            return;
        };
        let current = self.election.generation;
        if let Some(mine) = self.current_view()
            && mine.same_places(&view)
            && view.generation == current
        {
            return;
        }
        if view.generation <= current {
            if view.generation == current {
                warn!("Conflicting view {} at generation {}", view, current);
            } else {
                debug!("Stale NEWMASTER {} (mine g={})", view, current);
            }
            return;
        }
        if view.generation > current + 1 && self.election.ready {
            fatal!(
                "generation leap from {} to {} announced by {}",
                current,
                view.generation,
                conn
            );
        }

        let old_master = self.election.master;
        let Some(master) = self.place(view.master, view.master_started) else {
            warn!("Cannot reach announced master {}", view.master);
            return;
        };
        let deputy = match view.deputy {
            Some(ip) => self.place(ip, view.deputy_started),
            None => None,
        };
        info!("Adopting {} from {}", view, conn);
        self.election.master = Some(master);
        self.election.deputy = deputy;
        self.election.generation = view.generation;
        self.election.net_started_at = view.net_started;
        self.election.settle();

        if !self.election.is_serving() {
            let stale: Vec<ConnId> = self
                .conns
                .daemons()
                .filter(|c| Some(c.id) != self.election.master && Some(c.id) != self.election.deputy)
                .map(|c| c.id)
                .collect();
            for c in stale {
                self.close_conn(c, "not in the current view");
            }
        }
        if self.election.is_master() {
            self.advertise_later();
        } else {
            self.schedule.cancel(|t| *t == Task::DiscoveryBroadcast);
        }
        if old_master != self.election.master {
            self.resume_sync();
        }
    }

    /// A daemon connection went away.
    pub(crate) fn daemon_lost(&mut self, conn: ConnId, ip: Ipv4Addr) {
        let lost = self.election.forget(conn);
        let still_reachable = self.conns.find_daemon(ip).is_some();

        if self.election.is_master() {
            if !still_reachable {
                self.drop_host(ip);
            }
            if lost == Lost::Deputy {
                info!("Deputy {} lost", ip);
                self.pick_deputy();
                self.election.generation += 1;
                self.announce_view();
                self.election.settle();
            }
            return;
        }

        match lost {
            Lost::Master if self.election.is_deputy() => {
                info!("Master {} lost, deputy takes over", ip);
                self.election.master = Some(ConnId::SELF);
                self.election.deputy = None;
                if !still_reachable {
                    self.drop_host(ip);
                }
                self.pick_deputy();
                self.election.generation += 1;
                self.election.settle();
                self.announce_view();
                self.advertise_later();
            }
            Lost::Master => match self.election.deputy.take() {
                Some(deputy) => {
                    info!("Master {} lost, following deputy {}", ip, deputy);
                    self.election.master = Some(deputy);
                    self.election.settle();
                    self.resume_sync();
                }
                None => {
                    warn!("Master {} lost and no deputy left", ip);
                    self.sync.reset();
                    self.election.restart_search(INITCOUNT_SECOND);
                    self.schedule.reschedule(self.now, Task::DiscoveryBroadcast);
                }
            },
            Lost::Deputy => info!("Deputy {} lost, waiting for the master", ip),
            Lost::Neither => {}
        }
    }

    /// Releases every node registered from `ip`.
    fn drop_host(&mut self, ip: Ipv4Addr) {
        let nodes = self.store.nodes_on_host(ip);
        if nodes.is_empty() {
            return;
        }
        info!("Removing {} node(s) of lost host {}", nodes.len(), ip);
        for node in nodes {
            self.release_node(node);
        }
    }

    /// Best ready daemon by priority, then lowest address.
    fn pick_deputy(&mut self) {
        let best = self
            .conns
            .daemons()
            .filter(|c| c.ready && c.status.is_writable())
            .fold(None::<&Connection>, |best, c| match best {
                Some(b) if !outranks(c.priority, c.peer, b.priority, b.peer) => Some(b),
                _ => Some(c),
            })
            .map(|c| (c.id, c.peer));
        match best {
            Some((conn, ip)) => {
                info!("Picked {} as deputy", ip);
                self.election.deputy = Some(conn);
            }
            None => {
                info!("No ready daemon left to serve as deputy");
                self.election.deputy = None;
            }
        }
    }
}
