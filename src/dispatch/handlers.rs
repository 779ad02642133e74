//! Administrative and application requests.
//!
//! Every administrative request has the same three-party shape. It starts
//! at a local client, is evaluated if this daemon is master and forwarded
//! to the master otherwise; the master's answer comes back on the daemon
//! connection and is handed to the client through the node-id cache.

use std::net::Ipv4Addr;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::connection::{ConnId, NodeSlot};
use crate::daemon::Daemon;
use crate::daemon::context::millis;
use crate::daemon::net::{Transport, UdpTarget};
use crate::daemon::schedule::{CAST_TICK, CYCLE_UNIT_MS, DEFAULT_CYCLE, PENALTY_DELAY, Task};
use crate::error::{RequestError, RequestResult, result_code};
use crate::fatal;
use crate::registry::layout::*;
use crate::registry::ops::Allocation;
use crate::registry::{NodeId, SegmentId};
use crate::wire::udp::UDP_BODY_MAX;
use crate::wire::{Command, Datagram, Frame, NO_NODE};

/// Where a node-scoped request is evaluated.
enum Route {
    Evaluate(NodeId),
    Forwarded,
    Delivered,
    Refuse(RequestError),
}

/// Eviction notice from the master, as opposed to a DELCLIENT answer.
const EVICT: u8 = 1;

fn cycle_millis(cycle: u16) -> u64 {
    let cycle = if cycle == 0 { DEFAULT_CYCLE } else { cycle };
    u64::from(cycle) * CYCLE_UNIT_MS
}

impl<T: Transport> Daemon<T> {
    fn master_conn(&self) -> Option<ConnId> {
        self.election.master.filter(|c| c.is_peer())
    }

    /// Answers `request` on `conn`. Pending registry pushes go out first so
    /// a member's copy is current before its client sees the answer.
    fn reply(&mut self, conn: ConnId, request: &Frame, params: Vec<i32>) {
        self.push_touches();
        let reply = Frame::new(request.code)
            .with_seq(request.seq)
            .with_dest(request.src)
            .with_params(params);
        self.send(conn, reply);
    }

    fn route_node_request(&mut self, conn: ConnId, frame: &Frame) -> Route {
        if self.is_local(conn) {
            let slot = self.conns.get(conn).map_or(NodeSlot::Unjoined, |c| c.node);
            let node = match slot {
                NodeSlot::Node(node) => node,
                NodeSlot::Anonymous => return Route::Refuse(RequestError::AnonymousNotPermitted),
                NodeSlot::Unjoined => return Route::Refuse(RequestError::InvalidParameter),
            };
            if self.election.is_master() {
                return Route::Evaluate(node);
            }
            return match self.master_conn() {
                Some(master) => {
                    self.send(master, frame.clone().with_src(node.0));
                    Route::Forwarded
                }
                None => Route::Refuse(RequestError::NoMaster),
            };
        }

        if !self.election.is_master() {
            self.deliver_reply(frame.clone());
            return Route::Delivered;
        }
        let host = self.host_of(conn);
        match NodeId::from_index(frame.src as i16) {
            Some(node) if frame.src != NO_NODE && Some(self.store.node(node).ip) == host => {
                Route::Evaluate(node)
            }
            _ => {
                warn!(
                    "{} for node {} which is not on {:?}",
                    frame.describe(),
                    frame.src,
                    host
                );
                Route::Refuse(RequestError::InvalidParameter)
            }
        }
    }

    /// Hands an answer from the master to the local client it is for.
    fn deliver_reply(&mut self, frame: Frame) {
        let local = self
            .node_conns
            .get(frame.dest as usize)
            .copied()
            .flatten()
            .filter(|&c| self.is_local(c));
        match local {
            Some(conn) => self.send(conn, frame),
            None => debug!("No local client for answer {}", frame.describe()),
        }
    }

    /// Runs a node-scoped request through routing and answers it.
    fn node_request(
        &mut self,
        conn: ConnId,
        frame: Frame,
        eval: impl FnOnce(&mut Self, NodeId, &Frame) -> RequestResult<Vec<i32>>,
    ) {
        let result = match self.route_node_request(conn, &frame) {
            Route::Evaluate(node) => eval(self, node, &frame),
            Route::Refuse(e) => Err(e),
            Route::Forwarded | Route::Delivered => return,
        };
        let params = result.unwrap_or_else(|e| vec![e.code()]);
        self.reply(conn, &frame, params);
    }

    // -- NEWCLIENT / DELCLIENT ----------------------------------------------

    pub(crate) fn on_new_client(&mut self, conn: ConnId, frame: Frame) {
        if self.is_local(conn) {
            self.local_join(conn, frame);
        } else if self.election.is_master() {
            self.remote_join(conn, frame);
        } else {
            self.join_answer(frame);
        }
    }

    fn local_join(&mut self, conn: ConnId, frame: Frame) {
        let Some(pid) = frame.param(0) else {
            warn!("NEWCLIENT without pid on {}", conn);
            self.close_conn(conn, "malformed NEWCLIENT");
            return;
        };
        let name = frame.body_str();
        let slot = match self.conns.get_mut(conn) {
            Some(c) => {
                c.pid = pid;
                c.node
            }
            None => return,
        };

        if name.is_empty() {
            if let Some(c) = self.conns.get_mut(conn) {
                c.node = NodeSlot::Anonymous;
            }
            debug!("Anonymous client pid {} on {}", pid, conn);
            self.reply(conn, &frame, vec![ANONYMOUS_NODE as i32, pid]);
            return;
        }
        if slot != NodeSlot::Unjoined {
            self.joined(conn, pid, &frame, Err(RequestError::Exists));
            return;
        }
        if !is_valid_name(&name) {
            self.joined(conn, pid, &frame, Err(RequestError::InvalidName));
            return;
        }

        if self.election.is_master() {
            let result = self.grant_node(&name, pid, self.settings.ip);
            self.joined(conn, pid, &frame, result);
            return;
        }
        match self.master_conn() {
            Some(master) => self.send(master, frame.with_src(NO_NODE)),
            None => self.joined(conn, pid, &frame, Err(RequestError::NoMaster)),
        }
    }

    /// Registers `name` unless a live process still holds it. A holder on
    /// this host is probed; one elsewhere is trusted to be alive.
    fn grant_node(&mut self, name: &str, pid: i32, ip: Ipv4Addr) -> RequestResult<NodeId> {
        let my_ip = self.settings.ip;
        let probe = &self.probe;
        let node = self.store.register_node(name, pid, ip, self.now, |holder| {
            holder.ip != my_ip || probe.is_alive(holder.pid)
        })?;
        info!("Node {} ({}) joined from {} pid {}", name, node, ip, pid);
        Ok(node)
    }

    /// Answers a local join. Failures are answered after a penalty delay.
    fn joined(&mut self, conn: ConnId, pid: i32, request: &Frame, result: RequestResult<NodeId>) {
        match result {
            Ok(node) => {
                if let Some(c) = self.conns.get_mut(conn) {
                    c.node = NodeSlot::Node(node);
                }
                self.node_conns[node.0 as usize] = Some(conn);
                self.reply(conn, request, vec![node.0 as i32, pid]);
            }
            Err(e) => {
                debug!("Join by pid {} refused: {}", pid, e);
                let answer = Frame::new(request.code)
                    .with_seq(request.seq)
                    .with_params(vec![e.code(), pid]);
                self.schedule.push(
                    self.now + millis(PENALTY_DELAY),
                    Task::PenaltyReply {
                        conn,
                        pid,
                        frame: answer,
                    },
                );
            }
        }
    }

    /// The master evaluates a join forwarded by another daemon.
    fn remote_join(&mut self, conn: ConnId, frame: Frame) {
        let (Some(pid), Some(host)) = (frame.param(0), self.host_of(conn)) else {
            warn!("NEWCLIENT without pid from {}", conn);
            return;
        };
        let result = self.grant_node(&frame.body_str(), pid, host);
        let dest = match result {
            Ok(node) => {
                self.node_conns[node.0 as usize] = Some(conn);
                node.0
            }
            Err(_) => NO_NODE,
        };
        let code = result_code(result.map(|n| n.0 as i32));
        self.push_touches();
        let answer = Frame::new(frame.code)
            .with_seq(frame.seq)
            .with_dest(dest)
            .with_params(vec![code, pid]);
        self.send(conn, answer);
    }

    /// A join answer from the master, matched to the waiting client by pid.
    fn join_answer(&mut self, frame: Frame) {
        let (Some(result), Some(pid)) = (frame.param(0), frame.param(1)) else {
            warn!("NEWCLIENT answer without result");
            return;
        };
        let Some(conn) = self.conns.find_local_by_pid(pid) else {
            debug!("Join answer for pid {} which is gone", pid);
            return;
        };
        let result = match u16::try_from(result) {
            Ok(id) => NodeId::from_index(id as i16).ok_or(RequestError::InvalidParameter),
            Err(_) => Err(RequestError::from_code(result).unwrap_or(RequestError::NoMaster)),
        };
        self.joined(conn, pid, &frame, result);
    }

    pub(crate) fn on_del_client(&mut self, conn: ConnId, frame: Frame) {
        if self.is_local(conn) {
            let node = self.conns.get(conn).and_then(|c| c.node.node());
            let Some(node) = node else {
                self.reply(conn, &frame, vec![0]);
                return;
            };
            if self.election.is_master() {
                self.release_node(node);
                if let Some(c) = self.conns.get_mut(conn) {
                    c.node = NodeSlot::Unjoined;
                }
                self.reply(conn, &frame, vec![0]);
                return;
            }
            match self.master_conn() {
                Some(master) => self.send(master, frame.with_src(node.0)),
                None => self.reply(conn, &frame, vec![RequestError::NoMaster.code()]),
            }
            return;
        }

        if self.election.is_master() {
            self.remote_leave(conn, frame);
            return;
        }

        // An answer or an eviction from the master.
        let Some(local) = self
            .node_conns
            .get_mut(frame.dest as usize)
            .and_then(Option::take)
        else {
            debug!("DELCLIENT for node {} not cached here", frame.dest);
            return;
        };
        if let Some(c) = self.conns.get_mut(local) {
            c.node = NodeSlot::Unjoined;
        }
        if frame.opt == EVICT {
            info!("Node {} evicted by the master", frame.dest);
            self.close_conn(local, "evicted");
        } else {
            self.send(local, frame);
        }
    }

    /// Leave of one node, or with no node every node of the sender's host.
    fn remote_leave(&mut self, conn: ConnId, frame: Frame) {
        let Some(host) = self.host_of(conn) else {
            return;
        };
        let result = if frame.src == NO_NODE {
            let nodes = self.store.nodes_on_host(host);
            info!("Host {} released {} node(s)", host, nodes.len());
            for node in nodes {
                self.release_node(node);
            }
            Ok(0)
        } else {
            match NodeId::from_index(frame.src as i16) {
                Some(node) if self.store.node(node).ip == host => {
                    self.release_node(node);
                    Ok(0)
                }
                _ => Err(RequestError::InvalidParameter),
            }
        };
        self.reply(conn, &frame, vec![result_code(result)]);
    }

    /// Deregisters `node` and forgets its cached connection.
    pub(crate) fn release_node(&mut self, node: NodeId) {
        let departure = self.store.deregister_node(node, self.now);
        if let Some(slot) = self.node_conns.get_mut(node.0 as usize) {
            *slot = None;
        }
        debug!(
            "Released node {}: {} refs, {} segments reclaimed",
            node,
            departure.released_refs,
            departure.reclaimed.len()
        );
    }

    /// A local client connection closed.
    pub(crate) fn client_gone(&mut self, conn: &crate::connection::Connection) {
        let Some(node) = conn.node.node() else {
            return;
        };
        info!("Node {} (pid {}) disconnected", node, conn.pid);
        if self.node_conns[node.0 as usize] == Some(conn.id) {
            self.node_conns[node.0 as usize] = None;
        }
        if self.election.is_master() {
            self.release_node(node);
            return;
        }
        if let Some(master) = self.master_conn() {
            let leave = self.frame(Command::DelClient).with_src(node.0);
            self.send(master, leave);
        }
    }

    /// Disconnects a node the master had to drop.
    fn evict(&mut self, node: NodeId) {
        let record = self.store.node(node);
        info!("Evicting node {} ({})", node, record.name);
        self.release_node(node);
        if record.ip == self.settings.ip {
            if let Some(conn) = self.conns.find_local_by_node(node) {
                if let Some(c) = self.conns.get_mut(conn) {
                    c.node = NodeSlot::Unjoined;
                }
                self.close_conn(conn, "evicted");
            }
        } else if let Some(conn) = self.conns.find_daemon(record.ip) {
            let notice = self
                .frame(Command::DelClient)
                .with_opt(EVICT)
                .with_dest(node.0);
            self.send(conn, notice);
        }
    }

    // -- segments -----------------------------------------------------------

    /// ALLOCMEM `[cycle, revision, size]` with body `"name format"`.
    pub(crate) fn on_alloc_mem(&mut self, conn: ConnId, frame: Frame) {
        self.node_request(conn, frame, |daemon, node, frame| {
            let [cycle, revision, size] = *frame.params.as_slice() else {
                return Err(RequestError::InvalidParameter);
            };
            let body = frame.body_str();
            let (name, format) = body
                .split_once(' ')
                .ok_or(RequestError::InvalidParameter)?;
            let field = |v: i32| u16::try_from(v).map_err(|_| RequestError::InvalidParameter);
            let request = Allocation {
                node,
                name: name.to_string(),
                format: format.trim().to_string(),
                revision: field(revision)?,
                size: u32::try_from(size).map_err(|_| RequestError::InvalidParameter)?,
                cycle: field(cycle)?,
            };
            let allocated = daemon.store.allocate_segment(&request, daemon.now)?;
            for evicted in allocated.evicted {
                daemon.evict(evicted);
            }
            Ok(vec![
                allocated.segment.0 as i32,
                allocated.offset as i32,
                allocated.size as i32,
            ])
        });
    }

    /// OPENMEM `[revision]` with the segment name as body.
    pub(crate) fn on_open_mem(&mut self, conn: ConnId, frame: Frame) {
        self.node_request(conn, frame, |daemon, node, frame| {
            let revision = frame
                .param(0)
                .and_then(|r| u16::try_from(r).ok())
                .ok_or(RequestError::InvalidParameter)?;
            let id = daemon
                .store
                .open_segment(node, &frame.body_str(), revision, daemon.now)?;
            let seg = daemon.store.segment(id);
            Ok(vec![id.0 as i32, seg.offset, seg.size as i32])
        });
    }

    /// CLOSEMEM `[segment]`.
    pub(crate) fn on_close_mem(&mut self, conn: ConnId, frame: Frame) {
        self.node_request(conn, frame, |daemon, node, frame| {
            let id = frame
                .param(0)
                .and_then(|s| i16::try_from(s).ok())
                .and_then(SegmentId::from_index)
                .ok_or(RequestError::InvalidParameter)?;
            daemon.store.close_segment(node, id)?;
            Ok(vec![0])
        });
    }

    /// FLUSHMEM `[offset, len]`: broadcast a range of the caller's own
    /// segment to every daemon. Evaluated where the client lives.
    pub(crate) fn on_flush_mem(&mut self, conn: ConnId, frame: Frame) {
        if !self.is_local(conn) {
            warn!("FLUSHMEM from daemon connection {}", conn);
            return;
        }
        let result = self.flush_segment(conn, &frame);
        self.reply(conn, &frame, vec![result_code(result)]);
    }

    fn flush_segment(&mut self, conn: ConnId, frame: &Frame) -> RequestResult<i32> {
        let node = match self.conns.get(conn).map(|c| c.node) {
            Some(NodeSlot::Node(node)) => node,
            Some(NodeSlot::Anonymous) => return Err(RequestError::AnonymousNotPermitted),
            _ => return Err(RequestError::InvalidParameter),
        };
        let (Some(offset), Some(len)) = (frame.param(0), frame.param(1)) else {
            return Err(RequestError::InvalidParameter);
        };
        let (Ok(offset), Ok(len)) = (usize::try_from(offset), usize::try_from(len)) else {
            return Err(RequestError::InvalidPointer);
        };
        if offset.saturating_add(len) > self.arena.bytes().len() {
            return Err(RequestError::InvalidPointer);
        }
        let id = self
            .store
            .owned_segment_containing(node, offset, len)
            .ok_or(RequestError::NotFound)?;
        let range = if len == 0 {
            self.store.segment(id).range()
        } else {
            offset..offset + len
        };

        if !self.cast_range(id, range) {
            return Err(RequestError::InvalidPointer);
        }
        Ok(id.0 as i32)
    }

    /// Sends an arena range as USRCPYMEM datagrams. False when the range
    /// leaves the arena.
    fn cast_range(&mut self, id: SegmentId, range: std::ops::Range<usize>) -> bool {
        let mut pos = range.start;
        while pos < range.end {
            let end = range.end.min(pos + UDP_BODY_MAX);
            let Some(bytes) = self.arena.read(pos, end - pos) else {
                return false;
            };
            let datagram = Datagram::new(Command::UsrCpyMem)
                .with_short(id.0, 0)
                .with_params(vec![pos as i32])
                .with_body(Bytes::copy_from_slice(bytes));
            self.send_udp(UdpTarget::Discovery, datagram);
            pos = end;
        }
        true
    }

    /// Broadcasts every segment owned by a node of this host once per its
    /// cycle, whether or not the owner flushed it.
    pub(crate) fn on_segment_cast(&mut self) {
        let mut due = vec![None; MAX_SEGMENTS];
        if self.election.ready {
            let owned: Vec<_> = self
                .store
                .segments()
                .filter(|(_, seg)| {
                    seg.owner.is_some_and(|n| {
                        let node = self.store.node(n);
                        node.is_live() && node.ip == self.settings.ip
                    })
                })
                .collect();
            for (id, seg) in owned {
                let cycle = cycle_millis(seg.cycle);
                let slot = id.0 as usize;
                let mut next = self.cast_due[slot].unwrap_or(self.now + cycle);
                if next > self.now + 2 * cycle {
                    // the cycle shrank since the last cast
                    next = self.now + 2 * cycle;
                } else if self.now >= next {
                    if !self.cast_range(id, seg.range()) {
                        fatal!("segment {} range {:?} outside the arena", id, seg.range());
                    }
                    next = if self.now > next + cycle {
                        self.now + cycle
                    } else {
                        next + cycle
                    };
                }
                due[slot] = Some(next);
            }
        }
        self.cast_due = due;
        self.schedule
            .push(self.now + millis(CAST_TICK), Task::SegmentCast);
    }

    /// USRCPYMEM: segment bytes broadcast by the owner's daemon.
    pub(crate) fn on_usr_cpy_mem(&mut self, from: Ipv4Addr, datagram: Datagram) {
        let offset = datagram.params.first().and_then(|&o| usize::try_from(o).ok());
        let record = SegmentId::from_index(datagram.par1 as i16).map(|id| self.store.segment(id));
        let accepted = match (record, offset) {
            (Some(seg), Some(offset)) if seg.is_used() => {
                let owner_ip = seg.owner.map(|n| self.store.node(n).ip);
                let range = seg.range();
                owner_ip == Some(from)
                    && offset >= range.start
                    && offset + datagram.body.len() <= range.end
            }
            _ => false,
        };
        if !accepted {
            if let Some(count) = self.refused.record(from) {
                warn!(
                    "Refused segment {} data from {} ({} times)",
                    datagram.par1, from, count
                );
            }
            return;
        }
        if let Some(offset) = offset
            && !self.arena.write(offset, &datagram.body)
        {
            fatal!(
                "segment {} data {}+{} outside the arena",
                datagram.par1,
                offset,
                datagram.body.len()
            );
        }
    }

    // -- request names ------------------------------------------------------

    /// NEWREQ with the request name as body.
    pub(crate) fn on_new_req(&mut self, conn: ConnId, frame: Frame) {
        self.node_request(conn, frame, |daemon, _, frame| {
            let code = daemon.store.register_request(&frame.body_str())?;
            Ok(vec![code as i32])
        });
    }

    /// DELREQ `[code]`.
    pub(crate) fn on_del_req(&mut self, conn: ConnId, frame: Frame) {
        self.node_request(conn, frame, |daemon, _, frame| {
            let code = frame
                .param(0)
                .and_then(|c| u16::try_from(c).ok())
                .ok_or(RequestError::InvalidParameter)?;
            daemon.store.deregister_request(code)?;
            Ok(vec![0])
        });
    }

    // -- daemon control -----------------------------------------------------

    /// KILLDAEMON `[ip]` stops the daemon at that address; without
    /// parameters the receiver stops.
    pub(crate) fn on_kill_daemon(&mut self, conn: ConnId, frame: Frame) {
        let Some(target) = frame.param(0).map(|ip| Ipv4Addr::from(ip as u32)) else {
            self.stop("KILLDAEMON received");
            return;
        };
        if target == self.settings.ip {
            if self.is_local(conn) {
                self.reply(conn, &frame, vec![0]);
            }
            self.stop("KILLDAEMON received");
            return;
        }
        let result = match self.conns.find_daemon(target) {
            Some(daemon) => {
                info!("Forwarding KILLDAEMON to {}", target);
                let kill = self.frame(Command::KillDaemon);
                self.send(daemon, kill);
                Ok(0)
            }
            None => Err(RequestError::NotFound),
        };
        if self.is_local(conn) {
            self.reply(conn, &frame, vec![result_code(result)]);
        }
    }

    // -- application requests -----------------------------------------------

    /// Routes a request between nodes by its destination.
    pub(crate) fn on_application(&mut self, conn: ConnId, frame: Frame) {
        if self.store.request_by_code(frame.code).is_none() {
            fatal!(
                "unregistered request code {:#06x} from {}",
                frame.code,
                conn
            );
        }
        let dest = match NodeId::from_index(frame.dest as i16) {
            Some(node) if frame.dest != NO_NODE => node,
            _ => {
                warn!("{} has no destination node", frame.describe());
                return;
            }
        };
        let record = self.store.node(dest);
        if !record.is_live() {
            debug!("Dropping {} for departed node {}", frame.describe(), dest);
            return;
        }

        let target = if record.ip == self.settings.ip {
            self.node_conns[dest.0 as usize]
                .filter(|&c| self.is_local(c))
                .or_else(|| self.conns.find_local_by_node(dest))
        } else if self.election.is_serving() {
            self.conns.find_daemon(record.ip)
        } else if self.is_local(conn) {
            self.master_conn()
        } else {
            None
        };
        match target {
            Some(target) if target != conn => self.send(target, frame),
            _ => debug!("No route for {} to node {}", frame.describe(), dest),
        }
    }
}
