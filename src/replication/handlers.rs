//! Serving and consuming registry copies.

use tracing::{debug, info, warn};

use super::sync::{Progress, SyncRequest};
use crate::connection::{ConnId, QueueEntry, StoreRegion};
use crate::daemon::Daemon;
use crate::daemon::net::Transport;
use crate::fatal;
use crate::membership::split_u64;
use crate::registry::SegmentId;
use crate::registry::layout::*;
use crate::wire::{CHUNK_MAX, Command, Frame};

impl<T: Transport> Daemon<T> {
    /// Asks the current master for the next piece of the copy.
    pub(crate) fn request_sync(&mut self, req: SyncRequest) {
        let Some(master) = self.election.master.filter(|c| c.is_peer()) else {
            debug!("No master to copy from");
            return;
        };
        let frame = self.frame(Command::ReqCpyMem).with_params(req.params());
        self.send(master, frame);
    }

    /// Reissues the outstanding request, after the master changed.
    pub(crate) fn resume_sync(&mut self) {
        if let Some(req) = self.sync.outstanding() {
            info!("Resuming registry copy at {:?}", req);
            self.request_sync(req);
        }
    }

    /// Pushes every registry range mutated since the last event to the
    /// other daemons, widening unsent pushes where possible.
    pub(crate) fn push_touches(&mut self) {
        let touches = self.store.take_touches();
        if touches.is_empty() || !self.election.is_master() {
            return;
        }
        let targets: Vec<ConnId> = self
            .conns
            .daemons()
            .filter(|c| c.status.is_writable())
            .map(|c| c.id)
            .collect();
        for touch in touches {
            let mut pos = touch.pos;
            while pos < touch.end() {
                let len = CHUNK_MAX.min(touch.end() - pos);
                for &conn in &targets {
                    self.queue.touch(conn, pos, len);
                }
                pos += len;
            }
        }
    }

    /// REQCPYMEM: `[pos, len]` for a registry range, `[segment]` for a
    /// segment's arena bytes.
    pub(crate) fn on_req_cpy_mem(&mut self, conn: ConnId, frame: Frame) {
        if !self.election.is_serving() {
            let (Some(master), Some(peer)) = (
                self.election.master.filter(|c| c.is_peer()),
                self.conns.get(conn).map(|c| c.peer),
            ) else {
                debug!("Dropping REQCPYMEM from {}: no master", conn);
                return;
            };
            let mut forward = frame;
            if forward.from == 0 {
                forward.from = u32::from(peer);
            }
            self.send(master, forward);
            return;
        }

        let target = match frame.from_ip() {
            Some(ip) => match self.conns.find_daemon(ip) {
                Some(c) => c,
                None => {
                    debug!("Copy requester {} is gone", ip);
                    return;
                }
            },
            None => conn,
        };

        match *frame.params.as_slice() {
            [pos, len] => self.serve_registry(target, pos, len),
            [segment] => self.serve_segment(target, segment),
            _ => {
                warn!("REQCPYMEM with {} params on {}", frame.params.len(), conn);
                self.close_conn(conn, "malformed REQCPYMEM");
            }
        }
    }

    fn serve_registry(&mut self, target: ConnId, pos: i32, len: i32) {
        let in_range = usize::try_from(pos).ok().zip(usize::try_from(len).ok()).filter(
            |&(pos, len)| {
                pos >= REPLICATED_START
                    && len > 0
                    && len <= CHUNK_MAX
                    && pos.checked_add(len).is_some_and(|end| end <= REPLICATED_END)
            },
        );
        let Some((pos, len)) = in_range else {
            fatal!("registry copy request {}+{} out of range", pos, len);
        };
        let reply = self
            .frame(Command::SysCpyMem)
            .with_opt(1)
            .with_params(vec![pos as i32, len as i32]);
        self.send_entry(QueueEntry::with_store(
            target,
            reply,
            StoreRegion::Registry,
            pos,
            len,
        ));
    }

    /// Answers with the segment's arena range in chunks; an unused segment
    /// gets a single empty answer.
    fn serve_segment(&mut self, target: ConnId, segment: i32) {
        let Some(id) = i16::try_from(segment).ok().and_then(SegmentId::from_index) else {
            fatal!("segment copy request for invalid segment {}", segment);
        };
        let record = self.store.segment(id);
        let range = if record.is_used() {
            record.range()
        } else {
            0..0
        };
        if range.end > self.arena.bytes().len() {
            fatal!("segment {} range {:?} outside the arena", id, range);
        }

        let mut pos = range.start;
        loop {
            let len = CHUNK_MAX.min(range.end - pos);
            let more = (pos + len < range.end) as i32;
            let reply = self.frame(Command::SysCpyMem).with_opt(2).with_params(vec![
                segment,
                pos as i32,
                len as i32,
                more,
            ]);
            self.send_entry(QueueEntry::with_store(
                target,
                reply,
                StoreRegion::Arena,
                pos,
                len,
            ));
            pos += len;
            if more == 0 {
                break;
            }
        }
    }

    /// SYSCPYMEM: opt 0 is a pushed mutation, opt 1 a registry chunk and
    /// opt 2 a piece of a segment's arena range.
    pub(crate) fn on_sys_cpy_mem(&mut self, conn: ConnId, frame: Frame) {
        if self.election.is_master() || self.election.master != Some(conn) {
            debug!("Ignoring SYSCPYMEM from {} which is not my master", conn);
            return;
        }
        match frame.opt {
            0 | 1 => {
                let (Some(pos), Some(len)) = (frame.param(0), frame.param(1)) else {
                    fatal!("SYSCPYMEM without position from {}", conn);
                };
                let (pos, len) = (pos as usize, len as usize);
                if frame.body.len() != len {
                    fatal!(
                        "SYSCPYMEM body of {} bytes, header says {}",
                        frame.body.len(),
                        len
                    );
                }
                self.store.apply_bytes(pos, &frame.body);
                if frame.opt == 1 {
                    let progress = self.sync.registry_chunk(&self.store, pos, len);
                    self.advance_sync(progress);
                }
            }
            2 => {
                let (Some(segment), Some(pos), Some(len), Some(more)) =
                    (frame.param(0), frame.param(1), frame.param(2), frame.param(3))
                else {
                    fatal!("SYSCPYMEM segment chunk without range from {}", conn);
                };
                let (pos, len) = (pos as usize, len as usize);
                if frame.body.len() != len {
                    fatal!(
                        "SYSCPYMEM body of {} bytes, header says {}",
                        frame.body.len(),
                        len
                    );
                }
                let expected = self.sync.outstanding();
                let answers = i16::try_from(segment)
                    .ok()
                    .and_then(SegmentId::from_index)
                    .is_some_and(|id| expected == Some(SyncRequest::Segment(id)));
                if !answers {
                    debug!("Segment chunk {} does not answer {:?}", segment, expected);
                    return;
                }
                if len > 0 && !self.arena.write(pos, &frame.body) {
                    fatal!("segment {} chunk {}+{} outside the arena", segment, pos, len);
                }
                if more != 0 {
                    self.sync.bytes += len as u64;
                    return;
                }
                let progress = self.sync.segment_chunk(&self.store, len);
                self.advance_sync(progress);
            }
            other => fatal!("SYSCPYMEM with unknown option {} from {}", other, conn),
        }
    }

    fn advance_sync(&mut self, progress: Progress) {
        match progress {
            Progress::Next(req) => self.request_sync(req),
            Progress::Done => self.sync_complete(),
            Progress::Ignored => {}
        }
    }

    fn sync_complete(&mut self) {
        info!(
            "Registry copy complete: {} chunks, {} bytes, {} nodes, {} segments",
            self.sync.chunks,
            self.sync.bytes,
            self.store.node_count(),
            self.store.segment_count()
        );
        self.election.ready = true;
        let (hi, lo) = split_u64(self.started_at);
        let targets = [self.election.master, self.election.deputy];
        for conn in targets.into_iter().flatten().filter(|c| c.is_peer()) {
            let frame = self
                .frame(Command::Ready)
                .with_opt(1)
                .with_params(vec![self.settings.priority, hi, lo]);
            self.send(conn, frame);
        }
    }
}
