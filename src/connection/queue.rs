//! Process-wide outbound write queue.
//!
//! Frames are queued per destination and written one attempt per loop pass.
//! A frame is serialized only when its first byte is about to be written, so
//! an entry that refers to a registry or arena range carries the bytes as
//! they are at that moment, not when the entry was queued.

use std::collections::VecDeque;
use std::io;

use bytes::Bytes;
use tracing::{debug, warn};

use super::types::ConnId;
use crate::wire::codes::Command;
use crate::wire::frame::{CHUNK_MAX, Frame};

/// Inline payloads up to this many bytes live inside the entry.
pub const INLINE_MAX: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRegion {
    Registry,
    Arena,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    None,
    Inline { data: [u8; INLINE_MAX], len: u8 },
    /// Live range, read when the entry starts writing.
    Store {
        region: StoreRegion,
        pos: usize,
        len: usize,
    },
    Heap(Bytes),
}

impl Payload {
    pub fn from_bytes(data: &[u8]) -> Self {
        if data.is_empty() {
            Payload::None
        } else if data.len() <= INLINE_MAX {
            let mut inline = [0u8; INLINE_MAX];
            inline[..data.len()].copy_from_slice(data);
            Payload::Inline {
                data: inline,
                len: data.len() as u8,
            }
        } else {
            Payload::Heap(Bytes::copy_from_slice(data))
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::Inline { len, .. } => *len as usize,
            Payload::Store { len, .. } => *len,
            Payload::Heap(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub conn: ConnId,
    /// Header fields and params; the body comes from `payload`.
    pub frame: Frame,
    pub payload: Payload,
    encoded: Option<Bytes>,
    written: usize,
}

impl QueueEntry {
    pub fn new(conn: ConnId, mut frame: Frame) -> Self {
        let payload = Payload::from_bytes(&frame.body);
        frame.body = Bytes::new();
        Self {
            conn,
            frame,
            payload,
            encoded: None,
            written: 0,
        }
    }

    pub fn with_store(
        conn: ConnId,
        frame: Frame,
        region: StoreRegion,
        pos: usize,
        len: usize,
    ) -> Self {
        Self {
            conn,
            frame,
            payload: Payload::Store { region, pos, len },
            encoded: None,
            written: 0,
        }
    }

    pub fn started(&self) -> bool {
        self.encoded.is_some()
    }

    /// Registry copy frames of either kind read their bytes when they start,
    /// so an unsent one spanning `pos..pos + len` will carry a later write.
    fn covers_registry(&self, pos: usize, len: usize) -> bool {
        self.frame.code == Command::SysCpyMem.code()
            && matches!(
                self.payload,
                Payload::Store {
                    region: StoreRegion::Registry,
                    pos: p,
                    len: l,
                } if p <= pos && pos + len <= p + l
            )
    }

    fn is_registry_push(&self) -> bool {
        self.frame.code == Command::SysCpyMem.code()
            && self.frame.opt == 0
            && matches!(
                self.payload,
                Payload::Store {
                    region: StoreRegion::Registry,
                    ..
                }
            )
    }
}

/// Outcome of one flush attempt.
#[derive(Debug)]
pub enum Flushed {
    Idle,
    /// Part of the frame went out; the rest waits for the next pass.
    Partial(ConnId),
    Complete(ConnId),
    WouldBlock(ConnId),
    Failed(ConnId, io::Error),
}

#[derive(Debug, Default)]
pub struct WriteQueue {
    entries: VecDeque<QueueEntry>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, entry: QueueEntry) {
        self.entries.push_back(entry);
    }

    #[cfg(test)]
    pub(crate) fn pending_for(&self, conn: ConnId) -> usize {
        self.entries.iter().filter(|e| e.conn == conn).count()
    }

    #[cfg(test)]
    pub(crate) fn entries_for(&self, conn: ConnId) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter().filter(move |e| e.conn == conn)
    }

    /// Queues a registry range push to `conn`. Returns true when no new
    /// entry was needed: an unsent registry frame for `conn` already covers
    /// the range, or the connection's newest entry is an unstarted push that
    /// overlaps or adjoins it and was widened within one chunk.
    pub fn touch(&mut self, conn: ConnId, pos: usize, len: usize) -> bool {
        if self
            .entries
            .iter()
            .any(|e| e.conn == conn && !e.started() && e.covers_registry(pos, len))
        {
            return true;
        }
        if let Some(last) = self.entries.iter_mut().rev().find(|e| e.conn == conn)
            && !last.started()
            && last.is_registry_push()
            && let Payload::Store {
                pos: cur_pos,
                len: cur_len,
                ..
            } = last.payload
            && pos <= cur_pos + cur_len
            && cur_pos <= pos + len
        {
            let start = cur_pos.min(pos);
            let end = (cur_pos + cur_len).max(pos + len);
            if end - start <= CHUNK_MAX {
                last.payload = Payload::Store {
                    region: StoreRegion::Registry,
                    pos: start,
                    len: end - start,
                };
                last.frame.params = vec![start as i32, (end - start) as i32];
                return true;
            }
        }

        let frame = Frame::new(Command::SysCpyMem.code())
            .with_opt(0)
            .with_params(vec![pos as i32, len as i32]);
        self.push(QueueEntry::with_store(
            conn,
            frame,
            StoreRegion::Registry,
            pos,
            len,
        ));
        false
    }

    pub fn drop_conn(&mut self, conn: ConnId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.conn != conn);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!("Dropped {} queued frames for {}", dropped, conn);
        }
        dropped
    }

    /// Picks the head entry of the first connection that can take a write,
    /// preferring connections that did not block last time.
    fn pick(
        &self,
        writable: &impl Fn(ConnId) -> bool,
        waiting: &impl Fn(ConnId) -> bool,
    ) -> Option<usize> {
        let mut seen: Vec<ConnId> = Vec::new();
        let mut fallback = None;
        for (i, e) in self.entries.iter().enumerate() {
            if seen.contains(&e.conn) {
                continue;
            }
            seen.push(e.conn);
            if !writable(e.conn) {
                continue;
            }
            if !waiting(e.conn) {
                return Some(i);
            }
            fallback.get_or_insert(i);
        }
        fallback
    }

    /// Makes one write attempt.
    ///
    /// `writable` says whether a connection accepts writes at all,
    /// `waiting` whether its last write would have blocked.
    pub fn flush_one<W>(
        &mut self,
        registry: &[u8],
        arena: &[u8],
        writable: impl Fn(ConnId) -> bool,
        waiting: impl Fn(ConnId) -> bool,
        mut write: W,
    ) -> Flushed
    where
        W: FnMut(ConnId, &[u8]) -> io::Result<usize>,
    {
        let Some(index) = self.pick(&writable, &waiting) else {
            return Flushed::Idle;
        };
        let Some(entry) = self.entries.get_mut(index) else {
            return Flushed::Idle;
        };
        let conn = entry.conn;

        if entry.encoded.is_none() {
            let encoded = match &entry.payload {
                Payload::None => entry.frame.encode_with(Some(&b""[..])),
                Payload::Inline { data, len } => {
                    entry.frame.encode_with(Some(&data[..*len as usize]))
                }
                Payload::Heap(b) => entry.frame.encode_with(Some(&b[..])),
                Payload::Store { region, pos, len } => {
                    let source = match region {
                        StoreRegion::Registry => registry,
                        StoreRegion::Arena => arena,
                    };
                    match source.get(*pos..*pos + *len) {
                        Some(bytes) => entry.frame.encode_with(Some(bytes)),
                        None => {
                            warn!("Queued range {}+{} out of bounds for {}", pos, len, conn);
                            self.entries.remove(index);
                            return Flushed::Idle;
                        }
                    }
                }
            };
            match encoded {
                Ok(bytes) => entry.encoded = Some(bytes),
                Err(e) => {
                    warn!("Dropping unencodable frame for {}: {}", conn, e);
                    self.entries.remove(index);
                    return Flushed::Idle;
                }
            }
        }

        let Some(encoded) = entry.encoded.as_ref() else {
            return Flushed::Idle;
        };
        match write(conn, &encoded[entry.written..]) {
            Ok(n) => {
                entry.written += n;
                if entry.written >= encoded.len() {
                    self.entries.remove(index);
                    Flushed::Complete(conn)
                } else {
                    Flushed::Partial(conn)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Flushed::WouldBlock(conn),
            Err(e) => Flushed::Failed(conn, e),
        }
    }
}
