//! Joiner-side cursor over the two copy phases.
//!
//! Phase one walks the replicated registry block in chunks; phase two
//! visits every occupied segment and asks for its arena range. Exactly one
//! request is outstanding at a time, so after a master change the cursor can
//! hand the same request to the new master.

use tracing::debug;

use crate::fatal;
use crate::registry::Store;
use crate::registry::layout::*;
use crate::wire::frame::CHUNK_MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    Registry { pos: usize, len: usize },
    Segment(SegmentId),
}

impl SyncRequest {
    /// REQCPYMEM parameters: `[pos, len]` for the registry, `[segment]` for the arena.
    pub fn params(&self) -> Vec<i32> {
        match *self {
            SyncRequest::Registry { pos, len } => vec![pos as i32, len as i32],
            SyncRequest::Segment(id) => vec![id.0 as i32],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Next(SyncRequest),
    Done,
    /// The answer did not match the outstanding request.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Idle,
    Copying(SyncRequest),
    Done,
}

#[derive(Debug, Default)]
pub struct SyncCursor {
    phase: Phase,
    pub chunks: u32,
    pub bytes: u64,
}

fn registry_request(pos: usize) -> SyncRequest {
    SyncRequest::Registry {
        pos,
        len: CHUNK_MAX.min(REPLICATED_END - pos),
    }
}

/// First occupied segment at or after `from`. A record that is half
/// allocated means the copied registry is corrupt.
pub fn next_segment(store: &Store, from: usize) -> Option<SegmentId> {
    for id in SegmentId::all().skip(from) {
        let seg = store.segment(id);
        if seg.is_used() != (seg.size != 0) || (seg.is_used() && seg.offset < 0) {
            fatal!(
                "broken segment record {} name={:?} offset={} size={}",
                id,
                seg.name,
                seg.offset,
                seg.size
            );
        }
        if seg.is_used() {
            return Some(id);
        }
    }
    None
}

impl SyncCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) -> SyncRequest {
        let first = registry_request(REPLICATED_START);
        self.phase = Phase::Copying(first);
        self.chunks = 0;
        self.bytes = 0;
        first
    }

    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Copying(_))
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// The request waiting for an answer, to reissue after a master change.
    pub fn outstanding(&self) -> Option<SyncRequest> {
        match self.phase {
            Phase::Copying(req) => Some(req),
            _ => None,
        }
    }

    /// A registry chunk arrived (already applied to `store`).
    pub fn registry_chunk(&mut self, store: &Store, pos: usize, len: usize) -> Progress {
        let Phase::Copying(SyncRequest::Registry {
            pos: want,
            len: want_len,
        }) = self.phase
        else {
            return Progress::Ignored;
        };
        if pos != want || len != want_len {
            debug!("Registry chunk {}+{} does not answer {}+{}", pos, len, want, want_len);
            return Progress::Ignored;
        }
        self.chunks += 1;
        self.bytes += len as u64;

        let next = pos + len;
        let progress = if next < REPLICATED_END {
            Progress::Next(registry_request(next))
        } else {
            match next_segment(store, 0) {
                Some(id) => Progress::Next(SyncRequest::Segment(id)),
                None => Progress::Done,
            }
        };
        self.advance(progress)
    }

    /// A segment's arena range arrived (or an empty answer for a segment
    /// the master reclaimed meanwhile).
    pub fn segment_chunk(&mut self, store: &Store, len: usize) -> Progress {
        let Phase::Copying(SyncRequest::Segment(current)) = self.phase else {
            return Progress::Ignored;
        };
        self.chunks += 1;
        self.bytes += len as u64;

        let progress = match next_segment(store, current.0 as usize + 1) {
            Some(id) => Progress::Next(SyncRequest::Segment(id)),
            None => Progress::Done,
        };
        self.advance(progress)
    }

    fn advance(&mut self, progress: Progress) -> Progress {
        self.phase = match progress {
            Progress::Next(req) => Phase::Copying(req),
            Progress::Done => Phase::Done,
            Progress::Ignored => self.phase,
        };
        progress
    }
}
