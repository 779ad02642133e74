use std::net::Ipv4Addr;

use super::layout::*;
use super::region::{Region, format_header};
use crate::fatal;

/// A byte range of the replicated block that changed since the last drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Touch {
    pub pos: usize,
    pub len: usize,
}

impl Touch {
    pub fn end(&self) -> usize {
        self.pos + self.len
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    pub pid: i32,
    pub ip: Ipv4Addr,
    pub changed_at: u64,
    pub owned_first: Option<SegmentId>,
}

impl NodeRecord {
    pub fn is_used(&self) -> bool {
        !self.name.is_empty()
    }

    /// Registered and not yet released.
    pub fn is_live(&self) -> bool {
        self.is_used() && self.pid != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    pub name: String,
    pub format: String,
    pub offset: i32,
    pub size: u32,
    pub revision: u16,
    pub cycle: u16,
    pub owner: Option<NodeId>,
    pub refcount: u16,
    pub alloc_next: Option<SegmentId>,
    pub owner_next: Option<SegmentId>,
    pub created_at: u64,
}

impl SegmentRecord {
    pub fn is_used(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        let start = self.offset.max(0) as usize;
        start..start + self.size as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefRecord {
    pub node: NodeId,
    pub segment: SegmentId,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub name: String,
    pub code: u16,
}

/// Typed view over the registry region.
///
/// Every write into the replicated block is logged as a [`Touch`]; the daemon
/// drains the log after each handled event and pushes the ranges to its
/// peers. Writes that arrive from a peer go through [`Store::apply_bytes`]
/// and are not logged.
#[derive(Debug)]
pub struct Store {
    region: Region,
    touches: Vec<Touch>,
}

impl Store {
    pub fn new(region: Region) -> Self {
        if region.len() < REGION_SIZE {
            fatal!(
                "registry region holds {} bytes, layout needs {}",
                region.len(),
                REGION_SIZE
            );
        }
        Self {
            region,
            touches: Vec::new(),
        }
    }

    /// Zeroed heap-backed store, formatted for `pid`.
    pub fn in_memory(pid: i32, now: u64) -> Self {
        let mut region = Region::heap(REGION_SIZE);
        format_header(region.as_mut_slice(), pid, now);
        Self::new(region)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.region.as_slice()[..REGION_SIZE]
    }

    pub fn replicated(&self) -> &[u8] {
        &self.bytes()[REPLICATED_START..REPLICATED_END]
    }

    pub fn take_touches(&mut self) -> Vec<Touch> {
        std::mem::take(&mut self.touches)
    }

    #[cfg(test)]
    pub(crate) fn pending_touches(&self) -> &[Touch] {
        &self.touches
    }

    /// Overwrites a replicated range with bytes received from a peer.
    pub fn apply_bytes(&mut self, pos: usize, data: &[u8]) {
        let end = pos.checked_add(data.len()).unwrap_or(usize::MAX);
        if pos < REPLICATED_START || end > REPLICATED_END {
            fatal!(
                "registry chunk {}+{} outside replicated block {}..{}",
                pos,
                data.len(),
                REPLICATED_START,
                REPLICATED_END
            );
        }
        self.region.as_mut_slice()[pos..end].copy_from_slice(data);
    }

    fn log_touch(&mut self, pos: usize, len: usize) {
        if len == 0 || pos < REPLICATED_START || pos >= REPLICATED_END {
            return;
        }
        let len = len.min(REPLICATED_END - pos);
        if let Some(last) = self.touches.last_mut()
            && pos <= last.end()
            && pos + len >= last.pos
        {
            let start = last.pos.min(pos);
            let end = last.end().max(pos + len);
            last.pos = start;
            last.len = end - start;
            return;
        }
        self.touches.push(Touch { pos, len });
    }

    // -- raw accessors ----------------------------------------------------

    pub(crate) fn write(&mut self, pos: usize, data: &[u8]) {
        self.region.as_mut_slice()[pos..pos + data.len()].copy_from_slice(data);
        self.log_touch(pos, data.len());
    }

    pub(crate) fn zero(&mut self, pos: usize, len: usize) {
        self.region.as_mut_slice()[pos..pos + len].fill(0);
        self.log_touch(pos, len);
    }

    pub(crate) fn get_u8(&self, pos: usize) -> u8 {
        self.bytes()[pos]
    }

    pub(crate) fn get_u16(&self, pos: usize) -> u16 {
        u16::from_be_bytes([self.bytes()[pos], self.bytes()[pos + 1]])
    }

    pub(crate) fn get_i16(&self, pos: usize) -> i16 {
        self.get_u16(pos) as i16
    }

    pub(crate) fn get_u32(&self, pos: usize) -> u32 {
        let b = &self.bytes()[pos..pos + 4];
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    pub(crate) fn get_i32(&self, pos: usize) -> i32 {
        self.get_u32(pos) as i32
    }

    pub(crate) fn get_u64(&self, pos: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.bytes()[pos..pos + 8]);
        u64::from_be_bytes(b)
    }

    /// Reads a NUL-padded string field.
    pub(crate) fn get_str(&self, pos: usize, width: usize) -> String {
        let field = &self.bytes()[pos..pos + width];
        let end = field.iter().position(|&b| b == 0).unwrap_or(width);
        String::from_utf8_lossy(&field[..end]).into_owned()
    }

    /// Compares a stored name without allocating.
    pub(crate) fn name_eq(&self, pos: usize, name: &[u8]) -> bool {
        let field = &self.bytes()[pos..pos + NAME_LEN];
        name.len() < NAME_LEN && &field[..name.len()] == name && field[name.len()] == 0
    }

    pub(crate) fn set_u8(&mut self, pos: usize, v: u8) {
        self.write(pos, &[v]);
    }

    pub(crate) fn set_u16(&mut self, pos: usize, v: u16) {
        self.write(pos, &v.to_be_bytes());
    }

    pub(crate) fn set_i16(&mut self, pos: usize, v: i16) {
        self.write(pos, &v.to_be_bytes());
    }

    pub(crate) fn set_u32(&mut self, pos: usize, v: u32) {
        self.write(pos, &v.to_be_bytes());
    }

    pub(crate) fn set_i32(&mut self, pos: usize, v: i32) {
        self.write(pos, &v.to_be_bytes());
    }

    pub(crate) fn set_u64(&mut self, pos: usize, v: u64) {
        self.write(pos, &v.to_be_bytes());
    }

    pub(crate) fn set_str(&mut self, pos: usize, width: usize, s: &str) {
        let mut field = vec![0u8; width];
        let n = s.len().min(width - 1);
        field[..n].copy_from_slice(&s.as_bytes()[..n]);
        self.write(pos, &field);
    }

    // -- counters ---------------------------------------------------------

    pub fn node_count(&self) -> u16 {
        self.get_u16(CNT_NODES)
    }

    pub fn segment_count(&self) -> u16 {
        self.get_u16(CNT_SEGMENTS)
    }

    pub fn reference_count(&self) -> u16 {
        self.get_u16(CNT_REFERENCES)
    }

    pub fn request_count(&self) -> u16 {
        self.get_u16(CNT_REQUESTS)
    }

    pub(crate) fn bump(&mut self, counter: usize, delta: i32) {
        let v = self.get_u16(counter) as i32 + delta;
        self.set_u16(counter, v.clamp(0, u16::MAX as i32) as u16);
    }

    pub fn alloc_first(&self) -> Option<SegmentId> {
        SegmentId::from_index(self.get_i16(ALLOC_FIRST))
    }

    // -- records ----------------------------------------------------------

    pub fn node(&self, id: NodeId) -> NodeRecord {
        let at = id.offset();
        NodeRecord {
            name: self.get_str(at + NODE_NAME, NAME_LEN),
            pid: self.get_i32(at + NODE_PID),
            ip: Ipv4Addr::from(self.get_u32(at + NODE_IP)),
            changed_at: self.get_u64(at + NODE_CHANGED_AT),
            owned_first: SegmentId::from_index(self.get_i16(at + NODE_OWNED_FIRST)),
        }
    }

    pub fn segment(&self, id: SegmentId) -> SegmentRecord {
        let at = id.offset();
        SegmentRecord {
            name: self.get_str(at + SEG_NAME, NAME_LEN),
            format: self.get_str(at + SEG_FORMAT, FORMAT_LEN),
            offset: self.get_i32(at + SEG_OFFSET),
            size: self.get_u32(at + SEG_SIZE),
            revision: self.get_u16(at + SEG_REVISION),
            cycle: self.get_u16(at + SEG_CYCLE),
            owner: NodeId::from_index(self.get_i16(at + SEG_OWNER)),
            refcount: self.get_u16(at + SEG_REFCOUNT),
            alloc_next: SegmentId::from_index(self.get_i16(at + SEG_ALLOC_NEXT)),
            owner_next: SegmentId::from_index(self.get_i16(at + SEG_OWNER_NEXT)),
            created_at: self.get_u64(at + SEG_CREATED_AT),
        }
    }

    pub fn reference(&self, id: RefId) -> Option<RefRecord> {
        let at = id.offset();
        if self.get_u16(at + REF_IN_USE) == 0 {
            return None;
        }
        Some(RefRecord {
            node: NodeId::from_index(self.get_i16(at + REF_NODE))?,
            segment: SegmentId::from_index(self.get_i16(at + REF_SEGMENT))?,
            created_at: self.get_u64(at + REF_CREATED_AT),
        })
    }

    pub fn request(&self, id: ReqId) -> RequestRecord {
        let at = id.offset();
        RequestRecord {
            name: self.get_str(at + REQ_NAME, NAME_LEN),
            code: self.get_u16(at + REQ_CODE),
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, NodeRecord)> + '_ {
        NodeId::all()
            .map(|id| (id, self.node(id)))
            .filter(|(_, n)| n.is_live())
    }

    pub fn segments(&self) -> impl Iterator<Item = (SegmentId, SegmentRecord)> + '_ {
        SegmentId::all()
            .map(|id| (id, self.segment(id)))
            .filter(|(_, s)| s.is_used())
    }

    pub fn references(&self) -> impl Iterator<Item = (RefId, RefRecord)> + '_ {
        RefId::all().filter_map(|id| self.reference(id).map(|r| (id, r)))
    }

    pub fn requests(&self) -> impl Iterator<Item = (ReqId, RequestRecord)> + '_ {
        ReqId::all()
            .map(|id| (id, self.request(id)))
            .filter(|(_, r)| !r.name.is_empty())
    }

    /// Follows the address-ascending allocation list.
    pub fn alloc_chain(&self) -> Vec<SegmentId> {
        let mut chain = Vec::new();
        let mut cur = self.alloc_first();
        while let Some(id) = cur {
            if chain.len() > MAX_SEGMENTS {
                fatal!("allocation list loops at segment {}", id);
            }
            chain.push(id);
            cur = self.segment(id).alloc_next;
        }
        chain
    }

    /// Follows a node's owned-segment list.
    pub fn owned_chain(&self, node: NodeId) -> Vec<SegmentId> {
        let mut chain = Vec::new();
        let mut cur = self.node(node).owned_first;
        while let Some(id) = cur {
            if chain.len() > MAX_SEGMENTS {
                fatal!("owner list of node {} loops at segment {}", node, id);
            }
            chain.push(id);
            cur = self.segment(id).owner_next;
        }
        chain
    }
}
