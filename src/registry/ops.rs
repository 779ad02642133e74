//! Registry mutations the master performs on behalf of clients.
//!
//! Each operation completes a logical group (record first, then the hash
//! slot, then the counter) before returning, so a peer applying the touched
//! ranges in order never sees a hash slot pointing at a half-written record.

use std::net::Ipv4Addr;

use tracing::{debug, info};

use super::hash::HashTable;
use super::layout::*;
use super::store::{NodeRecord, Store};
use crate::error::{RequestError, RequestResult};
use crate::fatal;

/// Parameters of a segment allocation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub node: NodeId,
    pub name: String,
    pub format: String,
    pub revision: u16,
    pub size: u32,
    pub cycle: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocated {
    pub segment: SegmentId,
    pub offset: usize,
    pub size: usize,
    /// Nodes still referencing an older revision; they must be disconnected.
    pub evicted: Vec<NodeId>,
}

/// What a node's departure released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Departure {
    pub released_refs: usize,
    pub orphaned: Vec<SegmentId>,
    pub reclaimed: Vec<SegmentId>,
}

impl Store {
    // -- lookups ----------------------------------------------------------

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        let (_, offset) = self.hash_lookup(HashTable::Nodes, name)?;
        match NodeId::from_offset(offset as usize) {
            Some(id) => Some(id),
            None => fatal!("node hash for {} points at offset {}", name, offset),
        }
    }

    pub fn find_segment(&self, name: &str) -> Option<SegmentId> {
        let (_, offset) = self.hash_lookup(HashTable::Segments, name)?;
        match SegmentId::from_offset(offset as usize) {
            Some(id) => Some(id),
            None => fatal!("segment hash for {} points at offset {}", name, offset),
        }
    }

    pub fn find_request(&self, name: &str) -> Option<ReqId> {
        let (_, offset) = self.hash_lookup(HashTable::Requests, name)?;
        match ReqId::from_offset(offset as usize) {
            Some(id) => Some(id),
            None => fatal!("request hash for {} points at offset {}", name, offset),
        }
    }

    pub fn request_by_code(&self, code: u16) -> Option<ReqId> {
        let index = code.checked_sub(REQUEST_CODE_BASE)?;
        let id = ReqId::from_index(i16::try_from(index).ok()?)?;
        if self.request(id).name.is_empty() {
            None
        } else {
            Some(id)
        }
    }

    pub fn nodes_on_host(&self, ip: Ipv4Addr) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, n)| n.ip == ip)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn referencing_nodes(&self, segment: SegmentId) -> Vec<NodeId> {
        self.references()
            .filter(|(_, r)| r.segment == segment)
            .map(|(_, r)| r.node)
            .collect()
    }

    /// The caller's owned segment covering `offset..offset+len` of the arena.
    /// A zero `len` asks for the whole segment starting at `offset`.
    pub fn owned_segment_containing(
        &self,
        node: NodeId,
        offset: usize,
        len: usize,
    ) -> Option<SegmentId> {
        self.owned_chain(node).into_iter().find(|&id| {
            let range = self.segment(id).range();
            if len == 0 {
                range.start == offset
            } else {
                range.start <= offset && offset + len <= range.end
            }
        })
    }

    // -- nodes ------------------------------------------------------------

    /// Grants `name` to a process. A live holder keeps the name; a holder
    /// whose process is gone is cleaned up and its slot reused.
    pub fn register_node(
        &mut self,
        name: &str,
        pid: i32,
        ip: Ipv4Addr,
        now: u64,
        holder_alive: impl Fn(&NodeRecord) -> bool,
    ) -> RequestResult<NodeId> {
        if !is_valid_name(name) {
            return Err(RequestError::InvalidName);
        }

        if let Some(id) = self.find_node(name) {
            let existing = self.node(id);
            if existing.is_live() {
                if holder_alive(&existing) {
                    debug!("Node {} still held by pid {}", name, existing.pid);
                    return Err(RequestError::Exists);
                }
                info!("Node {} held by vanished pid {}, reclaiming", name, existing.pid);
                self.deregister_node(id, now);
            }
            self.fill_node(id, pid, ip, now);
            self.bump(CNT_NODES, 1);
            return Ok(id);
        }

        let id = self.free_node_slot().ok_or(RequestError::NoFreeSlot)?;
        let previous = self.node(id);
        if previous.is_used() {
            self.hash_delete(HashTable::Nodes, &previous.name);
        }
        self.set_str(id.offset() + NODE_NAME, NAME_LEN, name);
        self.fill_node(id, pid, ip, now);
        self.hash_insert(HashTable::Nodes, name, id.offset() as i32);
        self.bump(CNT_NODES, 1);
        Ok(id)
    }

    fn fill_node(&mut self, id: NodeId, pid: i32, ip: Ipv4Addr, now: u64) {
        let at = id.offset();
        self.set_i32(at + NODE_PID, pid);
        self.set_u32(at + NODE_IP, u32::from(ip));
        self.set_u64(at + NODE_CHANGED_AT, now);
        self.set_i16(at + NODE_OWNED_FIRST, NO_INDEX);
    }

    /// A never-used slot, else the one released longest ago.
    fn free_node_slot(&self) -> Option<NodeId> {
        let mut oldest: Option<(NodeId, u64)> = None;
        for id in NodeId::all() {
            let node = self.node(id);
            if !node.is_used() {
                return Some(id);
            }
            if !node.is_live() && oldest.is_none_or(|(_, t)| node.changed_at < t) {
                oldest = Some((id, node.changed_at));
            }
        }
        oldest.map(|(id, _)| id)
    }

    /// Releases a node and everything hanging off it. The name stays indexed
    /// so a restarting process gets the same id back.
    pub fn deregister_node(&mut self, id: NodeId, now: u64) -> Departure {
        let mut departure = Departure::default();
        if !self.node(id).is_live() {
            return departure;
        }

        let refs: Vec<_> = self
            .references()
            .filter(|(_, r)| r.node == id)
            .map(|(rid, r)| (rid, r.segment))
            .collect();
        for (rid, segment) in refs {
            self.drop_reference(rid, segment);
            departure.released_refs += 1;
            if self.reclaim_if_idle(segment) {
                departure.reclaimed.push(segment);
            }
        }

        for segment in self.owned_chain(id) {
            let at = segment.offset();
            self.set_i16(at + SEG_OWNER, NO_INDEX);
            self.set_i16(at + SEG_OWNER_NEXT, NO_INDEX);
            if self.reclaim_if_idle(segment) {
                departure.reclaimed.push(segment);
            } else {
                departure.orphaned.push(segment);
            }
        }

        let at = id.offset();
        self.set_i16(at + NODE_OWNED_FIRST, NO_INDEX);
        self.set_i32(at + NODE_PID, 0);
        self.set_u32(at + NODE_IP, 0);
        self.set_u64(at + NODE_CHANGED_AT, now);
        self.bump(CNT_NODES, -1);

        debug!(
            "Node {} released: {} refs, {} orphaned, {} reclaimed",
            id,
            departure.released_refs,
            departure.orphaned.len(),
            departure.reclaimed.len()
        );
        departure
    }

    // -- segments ---------------------------------------------------------

    pub fn allocate_segment(&mut self, req: &Allocation, now: u64) -> RequestResult<Allocated> {
        if !is_valid_name(&req.name) {
            return Err(RequestError::InvalidName);
        }
        if req.format.is_empty()
            || req.format.len() >= FORMAT_LEN
            || req.size == 0
            || req.size as usize > ARENA_SIZE
            || req.revision == 0
        {
            return Err(RequestError::InvalidParameter);
        }
        if !self.node(req.node).is_live() {
            return Err(RequestError::NotFound);
        }

        match self.find_segment(&req.name) {
            Some(id) => self.reallocate(id, req),
            None => self.allocate_fresh(req, now),
        }
    }

    fn allocate_fresh(&mut self, req: &Allocation, now: u64) -> RequestResult<Allocated> {
        let id = SegmentId::all()
            .find(|&id| !self.segment(id).is_used())
            .ok_or(RequestError::NoFreeSlot)?;
        let size = req.size as usize;
        let (offset, after) = self.find_gap(size, None, None).ok_or(RequestError::NoFreeSlot)?;

        let at = id.offset();
        self.set_str(at + SEG_NAME, NAME_LEN, &req.name);
        self.set_str(at + SEG_FORMAT, FORMAT_LEN, &req.format);
        self.set_i32(at + SEG_OFFSET, offset as i32);
        self.set_u32(at + SEG_SIZE, req.size);
        self.set_u16(at + SEG_REVISION, req.revision);
        self.set_u16(at + SEG_CYCLE, req.cycle);
        self.set_i16(at + SEG_OWNER, req.node.index());
        self.set_u16(at + SEG_REFCOUNT, 0);
        self.set_i16(at + SEG_OWNER_NEXT, NO_INDEX);
        self.set_u64(at + SEG_CREATED_AT, now);
        self.link_alloc(id, after);
        self.link_owner(id, req.node);

        self.hash_insert(HashTable::Segments, &req.name, at as i32);
        self.bump(CNT_SEGMENTS, 1);

        info!(
            "Segment {} ({}) allocated at {}+{} for node {}",
            req.name, id, offset, size, req.node
        );
        Ok(Allocated {
            segment: id,
            offset,
            size,
            evicted: Vec::new(),
        })
    }

    /// An existing name may only be taken over while unowned.
    fn reallocate(&mut self, id: SegmentId, req: &Allocation) -> RequestResult<Allocated> {
        let seg = self.segment(id);
        if let Some(owner) = seg.owner {
            debug!("Segment {} already owned by node {}", seg.name, owner);
            return Err(RequestError::Exists);
        }

        let mut evicted = Vec::new();
        if req.revision > seg.revision {
            evicted = self.referencing_nodes(id);
            info!(
                "Segment {} moves to revision {} -> {}, evicting {} readers",
                seg.name,
                seg.revision,
                req.revision,
                evicted.len()
            );
        } else if req.revision < seg.revision {
            return Err(RequestError::StaleRevision);
        } else if req.format != seg.format {
            return Err(RequestError::Exists);
        }

        let size = req.size as usize;
        let mut offset = seg.range().start;
        if size != seg.size as usize {
            let (at, after) = self
                .find_gap(size, Some(offset), Some(id))
                .ok_or(RequestError::NoFreeSlot)?;
            self.unlink_alloc(id);
            offset = at;
            self.set_i32(id.offset() + SEG_OFFSET, offset as i32);
            self.set_u32(id.offset() + SEG_SIZE, req.size);
            self.link_alloc(id, after);
        }

        let at = id.offset();
        self.set_str(at + SEG_FORMAT, FORMAT_LEN, &req.format);
        self.set_u16(at + SEG_REVISION, req.revision);
        self.set_u16(at + SEG_CYCLE, req.cycle);
        self.set_i16(at + SEG_OWNER, req.node.index());
        self.set_i16(at + SEG_OWNER_NEXT, NO_INDEX);
        self.link_owner(id, req.node);

        Ok(Allocated {
            segment: id,
            offset,
            size,
            evicted,
        })
    }

    /// First-fit over the allocation list. `prefer` wins when the gap that
    /// contains it is large enough from that point on. The range of `moving`
    /// counts as free.
    fn find_gap(
        &self,
        size: usize,
        prefer: Option<usize>,
        moving: Option<SegmentId>,
    ) -> Option<(usize, Option<SegmentId>)> {
        let mut prev_end = 0usize;
        let mut prev: Option<SegmentId> = None;
        let mut first: Option<(usize, Option<SegmentId>)> = None;

        for id in self.alloc_chain().into_iter().filter(|&id| Some(id) != moving) {
            let range = self.segment(id).range();
            if range.start >= prev_end {
                if let Some(p) = prefer
                    && p >= prev_end
                    && p + size <= range.start
                {
                    return Some((p, prev));
                }
                if first.is_none() && range.start - prev_end >= size {
                    first = Some((prev_end, prev));
                }
            }
            prev_end = prev_end.max(range.end);
            prev = Some(id);
        }

        if let Some(p) = prefer
            && p >= prev_end
            && p + size <= ARENA_SIZE
        {
            return Some((p, prev));
        }
        if first.is_some() {
            return first;
        }
        (prev_end + size <= ARENA_SIZE).then_some((prev_end, prev))
    }

    fn link_alloc(&mut self, id: SegmentId, after: Option<SegmentId>) {
        match after {
            Some(prev) => {
                let next = self.get_i16(prev.offset() + SEG_ALLOC_NEXT);
                self.set_i16(id.offset() + SEG_ALLOC_NEXT, next);
                self.set_i16(prev.offset() + SEG_ALLOC_NEXT, id.index());
            }
            None => {
                let next = self.get_i16(ALLOC_FIRST);
                self.set_i16(id.offset() + SEG_ALLOC_NEXT, next);
                self.set_i16(ALLOC_FIRST, id.index());
            }
        }
    }

    fn unlink_alloc(&mut self, id: SegmentId) {
        let next = self.get_i16(id.offset() + SEG_ALLOC_NEXT);
        let chain = self.alloc_chain();
        match chain.iter().position(|&s| s == id) {
            Some(0) => self.set_i16(ALLOC_FIRST, next),
            Some(i) => self.set_i16(chain[i - 1].offset() + SEG_ALLOC_NEXT, next),
            None => fatal!("segment {} missing from the allocation list", id),
        }
        self.set_i16(id.offset() + SEG_ALLOC_NEXT, NO_INDEX);
    }

    fn link_owner(&mut self, id: SegmentId, node: NodeId) {
        match self.owned_chain(node).last() {
            Some(&tail) => self.set_i16(tail.offset() + SEG_OWNER_NEXT, id.index()),
            None => self.set_i16(node.offset() + NODE_OWNED_FIRST, id.index()),
        }
    }

    #[cfg(test)]
    fn unlink_owner(&mut self, id: SegmentId, node: NodeId) {
        let next = self.get_i16(id.offset() + SEG_OWNER_NEXT);
        let chain = self.owned_chain(node);
        match chain.iter().position(|&s| s == id) {
            Some(0) => self.set_i16(node.offset() + NODE_OWNED_FIRST, next),
            Some(i) => self.set_i16(chain[i - 1].offset() + SEG_OWNER_NEXT, next),
            None => fatal!("segment {} missing from owner list of node {}", id, node),
        }
        self.set_i16(id.offset() + SEG_OWNER_NEXT, NO_INDEX);
    }

    /// Frees a segment nobody owns or reads. Returns whether it was freed.
    fn reclaim_if_idle(&mut self, id: SegmentId) -> bool {
        let seg = self.segment(id);
        if !seg.is_used() || seg.owner.is_some() || seg.refcount > 0 {
            return false;
        }
        self.unlink_alloc(id);
        self.hash_delete(HashTable::Segments, &seg.name);
        self.zero(id.offset(), SEGMENT_SIZE);
        self.set_i16(id.offset() + SEG_ALLOC_NEXT, NO_INDEX);
        self.set_i16(id.offset() + SEG_OWNER_NEXT, NO_INDEX);
        self.set_i16(id.offset() + SEG_OWNER, NO_INDEX);
        self.bump(CNT_SEGMENTS, -1);
        debug!("Segment {} ({}) reclaimed", seg.name, id);
        true
    }

    /// Gives up ownership without departing, reclaiming when idle.
    #[cfg(test)]
    pub(crate) fn release_segment(&mut self, node: NodeId, id: SegmentId) -> RequestResult<()> {
        if self.segment(id).owner != Some(node) {
            return Err(RequestError::InvalidPointer);
        }
        self.unlink_owner(id, node);
        self.set_i16(id.offset() + SEG_OWNER, NO_INDEX);
        self.reclaim_if_idle(id);
        Ok(())
    }

    // -- references -------------------------------------------------------

    pub fn open_segment(
        &mut self,
        node: NodeId,
        name: &str,
        revision: u16,
        now: u64,
    ) -> RequestResult<SegmentId> {
        if !is_valid_name(name) {
            return Err(RequestError::InvalidName);
        }
        let id = self.find_segment(name).ok_or(RequestError::NotFound)?;
        let seg = self.segment(id);
        if revision != 0 && revision != seg.revision {
            return Err(RequestError::StaleRevision);
        }

        let mut free = None;
        for rid in RefId::all() {
            match self.reference(rid) {
                Some(r) if r.node == node && r.segment == id => {
                    return Err(RequestError::AlreadyOpened);
                }
                None if free.is_none() => free = Some(rid),
                _ => {}
            }
        }
        let rid = free.ok_or(RequestError::NoFreeSlot)?;

        let at = rid.offset();
        self.set_i16(at + REF_NODE, node.index());
        self.set_i16(at + REF_SEGMENT, id.index());
        self.set_u64(at + REF_CREATED_AT, now);
        self.set_u16(at + REF_IN_USE, 1);
        self.set_u16(id.offset() + SEG_REFCOUNT, seg.refcount + 1);
        self.bump(CNT_REFERENCES, 1);
        Ok(id)
    }

    pub fn close_segment(&mut self, node: NodeId, id: SegmentId) -> RequestResult<()> {
        let rid = self
            .references()
            .find(|(_, r)| r.node == node && r.segment == id)
            .map(|(rid, _)| rid)
            .ok_or(RequestError::NotFound)?;
        self.drop_reference(rid, id);
        self.reclaim_if_idle(id);
        Ok(())
    }

    fn drop_reference(&mut self, rid: RefId, segment: SegmentId) {
        self.zero(rid.offset(), REF_SIZE);
        let count = self.segment(segment).refcount;
        self.set_u16(segment.offset() + SEG_REFCOUNT, count.saturating_sub(1));
        self.bump(CNT_REFERENCES, -1);
    }

    // -- request names ----------------------------------------------------

    /// Registers a request name; an existing name returns its code.
    pub fn register_request(&mut self, name: &str) -> RequestResult<u16> {
        if !is_valid_name(name) {
            return Err(RequestError::InvalidName);
        }
        if let Some(id) = self.find_request(name) {
            return Ok(self.request(id).code);
        }

        let id = ReqId::all()
            .find(|&id| self.request(id).name.is_empty())
            .ok_or(RequestError::NoFreeSlot)?;
        let code = REQUEST_CODE_BASE + id.0;
        self.set_str(id.offset() + REQ_NAME, NAME_LEN, name);
        self.set_u16(id.offset() + REQ_CODE, code);
        self.hash_insert(HashTable::Requests, name, id.offset() as i32);
        self.bump(CNT_REQUESTS, 1);
        Ok(code)
    }

    pub fn deregister_request(&mut self, code: u16) -> RequestResult<()> {
        let id = self.request_by_code(code).ok_or(RequestError::NotFound)?;
        let name = self.request(id).name;
        self.hash_delete(HashTable::Requests, &name);
        self.zero(id.offset(), REQUEST_SIZE);
        self.bump(CNT_REQUESTS, -1);
        Ok(())
    }
}
