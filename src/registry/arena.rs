use super::layout::ARENA_SIZE;
use super::region::Region;
use crate::fatal;

/// Flat byte arena holding segment payloads at the offsets the registry
/// assigns.
#[derive(Debug)]
pub struct DataArena {
    region: Region,
}

impl DataArena {
    pub fn new(region: Region) -> Self {
        if region.len() < ARENA_SIZE {
            fatal!("arena region holds {} bytes, needs {}", region.len(), ARENA_SIZE);
        }
        Self { region }
    }

    pub fn in_memory() -> Self {
        Self::new(Region::heap(ARENA_SIZE))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.region.as_slice()[..ARENA_SIZE]
    }

    pub fn read(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.bytes().get(offset..end)
    }

    /// Writes inside the arena; `false` when the range does not fit.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> bool {
        let Some(end) = offset.checked_add(data.len()) else {
            return false;
        };
        if end > ARENA_SIZE {
            return false;
        }
        self.region.as_mut_slice()[offset..end].copy_from_slice(data);
        true
    }

    pub fn zero(&mut self, offset: usize, len: usize) {
        let end = (offset + len).min(ARENA_SIZE);
        if offset < end {
            self.region.as_mut_slice()[offset..end].fill(0);
        }
    }
}
