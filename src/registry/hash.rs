//! Open-addressing name index over registry records.
//!
//! Each table is `HASH_SIZE` big-endian `i32` slots. An empty slot is 0, an
//! occupied slot holds the byte offset of the record whose name (always the
//! first field of a record) hashed there. Collisions resolve by linear
//! probing with full name comparison.

use super::layout::{HASH_SIZE, HASH_SLOT, NAME_LEN, NODE_HASH_AT, REQUEST_HASH_AT, SEGMENT_HASH_AT};
use super::store::{Store, Touch};
use crate::fatal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashTable {
    Nodes,
    Segments,
    Requests,
}

impl HashTable {
    fn base(self) -> usize {
        match self {
            HashTable::Nodes => NODE_HASH_AT,
            HashTable::Segments => SEGMENT_HASH_AT,
            HashTable::Requests => REQUEST_HASH_AT,
        }
    }

    pub fn slot_pos(self, slot: usize) -> usize {
        self.base() + slot * HASH_SLOT
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    Lookup,
    /// Insert the record at this byte offset.
    Insert(i32),
    Delete,
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOutcome {
    Found { slot: usize, offset: i32 },
    Missing,
    Inserted { slot: usize },
    Duplicate { slot: usize, offset: i32 },
    /// Slots rewritten by the delete, one or two ranges when it wrapped.
    Deleted { touched: Vec<Touch> },
}

/// Home bucket of a name. Identical on every host.
pub fn home_bucket(name: &[u8]) -> usize {
    let mut h: u32 = 0;
    for (i, &b) in name.iter().enumerate() {
        h = h.rotate_left(5).wrapping_add((b as u32).wrapping_mul(i as u32 + 1));
    }
    (h % HASH_SIZE as u32) as usize
}

/// Is `k` cyclically inside `(gap, j]`?
fn between(gap: usize, k: usize, j: usize) -> bool {
    if gap <= j {
        gap < k && k <= j
    } else {
        gap < k || k <= j
    }
}

impl Store {
    fn slot(&self, table: HashTable, slot: usize) -> i32 {
        self.get_i32(table.slot_pos(slot))
    }

    fn slot_name(&self, offset: i32) -> Vec<u8> {
        let at = offset as usize;
        let field = &self.bytes()[at..at + NAME_LEN];
        let end = field.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        field[..end].to_vec()
    }

    /// Single entry point mirroring the three probe modes.
    #[cfg(test)]
    pub(crate) fn hash(&mut self, table: HashTable, name: &str, mode: HashMode) -> HashOutcome {
        match mode {
            HashMode::Lookup => match self.hash_lookup(table, name) {
                Some((slot, offset)) => HashOutcome::Found { slot, offset },
                None => HashOutcome::Missing,
            },
            HashMode::Insert(offset) => match self.hash_lookup(table, name) {
                Some((slot, existing)) => HashOutcome::Duplicate {
                    slot,
                    offset: existing,
                },
                None => HashOutcome::Inserted {
                    slot: self.hash_insert(table, name, offset),
                },
            },
            HashMode::Delete => match self.hash_delete(table, name) {
                Some(touched) => HashOutcome::Deleted { touched },
                None => HashOutcome::Missing,
            },
        }
    }

    pub fn hash_lookup(&self, table: HashTable, name: &str) -> Option<(usize, i32)> {
        let key = name.as_bytes();
        let home = home_bucket(key);
        for step in 0..HASH_SIZE {
            let slot = (home + step) % HASH_SIZE;
            let offset = self.slot(table, slot);
            if offset == 0 {
                return None;
            }
            if offset < 0 || offset as usize + NAME_LEN > self.bytes().len() {
                fatal!("{:?} hash slot {} holds bad offset {}", table, slot, offset);
            }
            if self.name_eq(offset as usize, key) {
                return Some((slot, offset));
            }
        }
        fatal!("{:?} hash probe for {} exhausted the table", table, name);
    }

    /// Writes `offset` into the first empty probed slot. Callers check for
    /// an existing key first; finding one here is corruption.
    pub fn hash_insert(&mut self, table: HashTable, name: &str, offset: i32) -> usize {
        let key = name.as_bytes();
        let home = home_bucket(key);
        for step in 0..HASH_SIZE {
            let slot = (home + step) % HASH_SIZE;
            let current = self.slot(table, slot);
            if current == 0 {
                self.set_i32(table.slot_pos(slot), offset);
                return slot;
            }
            if self.name_eq(current as usize, key) {
                fatal!("{:?} hash insert of {} found it at slot {}", table, name, slot);
            }
        }
        fatal!("{:?} hash table full inserting {}", table, name);
    }

    /// Empties the key's slot and shifts later entries of the probe run back
    /// into the gap so every remaining key stays reachable from its home.
    pub fn hash_delete(&mut self, table: HashTable, name: &str) -> Option<Vec<Touch>> {
        let (start, _) = self.hash_lookup(table, name)?;

        let mut gap = start;
        let mut last_changed = start;
        self.set_i32(table.slot_pos(gap), 0);

        let mut j = gap;
        for _ in 0..HASH_SIZE {
            j = (j + 1) % HASH_SIZE;
            let offset = self.slot(table, j);
            if offset == 0 {
                break;
            }
            let home = home_bucket(&self.slot_name(offset));
            if between(gap, home, j) {
                continue;
            }
            self.set_i32(table.slot_pos(gap), offset);
            self.set_i32(table.slot_pos(j), 0);
            gap = j;
            last_changed = j;
        }

        let span = (last_changed + HASH_SIZE - start) % HASH_SIZE + 1;
        let mut touched = Vec::with_capacity(2);
        if start + span <= HASH_SIZE {
            touched.push(Touch {
                pos: table.slot_pos(start),
                len: span * HASH_SLOT,
            });
        } else {
            let head = HASH_SIZE - start;
            touched.push(Touch {
                pos: table.slot_pos(start),
                len: head * HASH_SLOT,
            });
            touched.push(Touch {
                pos: table.slot_pos(0),
                len: (span - head) * HASH_SLOT,
            });
        }
        Some(touched)
    }

    /// Checks every occupied slot is reachable from its home bucket.
    #[cfg(test)]
    pub(crate) fn hash_consistent(&self, table: HashTable) -> bool {
        (0..HASH_SIZE).all(|slot| {
            let offset = self.slot(table, slot);
            if offset == 0 {
                return true;
            }
            let name = self.slot_name(offset);
            let home = home_bucket(&name);
            let mut s = home;
            loop {
                let at = self.slot(table, s);
                if at == 0 {
                    return false;
                }
                if s == slot {
                    return at == offset;
                }
                s = (s + 1) % HASH_SIZE;
                if s == home {
                    return false;
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn hash_occupancy(&self, table: HashTable) -> usize {
        (0..HASH_SIZE).filter(|&s| self.slot(table, s) != 0).count()
    }
}
