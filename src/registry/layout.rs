//! Byte layout of the registry region.
//!
//! Every multi-byte field is big-endian so that two daemons on different
//! hosts hold byte-identical copies and replication can move raw ranges.
//!
//! ```text
//! 0                 REPLICATED_START                 REPLICATED_END         REGION_SIZE
//! | local header    | counters | nodes | segments |  | status | connections |
//! |                 | refs | requests | 3 x hash   |  |                      |
//! ```

use std::fmt;

pub const MAX_NODES: usize = 256;
pub const MAX_SEGMENTS: usize = 256;
pub const MAX_REFERENCES: usize = 1024;
pub const MAX_REQUESTS: usize = 256;
pub const MAX_CONNECTIONS: usize = 64;

/// Prime, roughly twice the record capacity.
pub const HASH_SIZE: usize = 521;

/// Name field width; names hold at most `NAME_LEN - 1` bytes.
pub const NAME_LEN: usize = 32;
pub const FORMAT_LEN: usize = 64;

pub const ARENA_SIZE: usize = 1 << 20;

/// Node id handed to clients that join without a name.
pub const ANONYMOUS_NODE: u16 = MAX_NODES as u16;

/// Stored in every index field that points nowhere.
pub const NO_INDEX: i16 = -1;

pub const LAYOUT_MAGIC: u32 = 0x4e53_4d44;
pub const LAYOUT_VERSION: u32 = 1;

// -- local header ---------------------------------------------------------

pub const HDR_MAGIC: usize = 0;
pub const HDR_VERSION: usize = 4;
pub const HDR_OWNER_PID: usize = 8;
pub const HDR_CREATED_AT: usize = 16;

pub const REPLICATED_START: usize = 32;

// -- counters -------------------------------------------------------------

pub const CNT_NODES: usize = REPLICATED_START;
pub const CNT_SEGMENTS: usize = REPLICATED_START + 2;
pub const CNT_REFERENCES: usize = REPLICATED_START + 4;
pub const CNT_REQUESTS: usize = REPLICATED_START + 6;
pub const ALLOC_FIRST: usize = REPLICATED_START + 8;

// -- node records ---------------------------------------------------------

pub const NODES_AT: usize = REPLICATED_START + 16;
pub const NODE_SIZE: usize = 64;
pub const NODE_NAME: usize = 0;
pub const NODE_PID: usize = 32;
pub const NODE_IP: usize = 36;
pub const NODE_CHANGED_AT: usize = 40;
pub const NODE_OWNED_FIRST: usize = 48;

// -- segment records ------------------------------------------------------

pub const SEGMENTS_AT: usize = NODES_AT + MAX_NODES * NODE_SIZE;
pub const SEGMENT_SIZE: usize = 128;
pub const SEG_NAME: usize = 0;
pub const SEG_FORMAT: usize = 32;
pub const SEG_OFFSET: usize = 96;
pub const SEG_SIZE: usize = 100;
pub const SEG_REVISION: usize = 104;
pub const SEG_CYCLE: usize = 106;
pub const SEG_OWNER: usize = 108;
pub const SEG_REFCOUNT: usize = 110;
pub const SEG_ALLOC_NEXT: usize = 112;
pub const SEG_OWNER_NEXT: usize = 114;
pub const SEG_CREATED_AT: usize = 116;

// -- reference records ----------------------------------------------------

pub const REFS_AT: usize = SEGMENTS_AT + MAX_SEGMENTS * SEGMENT_SIZE;
pub const REF_SIZE: usize = 16;
pub const REF_NODE: usize = 0;
pub const REF_SEGMENT: usize = 2;
pub const REF_IN_USE: usize = 4;
pub const REF_CREATED_AT: usize = 8;

// -- request records ------------------------------------------------------

pub const REQUESTS_AT: usize = REFS_AT + MAX_REFERENCES * REF_SIZE;
pub const REQUEST_SIZE: usize = 40;
pub const REQ_NAME: usize = 0;
pub const REQ_CODE: usize = 32;

// -- hash tables ----------------------------------------------------------

pub const HASH_SLOT: usize = 4;
pub const NODE_HASH_AT: usize = REQUESTS_AT + MAX_REQUESTS * REQUEST_SIZE;
pub const SEGMENT_HASH_AT: usize = NODE_HASH_AT + HASH_SIZE * HASH_SLOT;
pub const REQUEST_HASH_AT: usize = SEGMENT_HASH_AT + HASH_SIZE * HASH_SLOT;

pub const REPLICATED_END: usize = REQUEST_HASH_AT + HASH_SIZE * HASH_SLOT;

// -- local status, not replicated -----------------------------------------

pub const STATUS_AT: usize = (REPLICATED_END + 7) & !7;
pub const ST_ROLE: usize = STATUS_AT;
pub const ST_READY: usize = STATUS_AT + 1;
pub const ST_GENERATION: usize = STATUS_AT + 4;
pub const ST_MASTER_IP: usize = STATUS_AT + 8;
pub const ST_DEPUTY_IP: usize = STATUS_AT + 12;
pub const ST_NET_STARTED_AT: usize = STATUS_AT + 16;
pub const ST_PRIORITY: usize = STATUS_AT + 24;

pub const CONNS_AT: usize = STATUS_AT + 32;
pub const CONN_RECORD_SIZE: usize = 48;
pub const CR_IP: usize = 0;
pub const CR_STATUS: usize = 4;
pub const CR_KIND: usize = 5;
pub const CR_NODE: usize = 6;
pub const CR_PID: usize = 8;
pub const CR_PRIORITY: usize = 12;
pub const CR_STARTED_AT: usize = 16;
pub const CR_RX_BYTES: usize = 24;
pub const CR_TX_BYTES: usize = 32;
pub const CR_RX_FRAMES: usize = 40;
pub const CR_TX_FRAMES: usize = 44;

pub const REGION_SIZE: usize = CONNS_AT + MAX_CONNECTIONS * CONN_RECORD_SIZE;

const _: () = assert!(SEG_CREATED_AT + 8 <= SEGMENT_SIZE);
const _: () = assert!(NODE_OWNED_FIRST + 2 <= NODE_SIZE);
const _: () = assert!(REQ_CODE + 2 <= REQUEST_SIZE);
const _: () = assert!(ALLOC_FIRST + 2 <= NODES_AT);
const _: () = assert!(ST_PRIORITY + 4 <= CONNS_AT);

macro_rules! record_id {
    ($name:ident, $base:expr, $size:expr, $cap:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u16);

        impl $name {
            pub const CAPACITY: usize = $cap;

            /// Byte offset of the record inside the registry region.
            pub fn offset(self) -> usize {
                $base + self.0 as usize * $size
            }

            pub fn from_offset(offset: usize) -> Option<Self> {
                let rel = offset.checked_sub($base)?;
                if rel % $size != 0 || rel / $size >= $cap {
                    return None;
                }
                Some(Self((rel / $size) as u16))
            }

            /// Decodes a stored index field (`-1` is none).
            pub fn from_index(index: i16) -> Option<Self> {
                if index < 0 || index as usize >= $cap {
                    None
                } else {
                    Some(Self(index as u16))
                }
            }

            pub fn index(self) -> i16 {
                self.0 as i16
            }

            pub fn all() -> impl Iterator<Item = Self> {
                (0..$cap as u16).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(NodeId, NODES_AT, NODE_SIZE, MAX_NODES);
record_id!(SegmentId, SEGMENTS_AT, SEGMENT_SIZE, MAX_SEGMENTS);
record_id!(RefId, REFS_AT, REF_SIZE, MAX_REFERENCES);
record_id!(ReqId, REQUESTS_AT, REQUEST_SIZE, MAX_REQUESTS);

/// Names are 1..NAME_LEN bytes of `[A-Za-z0-9_]`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() < NAME_LEN
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Application request codes are `REQUEST_CODE_BASE + request slot`.
pub const REQUEST_CODE_BASE: u16 = 0x1000;
