//! Replication Module
//!
//! Keeps every daemon's copy of the registry identical to the master's.
//!
//! ## Core Mechanisms
//! - **Pull**: A joiner copies the replicated registry block in chunks of at most
//!   60000 bytes, then the arena range of every occupied segment.
//! - **Push**: Each registry mutation on the master is sent to all daemons as a
//!   SYSCPYMEM(opt 0) range; unsent ranges to the same daemon widen in place.
//! - **Live payloads**: Queued chunks read their bytes when they start writing, so a
//!   mutation landing mid-transfer is never lost.

pub mod handlers;
pub mod sync;

pub use sync::{Progress, SyncCursor, SyncRequest, next_segment};
