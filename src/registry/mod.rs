//! Shared Registry Module
//!
//! The registry is the state every daemon in the network agrees on: nodes
//! (named client processes), data segments laid out in a flat arena,
//! references from readers to segments, and request names. It lives in one
//! fixed-size byte region so local clients can map it and peers can copy it
//! range by range.
//!
//! ## Submodules
//! - **`layout`**: Offsets, capacities and typed record handles.
//! - **`region`**: Heap or memory-mapped backing, with owner-pid claiming.
//! - **`store`**: Typed record access and the touched-range log used by replication.
//! - **`hash`**: Open-addressing name index with backward-shift deletion.
//! - **`ops`**: Register/deregister, first-fit allocation, open/close, request names.
//! - **`arena`**: The segment payload area.

pub mod arena;
pub mod hash;
pub mod layout;
pub mod ops;
pub mod region;
pub mod store;

pub use arena::DataArena;
pub use layout::{NodeId, RefId, ReqId, SegmentId};
pub use store::{Store, Touch};

#[cfg(test)]
mod tests;
