//! Wire Protocol Module
//!
//! Everything that crosses a socket: the 16-byte TCP frame header with its
//! parameter list and body, the compact 8-byte UDP header used for discovery
//! and segment broadcasts, and the table of command codes.
//!
//! ## Submodules
//! - **`frame`**: TCP frames and the resumable `FrameReader`.
//! - **`udp`**: Discovery and data-copy datagrams.
//! - **`codes`**: Command codes, names and the protocol version.

pub mod codes;
pub mod frame;
pub mod udp;

pub use codes::Command;
pub use frame::{CHUNK_MAX, CodecError, Frame, FrameReader, NO_NODE};
pub use udp::Datagram;
