//! Daemon Runtime Module
//!
//! One `Daemon` value per daemon instance holds all of its state. The core is
//! sans-IO: it consumes [`NetEvent`]s and clock readings and acts through a
//! [`Transport`], which lets the same code run over tokio sockets in
//! production and over a deterministic in-process network in tests.
//!
//! ## Loop Pass
//! Each pass of the driver handles at most one inbound event (or wakes on
//! the 10 ms tick), then calls `poll`, which fires every due schedule entry
//! and drains the write queue until it is empty or every remaining
//! destination would block.
//! Work is batched per pass rather than taken one unit at a time: all of it
//! still runs on the one coordinator task, and a blocked destination only
//! defers its own entries.
//!
//! ## Submodules
//! - **`context`**: The `Daemon` struct, event entry points, write-queue draining.
//! - **`net`**: The `Transport` seam and the events sockets produce.
//! - **`schedule`**: Discovery ticks, liveness sweeps, segment casts and penalty replies.
//! - **`service`**: The tokio driver binding sockets to a `Daemon`.

pub mod context;
pub mod net;
pub mod schedule;
pub mod service;

pub use context::{Daemon, Settings};
pub use net::{NetEvent, Transport, UdpTarget};
pub use service::DaemonService;

#[cfg(test)]
pub(crate) mod sim;

#[cfg(test)]
mod tests;
