//! Shared Registry Daemon Library
//!
//! One daemon runs on every host of the network. Together they keep a single
//! registry of named nodes, memory segments and request names consistent on
//! all hosts. One daemon is elected master and evaluates every mutation; a
//! deputy stands ready to take over; the rest copy the registry and follow.
//!
//! ## Architecture Modules
//! - **`wire`**: TCP frames, UDP datagrams and the command table.
//! - **`registry`**: The fixed-layout shared region, its name hashes and the
//!   operations the master applies to it.
//! - **`connection`**: The connection table, the per-connection write queue
//!   and wake-ups for local client processes.
//! - **`membership`**: Discovery, master/deputy election and failover.
//! - **`replication`**: Full registry copies for joiners and pushes of every
//!   later mutation.
//! - **`dispatch`**: Client requests: joins, segments, request names, routing.
//! - **`daemon`**: The sans-IO daemon core and its tokio driver.
//! - **`config`**: File and command-line settings.

pub mod config;
pub mod connection;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod membership;
pub mod registry;
pub mod replication;
pub mod wire;
