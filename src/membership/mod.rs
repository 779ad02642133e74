//! Membership & Election Module
//!
//! Decides which daemon is master and which is deputy, and keeps every
//! daemon's view of that arrangement consistent as daemons come and go.
//!
//! ## Core Mechanisms
//! - **Discovery**: Fresh daemons broadcast NEWDAEMON with a randomized 0.75 to 1.5 s
//!   interval and count down; an established master or deputy answers with ACKDAEMON.
//! - **Election**: Unanswered daemons stand as candidate once more and then claim
//!   mastership. Higher priority wins, ties go to the lower address.
//! - **Generations**: Every confirmed change of master or deputy bumps the generation
//!   and is announced with NEWMASTER; stale announcements are ignored.
//! - **Failover**: Losing the master promotes the deputy; losing both restarts discovery.

pub mod election;
pub mod handlers;
pub mod types;

pub use election::{Election, Lost, Tick};
pub use types::{Role, View, join_u64, outranks, split_u64};
