//! Request Dispatch Module
//!
//! Evaluates, forwards and answers client requests: joins and leaves,
//! segment allocation and references, request-name registration, segment
//! broadcasts and application traffic between nodes.

pub mod handlers;
pub mod refused;

pub use refused::RefusedLog;
