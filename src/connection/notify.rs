//! Waking client processes on this host.
//!
//! A local client may be blocked on something other than its socket, so
//! after a frame to it is fully written the daemon pokes its pid. In
//! production the poke is `SIGUSR1`; in tests each simulated client owns a
//! `tokio::sync::Notify` registered under its pid.

use std::sync::Arc;

use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::Notify;

use crate::registry::region::pid_alive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No such process; the connection should go.
    Gone,
}

pub trait ProcessProbe {
    fn is_alive(&self, pid: i32) -> bool;

    /// Non-blocking wake-up.
    fn notify(&self, pid: i32) -> Delivery;
}

/// Signals real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: i32) -> bool {
        pid_alive(pid)
    }

    fn notify(&self, pid: i32) -> Delivery {
        if pid <= 0 {
            return Delivery::Gone;
        }
        match kill(Pid::from_raw(pid), Signal::SIGUSR1) {
            Err(Errno::ESRCH) => Delivery::Gone,
            _ => Delivery::Delivered,
        }
    }
}

/// In-process stand-in: pids are whatever the test registers.
#[derive(Debug, Default, Clone)]
pub struct ChannelProbe {
    waiters: Arc<DashMap<i32, Arc<Notify>>>,
}

impl ChannelProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: i32) -> Arc<Notify> {
        self.waiters
            .entry(pid)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Simulates the process exiting.
    pub fn unregister(&self, pid: i32) {
        self.waiters.remove(&pid);
    }
}

impl ProcessProbe for ChannelProbe {
    fn is_alive(&self, pid: i32) -> bool {
        self.waiters.contains_key(&pid)
    }

    fn notify(&self, pid: i32) -> Delivery {
        match self.waiters.get(&pid) {
            Some(waiter) => {
                waiter.notify_one();
                Delivery::Delivered
            }
            None => Delivery::Gone,
        }
    }
}
