use std::time::Duration;

use crate::connection::ConnId;
use crate::wire::Frame;

/// Interval of the connection liveness sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
/// Sweeps a daemon connection may stay silent before it is closed.
pub const SILENT_SWEEPS: u64 = 3;
/// Delay before a failed join is answered.
pub const PENALTY_DELAY: Duration = Duration::from_secs(1);
/// How often owned segments are checked for a due broadcast.
pub const CAST_TICK: Duration = Duration::from_millis(100);
/// Segment cycles count in units of this many milliseconds.
pub const CYCLE_UNIT_MS: u64 = 10;
/// Cycle used when the allocation left it at zero: 10 s.
pub const DEFAULT_CYCLE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    DiscoveryBroadcast,
    LivenessSweep,
    /// Broadcast locally owned segments whose cycle elapsed.
    SegmentCast,
    /// Deferred reply to a local client; dropped if `pid` no longer owns `conn`.
    PenaltyReply { conn: ConnId, pid: i32, frame: Frame },
}

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub at: u64,
    pub task: Task,
}

/// Deferred work ordered by fire time; equal times fire in insertion order.
#[derive(Debug, Default)]
pub struct Schedule {
    entries: Vec<ScheduleEntry>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, at: u64, task: Task) {
        let index = self.entries.partition_point(|e| e.at <= at);
        self.entries.insert(index, ScheduleEntry { at, task });
    }

    /// Replaces any pending entry of the same kind.
    pub fn reschedule(&mut self, at: u64, task: Task) {
        self.cancel(|t| std::mem::discriminant(t) == std::mem::discriminant(&task));
        self.push(at, task);
    }

    pub fn cancel(&mut self, pred: impl Fn(&Task) -> bool) {
        self.entries.retain(|e| !pred(&e.task));
    }

    pub fn pop_due(&mut self, now: u64) -> Option<Task> {
        if self.entries.first()?.at > now {
            return None;
        }
        Some(self.entries.remove(0).task)
    }

    pub fn next_at(&self) -> Option<u64> {
        self.entries.first().map(|e| e.at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
