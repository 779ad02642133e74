use std::net::Ipv4Addr;

/// Senders kept in the refusal table.
pub const REFUSED_SLOTS: usize = 16;

/// Most-recently-refused senders of segment data, newest first.
#[derive(Debug, Default)]
pub struct RefusedLog {
    entries: Vec<(Ipv4Addr, u64)>,
}

impl RefusedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a refusal from `ip` and moves it to the front. Returns the
    /// running count when this refusal should be logged: the 1st, 10th,
    /// 100th, 1000th and then every 10000th.
    pub fn record(&mut self, ip: Ipv4Addr) -> Option<u64> {
        let count = match self.entries.iter().position(|(addr, _)| *addr == ip) {
            Some(i) => self.entries.remove(i).1 + 1,
            None => 1,
        };
        self.entries.insert(0, (ip, count));
        self.entries.truncate(REFUSED_SLOTS);

        matches!(count, 1 | 10 | 100 | 1000)
            .then_some(count)
            .or_else(|| (count % 10000 == 0).then_some(count))
    }

    pub fn count(&self, ip: Ipv4Addr) -> u64 {
        self.entries
            .iter()
            .find(|(addr, _)| *addr == ip)
            .map_or(0, |(_, n)| *n)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
