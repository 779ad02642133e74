//! Master/deputy election state.
//!
//! Pure bookkeeping: which connection is master and which is deputy, the
//! generation counter, and the discovery countdown. Sending and connecting
//! happen in the daemon handlers that drive this state.

use std::net::Ipv4Addr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::types::*;
use crate::connection::ConnId;

/// What a discovery tick asks the daemon to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Broadcast NEWDAEMON and tick again after `next`.
    Broadcast { next: Duration },
    /// Nobody answered: this daemon is now master.
    Claimed,
    /// Master without deputy: broadcast and tick again after `next`.
    Advertise { next: Duration },
    /// Nothing left to discover.
    Idle,
}

/// Which role slot a lost connection held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lost {
    Master,
    Deputy,
    Neither,
}

#[derive(Debug)]
pub struct Election {
    role: Role,
    /// `ConnId::SELF` when this daemon holds the slot.
    pub master: Option<ConnId>,
    pub deputy: Option<ConnId>,
    pub generation: u32,
    pub net_started_at: u64,
    /// Registry copy complete (or self-elected).
    pub ready: bool,
    candidacies: u32,
    rng: StdRng,
}

impl Election {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            role: Role::Searching {
                countdown: INITCOUNT_FIRST,
            },
            master: None,
            deputy: None,
            generation: 0,
            net_started_at: 0,
            ready: false,
            candidacies: 0,
            rng,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.master == Some(ConnId::SELF)
    }

    pub fn is_deputy(&self) -> bool {
        self.deputy == Some(ConnId::SELF)
    }

    /// Master or deputy: answers discovery and serves replication.
    pub fn is_serving(&self) -> bool {
        self.is_master() || self.is_deputy()
    }

    /// How many times this daemon stood as final candidate.
    pub fn candidacies(&self) -> u32 {
        self.candidacies
    }

    /// Randomized discovery interval, 0.75 to 1.5 s.
    pub fn jitter(&mut self) -> Duration {
        let extra = self.rng.gen_range(0..=BROADCAST_JITTER.as_millis() as u64);
        BROADCAST_MIN + Duration::from_millis(extra)
    }

    pub fn tick(&mut self, now: u64) -> Tick {
        match self.role {
            Role::Searching { countdown } if countdown > 0 => {
                self.role = Role::Searching {
                    countdown: countdown - 1,
                };
                debug!("Standing for master ({} rounds left)", countdown - 1);
                Tick::Broadcast {
                    next: self.jitter(),
                }
            }
            Role::Searching { .. } => {
                self.role = Role::Candidate;
                self.candidacies += 1;
                info!("No master answered, final claim as candidate");
                Tick::Broadcast {
                    next: self.jitter(),
                }
            }
            Role::Candidate => {
                self.master = Some(ConnId::SELF);
                self.deputy = None;
                self.generation += 1;
                self.ready = true;
                if self.net_started_at == 0 {
                    self.net_started_at = now;
                }
                self.role = Role::Master;
                info!("Selected myself as MASTER (generation {})", self.generation);
                Tick::Claimed
            }
            Role::Master if self.deputy.is_none() => Tick::Advertise {
                next: ADVERTISE_INTERVAL,
            },
            _ => Tick::Idle,
        }
    }

    /// A NEWDAEMON from another daemon still searching. Returns whether it
    /// outranks this one, in which case this daemon backs off.
    pub fn hear_candidate(&mut self, them: (i32, Ipv4Addr), me: (i32, Ipv4Addr)) -> bool {
        if !outranks(them.0, them.1, me.0, me.1) {
            return false;
        }
        match self.role {
            Role::Searching { countdown } => {
                self.role = Role::Searching {
                    countdown: countdown + INITCOUNT_DELTA,
                };
                debug!("Better candidate {} (priority {}), backing off", them.1, them.0);
                true
            }
            Role::Candidate => {
                self.role = Role::Searching {
                    countdown: INITCOUNT_DELTA,
                };
                info!("Better candidate {} appeared, withdrawing", them.1);
                true
            }
            _ => false,
        }
    }

    /// Forgets master and deputy and starts discovery over.
    pub fn restart_search(&mut self, countdown: u32) {
        self.master = None;
        self.deputy = None;
        self.ready = false;
        self.role = Role::Searching { countdown };
        info!("Searching for a master again ({} rounds)", countdown);
    }

    /// Derives the established role from the master and deputy slots.
    pub fn settle(&mut self) {
        let role = if self.is_master() {
            Role::Master
        } else if self.is_deputy() {
            Role::Deputy
        } else if self.master.is_some() {
            Role::Member
        } else {
            return;
        };
        if role != self.role {
            info!("Role {} -> {} (generation {})", self.role, role, self.generation);
            self.role = role;
        }
    }

    /// Clears whichever slot `conn` held.
    pub fn forget(&mut self, conn: ConnId) -> Lost {
        if self.master == Some(conn) {
            self.master = None;
            Lost::Master
        } else if self.deputy == Some(conn) {
            self.deputy = None;
            Lost::Deputy
        } else {
            Lost::Neither
        }
    }
}
