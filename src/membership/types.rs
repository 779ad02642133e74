use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Discovery rounds before a fresh daemon stands as candidate.
pub const INITCOUNT_FIRST: u32 = 4;
/// Rounds after losing both master and deputy.
pub const INITCOUNT_SECOND: u32 = 8;
/// Rounds added on hearing a better candidate.
pub const INITCOUNT_DELTA: u32 = 2;

pub const BROADCAST_MIN: Duration = Duration::from_millis(750);
pub const BROADCAST_JITTER: Duration = Duration::from_millis(750);
/// A master without a deputy keeps advertising at this pace.
pub const ADVERTISE_INTERVAL: Duration = Duration::from_secs(30);

/// Wire value of "no deputy" in a view.
const NO_ADDR: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Searching { countdown: u32 },
    Candidate,
    Master,
    Deputy,
    Member,
}

impl Role {
    /// Code published in the registry status block.
    pub fn code(self) -> u8 {
        match self {
            Role::Searching { .. } => 0,
            Role::Candidate => 1,
            Role::Master => 2,
            Role::Deputy => 3,
            Role::Member => 4,
        }
    }

    pub fn is_established(self) -> bool {
        matches!(self, Role::Master | Role::Deputy | Role::Member)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Searching { countdown } => write!(f, "SEARCHING({})", countdown),
            Role::Candidate => write!(f, "CANDIDATE"),
            Role::Master => write!(f, "MASTER"),
            Role::Deputy => write!(f, "DEPUTY"),
            Role::Member => write!(f, "MEMBER"),
        }
    }
}

/// Whether `(prio_a, ip_a)` is the better claim to mastership: higher
/// priority wins, equal priority goes to the lower address.
pub fn outranks(prio_a: i32, ip_a: Ipv4Addr, prio_b: i32, ip_b: Ipv4Addr) -> bool {
    prio_a > prio_b || (prio_a == prio_b && u32::from(ip_a) < u32::from(ip_b))
}

pub fn split_u64(v: u64) -> (i32, i32) {
    ((v >> 32) as u32 as i32, v as u32 as i32)
}

pub fn join_u64(hi: i32, lo: i32) -> u64 {
    ((hi as u32 as u64) << 32) | lo as u32 as u64
}

/// The network-wide arrangement carried by ACKDAEMON and NEWMASTER:
/// `[master, deputy, master start hi/lo, deputy start hi/lo, net start hi/lo, generation]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct View {
    pub master: Ipv4Addr,
    pub deputy: Option<Ipv4Addr>,
    pub master_started: u64,
    pub deputy_started: u64,
    pub net_started: u64,
    pub generation: u32,
}

impl View {
    pub const PARAMS: usize = 9;

    pub fn to_params(&self) -> Vec<i32> {
        let (m_hi, m_lo) = split_u64(self.master_started);
        let (d_hi, d_lo) = split_u64(self.deputy_started);
        let (n_hi, n_lo) = split_u64(self.net_started);
        vec![
            u32::from(self.master) as i32,
            self.deputy.map_or(NO_ADDR, u32::from) as i32,
            m_hi,
            m_lo,
            d_hi,
            d_lo,
            n_hi,
            n_lo,
            self.generation as i32,
        ]
    }

    pub fn from_params(params: &[i32]) -> Option<Self> {
        if params.len() != Self::PARAMS {
            return None;
        }
        let master = params[0] as u32;
        let deputy = params[1] as u32;
        if master == 0 || master == NO_ADDR || master == deputy {
            return None;
        }
        Some(Self {
            master: Ipv4Addr::from(master),
            deputy: (deputy != NO_ADDR && deputy != 0).then(|| Ipv4Addr::from(deputy)),
            master_started: join_u64(params[2], params[3]),
            deputy_started: join_u64(params[4], params[5]),
            net_started: join_u64(params[6], params[7]),
            generation: params[8] as u32,
        })
    }

    /// Same master and deputy, ignoring times and generation.
    pub fn same_places(&self, other: &View) -> bool {
        self.master == other.master && self.deputy == other.deputy
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.deputy {
            Some(d) => write!(f, "M={} D={} g={}", self.master, d, self.generation),
            None => write!(f, "M={} D=(none) g={}", self.master, self.generation),
        }
    }
}
