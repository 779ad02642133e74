//! Deterministic in-process network for protocol tests.
//!
//! Daemons share one bus. Datagrams, connection attempts, stream bytes and
//! hang-ups are queued in send order and delivered between clock steps, so a
//! scenario replays identically on every run. Clients are plain endpoints
//! that write frames and collect what the daemon sends them.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Notify;

use super::context::{Daemon, Settings};
use super::net::{NetEvent, Transport, UdpTarget};
use crate::connection::{ChannelProbe, ConnId};
use crate::registry::{DataArena, Store};
use crate::wire::{Datagram, Frame, FrameReader};

/// Clock step between polls.
pub const STEP: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Party {
    Daemon(Ipv4Addr),
    Client(usize),
}

type End = (Party, ConnId);

enum Pending {
    Datagram {
        from: Ipv4Addr,
        to: UdpTarget,
        data: Bytes,
    },
    Connect {
        from: Ipv4Addr,
        conn: ConnId,
        to: Ipv4Addr,
    },
    Bytes {
        from: End,
        data: Vec<u8>,
    },
    Close {
        to: End,
    },
}

#[derive(Default)]
struct Bus {
    pending: VecDeque<Pending>,
    links: HashMap<End, End>,
}

impl Bus {
    fn unlink(&mut self, end: End) -> Option<End> {
        let peer = self.links.remove(&end)?;
        self.links.remove(&peer);
        Some(peer)
    }
}

pub struct SimTransport {
    ip: Ipv4Addr,
    bus: Rc<RefCell<Bus>>,
}

impl Transport for SimTransport {
    fn send_datagram(&mut self, target: UdpTarget, data: &[u8]) {
        self.bus.borrow_mut().pending.push_back(Pending::Datagram {
            from: self.ip,
            to: target,
            data: Bytes::copy_from_slice(data),
        });
    }

    fn connect(&mut self, conn: ConnId, ip: Ipv4Addr) {
        self.bus.borrow_mut().pending.push_back(Pending::Connect {
            from: self.ip,
            conn,
            to: ip,
        });
    }

    fn write(&mut self, conn: ConnId, data: &[u8]) -> io::Result<usize> {
        let mut bus = self.bus.borrow_mut();
        let me = (Party::Daemon(self.ip), conn);
        if !bus.links.contains_key(&me) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        bus.pending.push_back(Pending::Bytes {
            from: me,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn close(&mut self, conn: ConnId) {
        let mut bus = self.bus.borrow_mut();
        if let Some(peer) = bus.unlink((Party::Daemon(self.ip), conn)) {
            bus.pending.push_back(Pending::Close { to: peer });
        }
    }
}

pub struct SimClient {
    pub host: Ipv4Addr,
    pub pid: i32,
    pub inbox: VecDeque<Frame>,
    pub closed: bool,
    pub wakeups: Arc<Notify>,
}

pub struct Sim {
    bus: Rc<RefCell<Bus>>,
    daemons: Vec<Daemon<SimTransport>>,
    readers: HashMap<End, FrameReader>,
    clients: Vec<SimClient>,
    probe: ChannelProbe,
    /// Datagrams addressed to hosts without a daemon.
    strays: Vec<(Ipv4Addr, Bytes)>,
    now: u64,
}

pub fn host(octet: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, octet)
}

impl Sim {
    pub fn new() -> Self {
        Self {
            bus: Rc::new(RefCell::new(Bus::default())),
            daemons: Vec::new(),
            readers: HashMap::new(),
            clients: Vec::new(),
            probe: ChannelProbe::new(),
            strays: Vec::new(),
            now: 1_000,
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// Starts a daemon on `10.0.0.<octet>`.
    pub fn start(&mut self, octet: u8, priority: i32) -> Ipv4Addr {
        let ip = host(octet);
        let settings = Settings {
            ip,
            priority,
            pid: 100 + octet as i32,
            jitter_seed: Some(octet as u64),
        };
        let transport = SimTransport {
            ip,
            bus: self.bus.clone(),
        };
        let daemon = Daemon::new(
            settings,
            transport,
            Store::in_memory(100 + octet as i32, self.now),
            DataArena::in_memory(),
            Box::new(self.probe.clone()),
            self.now,
        );
        self.daemons.push(daemon);
        ip
    }

    pub fn daemon(&self, ip: Ipv4Addr) -> &Daemon<SimTransport> {
        self.daemons
            .iter()
            .find(|d| d.ip() == ip)
            .unwrap_or_else(|| panic!("no daemon at {}", ip))
    }

    pub fn daemon_mut(&mut self, ip: Ipv4Addr) -> &mut Daemon<SimTransport> {
        self.daemons
            .iter_mut()
            .find(|d| d.ip() == ip)
            .unwrap_or_else(|| panic!("no daemon at {}", ip))
    }

    /// Decoded datagrams sent to `ip`, where no daemon runs.
    pub fn datagrams_to(&self, ip: Ipv4Addr) -> Vec<Datagram> {
        self.strays
            .iter()
            .filter(|(to, _)| *to == ip)
            .filter_map(|(_, data)| Datagram::decode(data).ok().flatten())
            .collect()
    }

    pub fn daemons(&self) -> impl Iterator<Item = &Daemon<SimTransport>> {
        self.daemons.iter()
    }

    /// Kills a daemon outright: its peers see every connection drop.
    pub fn crash(&mut self, ip: Ipv4Addr) {
        self.daemons.retain(|d| d.ip() != ip);
        let mut bus = self.bus.borrow_mut();
        let ends: Vec<End> = bus
            .links
            .keys()
            .filter(|(party, _)| *party == Party::Daemon(ip))
            .copied()
            .collect();
        for end in ends {
            if let Some(peer) = bus.unlink(end) {
                bus.pending.push_back(Pending::Close { to: peer });
            }
        }
    }

    /// Advances the clock one step and delivers everything in flight.
    pub fn step(&mut self) {
        self.now += STEP;
        for daemon in &mut self.daemons {
            daemon.poll(self.now);
        }
        self.deliver();
        for daemon in &mut self.daemons {
            daemon.flush();
        }
        self.deliver();
    }

    pub fn run_for(&mut self, ms: u64) {
        let until = self.now + ms;
        while self.now < until {
            self.step();
        }
    }

    /// Steps until `done` holds, for at most `ms`. Returns whether it held.
    pub fn run_until(&mut self, ms: u64, mut done: impl FnMut(&Sim) -> bool) -> bool {
        let until = self.now + ms;
        while self.now < until {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    fn deliver(&mut self) {
        for _ in 0..1_000_000 {
            let next = self.bus.borrow_mut().pending.pop_front();
            let Some(pending) = next else {
                return;
            };
            match pending {
                Pending::Datagram { from, to, data } => {
                    if let UdpTarget::Peer(ip) = to
                        && !self.daemons.iter().any(|d| d.ip() == ip)
                    {
                        self.strays.push((ip, data.clone()));
                    }
                    for daemon in &mut self.daemons {
                        let wanted = match to {
                            UdpTarget::Discovery => daemon.ip() != from,
                            UdpTarget::Peer(ip) => daemon.ip() == ip,
                        };
                        if wanted {
                            daemon.handle(NetEvent::Datagram {
                                from,
                                data: data.clone(),
                            });
                        }
                    }
                }
                Pending::Connect { from, conn, to } => self.connect(from, conn, to),
                Pending::Bytes { from, data } => self.carry(from, &data),
                Pending::Close { to } => {
                    self.readers.remove(&to);
                    match to.0 {
                        Party::Daemon(ip) => {
                            if let Some(d) = self.daemons.iter_mut().find(|d| d.ip() == ip) {
                                d.handle(NetEvent::Closed(to.1));
                            }
                        }
                        Party::Client(i) => self.clients[i].closed = true,
                    }
                }
            }
        }
        panic!("simulated network never went quiet");
    }

    fn connect(&mut self, from: Ipv4Addr, conn: ConnId, to: Ipv4Addr) {
        let accepted = self
            .daemons
            .iter_mut()
            .find(|d| d.ip() == to)
            .and_then(|d| d.accept(from));
        let event = match accepted {
            Some(theirs) => {
                let ours = (Party::Daemon(from), conn);
                let theirs = (Party::Daemon(to), theirs);
                self.link(ours, theirs);
                NetEvent::Connected(conn)
            }
            None => NetEvent::Closed(conn),
        };
        if let Some(d) = self.daemons.iter_mut().find(|d| d.ip() == from) {
            d.handle(event);
        }
    }

    fn link(&mut self, a: End, b: End) {
        let mut bus = self.bus.borrow_mut();
        bus.links.insert(a, b);
        bus.links.insert(b, a);
        self.readers.insert(a, FrameReader::new());
        self.readers.insert(b, FrameReader::new());
    }

    fn carry(&mut self, from: End, data: &[u8]) {
        let Some(to) = self.bus.borrow().links.get(&from).copied() else {
            return;
        };
        let frames = self.readers.entry(to).or_default().feed(data);
        match to.0 {
            Party::Daemon(ip) => {
                let Some(daemon) = self.daemons.iter_mut().find(|d| d.ip() == ip) else {
                    return;
                };
                match frames {
                    Ok(frames) => {
                        for frame in frames {
                            daemon.handle(NetEvent::Frame { conn: to.1, frame });
                        }
                    }
                    Err(error) => daemon.handle(NetEvent::Malformed { conn: to.1, error }),
                }
            }
            Party::Client(i) => {
                let frames = frames.unwrap_or_else(|e| panic!("client {} got garbage: {}", i, e));
                self.clients[i].inbox.extend(frames);
            }
        }
    }

    // -- clients ------------------------------------------------------------

    /// Connects a client process `pid` to the daemon on `host`.
    pub fn client(&mut self, host: Ipv4Addr, pid: i32) -> usize {
        let index = self.clients.len();
        let daemon = self.daemon_mut(host);
        let conn = daemon
            .accept(host)
            .unwrap_or_else(|| panic!("daemon {} refused a client", host));
        self.link((Party::Client(index), ConnId(0)), (Party::Daemon(host), conn));
        let wakeups = self.probe.register(pid);
        self.clients.push(SimClient {
            host,
            pid,
            inbox: VecDeque::new(),
            closed: false,
            wakeups,
        });
        index
    }

    pub fn client_ref(&self, index: usize) -> &SimClient {
        &self.clients[index]
    }

    pub fn send(&mut self, index: usize, frame: Frame) {
        let data = frame.encode().expect("client frame encodes").to_vec();
        self.bus.borrow_mut().pending.push_back(Pending::Bytes {
            from: (Party::Client(index), ConnId(0)),
            data,
        });
    }

    /// Sends `frame` and steps until an answer arrives (at most 5 s).
    pub fn request(&mut self, index: usize, frame: Frame) -> Frame {
        self.send(index, frame);
        let answered = self.run_until(5_000, |sim| !sim.clients[index].inbox.is_empty());
        assert!(answered, "client {} got no answer", index);
        self.recv(index).expect("answer queued")
    }

    pub fn recv(&mut self, index: usize) -> Option<Frame> {
        self.clients[index].inbox.pop_front()
    }

    /// The client process exits: its connection drops and its pid dies.
    pub fn kill_client(&mut self, index: usize) {
        let pid = self.clients[index].pid;
        self.probe.unregister(pid);
        self.clients[index].closed = true;
        let mut bus = self.bus.borrow_mut();
        if let Some(peer) = bus.unlink((Party::Client(index), ConnId(0))) {
            bus.pending.push_back(Pending::Close { to: peer });
        }
    }
}
