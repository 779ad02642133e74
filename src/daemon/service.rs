use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::context::{Daemon, Settings};
use super::net::{NetEvent, Transport, UdpTarget};
use crate::config::DaemonConfig;
use crate::connection::{ConnId, SignalProbe};
use crate::registry::layout::{ARENA_SIZE, REGION_SIZE};
use crate::registry::region::claim_regions;
use crate::registry::{DataArena, Store};
use crate::wire::frame::FrameReader;
use crate::wire::udp::MAX_DATAGRAM;
use crate::wire::{CodecError, Frame};

/// Upper bound on one wait of the event loop.
const TICK: Duration = Duration::from_millis(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// What socket tasks report to the coordinator. Stream events carry the
/// serial of the stream they came from so events of a closed stream are
/// not mistaken for its slot's next occupant.
enum Inbound {
    Datagram {
        from: Ipv4Addr,
        data: Bytes,
    },
    Accepted {
        stream: TcpStream,
        peer: Ipv4Addr,
    },
    Connected {
        conn: ConnId,
        serial: u64,
        stream: TcpStream,
    },
    ConnectFailed {
        conn: ConnId,
        serial: u64,
    },
    Frame {
        conn: ConnId,
        serial: u64,
        frame: Frame,
    },
    Malformed {
        conn: ConnId,
        serial: u64,
        error: CodecError,
    },
    Closed {
        conn: ConnId,
        serial: u64,
    },
}

struct Stream {
    serial: u64,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

/// Sockets behind a production daemon.
pub struct TokioTransport {
    udp: Arc<UdpSocket>,
    port: u16,
    discovery: Vec<SocketAddrV4>,
    streams: HashMap<ConnId, Stream>,
    connecting: HashMap<ConnId, (u64, JoinHandle<()>)>,
    next_serial: u64,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl TokioTransport {
    fn new(
        udp: Arc<UdpSocket>,
        port: u16,
        discovery: Vec<SocketAddrV4>,
        tx: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            udp,
            port,
            discovery,
            streams: HashMap::new(),
            connecting: HashMap::new(),
            next_serial: 0,
            tx,
        }
    }

    fn serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    /// Starts reading `stream` on behalf of `conn`.
    fn attach(&mut self, conn: ConnId, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay on {}: {}", conn, e);
        }
        let serial = self.serial();
        let (reader, writer) = stream.into_split();
        let reader = tokio::spawn(read_frames(conn, serial, reader, self.tx.clone()));
        if let Some(old) = self.streams.insert(
            conn,
            Stream {
                serial,
                writer,
                reader,
            },
        ) {
            old.reader.abort();
        }
    }

    fn is_current(&self, conn: ConnId, serial: u64) -> bool {
        self.streams.get(&conn).is_some_and(|s| s.serial == serial)
    }

    fn finish_connect(&mut self, conn: ConnId, serial: u64) -> bool {
        match self.connecting.get(&conn) {
            Some((pending, _)) if *pending == serial => {
                self.connecting.remove(&conn);
                true
            }
            _ => false,
        }
    }

    fn forget(&mut self, conn: ConnId) {
        if let Some(stream) = self.streams.remove(&conn) {
            stream.reader.abort();
        }
    }
}

impl Transport for TokioTransport {
    fn send_datagram(&mut self, target: UdpTarget, data: &[u8]) {
        let targets = match target {
            UdpTarget::Discovery => self.discovery.clone(),
            UdpTarget::Peer(ip) => vec![SocketAddrV4::new(ip, self.port)],
        };
        for addr in targets {
            if let Err(e) = self.udp.try_send_to(data, SocketAddr::V4(addr)) {
                warn!("Datagram to {} failed: {}", addr, e);
            }
        }
    }

    fn connect(&mut self, conn: ConnId, ip: Ipv4Addr) {
        let serial = self.serial();
        let addr = SocketAddrV4::new(ip, self.port);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let inbound = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await
            {
                Ok(Ok(stream)) => Inbound::Connected {
                    conn,
                    serial,
                    stream,
                },
                Ok(Err(e)) => {
                    warn!("Connect to {} failed: {}", addr, e);
                    Inbound::ConnectFailed { conn, serial }
                }
                Err(_) => {
                    warn!("Connect to {} timed out", addr);
                    Inbound::ConnectFailed { conn, serial }
                }
            };
            let _ = tx.send(inbound);
        });
        if let Some((_, old)) = self.connecting.insert(conn, (serial, task)) {
            old.abort();
        }
    }

    fn write(&mut self, conn: ConnId, data: &[u8]) -> io::Result<usize> {
        match self.streams.get(&conn) {
            Some(stream) => stream.writer.try_write(data),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn close(&mut self, conn: ConnId) {
        self.forget(conn);
        if let Some((_, task)) = self.connecting.remove(&conn) {
            task.abort();
        }
    }
}

async fn read_frames(
    conn: ConnId,
    serial: u64,
    mut reader: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Inbound>,
) {
    let mut frames = FrameReader::new();
    loop {
        let n = match reader.read(frames.buf_mut()).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Read on {} failed: {}", conn, e);
                break;
            }
        };
        let inbound = match frames.advance(n) {
            Ok(Some(frame)) => Inbound::Frame {
                conn,
                serial,
                frame,
            },
            Ok(None) => continue,
            Err(error) => {
                let _ = tx.send(Inbound::Malformed {
                    conn,
                    serial,
                    error,
                });
                return;
            }
        };
        if tx.send(inbound).is_err() {
            return;
        }
    }
    let _ = tx.send(Inbound::Closed { conn, serial });
}

async fn accept_loop(listener: TcpListener, tx: mpsc::UnboundedSender<Inbound>) {
    loop {
        match listener.accept().await {
            Ok((stream, SocketAddr::V4(peer))) => {
                if tx
                    .send(Inbound::Accepted {
                        stream,
                        peer: *peer.ip(),
                    })
                    .is_err()
                {
                    return;
                }
            }
            Ok((_, peer)) => warn!("Ignoring IPv6 connection from {}", peer),
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::UnboundedSender<Inbound>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, SocketAddr::V4(src))) => {
                let inbound = Inbound::Datagram {
                    from: *src.ip(),
                    data: Bytes::copy_from_slice(&buf[..len]),
                };
                if tx.send(inbound).is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to receive datagram: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// A daemon bound to real sockets and shared regions.
pub struct DaemonService {
    daemon: Daemon<TokioTransport>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    tasks: Vec<JoinHandle<()>>,
}

impl DaemonService {
    pub async fn bind(config: &DaemonConfig) -> Result<Self> {
        let pid = std::process::id() as i32;
        let now = unix_millis();
        let key = config.shm_key();
        let (registry, arena, claim) =
            claim_regions(&config.shm_dir, key, REGION_SIZE, ARENA_SIZE, pid, now)
                .with_context(|| format!("claiming shared regions with key {}", key))?;
        info!(
            "Shared regions {} and {} in {} ({:?})",
            key,
            key + 1,
            config.shm_dir.display(),
            claim
        );

        let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .with_context(|| format!("binding UDP port {}", config.port))?;
        udp.set_broadcast(true)?;
        let udp = Arc::new(udp);
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .with_context(|| format!("binding TCP port {}", config.port))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(accept_loop(listener, tx.clone())),
            tokio::spawn(receive_loop(udp.clone(), tx.clone())),
        ];
        let transport = TokioTransport::new(udp, config.port, config.discovery_targets(), tx);

        let settings = Settings {
            ip: config.ip,
            priority: config.priority,
            pid,
            jitter_seed: config.jitter_seed,
        };
        let daemon = Daemon::new(
            settings,
            transport,
            Store::new(registry),
            DataArena::new(arena),
            Box::new(SignalProbe),
            now,
        );
        Ok(Self { daemon, rx, tasks })
    }

    /// Runs until the daemon stops itself or the process is interrupted.
    pub async fn run(mut self) -> Result<()> {
        info!("Daemon {} listening", self.daemon.ip());
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);

        loop {
            tokio::select! {
                inbound = self.rx.recv() => match inbound {
                    Some(inbound) => self.dispatch(inbound),
                    None => break,
                },
                _ = ticker.tick() => {}
                _ = &mut interrupt => {
                    info!("Interrupted");
                    break;
                }
            }
            self.daemon.poll(unix_millis());
            if self.daemon.is_stopping() {
                break;
            }
        }

        for task in &self.tasks {
            task.abort();
        }
        info!("Daemon {} stopped", self.daemon.ip());
        Ok(())
    }

    fn dispatch(&mut self, inbound: Inbound) {
        let event = match inbound {
            Inbound::Datagram { from, data } => NetEvent::Datagram { from, data },
            Inbound::Accepted { stream, peer } => {
                if let Some(conn) = self.daemon.accept(peer) {
                    self.daemon.transport_mut().attach(conn, stream);
                }
                return;
            }
            Inbound::Connected {
                conn,
                serial,
                stream,
            } => {
                let transport = self.daemon.transport_mut();
                if !transport.finish_connect(conn, serial) {
                    return;
                }
                transport.attach(conn, stream);
                NetEvent::Connected(conn)
            }
            Inbound::ConnectFailed { conn, serial } => {
                if !self.daemon.transport_mut().finish_connect(conn, serial) {
                    return;
                }
                NetEvent::Closed(conn)
            }
            Inbound::Frame {
                conn,
                serial,
                frame,
            } => {
                if !self.daemon.transport_mut().is_current(conn, serial) {
                    return;
                }
                NetEvent::Frame { conn, frame }
            }
            Inbound::Malformed {
                conn,
                serial,
                error,
            } => {
                if !self.daemon.transport_mut().is_current(conn, serial) {
                    return;
                }
                NetEvent::Malformed { conn, error }
            }
            Inbound::Closed { conn, serial } => {
                let transport = self.daemon.transport_mut();
                if !transport.is_current(conn, serial) {
                    return;
                }
                transport.forget(conn);
                NetEvent::Closed(conn)
            }
        };
        self.daemon.handle(event);
    }
}
