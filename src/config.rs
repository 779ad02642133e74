//! Daemon configuration.
//!
//! Settings come from an optional TOML file; command-line flags (or their
//! environment fallbacks) override whatever the file says.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 8120;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address other daemons know this host by.
    pub ip: Ipv4Addr,
    /// TCP and UDP port shared by every daemon on the network.
    pub port: u16,
    pub priority: i32,
    /// Discovery broadcast address; the limited broadcast when unset.
    pub broadcast: Option<Ipv4Addr>,
    /// Extra daemons to probe directly during discovery.
    pub seeds: Vec<Ipv4Addr>,
    /// Key of the registry region; the arena uses the next key. Defaults
    /// to the port.
    pub shm_key: Option<u32>,
    pub shm_dir: PathBuf,
    pub jitter_seed: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::LOCALHOST,
            port: DEFAULT_PORT,
            priority: 0,
            broadcast: None,
            seeds: Vec::new(),
            shm_key: None,
            shm_dir: PathBuf::from("/dev/shm"),
            jitter_seed: None,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn shm_key(&self) -> u32 {
        self.shm_key.unwrap_or(self.port as u32)
    }

    /// Where NEWDAEMON broadcasts and segment flushes go.
    pub fn discovery_targets(&self) -> Vec<SocketAddrV4> {
        let broadcast = self.broadcast.unwrap_or(Ipv4Addr::BROADCAST);
        let mut targets = vec![SocketAddrV4::new(broadcast, self.port)];
        for seed in &self.seeds {
            let addr = SocketAddrV4::new(*seed, self.port);
            if !targets.contains(&addr) {
                targets.push(addr);
            }
        }
        targets
    }
}

#[derive(Debug, Parser)]
#[command(name = "nsmd", version, about = "Shared registry peer daemon")]
pub struct Cli {
    /// TOML file with defaults for every option below.
    #[arg(long, env = "NSMD_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "NSMD_IP")]
    pub ip: Option<Ipv4Addr>,

    #[arg(long, env = "NSMD_PORT")]
    pub port: Option<u16>,

    #[arg(long, env = "NSMD_PRIORITY", allow_negative_numbers = true)]
    pub priority: Option<i32>,

    #[arg(long, env = "NSMD_BROADCAST")]
    pub broadcast: Option<Ipv4Addr>,

    /// Daemon to probe directly; may repeat.
    #[arg(long = "seed")]
    pub seeds: Vec<Ipv4Addr>,

    #[arg(long, env = "NSMD_SHM_KEY")]
    pub shm_key: Option<u32>,

    #[arg(long, env = "NSMD_SHM_DIR")]
    pub shm_dir: Option<PathBuf>,

    /// Fix the discovery jitter (reproducible runs).
    #[arg(long, hide = true)]
    pub jitter_seed: Option<u64>,
}

impl Cli {
    /// The file's settings with every given flag applied on top.
    pub fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)?,
            None => DaemonConfig::default(),
        };
        if let Some(ip) = self.ip {
            config.ip = ip;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(priority) = self.priority {
            config.priority = priority;
        }
        if self.broadcast.is_some() {
            config.broadcast = self.broadcast;
        }
        if !self.seeds.is_empty() {
            config.seeds = self.seeds;
        }
        if self.shm_key.is_some() {
            config.shm_key = self.shm_key;
        }
        if let Some(dir) = self.shm_dir {
            config.shm_dir = dir;
        }
        if self.jitter_seed.is_some() {
            config.jitter_seed = self.jitter_seed;
        }
        Ok(config)
    }
}
