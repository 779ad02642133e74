//! Backing memory for the registry and the data arena.
//!
//! In production both live in memory-mapped files under a shared directory
//! (normally `/dev/shm`), named after two consecutive numeric keys so local
//! clients can map them read-only. Tests run on plain heap buffers.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{info, warn};

use super::layout::{
    ALLOC_FIRST, HDR_CREATED_AT, HDR_MAGIC, HDR_OWNER_PID, HDR_VERSION, LAYOUT_MAGIC,
    LAYOUT_VERSION, NO_INDEX,
};

pub enum Region {
    Heap(Vec<u8>),
    Mapped { mmap: MmapMut, path: PathBuf },
}

impl Region {
    pub fn heap(len: usize) -> Self {
        Region::Heap(vec![0; len])
    }

    /// Maps `dir/nsmd.<key>`, creating or resizing the file as needed.
    pub fn map(dir: &Path, key: u32, len: usize) -> Result<Self> {
        let path = region_path(dir, key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&path)
            .with_context(|| format!("failed to open shared region {}", path.display()))?;

        let current = file.metadata()?.len();
        if current != len as u64 {
            file.set_len(len as u64)
                .with_context(|| format!("failed to size shared region {}", path.display()))?;
        }

        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .with_context(|| format!("failed to map shared region {}", path.display()))?;

        Ok(Region::Mapped { mmap, path })
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Region::Heap(v) => v,
            Region::Mapped { mmap, .. } => mmap,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Region::Heap(v) => v,
            Region::Mapped { mmap, .. } => mmap,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Region::Heap(_) => None,
            Region::Mapped { path, .. } => Some(path),
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Region::Heap(v) => write!(f, "Region::Heap({} bytes)", v.len()),
            Region::Mapped { path, mmap } => {
                write!(f, "Region::Mapped({}, {} bytes)", path.display(), mmap.len())
            }
        }
    }
}

pub fn region_path(dir: &Path, key: u32) -> PathBuf {
    dir.join(format!("nsmd.{key}"))
}

/// Signal 0 probe: a process exists unless the kernel says `ESRCH`.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

/// How a claimed registry region came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Fresh,
    Reclaimed { previous_owner: i32 },
}

/// Claims the registry region at `key` and the arena at `key + 1`.
///
/// A region whose header names a live foreign owner is refused. A region that
/// is new, foreign-formatted, or left behind by a dead owner is zeroed along
/// with its arena and stamped with the caller as owner.
pub fn claim_regions(
    dir: &Path,
    key: u32,
    registry_len: usize,
    arena_len: usize,
    pid: i32,
    now: u64,
) -> Result<(Region, Region, Claim)> {
    let mut registry = Region::map(dir, key, registry_len)?;
    let mut arena = Region::map(dir, key + 1, arena_len)?;

    let bytes = registry.as_slice();
    let magic = u32::from_be_bytes(bytes[HDR_MAGIC..HDR_MAGIC + 4].try_into()?);
    let version = u32::from_be_bytes(bytes[HDR_VERSION..HDR_VERSION + 4].try_into()?);
    let owner = i32::from_be_bytes(bytes[HDR_OWNER_PID..HDR_OWNER_PID + 4].try_into()?);

    let claim = if magic != LAYOUT_MAGIC || version != LAYOUT_VERSION {
        if magic != 0 {
            warn!(
                "Region key {} carries foreign layout {:#x}/{}, reformatting",
                key, magic, version
            );
        }
        Claim::Fresh
    } else if owner != pid && pid_alive(owner) {
        bail!("shared region key {key} is still owned by live pid {owner}");
    } else {
        info!("Reclaiming region key {} left by pid {}", key, owner);
        Claim::Reclaimed {
            previous_owner: owner,
        }
    };

    registry.as_mut_slice().fill(0);
    arena.as_mut_slice().fill(0);
    format_header(registry.as_mut_slice(), pid, now);

    Ok((registry, arena, claim))
}

pub fn format_header(bytes: &mut [u8], pid: i32, now: u64) {
    bytes[HDR_MAGIC..HDR_MAGIC + 4].copy_from_slice(&LAYOUT_MAGIC.to_be_bytes());
    bytes[HDR_VERSION..HDR_VERSION + 4].copy_from_slice(&LAYOUT_VERSION.to_be_bytes());
    bytes[HDR_OWNER_PID..HDR_OWNER_PID + 4].copy_from_slice(&pid.to_be_bytes());
    bytes[HDR_CREATED_AT..HDR_CREATED_AT + 8].copy_from_slice(&now.to_be_bytes());
    bytes[ALLOC_FIRST..ALLOC_FIRST + 2].copy_from_slice(&NO_INDEX.to_be_bytes());
}
