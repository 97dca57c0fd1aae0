//! Parsed view of `/proc/self/maps`.

use nix::sys::mman::ProtFlags;
use procfs::process::{MMPermissions, MMapPath, Process};

use crate::prelude::*;

/// One virtually contiguous region of the current address space.
#[derive(Debug, Clone)]
pub struct MapRegion {
    pub start: usize,
    pub end: usize,
    pub perms: MMPermissions,
    pub offset: u64,
    pub inode: u64,
    /// Pathname as the kernel reports it; empty for anonymous mappings.
    pub pathname: String,
}

impl MapRegion {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn is_readable(&self) -> bool {
        self.perms.contains(MMPermissions::READ)
    }

    pub fn is_executable(&self) -> bool {
        self.perms.contains(MMPermissions::EXECUTE)
    }

    /// The region's permissions as `mmap`/`mprotect` flags.
    pub fn prot(&self) -> ProtFlags {
        let mut prot = ProtFlags::empty();
        if self.perms.contains(MMPermissions::READ) {
            prot |= ProtFlags::PROT_READ;
        }
        if self.perms.contains(MMPermissions::WRITE) {
            prot |= ProtFlags::PROT_WRITE;
        }
        if self.perms.contains(MMPermissions::EXECUTE) {
            prot |= ProtFlags::PROT_EXEC;
        }
        prot
    }
}

/// Reads and parses the current process's memory map.
pub fn scan_self() -> Result<Vec<MapRegion>> {
    let process = Process::myself().context("cannot open /proc/self")?;
    let maps = process.maps().context("cannot read /proc/self/maps")?;

    Ok(maps
        .iter()
        .map(|map| MapRegion {
            start: map.address.0 as usize,
            end: map.address.1 as usize,
            perms: map.perms,
            offset: map.offset,
            inode: map.inode,
            pathname: pathname_text(&map.pathname),
        })
        .collect())
}

fn pathname_text(pathname: &MMapPath) -> String {
    match pathname {
        MMapPath::Path(path) => path.to_string_lossy().into_owned(),
        MMapPath::Anonymous => String::new(),
        MMapPath::Heap => "[heap]".to_string(),
        MMapPath::Stack => "[stack]".to_string(),
        MMapPath::TStack(tid) => format!("[stack:{tid}]"),
        MMapPath::Vdso => "[vdso]".to_string(),
        MMapPath::Other(other) => format!("[{other}]"),
        special => format!("[{special:?}]").to_lowercase(),
    }
}
