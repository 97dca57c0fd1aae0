//! Page-granularity address arithmetic.
//!
//! The kernel only maps and protects whole pages, so every address handed to
//! `mmap`/`mprotect` goes through these helpers. The page size is read from
//! the kernel once instead of being hardcoded, since 16K-page devices exist.

use lazy_static::lazy_static;
use nix::unistd::{SysconfVar, sysconf};

lazy_static! {
    static ref PAGE_SIZE: usize = sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|size| size as usize)
        .unwrap_or(4096);
}

pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Round `addr` down to the start of its page.
pub fn page_start(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

/// Round `addr` up to the next page boundary (identity on boundaries).
pub fn page_end(addr: usize) -> usize {
    page_start(addr + page_size() - 1)
}
