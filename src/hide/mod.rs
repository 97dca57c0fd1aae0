//! Memory-map concealment.
//!
//! Rewrites the regions of a resident library so the same bytes stay mapped
//! at the same addresses with the same permissions, but the kernel reports
//! them as anonymous private memory instead of a named file.

mod maps;

pub use maps::MapRegion;

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use itertools::Itertools;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, mprotect, munmap};

use crate::prelude::*;

/// Rewrites every readable or executable mapping whose pathname contains
/// `pattern` as anonymous memory.
///
/// Each region is individually unmapped and replaced, so there is a short
/// window during which its pages are absent. The caller must guarantee
/// that no other thread touches the affected regions for the duration of
/// the call; concealment normally runs right after a load, before anything
/// else learns the addresses.
pub fn hide(pattern: &str) -> Result<()> {
    ensure!(!pattern.is_empty(), "empty pattern");

    let regions = maps::scan_self()?;
    if log_enabled!(log::Level::Trace) {
        for region in regions.iter().sorted_by_key(|r| r.start) {
            trace!(
                "{:016x}-{:016x} {:?} {:08x} {}",
                region.start, region.end, region.perms, region.offset, region.pathname
            );
        }
    }

    let targets: Vec<MapRegion> = regions
        .into_iter()
        .filter(|region| !region.pathname.is_empty() && region.pathname.contains(pattern))
        .filter(|region| region.is_readable() || region.is_executable())
        .collect();

    if targets.is_empty() {
        debug!("no mappings match \"{pattern}\"");
        return Ok(());
    }

    info!("concealing {} mappings matching \"{pattern}\"", targets.len());
    for region in &targets {
        conceal(region).with_context(|| {
            format!(
                "cannot conceal {:x}-{:x} ({})",
                region.start, region.end, region.pathname
            )
        })?;
    }
    Ok(())
}

/// Runs [`hide`] for each pattern in turn.
pub fn hide_all<S: AsRef<str>>(patterns: &[S]) -> Result<()> {
    for pattern in patterns {
        hide(pattern.as_ref())?;
    }
    Ok(())
}

/// Replaces one file-backed region with an anonymous copy at the same
/// address. The replacement is filled while writable and only then locked
/// down to the region's original permissions.
fn conceal(region: &MapRegion) -> Result<()> {
    let length =
        NonZeroUsize::new(region.len()).ok_or_else(|| anyhow!("empty mapping"))?;
    debug!(
        "{:x}-{:x} {:?} {} -> anonymous",
        region.start, region.end, region.perms, region.pathname
    );

    let backup = unsafe {
        mmap_anonymous(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        )
    }
    .context("cannot allocate backup mapping")?;

    unsafe {
        std::ptr::copy_nonoverlapping(
            region.start as *const u8,
            backup.as_ptr() as *mut u8,
            length.get(),
        );
    }

    let original = NonNull::new(region.start as *mut c_void)
        .ok_or_else(|| anyhow!("mapping at null address"))?;
    unsafe { munmap(original, length.get()) }.context("cannot unmap original mapping")?;

    // The region is gone from here until the replacement lands; a failure
    // below leaves a hole in the address space.
    let replacement = unsafe {
        mmap_anonymous(
            NonZeroUsize::new(region.start),
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
        )
    }
    .context("cannot remap region as anonymous memory")?;

    unsafe {
        std::ptr::copy_nonoverlapping(
            backup.as_ptr() as *const u8,
            replacement.as_ptr() as *mut u8,
            length.get(),
        );
    }

    unsafe { mprotect(replacement, length.get(), region.prot()) }
        .context("cannot restore mapping permissions")?;

    unsafe { munmap(backup, length.get()) }.context("cannot release backup mapping")?;
    Ok(())
}
