//! Address-space reservation and segment placement.
//!
//! The image is not file-mapped. A single anonymous `PROT_NONE` reservation
//! covers the whole load span, segment bytes are copied into it, and the
//! final page protections are applied afterwards. Every page of the loaded
//! library is therefore backed by anonymous memory.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, mprotect, munmap};
use object::elf;

use crate::linker::module::{ENDIAN, Ehdr, Phdr};
use crate::page::{page_end, page_start};
use crate::prelude::*;

pub(crate) struct MemoryManager {
    load_start: Option<NonNull<c_void>>,
    load_size: usize,
    load_bias: usize,
    loaded_phdr: Option<usize>,
    // The reservation is torn down on drop until the load has fully linked.
    armed: bool,
}

impl MemoryManager {
    pub fn new() -> Self {
        MemoryManager {
            load_start: None,
            load_size: 0,
            load_bias: 0,
            loaded_phdr: None,
            armed: false,
        }
    }

    pub fn load_start(&self) -> usize {
        self.load_start.map_or(0, |p| p.as_ptr() as usize)
    }

    pub fn load_size(&self) -> usize {
        self.load_size
    }

    pub fn load_bias(&self) -> usize {
        self.load_bias
    }

    /// Live address of the program header table, when one was found inside
    /// a loaded segment.
    pub fn loaded_phdr(&self) -> Option<usize> {
        self.loaded_phdr
    }

    /// Keeps the reservation alive past this manager's lifetime. Called once
    /// linking succeeded; loaded libraries are never unmapped.
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Reserves one contiguous anonymous range covering all `PT_LOAD`
    /// segments. Segment copies later overwrite parts of it in place.
    pub fn reserve_address_space(&mut self, phdrs: &[Phdr]) -> Result<()> {
        let (min_vaddr, max_vaddr) =
            load_span(phdrs).ok_or_else(|| anyhow!("no loadable segments"))?;
        let load_size = max_vaddr - min_vaddr;
        let length = NonZeroUsize::new(load_size)
            .ok_or_else(|| anyhow!("loadable segments are empty"))?;

        let start = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .with_context(|| format!("cannot reserve {load_size:#x} bytes of address space"))?;

        self.load_start = Some(start);
        self.load_size = load_size;
        self.load_bias = (start.as_ptr() as usize).wrapping_sub(min_vaddr);
        self.armed = true;

        debug!(
            "reserved {:#x} bytes at {:p}, bias {:#x}",
            load_size,
            start.as_ptr(),
            self.load_bias
        );
        Ok(())
    }

    /// Copies every `PT_LOAD` into the reservation and zeroes BSS tails.
    pub fn load_segments(&mut self, phdrs: &[Phdr], image: &[u8]) -> Result<()> {
        for (index, phdr) in phdrs.iter().enumerate() {
            if phdr.p_type.get(ENDIAN) != elf::PT_LOAD {
                continue;
            }

            let p_vaddr = phdr.p_vaddr.get(ENDIAN) as usize;
            let p_memsz = phdr.p_memsz.get(ENDIAN) as usize;
            let p_filesz = phdr.p_filesz.get(ENDIAN) as usize;
            let p_offset = phdr.p_offset.get(ENDIAN) as usize;

            let seg_start = self.load_bias.wrapping_add(p_vaddr);
            let seg_end = seg_start + p_memsz;
            let seg_page_start = page_start(seg_start);
            let seg_page_end = page_end(seg_end);
            let seg_file_end = seg_start + p_filesz;

            trace!(
                "segment {index}: vaddr={p_vaddr:#x} memsz={p_memsz:#x} \
                 filesz={p_filesz:#x} offset={p_offset:#x}"
            );

            let file_end = p_offset
                .checked_add(p_filesz)
                .ok_or_else(|| anyhow!("segment {index} offsets overflow"))?;
            ensure!(
                file_end <= image.len(),
                "segment {index} extends past end of file ({file_end:#x} > {:#x})",
                image.len()
            );
            ensure!(
                seg_page_start >= self.load_start() && seg_page_end <= self.load_start() + self.load_size,
                "segment {index} lies outside the reservation"
            );

            if p_filesz > 0 {
                self.protect_range(
                    seg_page_start,
                    seg_page_end - seg_page_start,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                )
                .with_context(|| format!("cannot make segment {index} writable for loading"))?;

                ensure!(
                    seg_file_end <= seg_page_end,
                    "segment {index} copy would overrun its page span"
                );
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        image.as_ptr().add(p_offset),
                        seg_start as *mut u8,
                        p_filesz,
                    );
                }
            }

            if p_memsz > p_filesz {
                let bss_len = p_memsz - p_filesz;
                trace!("zeroing {bss_len:#x} BSS bytes at {seg_file_end:#x}");
                unsafe {
                    std::ptr::write_bytes(seg_file_end as *mut u8, 0, bss_len);
                }
            }

            // Pages past the file-backed tail must read as zero.
            let aligned_file_end = page_end(seg_file_end);
            if seg_page_end > aligned_file_end {
                let gap = seg_page_end - aligned_file_end;
                unsafe {
                    mmap_anonymous(
                        NonZeroUsize::new(aligned_file_end),
                        NonZeroUsize::new(gap).expect("gap is non-zero"),
                        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                        MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
                    )
                }
                .with_context(|| format!("cannot zero-fill tail of segment {index}"))?;
            }
        }
        Ok(())
    }

    /// Locates the live program header table, preferring `PT_PHDR`, then a
    /// load segment covering file offset zero. When neither exists the
    /// caller keeps using its own copy of the table.
    pub fn find_phdr(&mut self, phdrs: &[Phdr]) -> Result<()> {
        for phdr in phdrs {
            if phdr.p_type.get(ENDIAN) == elf::PT_PHDR {
                let addr = self.load_bias.wrapping_add(phdr.p_vaddr.get(ENDIAN) as usize);
                return self.check_phdr(addr, phdrs);
            }
        }

        for phdr in phdrs {
            if phdr.p_type.get(ENDIAN) == elf::PT_LOAD {
                if phdr.p_offset.get(ENDIAN) == 0 {
                    let ehdr_addr =
                        self.load_bias.wrapping_add(phdr.p_vaddr.get(ENDIAN) as usize);
                    let ehdr = unsafe { (ehdr_addr as *const Ehdr).read_unaligned() };
                    let addr = ehdr_addr + ehdr.e_phoff.get(ENDIAN) as usize;
                    return self.check_phdr(addr, phdrs);
                }
                break;
            }
        }

        debug!("no in-image program header table, falling back to the file copy");
        Ok(())
    }

    fn check_phdr(&mut self, addr: usize, phdrs: &[Phdr]) -> Result<()> {
        let table_end = addr + phdrs.len() * std::mem::size_of::<Phdr>();
        for phdr in phdrs {
            if phdr.p_type.get(ENDIAN) != elf::PT_LOAD {
                continue;
            }
            let seg_start = self.load_bias.wrapping_add(phdr.p_vaddr.get(ENDIAN) as usize);
            let seg_end = seg_start + phdr.p_filesz.get(ENDIAN) as usize;
            if seg_start <= addr && table_end <= seg_end {
                self.loaded_phdr = Some(addr);
                return Ok(());
            }
        }
        bail!("program header table at {addr:#x} not inside a loadable segment");
    }

    /// Applies the final `p_flags`-derived protection to every `PT_LOAD`.
    pub fn protect_segments(&self, phdrs: &[Phdr]) -> Result<()> {
        for (index, phdr) in phdrs.iter().enumerate() {
            if phdr.p_type.get(ENDIAN) != elf::PT_LOAD {
                continue;
            }
            let seg_start = self.load_bias.wrapping_add(phdr.p_vaddr.get(ENDIAN) as usize);
            let seg_page_start = page_start(seg_start);
            let seg_page_end = page_end(seg_start + phdr.p_memsz.get(ENDIAN) as usize);
            let prot = prot_from_flags(phdr.p_flags.get(ENDIAN));

            self.protect_range(seg_page_start, seg_page_end - seg_page_start, prot)
                .with_context(|| format!("cannot protect segment {index}"))?;
            trace!(
                "protected segment {index}: {seg_page_start:#x}-{seg_page_end:#x} {prot:?}"
            );
        }
        Ok(())
    }

    fn protect_range(&self, start: usize, len: usize, prot: ProtFlags) -> Result<()> {
        let addr = NonNull::new(start as *mut c_void)
            .ok_or_else(|| anyhow!("null segment address"))?;
        unsafe { mprotect(addr, len, prot) }?;
        Ok(())
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        if self.armed {
            if let Some(start) = self.load_start {
                unsafe {
                    let _ = munmap(start, self.load_size);
                }
            }
        }
    }
}

/// Page-aligned `[min_vaddr, max_vaddr)` span over all `PT_LOAD` entries.
fn load_span(phdrs: &[Phdr]) -> Option<(usize, usize)> {
    let mut min_vaddr = usize::MAX;
    let mut max_vaddr = 0usize;
    let mut found = false;

    for phdr in phdrs {
        if phdr.p_type.get(ENDIAN) != elf::PT_LOAD {
            continue;
        }
        found = true;
        let vaddr = phdr.p_vaddr.get(ENDIAN) as usize;
        min_vaddr = min_vaddr.min(vaddr);
        max_vaddr = max_vaddr.max(vaddr + phdr.p_memsz.get(ENDIAN) as usize);
    }

    found.then(|| (page_start(min_vaddr), page_end(max_vaddr)))
}

pub(crate) fn prot_from_flags(p_flags: u32) -> ProtFlags {
    let mut prot = ProtFlags::empty();
    if p_flags & elf::PF_R != 0 {
        prot |= ProtFlags::PROT_READ;
    }
    if p_flags & elf::PF_W != 0 {
        prot |= ProtFlags::PROT_WRITE;
    }
    if p_flags & elf::PF_X != 0 {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}
