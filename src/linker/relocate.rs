//! AArch64 RELA relocation and symbol resolution.
//!
//! Binding is eager: jump slots are resolved up front, there is no lazy
//! resolver stub. Symbol lookup tries the module's own hash tables first,
//! then each `DT_NEEDED` dependency through the platform loader, then the
//! global namespace.

use std::ffi::{CString, c_void};
use std::ptr::NonNull;

use nix::sys::mman::{ProtFlags, mprotect};
use object::LittleEndian;
use object::elf::{self, Rela64};

use crate::linker::module::{ENDIAN, Module, Sym};
use crate::page::{page_end, page_start};
use crate::prelude::*;

type Rela = Rela64<LittleEndian>;

const RELA_ENTRY_SIZE: usize = std::mem::size_of::<Rela>();

/// Caps mirroring what a well-formed object can plausibly carry.
const MAX_RELA_COUNT: usize = 100_000;
const MAX_PLT_RELA_COUNT: usize = 10_000;
const MAX_INIT_ARRAY_COUNT: usize = 1000;

/// Relocation kinds this loader applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelocKind {
    None,
    Abs64,
    GlobDat,
    JumpSlot,
    Relative,
    Irelative,
}

impl RelocKind {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            elf::R_AARCH64_NONE => Some(RelocKind::None),
            elf::R_AARCH64_ABS64 => Some(RelocKind::Abs64),
            elf::R_AARCH64_GLOB_DAT => Some(RelocKind::GlobDat),
            elf::R_AARCH64_JUMP_SLOT => Some(RelocKind::JumpSlot),
            elf::R_AARCH64_RELATIVE => Some(RelocKind::Relative),
            elf::R_AARCH64_IRELATIVE => Some(RelocKind::Irelative),
            _ => None,
        }
    }
}

/// Relocates the image, then runs its initializers. Constructors have run
/// by the time this returns.
pub(crate) fn link_image(module: &Module) -> Result<()> {
    relocate_image(module)?;
    run_initializers(module)
}

pub(crate) fn relocate_image(module: &Module) -> Result<()> {
    if let Some(table) = module.rela {
        ensure!(
            table.count <= MAX_RELA_COUNT,
            "implausible relocation count {}",
            table.count
        );
        debug!("{}: applying {} RELA relocations", module.name(), table.count);
        apply_rela_table(module, table.off, table.count);
    }

    if let Some(table) = module.plt_rela {
        ensure!(
            table.count <= MAX_PLT_RELA_COUNT,
            "implausible PLT relocation count {}",
            table.count
        );
        debug!(
            "{}: applying {} PLT RELA relocations",
            module.name(),
            table.count
        );
        apply_rela_table(module, table.off, table.count);
    }

    Ok(())
}

fn apply_rela_table(module: &Module, off: usize, count: usize) {
    for index in 0..count {
        let Some(entry) = module.try_read::<Rela>(off + index * RELA_ENTRY_SIZE) else {
            debug!("relocation {index} unreadable, skipped");
            continue;
        };
        // One bad entry does not doom the rest of the table.
        if let Err(err) = apply_rela(module, &entry) {
            debug!("relocation {index} failed: {err:#}");
        }
    }
}

fn apply_rela(module: &Module, rela: &Rela) -> Result<()> {
    let r_offset = rela.r_offset.get(ENDIAN) as usize;
    let r_type = rela.r_type(ENDIAN, false);
    let r_sym = rela.r_sym(ENDIAN, false);
    let addend = rela.r_addend.get(ENDIAN);

    let reloc = module.load_bias().wrapping_add(r_offset);
    ensure!(
        module.contains_range(reloc, 8),
        "target {reloc:#x} outside [{:#x}, {:#x})",
        module.base(),
        module.base() + module.size()
    );

    let mut sym_addr = 0usize;
    if r_sym != 0 {
        let sym = module
            .sym_at(r_sym as usize)
            .ok_or_else(|| anyhow!("symbol index {r_sym} unreadable"))?;
        if sym.st_shndx.get(ENDIAN) != elf::SHN_UNDEF {
            sym_addr = module
                .load_bias()
                .wrapping_add(sym.st_value.get(ENDIAN) as usize);
        } else if let Some(name) = module.str_at(sym.st_name.get(ENDIAN) as usize) {
            sym_addr = resolve_symbol(module, &name);
            if sym_addr == 0 {
                trace!("cannot resolve {name}, binding to zero");
            }
        }
    }

    // Data pages are normally still writable at this point; text pages need
    // the temporary unlock. Failure is not fatal, the write will tell.
    unlock_region(reloc, 8);

    match RelocKind::from_raw(r_type) {
        Some(RelocKind::None) => Ok(()),
        Some(RelocKind::Abs64) | Some(RelocKind::GlobDat) | Some(RelocKind::JumpSlot) => {
            poke64(module, reloc, (sym_addr as u64).wrapping_add(addend as u64))
        }
        Some(RelocKind::Relative) => poke64(
            module,
            reloc,
            (module.load_bias() as u64).wrapping_add(addend as u64),
        ),
        Some(RelocKind::Irelative) => {
            let resolver = module.load_bias().wrapping_add(addend as usize);
            ensure!(
                module.contains(resolver),
                "ifunc resolver {resolver:#x} outside the image"
            );
            let resolver: unsafe extern "C" fn() -> u64 =
                unsafe { std::mem::transmute(resolver) };
            let resolved = unsafe { resolver() };
            poke64(module, reloc, resolved)
        }
        None => {
            debug!("unsupported relocation type {r_type}, skipped");
            Ok(())
        }
    }
}

/// Bound-checked 64-bit store into the module image.
fn poke64(module: &Module, addr: usize, value: u64) -> Result<()> {
    ensure!(
        module.contains_range(addr, 8),
        "write to {addr:#x} outside the image"
    );
    unsafe { (addr as *mut u64).write_unaligned(value) };
    Ok(())
}

fn unlock_region(addr: usize, len: usize) {
    let start = page_start(addr);
    let span = page_end(addr + len) - start;
    let Some(ptr) = NonNull::new(start as *mut c_void) else {
        return;
    };
    if let Err(err) = unsafe {
        mprotect(ptr, span, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
    } {
        trace!("mprotect({start:#x}) before relocation failed: {err}");
    }
}

fn run_initializers(module: &Module) -> Result<()> {
    if let Some(off) = module.init_func_off {
        let addr = module.base() + off;
        debug!("{}: calling DT_INIT at {addr:#x}", module.name());
        let init: unsafe extern "C" fn() = unsafe { std::mem::transmute(addr) };
        unsafe { init() };
    }

    if let Some(array) = module.init_array {
        ensure!(
            array.count <= MAX_INIT_ARRAY_COUNT,
            "implausible init_array length {}",
            array.count
        );
        debug!(
            "{}: calling {} init_array entries",
            module.name(),
            array.count
        );
        for index in 0..array.count {
            let slot = module
                .xword(array.off + index * 8)
                .ok_or_else(|| anyhow!("init_array entry {index} unreadable"))?;
            if slot == 0 {
                continue;
            }
            let ctor: unsafe extern "C" fn() = unsafe { std::mem::transmute(slot as usize) };
            unsafe { ctor() };
        }
    }

    Ok(())
}

/// Resolution order for an undefined name: the module's own tables, each
/// needed library already resident (no new loads), then the global
/// namespace. First hit wins; zero means unresolved.
fn resolve_symbol(module: &Module, name: &str) -> usize {
    if let Some(sym) = gnu_lookup(module, name).or_else(|| elf_lookup(module, name)) {
        if sym.st_shndx.get(ENDIAN) != elf::SHN_UNDEF {
            let addr = module
                .load_bias()
                .wrapping_add(sym.st_value.get(ENDIAN) as usize);
            trace!("{name} found locally at {addr:#x}");
            return addr;
        }
    }

    for lib in module.needed() {
        if let Some(addr) = dlsym_in(lib, name) {
            trace!("{name} found in {lib} at {addr:#x}");
            return addr;
        }
    }

    if let Some(addr) = dlsym_default(name) {
        trace!("{name} found globally at {addr:#x}");
        return addr;
    }

    0
}

/// Asks the platform loader for `name` inside an already-loaded `lib`.
fn dlsym_in(lib: &str, name: &str) -> Option<usize> {
    let c_lib = CString::new(lib).ok()?;
    let c_name = CString::new(name).ok()?;
    let handle =
        unsafe { libc::dlopen(c_lib.as_ptr(), libc::RTLD_NOW | libc::RTLD_NOLOAD) };
    if handle.is_null() {
        return None;
    }
    let addr = unsafe { libc::dlsym(handle, c_name.as_ptr()) };
    unsafe { libc::dlclose(handle) };
    (!addr.is_null()).then_some(addr as usize)
}

fn dlsym_default(name: &str) -> Option<usize> {
    let c_name = CString::new(name).ok()?;
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c_name.as_ptr()) };
    (!addr.is_null()).then_some(addr as usize)
}

/// Public-lookup path: hash tables first, linear scan as a last resort.
/// The returned address is checked against the module's geometry.
pub(crate) fn find_exported(module: &Module, name: &str) -> Option<usize> {
    fn defined(sym: &Sym) -> bool {
        sym.st_shndx.get(ENDIAN) != elf::SHN_UNDEF
    }
    let sym = gnu_lookup(module, name)
        .filter(defined)
        .or_else(|| elf_lookup(module, name).filter(defined))
        .or_else(|| {
            if module.gnu_hash.is_none() && module.hash.is_none() {
                linear_lookup(module, name)
            } else {
                None
            }
        })?;

    let addr = module
        .load_bias()
        .wrapping_add(sym.st_value.get(ENDIAN) as usize);
    if !module.contains(addr) {
        warn!(
            "{name} resolves to {addr:#x}, outside [{:#x}, {:#x})",
            module.base(),
            module.base() + module.size()
        );
        return None;
    }
    Some(addr)
}

pub(crate) fn gnu_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 5381;
    for &byte in name {
        h = h.wrapping_mul(33).wrapping_add(u32::from(byte));
    }
    h
}

pub(crate) fn elf_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &byte in name {
        h = (h << 4).wrapping_add(u32::from(byte));
        let g = h & 0xf000_0000;
        h ^= g;
        h ^= g >> 24;
    }
    h
}

fn gnu_lookup(module: &Module, name: &str) -> Option<Sym> {
    let table = module.gnu_hash.as_ref()?;
    module.symtab_off?;
    module.strtab_off?;

    let hash = gnu_hash(name.as_bytes());
    let hash2 = hash >> table.shift2;

    const BLOOM_BITS: u32 = 64;
    let word_index = (hash / BLOOM_BITS) % table.maskwords;
    let bloom_word = module.xword(table.bloom_off + 8 * word_index as usize)?;
    if (bloom_word >> (hash % BLOOM_BITS)) & (bloom_word >> (hash2 % BLOOM_BITS)) & 1 == 0 {
        return None;
    }

    let bucket_off = table.bucket_off + 4 * (hash % table.nbucket) as usize;
    let mut n = module.word(bucket_off)?;
    if n == 0 {
        return None;
    }

    let mut remaining = module.max_sym_count();
    loop {
        let sym = module.sym_at(n as usize)?;
        let chain = module.word(table.chain_entry_off(n)?)?;
        if (chain ^ hash) >> 1 == 0
            && module.str_at(sym.st_name.get(ENDIAN) as usize)? == name
        {
            return Some(sym);
        }
        if chain & 1 == 1 || remaining == 0 {
            return None;
        }
        n += 1;
        remaining -= 1;
    }
}

fn elf_lookup(module: &Module, name: &str) -> Option<Sym> {
    let table = module.hash.as_ref()?;
    module.symtab_off?;
    module.strtab_off?;
    if table.nbucket == 0 {
        return None;
    }

    let hash = elf_hash(name.as_bytes());
    let mut n = module.word(table.bucket_off + 4 * (hash % table.nbucket) as usize)?;
    let mut remaining = table.nchain as usize;
    while n != 0 && remaining > 0 {
        let sym = module.sym_at(n as usize)?;
        if sym.st_name.get(ENDIAN) != 0
            && module.str_at(sym.st_name.get(ENDIAN) as usize)? == name
        {
            return Some(sym);
        }
        n = module.word(table.chain_off + 4 * n as usize)?;
        remaining -= 1;
    }
    None
}

/// Walk of the whole symbol table for objects carrying no hash table at
/// all. Bounded by the classic `nchain` when known, otherwise by what the
/// image can physically hold.
fn linear_lookup(module: &Module, name: &str) -> Option<Sym> {
    let count = module
        .hash
        .as_ref()
        .map(|table| table.nchain as usize)
        .unwrap_or_else(|| module.max_sym_count());
    if count == 0 {
        debug!("cannot determine symbol table size for linear lookup");
        return None;
    }
    for index in 0..count {
        let sym = module.sym_at(index)?;
        if sym.st_name.get(ENDIAN) == 0 || sym.st_shndx.get(ENDIAN) == elf::SHN_UNDEF {
            continue;
        }
        // Without a hash table there is no trustworthy entry count, so an
        // unreadable name just ends up skipped rather than ending the scan.
        match module.str_at(sym.st_name.get(ENDIAN) as usize) {
            Some(candidate) if candidate == name => return Some(sym),
            _ => {}
        }
    }
    None
}
