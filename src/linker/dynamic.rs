//! `PT_DYNAMIC` parsing.
//!
//! Two passes over the tag stream: the first records table locations as
//! offsets into the module image, the second materializes `DT_NEEDED` names
//! once the string table is known.

use object::elf::{self, Dyn64};
use object::LittleEndian;

use crate::linker::module::{ElfHashTable, GnuHashTable, Module, Phdr, TableRange, ENDIAN};
use crate::prelude::*;

type Dyn = Dyn64<LittleEndian>;

const DYN_ENTRY_SIZE: usize = std::mem::size_of::<Dyn>();
const RELA_ENTRY_SIZE: usize = std::mem::size_of::<object::elf::Rela64<LittleEndian>>();

/// Ceiling on dynamic entries, to stop runaway walks over garbage input.
const MAX_DYN_COUNT: usize = 1000;
/// `DT_NEEDED` string offsets above this are treated as garbage.
const MAX_NEEDED_OFFSET: u64 = 65536;
const MAX_NEEDED_LEN: usize = 256;

pub(crate) fn parse_dynamic(module: &mut Module, phdrs: &[Phdr]) -> Result<()> {
    let dynamic_phdr = phdrs
        .iter()
        .find(|phdr| phdr.p_type.get(ENDIAN) == elf::PT_DYNAMIC)
        .ok_or_else(|| anyhow!("no PT_DYNAMIC segment"))?;

    let dyn_addr = module
        .load_bias()
        .wrapping_add(dynamic_phdr.p_vaddr.get(ENDIAN) as usize);
    let dyn_count = dynamic_phdr.p_memsz.get(ENDIAN) as usize / DYN_ENTRY_SIZE;
    ensure!(
        dyn_count > 0 && dyn_count <= MAX_DYN_COUNT,
        "implausible dynamic entry count {dyn_count}"
    );

    let dyn_off = module
        .offset_of(dyn_addr)
        .filter(|off| module.contains_range(module.base() + off, dyn_count * DYN_ENTRY_SIZE))
        .ok_or_else(|| anyhow!("dynamic section lies outside the image"))?;

    module.dynamic_off = Some(dyn_off);
    module.dynamic_count = dyn_count;
    debug!("dynamic section at {dyn_addr:#x}, {dyn_count} entries");

    // Counts and addresses arrive in separate tags; collected, then paired.
    let mut rela_off = None;
    let mut rela_count = None;
    let mut plt_off = None;
    let mut plt_count = None;
    let mut init_array_off = None;
    let mut init_array_count = None;
    let mut fini_array_off = None;
    let mut fini_array_count = None;

    for index in 0..dyn_count {
        let entry: Dyn = module
            .try_read(dyn_off + index * DYN_ENTRY_SIZE)
            .ok_or_else(|| anyhow!("dynamic entry {index} unreadable"))?;
        let tag = entry.d_tag.get(ENDIAN);
        let value = entry.d_val.get(ENDIAN);
        if tag == u64::from(elf::DT_NULL) {
            break;
        }

        trace!("dynamic entry {index}: tag {tag:#x} value {value:#x}");

        match tag as u32 {
            elf::DT_SYMTAB => module.symtab_off = table_offset(module, value, "DT_SYMTAB"),
            elf::DT_STRTAB => module.strtab_off = table_offset(module, value, "DT_STRTAB"),
            elf::DT_JMPREL => plt_off = table_offset(module, value, "DT_JMPREL"),
            elf::DT_PLTRELSZ => plt_count = Some(value as usize / RELA_ENTRY_SIZE),
            elf::DT_RELA => rela_off = table_offset(module, value, "DT_RELA"),
            elf::DT_RELASZ => rela_count = Some(value as usize / RELA_ENTRY_SIZE),
            elf::DT_INIT => module.init_func_off = table_offset(module, value, "DT_INIT"),
            elf::DT_INIT_ARRAY => {
                init_array_off = table_offset(module, value, "DT_INIT_ARRAY")
            }
            elf::DT_INIT_ARRAYSZ => init_array_count = Some(value as usize / 8),
            elf::DT_FINI_ARRAY => {
                fini_array_off = table_offset(module, value, "DT_FINI_ARRAY")
            }
            elf::DT_FINI_ARRAYSZ => fini_array_count = Some(value as usize / 8),
            elf::DT_HASH => module.hash = parse_elf_hash(module, value),
            elf::DT_GNU_HASH => module.gnu_hash = parse_gnu_hash(module, value),
            elf::DT_FLAGS => module.flags = value,
            // Resolvable only once DT_STRTAB is known; second pass below.
            elf::DT_NEEDED => trace!("DT_NEEDED at string offset {value} (deferred)"),
            elf::DT_SONAME
            | elf::DT_RUNPATH
            | elf::DT_FLAGS_1
            | elf::DT_FINI
            | elf::DT_RELAENT
            | elf::DT_PLTREL
            | elf::DT_STRSZ
            | elf::DT_SYMENT => {
                trace!("dynamic tag {tag:#x} noted, value {value:#x}")
            }
            _ => trace!("unhandled dynamic tag {tag:#x}, value {value:#x}"),
        }
    }

    module.rela = pair_table(module, rela_off, rela_count);
    module.plt_rela = pair_table(module, plt_off, plt_count);
    module.init_array = pair_pointer_array(module, init_array_off, init_array_count);
    module.fini_array = pair_pointer_array(module, fini_array_off, fini_array_count);

    if module.symtab_off.is_none() {
        debug!("{}: no DT_SYMTAB", module.name());
    }
    if module.strtab_off.is_none() {
        debug!("{}: no DT_STRTAB", module.name());
    }

    if module.strtab_off.is_some() {
        collect_needed(module, dyn_off, dyn_count)?;
    }

    debug!(
        "{}: dynamic parsing complete, {} needed libraries",
        module.name(),
        module.needed.len()
    );
    Ok(())
}

/// Converts a `d_ptr` value to an image offset, dropping entries whose
/// biased address escapes the reservation.
fn table_offset(module: &Module, d_ptr: u64, tag: &str) -> Option<usize> {
    let live = module.load_bias().wrapping_add(d_ptr as usize);
    let off = module.offset_of(live);
    if off.is_none() {
        debug!("{tag} target {live:#x} outside the image, ignored");
    }
    off
}

fn pair_table(module: &Module, off: Option<usize>, count: Option<usize>) -> Option<TableRange> {
    let (off, count) = (off?, count?);
    if count == 0 {
        return None;
    }
    if !module.contains_range(module.base() + off, count * RELA_ENTRY_SIZE) {
        debug!("relocation table at offset {off:#x} overruns the image, ignored");
        return None;
    }
    Some(TableRange { off, count })
}

fn pair_pointer_array(
    module: &Module,
    off: Option<usize>,
    count: Option<usize>,
) -> Option<TableRange> {
    let (off, count) = (off?, count?);
    if count == 0 {
        return None;
    }
    if !module.contains_range(module.base() + off, count * 8) {
        debug!("pointer array at offset {off:#x} overruns the image, ignored");
        return None;
    }
    Some(TableRange { off, count })
}

fn parse_elf_hash(module: &Module, d_ptr: u64) -> Option<ElfHashTable> {
    let off = table_offset(module, d_ptr, "DT_HASH")?;
    let nbucket = module.word(off)?;
    let nchain = module.word(off + 4)?;
    let bucket_off = off + 8;
    let chain_off = bucket_off + 4 * nbucket as usize;
    let table_len = 8 + 4 * (nbucket as usize + nchain as usize);
    if !module.contains_range(module.base() + off, table_len) {
        debug!("DT_HASH table overruns the image, ignored");
        return None;
    }
    debug!("hash table: nbucket={nbucket} nchain={nchain}");
    Some(ElfHashTable {
        nbucket,
        nchain,
        bucket_off,
        chain_off,
    })
}

fn parse_gnu_hash(module: &Module, d_ptr: u64) -> Option<GnuHashTable> {
    let off = table_offset(module, d_ptr, "DT_GNU_HASH")?;
    let nbucket = module.word(off)?;
    let symbias = module.word(off + 4)?;
    let maskwords = module.word(off + 8)?;
    let shift2 = module.word(off + 12)?;
    if nbucket == 0 || maskwords == 0 {
        debug!("degenerate GNU hash table, ignored");
        return None;
    }
    let bloom_off = off + 16;
    let bucket_off = bloom_off + 8 * maskwords as usize;
    if !module.contains_range(module.base() + off, 16 + 8 * maskwords as usize + 4 * nbucket as usize) {
        debug!("DT_GNU_HASH table overruns the image, ignored");
        return None;
    }
    debug!("GNU hash table: nbucket={nbucket} symbias={symbias} maskwords={maskwords}");
    Some(GnuHashTable {
        nbucket,
        symbias,
        maskwords,
        shift2,
        bloom_off,
        bucket_off,
    })
}

fn collect_needed(module: &mut Module, dyn_off: usize, dyn_count: usize) -> Result<()> {
    let mut needed = Vec::new();
    for index in 0..dyn_count {
        let entry: Dyn = module
            .try_read(dyn_off + index * DYN_ENTRY_SIZE)
            .ok_or_else(|| anyhow!("dynamic entry {index} unreadable"))?;
        let tag = entry.d_tag.get(ENDIAN);
        if tag == u64::from(elf::DT_NULL) {
            break;
        }
        if tag != u64::from(elf::DT_NEEDED) {
            continue;
        }
        let str_off = entry.d_val.get(ENDIAN);
        if str_off >= MAX_NEEDED_OFFSET {
            debug!("DT_NEEDED string offset {str_off} too large, ignored");
            continue;
        }
        match module.str_at(str_off as usize) {
            Some(name) if !name.is_empty() && name.len() < MAX_NEEDED_LEN => {
                debug!("DT_NEEDED: {name}");
                needed.push(name);
            }
            _ => debug!("DT_NEEDED: invalid string at offset {str_off}, ignored"),
        }
    }
    module.needed = needed;
    Ok(())
}
