//! Synthetic AArch64 shared objects for tests.
//!
//! Builds a minimal `ET_DYN` image from raw ELF records: one RWX-capable
//! load segment holding code, data slots, string/symbol tables, both hash
//! tables, a small RELA table, and a dynamic section. The exported
//! `yuuki_test` function adds its two arguments; the optional init routine
//! writes 42 into the exported global `g`.

use std::io::Write;

use object::elf::{self, Dyn64, FileHeader64, Rela64, Sym64};
use object::pod;
use object::{I64, LittleEndian, U16, U32, U64};

use crate::linker::dynamic::parse_dynamic;
use crate::linker::memory::MemoryManager;
use crate::linker::module::{ENDIAN, Ehdr, Module, Phdr};
use crate::linker::relocate::gnu_hash;

const E: LittleEndian = LittleEndian;

pub(crate) struct Fixture {
    pub load_flags: u32,
    pub with_gnu_hash: bool,
    pub with_classic_hash: bool,
    pub with_dynamic: bool,
    pub with_needed: bool,
    pub with_init: bool,
}

impl Default for Fixture {
    fn default() -> Self {
        Fixture {
            load_flags: elf::PF_R | elf::PF_W | elf::PF_X,
            with_gnu_hash: true,
            with_classic_hash: true,
            with_dynamic: true,
            with_needed: false,
            with_init: false,
        }
    }
}

impl Fixture {
    pub const PHDR_OFF: usize = 0x40;
    pub const CODE_OFF: usize = 0x140;
    pub const INIT_OFF: usize = 0x150;
    pub const DATA_G_OFF: usize = 0x170;
    pub const SLOT_REL_OFF: usize = 0x178;
    pub const SLOT_ABS_OFF: usize = 0x180;
    pub const SLOT_UND_OFF: usize = 0x188;
    pub const STRTAB_OFF: usize = 0x1a0;
    pub const SYMTAB_OFF: usize = 0x1e0;
    pub const HASH_OFF: usize = 0x240;
    pub const GNU_HASH_OFF: usize = 0x260;
    pub const RELA_OFF: usize = 0x290;
    pub const DYN_OFF: usize = 0x2e0;
    pub const FILE_SIZE: usize = 0x400;
    pub const MEM_SIZE: usize = 0x500;
    pub const RELA_COUNT: usize = 3;
    pub const UNDEF_ADDEND: u64 = 0x2a;
    pub const UNDEF_NAME: &'static str = "phantomlink_missing";

    const STRTAB: &'static [u8] = b"\0yuuki_test\0g\0libdl.so\0phantomlink_missing\0";
    const NAME_YUUKI: u32 = 1;
    const NAME_G: u32 = 12;
    const NAME_LIBDL: u64 = 14;
    const NAME_MISSING: u32 = 23;

    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; Self::FILE_SIZE];

        // yuuki_test: add w0, w0, w1 ; ret
        put_code(&mut image, Self::CODE_OFF, &[0x0b01_0000, 0xd65f_03c0]);
        // init: adr x1, #0x20 ; movz w2, #42 ; str w2, [x1] ; ret
        put_code(
            &mut image,
            Self::INIT_OFF,
            &[0x1000_0101, 0x5280_0542, 0xb900_0022, 0xd65f_03c0],
        );

        put(&mut image, Self::STRTAB_OFF, Self::STRTAB);

        let syms = [
            make_sym(0, 0, 0, 0, 0),
            make_sym(
                Self::NAME_YUUKI,
                (elf::STB_GLOBAL << 4) | elf::STT_FUNC,
                1,
                Self::CODE_OFF as u64,
                8,
            ),
            make_sym(
                Self::NAME_G,
                (elf::STB_GLOBAL << 4) | elf::STT_OBJECT,
                1,
                Self::DATA_G_OFF as u64,
                8,
            ),
            make_sym(Self::NAME_MISSING, elf::STB_GLOBAL << 4, elf::SHN_UNDEF, 0, 0),
        ];
        put(&mut image, Self::SYMTAB_OFF, pod::bytes_of_slice(&syms));

        if self.with_classic_hash {
            // nbucket=1, nchain=4, bucket[0]=1, chain=[0, 2, 0, 0]
            put_words(&mut image, Self::HASH_OFF, &[1, 4, 1, 0, 2, 0, 0]);
        }

        if self.with_gnu_hash {
            // nbucket=1, symbias=1, maskwords=1, shift2=6
            put_words(&mut image, Self::GNU_HASH_OFF, &[1, 1, 1, 6]);
            // all-ones bloom word: filter always passes
            put(
                &mut image,
                Self::GNU_HASH_OFF + 16,
                &u64::MAX.to_le_bytes(),
            );
            let chain_yuuki = gnu_hash(b"yuuki_test") & !1;
            let chain_g = gnu_hash(b"g") | 1; // end of chain
            put_words(
                &mut image,
                Self::GNU_HASH_OFF + 24,
                &[1, chain_yuuki, chain_g],
            );
        }

        let relas = [
            make_rela(
                Self::SLOT_REL_OFF,
                0,
                elf::R_AARCH64_RELATIVE,
                Self::CODE_OFF as i64,
            ),
            make_rela(Self::SLOT_ABS_OFF, 2, elf::R_AARCH64_ABS64, 0),
            make_rela(
                Self::SLOT_UND_OFF,
                3,
                elf::R_AARCH64_ABS64,
                Self::UNDEF_ADDEND as i64,
            ),
        ];
        put(&mut image, Self::RELA_OFF, pod::bytes_of_slice(&relas));

        let mut dyns = Vec::new();
        if self.with_classic_hash {
            dyns.push(make_dyn(elf::DT_HASH, Self::HASH_OFF as u64));
        }
        if self.with_gnu_hash {
            dyns.push(make_dyn(elf::DT_GNU_HASH, Self::GNU_HASH_OFF as u64));
        }
        dyns.push(make_dyn(elf::DT_STRTAB, Self::STRTAB_OFF as u64));
        dyns.push(make_dyn(elf::DT_SYMTAB, Self::SYMTAB_OFF as u64));
        dyns.push(make_dyn(elf::DT_SYMENT, 24));
        dyns.push(make_dyn(elf::DT_STRSZ, Self::STRTAB.len() as u64));
        dyns.push(make_dyn(elf::DT_RELA, Self::RELA_OFF as u64));
        dyns.push(make_dyn(elf::DT_RELASZ, (Self::RELA_COUNT * 24) as u64));
        dyns.push(make_dyn(elf::DT_RELAENT, 24));
        if self.with_init {
            dyns.push(make_dyn(elf::DT_INIT, Self::INIT_OFF as u64));
        }
        if self.with_needed {
            dyns.push(make_dyn(elf::DT_NEEDED, Self::NAME_LIBDL));
        }
        dyns.push(make_dyn(elf::DT_NULL, 0));
        put(&mut image, Self::DYN_OFF, pod::bytes_of_slice(&dyns));
        let dyn_size = (dyns.len() * std::mem::size_of::<Dyn64<LittleEndian>>()) as u64;

        let phnum: u16 = if self.with_dynamic { 3 } else { 2 };
        let phdr_table_size = (phnum as u64) * 56;
        let mut phdrs = vec![
            make_phdr(
                elf::PT_PHDR,
                Self::PHDR_OFF as u64,
                Self::PHDR_OFF as u64,
                phdr_table_size,
                phdr_table_size,
                elf::PF_R,
            ),
            make_phdr(
                elf::PT_LOAD,
                0,
                0,
                Self::FILE_SIZE as u64,
                Self::MEM_SIZE as u64,
                self.load_flags,
            ),
        ];
        if self.with_dynamic {
            phdrs.push(make_phdr(
                elf::PT_DYNAMIC,
                Self::DYN_OFF as u64,
                Self::DYN_OFF as u64,
                dyn_size,
                dyn_size,
                elf::PF_R | elf::PF_W,
            ));
        }
        put(&mut image, Self::PHDR_OFF, pod::bytes_of_slice(&phdrs));

        put(&mut image, 0, pod::bytes_of(&make_ehdr(phnum)));
        image
    }
}

/// Runs the load pipeline short of final protections and relocation, so
/// tests can poke at a live module image freely. The returned manager still
/// owns the reservation and unmaps it on drop.
pub(crate) fn load(fixture: &Fixture) -> (MemoryManager, Module) {
    let image = fixture.build();
    let (header, phdrs) = parse(&image);
    let mut memory = MemoryManager::new();
    memory.reserve_address_space(&phdrs).unwrap();
    memory.load_segments(&phdrs, &image).unwrap();
    memory.find_phdr(&phdrs).unwrap();
    let mut module = Module::new("fixture", &memory, &header, &phdrs);
    parse_dynamic(&mut module, &phdrs).unwrap();
    (memory, module)
}

pub(crate) fn parse(image: &[u8]) -> (Ehdr, Vec<Phdr>) {
    let (header, _) = pod::from_bytes::<Ehdr>(image).unwrap();
    let header = *header;
    let phoff = header.e_phoff.get(ENDIAN) as usize;
    let phnum = header.e_phnum.get(ENDIAN) as usize;
    let (phdrs, _) = pod::slice_from_bytes::<Phdr>(&image[phoff..], phnum).unwrap();
    (header, phdrs.to_vec())
}

pub(crate) fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

pub(crate) fn make_phdr(
    p_type: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_flags: u32,
) -> Phdr {
    Phdr {
        p_type: U32::new(E, p_type),
        p_flags: U32::new(E, p_flags),
        p_offset: U64::new(E, p_offset),
        p_vaddr: U64::new(E, p_vaddr),
        p_paddr: U64::new(E, p_vaddr),
        p_filesz: U64::new(E, p_filesz),
        p_memsz: U64::new(E, p_memsz),
        p_align: U64::new(E, 0x1000),
    }
}

fn make_ehdr(phnum: u16) -> Ehdr {
    FileHeader64 {
        e_ident: elf::Ident {
            magic: elf::ELFMAG,
            class: elf::ELFCLASS64,
            data: elf::ELFDATA2LSB,
            version: elf::EV_CURRENT,
            os_abi: 0,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: U16::new(E, elf::ET_DYN),
        e_machine: U16::new(E, elf::EM_AARCH64),
        e_version: U32::new(E, u32::from(elf::EV_CURRENT)),
        e_entry: U64::new(E, 0),
        e_phoff: U64::new(E, Fixture::PHDR_OFF as u64),
        e_shoff: U64::new(E, 0),
        e_flags: U32::new(E, 0),
        e_ehsize: U16::new(E, 64),
        e_phentsize: U16::new(E, 56),
        e_phnum: U16::new(E, phnum),
        e_shentsize: U16::new(E, 0),
        e_shnum: U16::new(E, 0),
        e_shstrndx: U16::new(E, 0),
    }
}

fn make_sym(st_name: u32, st_info: u8, st_shndx: u16, st_value: u64, st_size: u64) -> Sym64<LittleEndian> {
    Sym64 {
        st_name: U32::new(E, st_name),
        st_info,
        st_other: 0,
        st_shndx: U16::new(E, st_shndx),
        st_value: U64::new(E, st_value),
        st_size: U64::new(E, st_size),
    }
}

fn make_rela(r_offset: usize, sym: u32, r_type: u32, addend: i64) -> Rela64<LittleEndian> {
    Rela64 {
        r_offset: U64::new(E, r_offset as u64),
        r_info: U64::new(E, (u64::from(sym) << 32) | u64::from(r_type)),
        r_addend: I64::new(E, addend),
    }
}

fn make_dyn(tag: u32, value: u64) -> Dyn64<LittleEndian> {
    Dyn64 {
        d_tag: U64::new(E, u64::from(tag)),
        d_val: U64::new(E, value),
    }
}

fn put(image: &mut [u8], off: usize, bytes: &[u8]) {
    image[off..off + bytes.len()].copy_from_slice(bytes);
}

fn put_words(image: &mut [u8], off: usize, words: &[u32]) {
    for (index, word) in words.iter().enumerate() {
        put(image, off + 4 * index, &word.to_le_bytes());
    }
}

fn put_code(image: &mut [u8], off: usize, insns: &[u32]) {
    put_words(image, off, insns);
}
