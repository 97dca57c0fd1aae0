//! Read-only view of an ELF shared object on disk.
//!
//! The whole file is mapped private read-only and stays mapped only for the
//! duration of a load: once segments have been copied into their final home
//! the reader is dropped, unmapping the file and closing the descriptor.

use std::fs::File;
use std::mem;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use object::elf;
use object::pod;

use crate::linker::module::{ENDIAN, Ehdr, Phdr};
use crate::prelude::*;

#[derive(Debug)]
pub(crate) struct ElfReader {
    path: PathBuf,
    // Held so the descriptor lives exactly as long as the mapping.
    _file: File,
    image: Mmap,
    header: Ehdr,
    phdrs: Vec<Phdr>,
}

impl ElfReader {
    /// Opens, maps, and validates `path`, copying out the program header
    /// table. Rust opens with `O_CLOEXEC`, matching what a loader wants.
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        let file_size = file
            .metadata()
            .with_context(|| format!("cannot stat {}", path.display()))?
            .len() as usize;
        ensure!(
            file_size >= mem::size_of::<Ehdr>(),
            "{}: file too small for an ELF header",
            path.display()
        );

        let image = unsafe { MmapOptions::new().map_copy_read_only(&file) }
            .with_context(|| format!("cannot mmap {}", path.display()))?;

        let (header, _) = pod::from_bytes::<Ehdr>(&image)
            .map_err(|()| anyhow!("{}: unreadable ELF header", path.display()))?;
        let header = *header;
        verify_header(&header).with_context(|| format!("{}: invalid ELF", path.display()))?;

        let phdrs = read_program_headers(&header, &image)
            .with_context(|| format!("{}: invalid ELF", path.display()))?;

        debug!(
            "{}: type={} machine={} entry={:#x} phoff={:#x} phnum={}",
            path.display(),
            header.e_type.get(ENDIAN),
            header.e_machine.get(ENDIAN),
            header.e_entry.get(ENDIAN),
            header.e_phoff.get(ENDIAN),
            header.e_phnum.get(ENDIAN),
        );

        Ok(ElfReader {
            path: path.to_path_buf(),
            _file: file,
            image,
            header,
            phdrs,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Ehdr {
        &self.header
    }

    pub fn phdrs(&self) -> &[Phdr] {
        &self.phdrs
    }

    /// The mapped file contents.
    pub fn image(&self) -> &[u8] {
        &self.image
    }
}

fn verify_header(header: &Ehdr) -> Result<()> {
    ensure!(header.e_ident.magic == elf::ELFMAG, "bad magic");
    ensure!(
        header.e_ident.class == elf::ELFCLASS64,
        "not a 64-bit object"
    );
    ensure!(
        header.e_machine.get(ENDIAN) == elf::EM_AARCH64,
        "not an AArch64 object (machine {})",
        header.e_machine.get(ENDIAN)
    );
    ensure!(
        header.e_version.get(ENDIAN) == u32::from(elf::EV_CURRENT),
        "unsupported ELF version {}",
        header.e_version.get(ENDIAN)
    );
    ensure!(
        header.e_type.get(ENDIAN) == elf::ET_DYN,
        "not a shared object (type {})",
        header.e_type.get(ENDIAN)
    );
    Ok(())
}

fn read_program_headers(header: &Ehdr, image: &[u8]) -> Result<Vec<Phdr>> {
    let phnum = header.e_phnum.get(ENDIAN) as usize;
    let phoff = header.e_phoff.get(ENDIAN) as usize;
    let phentsize = header.e_phentsize.get(ENDIAN) as usize;

    ensure!(phnum > 0, "no program headers");
    ensure!(
        phentsize == mem::size_of::<Phdr>(),
        "unexpected program header size {phentsize}"
    );
    let table_size = phnum
        .checked_mul(phentsize)
        .ok_or_else(|| anyhow!("program header table overflows"))?;
    let table_end = phoff
        .checked_add(table_size)
        .ok_or_else(|| anyhow!("program header table overflows"))?;
    ensure!(
        table_end <= image.len(),
        "program header table extends past end of file"
    );

    let (phdrs, _) = pod::slice_from_bytes::<Phdr>(&image[phoff..], phnum)
        .map_err(|()| anyhow!("misaligned program header table"))?;
    Ok(phdrs.to_vec())
}
