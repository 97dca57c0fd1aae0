//! Userland loader for AArch64 shared objects.
//!
//! Maps, relocates, and initializes a shared object without going through
//! the platform dynamic linker. Segment bytes are copied into an anonymous
//! reservation, so the resulting pages are not attributed to any file.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! let mut linker = phantomlink::Linker::new();
//! linker.load_library("/data/local/tmp/payload.so")?;
//! let addr = linker.get_symbol("/data/local/tmp/payload.so", "entry");
//! # Ok(())
//! # }
//! ```

mod dynamic;
#[cfg(test)]
mod fixture;
mod memory;
mod module;
mod reader;
mod relocate;

pub use module::Module;

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use memory::MemoryManager;
use reader::ElfReader;

use crate::prelude::*;

/// A process-local loader instance.
///
/// Owns the registry of everything it has loaded, keyed by the path handed
/// to [`Linker::load_library`]. Not reentrant and not thread-safe by
/// design; callers serialize loads.
pub struct Linker {
    modules: HashMap<PathBuf, Module>,
}

impl Linker {
    pub fn new() -> Self {
        Linker {
            modules: HashMap::new(),
        }
    }

    /// Loads `path`, runs its constructors, and retains it for the lifetime
    /// of the process. Loading the same path again is a no-op reporting
    /// success.
    pub fn load_library<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if self.modules.contains_key(path) {
            info!("{} is already loaded", path.display());
            return Ok(());
        }

        info!("loading {}", path.display());
        let module = load_uncached(path)
            .with_context(|| format!("cannot load {}", path.display()))?;
        info!(
            "loaded {} at {:#x} ({:#x} bytes)",
            path.display(),
            module.base(),
            module.size()
        );
        self.modules.insert(path.to_path_buf(), module);
        Ok(())
    }

    /// Address of an exported symbol in a previously loaded library, or
    /// `None` when either the library or the symbol is unknown.
    pub fn get_symbol<P: AsRef<Path>>(&self, path: P, name: &str) -> Option<NonNull<c_void>> {
        let path = path.as_ref();
        let Some(module) = self.modules.get(path) else {
            debug!("{} is not loaded", path.display());
            return None;
        };
        relocate::find_exported(module, name)
            .and_then(|addr| NonNull::new(addr as *mut c_void))
    }

    pub fn module<P: AsRef<Path>>(&self, path: P) -> Option<&Module> {
        self.modules.get(path.as_ref())
    }

    /// Loaded modules, in no particular order.
    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    /// Drops every module descriptor. The mapped images stay in place and
    /// no finalizer runs; only the bookkeeping goes away.
    pub fn cleanup(&mut self) {
        debug!("dropping {} module descriptors", self.modules.len());
        self.modules.clear();
    }
}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}

fn load_uncached(path: &Path) -> Result<Module> {
    let reader = ElfReader::open(path)?;

    let mut memory = MemoryManager::new();
    memory.reserve_address_space(reader.phdrs())?;
    memory.load_segments(reader.phdrs(), reader.image())?;
    memory.find_phdr(reader.phdrs())?;

    let name = reader
        .path()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let mut module = Module::new(&name, &memory, reader.header(), reader.phdrs());

    dynamic::parse_dynamic(&mut module, reader.phdrs())?;
    memory.protect_segments(reader.phdrs())?;
    relocate::link_image(&module)?;

    // The image now lives forever; stop the manager from unmapping it.
    memory.disarm();
    Ok(module)
    // The reader drops here, unmapping the file and closing its descriptor.
}
