//! In-process loading of AArch64 shared objects and concealment of their
//! memory mappings.
//!
//! Two cooperating subsystems: [`linker`] maps, relocates, and initializes
//! a shared object from a file path without involving the platform dynamic
//! linker, and [`hide`] rewrites the mappings of an already-resident
//! library so they appear as anonymous memory.

pub mod app;
pub mod config;
pub mod hide;
pub mod linker;
mod local_logger;
mod page;
mod prelude;

pub use config::{LibraryEntry, SessionConfig};
pub use hide::{MapRegion, hide, hide_all};
pub use linker::{Linker, Module};
