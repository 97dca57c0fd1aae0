use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// One library scheduled for injection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryEntry {
    pub path: PathBuf,
    /// Conceal mappings named after this library once it is loaded. Only
    /// matters for anything the platform loader pulled in by name; the
    /// in-process loader never produces named mappings.
    #[serde(default)]
    pub hide: bool,
}

/// An injection session: what to load, when, and what to conceal after.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Seconds to sleep before the first load, letting the host process
    /// finish its own initialization.
    #[serde(default)]
    pub delay_secs: u64,
    #[serde(default)]
    pub libraries: Vec<LibraryEntry>,
    /// Extra pathname substrings to conceal once every library is loaded.
    #[serde(default)]
    pub hide_patterns: Vec<String>,
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("cannot parse config {}", path.display()))
    }
}
