use std::path::Path;

use anyhow::{bail, Result};
use decant_core::ReferenceEntry;
use tracing::info;

use crate::read_json_file;

/// Official catalog loaded once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct ReferenceCatalog {
    entries: Vec<ReferenceEntry>,
    names: Vec<String>,
}

impl ReferenceCatalog {
    pub fn new(entries: Vec<ReferenceEntry>) -> Result<Self> {
        if entries.is_empty() {
            bail!("reference catalog has no entries");
        }
        let names = entries.iter().map(|e| e.name.clone()).collect();
        Ok(Self { entries, names })
    }

    /// Canonical names in catalog order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// First entry whose canonical name equals `name` exactly.
    pub fn lookup(&self, name: &str) -> Option<&ReferenceEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn load_reference_catalog(path: impl AsRef<Path>) -> Result<ReferenceCatalog> {
    let path = path.as_ref();
    let entries: Vec<ReferenceEntry> = read_json_file(path)?;
    let catalog = ReferenceCatalog::new(entries)?;
    info!(path = %path.display(), entries = catalog.len(), "loaded reference catalog");
    Ok(catalog)
}
