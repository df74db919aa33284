//! Archive configuration and component construction.
//!
//! Backends and storages are built through explicit factory registries:
//! an application registers a factory per component name, and
//! [`create`] wires an [`Archive`] from a configuration document. There
//! is no dynamic discovery.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::archive::Archive;
use crate::backend::Backend;
use crate::fs::FsStorage;
use crate::mem::MemBackend;
use crate::storage::Storage;
use crate::{Error, Result};

fn default_max_cascade_cycles() -> u32 {
    25
}

/// Archive configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Root of the stored product data.
    pub root: PathBuf,
    /// Name of the registered catalogue backend.
    pub backend: String,
    /// Name of the registered storage backend.
    pub storage: String,
    /// Archive by symlink instead of copy, unless overridden per ingest.
    #[serde(default)]
    pub use_symlinks: bool,
    /// Minutes a product's sources must have been gone before cascade
    /// rules apply to it.
    #[serde(default)]
    pub cascade_grace_period: i64,
    /// Upper bound on cascade fixpoint iterations.
    #[serde(default = "default_max_cascade_cycles")]
    pub max_cascade_cycles: u32,
    /// Names of archives products may be pulled from.
    #[serde(default)]
    pub external_archives: Vec<String>,
    /// Credentials file for remote backends.
    #[serde(default)]
    pub auth_file: Option<PathBuf>,
}

impl ArchiveConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| Error::User(format!("invalid archive configuration: {err}")))
    }
}

pub type BackendFactory = Box<dyn Fn(&ArchiveConfig) -> Result<Box<dyn Backend>>>;
pub type StorageFactory = Box<dyn Fn(&ArchiveConfig) -> Result<Box<dyn Storage>>>;

/// Named factories for catalogue and storage backends.
pub struct ComponentRegistry {
    backends: BTreeMap<String, BackendFactory>,
    storages: BTreeMap<String, StorageFactory>,
}

impl Default for ComponentRegistry {
    /// Registry with the built-in `mem` backend and `fs` storage.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_backend("mem", |_| Ok(Box::new(MemBackend::new())));
        registry.register_storage("fs", |config| Ok(Box::new(FsStorage::new(&config.root))));
        registry
    }
}

impl ComponentRegistry {
    pub fn empty() -> Self {
        Self {
            backends: BTreeMap::new(),
            storages: BTreeMap::new(),
        }
    }

    pub fn register_backend<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ArchiveConfig) -> Result<Box<dyn Backend>> + 'static,
    {
        self.backends.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_storage<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ArchiveConfig) -> Result<Box<dyn Storage>> + 'static,
    {
        self.storages.insert(name.to_string(), Box::new(factory));
    }

    pub fn create_backend(&self, config: &ArchiveConfig) -> Result<Box<dyn Backend>> {
        match self.backends.get(&config.backend) {
            Some(factory) => factory(config),
            None => Err(Error::User(format!(
                "unknown backend: '{}'; available: {}",
                config.backend,
                quoted_names(self.backends.keys())
            ))),
        }
    }

    pub fn create_storage(&self, config: &ArchiveConfig) -> Result<Box<dyn Storage>> {
        match self.storages.get(&config.storage) {
            Some(factory) => factory(config),
            None => Err(Error::User(format!(
                "unknown storage: '{}'; available: {}",
                config.storage,
                quoted_names(self.storages.keys())
            ))),
        }
    }
}

fn quoted_names<'a>(names: impl Iterator<Item = &'a String>) -> String {
    names
        .map(|name| format!("'{name}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build an archive from a configuration document and registry.
pub fn create(config: &ArchiveConfig, registry: &ComponentRegistry) -> Result<Archive> {
    let backend = registry.create_backend(config)?;
    let storage = registry.create_storage(config)?;
    Archive::new(config, backend, storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_with_defaults() {
        let config = ArchiveConfig::from_json(
            r#"{"root": "/data/archive", "backend": "mem", "storage": "fs"}"#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/data/archive"));
        assert!(!config.use_symlinks);
        assert_eq!(config.cascade_grace_period, 0);
        assert_eq!(config.max_cascade_cycles, 25);
    }

    #[test]
    fn unknown_backend_lists_alternatives() {
        let config = ArchiveConfig::from_json(
            r#"{"root": "/data", "backend": "postgres", "storage": "fs"}"#,
        )
        .unwrap();
        let err = ComponentRegistry::default()
            .create_backend(&config)
            .unwrap_err();
        assert!(err.to_string().contains("unknown backend: 'postgres'"));
        assert!(err.to_string().contains("'mem'"));
    }

    #[test]
    fn create_wires_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArchiveConfig {
            root: dir.path().join("archive"),
            backend: "mem".to_string(),
            storage: "fs".to_string(),
            use_symlinks: false,
            cascade_grace_period: 0,
            max_cascade_cycles: 25,
            external_archives: Vec::new(),
            auth_file: None,
        };
        let archive = create(&config, &ComponentRegistry::default()).unwrap();
        assert_eq!(archive.root(), config.root);
    }
}
