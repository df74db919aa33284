//! Storage backend contract.
//!
//! A storage backend holds the product data itself, addressed by the
//! relative archive path and physical name recorded in the catalogue.
//! The coordinator decides where a product belongs; the storage backend
//! only moves bytes.

use std::path::{Path, PathBuf};

use crate::plugin::ProductTypePlugin;
use crate::properties::Properties;
use crate::Result;

pub trait Storage: Send {
    fn exists(&self) -> Result<bool>;

    fn prepare(&mut self) -> Result<()>;

    fn destroy(&mut self) -> Result<()>;

    /// Whether `get` can deliver symlinks instead of copies.
    fn supports_symlinks(&self) -> bool;

    /// Location of a product's stored data, derived from
    /// `core.archive_path` and `core.physical_name`.
    fn product_path(&self, properties: &Properties) -> Result<PathBuf>;

    /// Store product data. The plugin decides the archive path, which is
    /// written back into `core.archive_path`. With `use_current_path`
    /// the files must already be at their archive location and are left
    /// in place. With `use_symlinks` the archive references the original
    /// files instead of holding copies.
    fn put(
        &mut self,
        paths: &[PathBuf],
        properties: &mut Properties,
        plugin: &dyn ProductTypePlugin,
        use_current_path: bool,
        use_symlinks: bool,
    ) -> Result<()>;

    /// Deliver a copy (or symlink) of the stored product data inside
    /// `target_path`. Returns the path of the delivered product.
    fn get(
        &self,
        product_path: &Path,
        properties: &Properties,
        plugin: &dyn ProductTypePlugin,
        target_path: &Path,
        use_symlinks: bool,
    ) -> Result<PathBuf>;

    /// Remove stored product data. Missing data is not an error.
    fn delete(
        &mut self,
        product_path: &Path,
        properties: &Properties,
        plugin: &dyn ProductTypePlugin,
    ) -> Result<()>;

    /// Move stored product data to a new relative archive path.
    fn rename(&mut self, product_path: &Path, new_archive_path: &str) -> Result<PathBuf>;
}
