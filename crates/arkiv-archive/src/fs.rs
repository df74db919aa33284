//! Filesystem storage backend.
//!
//! Products live under a single root directory at
//! `<root>/<archive_path>/<physical_name>`. Multi-part products occupy a
//! per-product directory at that location; single-part products are the
//! file itself.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::plugin::ProductTypePlugin;
use crate::properties::Properties;
use crate::storage::Storage;
use crate::util;
use crate::{Error, Result};

pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target_dir(&self, archive_path: &str) -> PathBuf {
        self.root.join(archive_path)
    }

    /// Relative archive path of a directory inside the root.
    fn relative_archive_path(&self, dir: &Path) -> Result<String> {
        let root = fs::canonicalize(&self.root)?;
        let dir = fs::canonicalize(dir)?;
        let relative = dir.strip_prefix(&root).map_err(|_| {
            Error::User(format!(
                "product path '{}' is not inside the archive root",
                dir.display()
            ))
        })?;
        Ok(relative.to_string_lossy().replace('\\', "/"))
    }
}

fn copy_path(source: &Path, target: &Path) -> Result<()> {
    if source.is_dir() {
        fs::create_dir(target)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_path(&entry.path(), &target.join(entry.file_name()))?;
        }
    } else {
        fs::copy(source, target)?;
    }
    Ok(())
}

fn link_path(source: &Path, target: &Path) -> Result<()> {
    let source = fs::canonicalize(source)?;
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(&source, target)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = target;
        Err(Error::User(
            "symbolic links are not supported on this platform".to_string(),
        ))
    }
}

impl Storage for FsStorage {
    fn exists(&self) -> Result<bool> {
        Ok(self.root.is_dir())
    }

    fn prepare(&mut self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        if self.root.is_dir() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }

    fn supports_symlinks(&self) -> bool {
        cfg!(unix)
    }

    fn product_path(&self, properties: &Properties) -> Result<PathBuf> {
        let archive_path = properties.archive_path().ok_or_else(|| {
            Error::Internal("product has no archive path".to_string())
        })?;
        let physical_name = properties.physical_name().ok_or_else(|| {
            Error::Internal("product has no physical name".to_string())
        })?;
        Ok(self.root.join(archive_path).join(physical_name))
    }

    fn put(
        &mut self,
        paths: &[PathBuf],
        properties: &mut Properties,
        plugin: &dyn ProductTypePlugin,
        use_current_path: bool,
        use_symlinks: bool,
    ) -> Result<()> {
        let archive_path = if use_current_path {
            // Data stays where it is; record its location instead of
            // moving it.
            let first = paths.first().ok_or_else(|| {
                Error::User("nothing to archive".to_string())
            })?;
            let dir = first.parent().ok_or_else(|| {
                Error::User(format!("invalid product path: '{}'", first.display()))
            })?;
            let dir = if plugin.use_enclosing_directory() {
                dir.parent().ok_or_else(|| {
                    Error::User(format!("invalid product path: '{}'", first.display()))
                })?
            } else {
                dir
            };
            self.relative_archive_path(dir)?
        } else {
            plugin.archive_path(properties)?
        };
        properties.set_core("archive_path", archive_path.clone().into());

        if use_current_path {
            return Ok(());
        }

        let mut target_dir = self.target_dir(&archive_path);
        if plugin.use_enclosing_directory() {
            let physical_name = properties.physical_name().ok_or_else(|| {
                Error::Internal("product has no physical name".to_string())
            })?;
            target_dir = target_dir.join(physical_name);
        }
        fs::create_dir_all(&target_dir)?;

        for path in paths {
            let target = target_dir.join(util::basename(path)?);
            debug!(source = %path.display(), target = %target.display(), "archiving");
            if use_symlinks {
                link_path(path, &target)?;
            } else {
                copy_path(path, &target)?;
            }
        }
        Ok(())
    }

    fn get(
        &self,
        product_path: &Path,
        properties: &Properties,
        plugin: &dyn ProductTypePlugin,
        target_path: &Path,
        use_symlinks: bool,
    ) -> Result<PathBuf> {
        if !product_path.exists() {
            return Err(Error::User(format!(
                "no data available for product {}",
                properties.display_name()
            )));
        }

        let target = target_path.join(util::basename(product_path)?);
        if plugin.use_enclosing_directory() && !use_symlinks {
            // The enclosing directory itself is part of the product.
            fs::create_dir(&target)?;
            for entry in fs::read_dir(product_path)? {
                let entry = entry?;
                copy_path(&entry.path(), &target.join(entry.file_name()))?;
            }
        } else if use_symlinks {
            link_path(product_path, &target)?;
        } else {
            copy_path(product_path, &target)?;
        }
        Ok(target)
    }

    fn delete(
        &mut self,
        product_path: &Path,
        properties: &Properties,
        _plugin: &dyn ProductTypePlugin,
    ) -> Result<()> {
        if !product_path.exists() {
            return Ok(());
        }
        debug!(product = %properties.display_name(), path = %product_path.display(), "deleting data");
        if product_path.is_dir() {
            fs::remove_dir_all(product_path)?;
        } else {
            fs::remove_file(product_path)?;
        }
        Ok(())
    }

    fn rename(&mut self, product_path: &Path, new_archive_path: &str) -> Result<PathBuf> {
        let target_dir = self.target_dir(new_archive_path);
        fs::create_dir_all(&target_dir)?;
        let target = target_dir.join(util::basename(product_path)?);
        fs::rename(product_path, &target)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::AnalyzeResult;
    use arkiv_expr::Value;

    struct FilePlugin;

    impl ProductTypePlugin for FilePlugin {
        fn identify(&self, _paths: &[PathBuf]) -> bool {
            true
        }

        fn analyze(&self, _paths: &[PathBuf]) -> Result<AnalyzeResult> {
            Ok(AnalyzeResult::default())
        }

        fn archive_path(&self, _properties: &Properties) -> Result<String> {
            Ok("2020/01".to_string())
        }
    }

    fn properties(name: &str) -> Properties {
        let mut properties = Properties::new();
        properties.set_core("physical_name", Value::Text(name.to_string()));
        properties.set_core("product_name", Value::Text(name.to_string()));
        properties.set_core("uuid", Value::Uuid(uuid::Uuid::new_v4()));
        properties
    }

    #[test]
    fn put_get_delete_round_trip() {
        let workspace = tempfile::tempdir().unwrap();
        let source = workspace.path().join("p.dat");
        fs::write(&source, b"data").unwrap();

        let mut storage = FsStorage::new(workspace.path().join("archive"));
        storage.prepare().unwrap();

        let mut props = properties("p.dat");
        storage
            .put(&[source.clone()], &mut props, &FilePlugin, false, false)
            .unwrap();
        assert_eq!(props.archive_path(), Some("2020/01"));

        let product_path = storage.product_path(&props).unwrap();
        assert_eq!(fs::read(&product_path).unwrap(), b"data");

        let out = workspace.path().join("out");
        fs::create_dir(&out).unwrap();
        let delivered = storage
            .get(&product_path, &props, &FilePlugin, &out, false)
            .unwrap();
        assert_eq!(fs::read(delivered).unwrap(), b"data");

        storage.delete(&product_path, &props, &FilePlugin).unwrap();
        assert!(!product_path.exists());
        // Deleting again is not an error.
        storage.delete(&product_path, &props, &FilePlugin).unwrap();
    }

    #[test]
    fn rename_moves_the_product() {
        let workspace = tempfile::tempdir().unwrap();
        let source = workspace.path().join("p.dat");
        fs::write(&source, b"data").unwrap();

        let mut storage = FsStorage::new(workspace.path().join("archive"));
        storage.prepare().unwrap();

        let mut props = properties("p.dat");
        storage
            .put(&[source], &mut props, &FilePlugin, false, false)
            .unwrap();
        let old_path = storage.product_path(&props).unwrap();
        let new_path = storage.rename(&old_path, "2021/02").unwrap();
        assert!(!old_path.exists());
        assert_eq!(fs::read(new_path).unwrap(), b"data");
    }
}
