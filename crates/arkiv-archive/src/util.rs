//! Product data helpers: sizing, hashing, path hygiene.

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::{Error, Result};

/// Total size in bytes of the given files and directory trees.
pub fn product_size(paths: &[PathBuf]) -> Result<u64> {
    let mut total = 0u64;
    for path in paths {
        for entry in WalkDir::new(path).follow_links(true) {
            let entry = entry.map_err(|err| Error::Io(err.into()))?;
            if entry.file_type().is_file() {
                total += entry.metadata().map_err(|err| Error::Io(err.into()))?.len();
            }
        }
    }
    Ok(total)
}

/// SHA-256 hash over the product data, as a lowercase hex digest.
///
/// Files are hashed in sorted relative-path order, each preceded by its
/// relative path, so that renames and reorderings change the digest.
pub fn product_hash(paths: &[PathBuf]) -> Result<String> {
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for path in paths {
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(""));
        for entry in WalkDir::new(path).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|err| Error::Io(err.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&base)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            files.push((relative, entry.path().to_path_buf()));
        }
    }
    files.sort();

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    for (relative, path) in files {
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        let mut file = fs::File::open(&path)?;
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
    }

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    Ok(hex)
}

/// Whether two or more paths share the same file name.
pub fn contains_duplicate_basenames(paths: &[PathBuf]) -> bool {
    let mut seen = HashSet::new();
    paths
        .iter()
        .filter_map(|path| path.file_name())
        .any(|name| !seen.insert(name.to_os_string()))
}

/// File name component of a path, as UTF-8.
pub fn basename(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::User(format!("invalid product path: '{}'", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn size_sums_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.dat"), b"12345").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.dat"), b"123").unwrap();

        let total = product_size(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(total, 8);
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.dat");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"payload").unwrap();
        drop(file);

        let first = product_hash(&[path.clone()]).unwrap();
        let second = product_hash(&[path.clone()]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);

        fs::write(&path, b"payload2").unwrap();
        assert_ne!(product_hash(&[path]).unwrap(), first);
    }

    #[test]
    fn hash_depends_on_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.dat");
        let b = dir.path().join("b.dat");
        fs::write(&a, b"same").unwrap();
        fs::write(&b, b"same").unwrap();
        assert_ne!(
            product_hash(&[a]).unwrap(),
            product_hash(&[b]).unwrap()
        );
    }

    #[test]
    fn duplicate_basenames_are_detected() {
        let paths = vec![PathBuf::from("x/a.dat"), PathBuf::from("y/a.dat")];
        assert!(contains_duplicate_basenames(&paths));
        let paths = vec![PathBuf::from("x/a.dat"), PathBuf::from("x/b.dat")];
        assert!(!contains_duplicate_basenames(&paths));
    }
}
