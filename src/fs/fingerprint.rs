//! content fingerprint of a directory tree
//!
//! fingerprint = SHA256 over every entry, sorted by path:
//! path | type | mode | content (files) or target (symlinks)

use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{IoResultExt, Result};
use crate::fs::copy::walk_error;

/// hex fingerprint of everything below `root`
///
/// the root directory itself only contributes its mode, so the same tree
/// under a different name has the same fingerprint
pub fn fingerprint(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();

    let root_meta = fs::metadata(root).with_path(root)?;
    hasher.update((root_meta.permissions().mode() & 0o7777).to_le_bytes());

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(root, e))?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let meta = entry.metadata().map_err(|e| walk_error(root, e))?;
        let file_type = entry.file_type();

        hasher.update(rel.as_os_str().as_bytes());
        hasher.update([0u8]);

        if file_type.is_symlink() {
            hasher.update(b"l");
            let target = fs::read_link(entry.path()).with_path(entry.path())?;
            hasher.update(target.as_os_str().as_bytes());
        } else {
            let tag: &[u8] = if file_type.is_dir() {
                b"d"
            } else if file_type.is_file() {
                b"f"
            } else {
                b"o"
            };
            hasher.update(tag);
            hasher.update((meta.permissions().mode() & 0o7777).to_le_bytes());

            if file_type.is_file() {
                hasher.update(meta.len().to_le_bytes());
                let mut file = File::open(entry.path()).with_path(entry.path())?;
                io::copy(&mut file, &mut hasher).with_path(entry.path())?;
            }
        }
        hasher.update([0u8]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tree(root: &Path, content: &str) {
        fs::create_dir_all(root.join("refs/heads")).unwrap();
        fs::write(root.join("config"), "[core]\n").unwrap();
        fs::write(root.join("refs/heads/main"), content).unwrap();
    }

    #[test]
    fn test_fingerprint_stable_across_locations() {
        let dir = tempdir().unwrap();
        tree(&dir.path().join("a"), "abc");
        tree(&dir.path().join("b"), "abc");

        let a = fingerprint(&dir.path().join("a")).unwrap();
        let b = fingerprint(&dir.path().join("b")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_detects_content_change() {
        let dir = tempdir().unwrap();
        tree(&dir.path().join("a"), "abc");
        tree(&dir.path().join("b"), "abd");

        assert_ne!(
            fingerprint(&dir.path().join("a")).unwrap(),
            fingerprint(&dir.path().join("b")).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_detects_mode_change() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        tree(&a, "abc");
        let before = fingerprint(&a).unwrap();

        fs::set_permissions(a.join("config"), fs::Permissions::from_mode(0o600)).unwrap();
        assert_ne!(before, fingerprint(&a).unwrap());
    }

    #[test]
    fn test_fingerprint_detects_new_entry() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        tree(&a, "abc");
        let before = fingerprint(&a).unwrap();

        fs::create_dir(a.join("tmp")).unwrap();
        assert_ne!(before, fingerprint(&a).unwrap());
    }
}
