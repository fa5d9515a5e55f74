//! recursive tree copy with optional hardlinking

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};

#[derive(Clone, Debug, Default)]
pub struct CopyOptions {
    /// hardlink regular files below this relative path instead of copying
    ///
    /// only safe for files that are never modified in place
    pub hardlink_under: Option<PathBuf>,
}

/// copy statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CopyStats {
    pub copied: usize,
    pub hardlinked: usize,
    pub symlinks: usize,
    pub directories: usize,
    pub skipped: usize,
    pub bytes_copied: u64,
}

/// true if an io error is EXDEV (rename or link across filesystems)
pub fn is_cross_device(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::libc::EXDEV)
}

/// copy `src` to `dst`, which must not exist yet
///
/// permissions are preserved; hardlinks fall back to copies once the
/// filesystem refuses them
pub fn copy_tree(src: &Path, dst: &Path, options: &CopyOptions) -> Result<CopyStats> {
    if dst.symlink_metadata().is_ok() {
        return Err(Error::Io {
            path: dst.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "destination exists"),
        });
    }

    let mut stats = CopyStats::default();
    let mut try_hardlink = options.hardlink_under.is_some();
    // directory modes are applied last so read-only dirs can still be filled
    let mut dir_modes = Vec::new();

    fs::create_dir_all(dst).with_path(dst)?;
    let root_meta = fs::metadata(src).with_path(src)?;
    dir_modes.push((dst.to_path_buf(), root_meta.permissions().mode()));

    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(src, e))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| Error::Io {
                path: entry.path().to_path_buf(),
                source: std::io::Error::other("path escaped copy root"),
            })?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target).with_path(&target)?;
            let meta = entry.metadata().map_err(|e| walk_error(src, e))?;
            dir_modes.push((target, meta.permissions().mode()));
            stats.directories += 1;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).with_path(entry.path())?;
            symlink(&link, &target).with_path(&target)?;
            stats.symlinks += 1;
        } else if file_type.is_file() {
            let linkable = options
                .hardlink_under
                .as_ref()
                .is_some_and(|prefix| rel.starts_with(prefix));

            if try_hardlink && linkable {
                match fs::hard_link(entry.path(), &target) {
                    Ok(()) => {
                        stats.hardlinked += 1;
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "hardlinking unavailable, copying instead");
                        try_hardlink = false;
                    }
                }
            }

            stats.bytes_copied += fs::copy(entry.path(), &target).with_path(&target)?;
            stats.copied += 1;
        } else {
            tracing::warn!(path = %entry.path().display(), "skipping special file");
            stats.skipped += 1;
        }
    }

    for (dir, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode)).with_path(&dir)?;
    }

    Ok(stats)
}

pub(crate) fn walk_error(root: &Path, e: walkdir::Error) -> Error {
    let path = e.path().unwrap_or(root).to_path_buf();
    Error::Io {
        path,
        source: e
            .into_io_error()
            .unwrap_or_else(|| std::io::Error::other("walkdir error")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::tempdir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("objects/ab")).unwrap();
        fs::create_dir_all(root.join("refs/heads")).unwrap();
        fs::write(root.join("config"), "[core]\nmode=archive-z2\n").unwrap();
        fs::write(root.join("objects/ab/cdef.filez"), "compressed").unwrap();
        fs::write(root.join("refs/heads/main"), "abcdef\n").unwrap();
        symlink("../config", root.join("refs/config-link")).unwrap();
        fs::set_permissions(root.join("config"), fs::Permissions::from_mode(0o600)).unwrap();
    }

    #[test]
    fn test_copy_tree_preserves_content() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        sample_tree(&src);

        let stats = copy_tree(&src, &dst, &CopyOptions::default()).unwrap();

        assert_eq!(stats.copied, 3);
        assert_eq!(stats.hardlinked, 0);
        assert_eq!(stats.symlinks, 1);
        assert_eq!(
            fs::read_to_string(dst.join("objects/ab/cdef.filez")).unwrap(),
            "compressed"
        );
        assert_eq!(
            fs::read_link(dst.join("refs/config-link")).unwrap(),
            PathBuf::from("../config")
        );
        let mode = fs::metadata(dst.join("config")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_copy_tree_hardlinks_objects_only() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        sample_tree(&src);

        let options = CopyOptions {
            hardlink_under: Some(PathBuf::from("objects")),
        };
        let stats = copy_tree(&src, &dst, &options).unwrap();

        assert_eq!(stats.hardlinked, 1);
        assert_eq!(stats.copied, 2);

        let src_ino = fs::metadata(src.join("objects/ab/cdef.filez")).unwrap().ino();
        let dst_ino = fs::metadata(dst.join("objects/ab/cdef.filez")).unwrap().ino();
        assert_eq!(src_ino, dst_ino);

        let src_cfg = fs::metadata(src.join("config")).unwrap().ino();
        let dst_cfg = fs::metadata(dst.join("config")).unwrap().ino();
        assert_ne!(src_cfg, dst_cfg);
    }

    #[test]
    fn test_copy_tree_refuses_existing_destination() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        sample_tree(&src);
        fs::create_dir(&dst).unwrap();

        assert!(copy_tree(&src, &dst, &CopyOptions::default()).is_err());
    }

    #[test]
    fn test_is_cross_device() {
        let exdev = std::io::Error::from_raw_os_error(nix::libc::EXDEV);
        assert!(is_cross_device(&exdev));
        assert!(!is_cross_device(&std::io::Error::other("x")));
    }
}
