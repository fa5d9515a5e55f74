//! best-effort cleanup after a run
//!
//! nothing here fails a run: problems are reported as [`Error::Cleanup`]
//! values and logged by the caller.

use std::fs;
use std::path::{Path, PathBuf};

use nix::unistd::{chown, User};

use crate::error::{Error, Result};

/// what a temporary sweep did
#[derive(Debug, Default)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<Error>,
}

/// remove every path matching one of `patterns`
pub fn sweep_tmp(patterns: &[String]) -> SweepReport {
    let mut report = SweepReport::default();

    for pattern in patterns {
        let paths = match glob::glob(pattern) {
            Ok(paths) => paths,
            Err(e) => {
                report.failures.push(Error::InvalidConfig(format!(
                    "bad cleanup pattern {:?}: {}",
                    pattern, e
                )));
                continue;
            }
        };

        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    let path = e.path().to_path_buf();
                    report.failures.push(Error::Cleanup {
                        path,
                        source: e.into(),
                    });
                    continue;
                }
            };

            match remove_path(&path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "removed temporary path");
                    report.removed.push(path);
                }
                Err(source) => report.failures.push(Error::Cleanup { path, source }),
            }
        }
    }

    report
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// hand `path` back to `owner` and their primary group
///
/// only the directory itself changes owner; its contents keep theirs
pub fn restore_owner(path: &Path, owner: &str) -> Result<()> {
    let user = User::from_name(owner)
        .map_err(|e| Error::Cleanup {
            path: path.to_path_buf(),
            source: std::io::Error::from(e),
        })?
        .ok_or_else(|| Error::UnknownUser(owner.to_string()))?;

    chown(path, Some(user.uid), Some(user.gid)).map_err(|e| Error::Cleanup {
        path: path.to_path_buf(),
        source: std::io::Error::from(e),
    })?;

    tracing::debug!(path = %path.display(), owner, "restored ownership");
    Ok(())
}
