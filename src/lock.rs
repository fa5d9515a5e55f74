use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, IoResultExt, Result};

/// guard that holds the publish lock until dropped
pub struct PublishLock {
    path: PathBuf,
    #[allow(dead_code)]
    flock: Flock<File>,
}
// lock is released automatically when Flock is dropped

impl PublishLock {
    /// acquire the lock, failing immediately if another run holds it
    pub fn acquire(path: &Path) -> Result<Self> {
        Self::try_acquire(path)?.ok_or_else(|| Error::LockContention(path.to_path_buf()))
    }

    /// try to acquire the lock, returning None if already held
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }

        // never truncate: the holder may be inspecting it
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_path(path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                tracing::debug!(path = %path.display(), "acquired publish lock");
                Ok(Some(Self {
                    path: path.to_path_buf(),
                    flock,
                }))
            }
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(Error::Io {
                path: path.to_path_buf(),
                source: std::io::Error::from(errno),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_publish_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("srv/.vauxite.lock");

        // acquire lock, creating the parent
        let lock = PublishLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path);

        // second acquisition should fail
        assert!(PublishLock::try_acquire(&path).unwrap().is_none());
        assert!(matches!(
            PublishLock::acquire(&path),
            Err(Error::LockContention(p)) if p == path
        ));

        drop(lock);

        // now should succeed
        assert!(PublishLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_lock_file_survives_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".vauxite.lock");

        drop(PublishLock::acquire(&path).unwrap());
        assert!(path.exists());
        PublishLock::acquire(&path).unwrap();
    }
}
