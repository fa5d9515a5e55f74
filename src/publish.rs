//! atomic promotion of a built repository to its serving path
//!
//! the source is first moved (or copied and verified, across filesystems) to
//! a sibling `.<name>.incoming` directory next to the destination. when a tree
//! is already being served, the two directories are then exchanged in a single
//! `renameat2(RENAME_EXCHANGE)` call, so the destination path always names a
//! complete tree:
//!
//! ```text
//! incoming <-> destination     one atomic step
//! incoming  -> destination.old previous tree, removed afterwards
//! ```
//!
//! a first publish is a plain rename. [`recover`] restores `destination.old`
//! when the destination went missing outside of a commit.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cancel::CriticalSection;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{copy_tree, fingerprint, is_cross_device, CopyOptions};

/// suffix of the previous tree while it is being retired
pub const BACKUP_SUFFIX: &str = ".old";

type Relabel<'a> = Box<dyn Fn(&Path) -> Result<()> + 'a>;

/// what a successful commit did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// an existing tree was replaced
    pub replaced: bool,
    /// the source had to be copied across filesystems
    pub copied: bool,
    /// the backup of the previous tree was removed
    pub backup_removed: bool,
}

#[cfg(test)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Fault {
    /// the exchange (or first-publish rename) fails
    FailPromote,
    /// the process dies once the previous tree sits at the backup path
    CrashAfterBackup,
    /// moving the source reports EXDEV
    CrossDevice,
    /// as `CrossDevice`, and the copy is altered before it is verified
    TamperCopy,
}

/// one promotion of `source` to `destination`
pub struct PublishTransaction<'a> {
    source: PathBuf,
    destination: PathBuf,
    relabel: Option<Relabel<'a>>,
    #[cfg(test)]
    fault: Option<Fault>,
}

impl<'a> PublishTransaction<'a> {
    pub fn new(source: &Path, destination: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            relabel: None,
            #[cfg(test)]
            fault: None,
        }
    }

    /// label the incoming tree before it is swapped into place
    pub fn with_relabel(mut self, relabel: impl Fn(&Path) -> Result<()> + 'a) -> Self {
        self.relabel = Some(Box::new(relabel));
        self
    }

    #[cfg(test)]
    pub(crate) fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn backup_path(&self) -> PathBuf {
        suffixed(&self.destination, BACKUP_SUFFIX)
    }

    /// sibling of the destination the source is staged into
    pub fn incoming_path(&self) -> PathBuf {
        sibling(&self.destination, ".", ".incoming")
    }

    /// promote the source to the destination
    pub fn commit(self) -> Result<PublishOutcome> {
        let mut outcome = PublishOutcome::default();
        let backup = self.backup_path();
        let incoming = self.incoming_path();

        if let Some(parent) = self.destination.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }

        outcome.copied = self.stage(&incoming)?;

        if let Some(relabel) = &self.relabel {
            relabel(&incoming)?;
        }

        if self.destination.symlink_metadata().is_err() {
            {
                let _critical = CriticalSection::enter();
                self.promote(&incoming).map_err(|e| self.failed(None, e))?;
            }
            tracing::info!(path = %self.destination.display(), "published");
            self.remove_copied_source(&outcome);
            return Ok(outcome);
        }

        // left over from an earlier run whose cleanup failed
        if backup.symlink_metadata().is_ok() {
            tracing::info!(path = %backup.display(), "removing stale backup");
            fs::remove_dir_all(&backup).map_err(|e| self.failed(None, e))?;
        }

        {
            let _critical = CriticalSection::enter();
            self.swap(&incoming).map_err(|e| self.failed(None, e))?;
            outcome.replaced = true;
        }

        tracing::info!(path = %self.destination.display(), "published");

        // the previous tree now sits at the incoming path
        match fs::rename(&incoming, &backup) {
            Ok(()) => {
                #[cfg(test)]
                if self.fault == Some(Fault::CrashAfterBackup) {
                    return Err(self.failed(Some(backup), std::io::Error::other("simulated crash")));
                }

                outcome.backup_removed = self.remove_backup(&backup);
            }
            Err(e) => {
                tracing::warn!(
                    path = %incoming.display(),
                    error = %e,
                    "could not move previous tree aside"
                );
                outcome.backup_removed = self.remove_backup(&incoming);
            }
        }

        self.remove_copied_source(&outcome);
        Ok(outcome)
    }

    /// move the source into the incoming directory; true if it was copied
    fn stage(&self, incoming: &Path) -> Result<bool> {
        if incoming.symlink_metadata().is_ok() {
            tracing::debug!(path = %incoming.display(), "removing leftover incoming tree");
            fs::remove_dir_all(incoming).map_err(|e| self.failed(None, e))?;
        }

        match self.move_source(incoming) {
            Ok(()) => return Ok(false),
            Err(e) if is_cross_device(&e) => {}
            Err(e) => return Err(self.failed(None, e)),
        }

        tracing::info!(
            from = %self.source.display(),
            to = %incoming.display(),
            "source on another filesystem, copying"
        );

        let expected = fingerprint(&self.source)?;
        if let Err(e) = copy_tree(&self.source, incoming, &CopyOptions::default()) {
            let _ = fs::remove_dir_all(incoming);
            return Err(e);
        }

        #[cfg(test)]
        if self.fault == Some(Fault::TamperCopy) {
            fs::write(incoming.join("marker"), "tampered").with_path(incoming)?;
        }

        let actual = fingerprint(incoming)?;
        if actual != expected {
            let _ = fs::remove_dir_all(incoming);
            return Err(self.failed(
                None,
                std::io::Error::other(format!(
                    "copied tree does not match source ({} != {})",
                    actual, expected
                )),
            ));
        }

        Ok(true)
    }

    fn move_source(&self, incoming: &Path) -> std::io::Result<()> {
        #[cfg(test)]
        if matches!(self.fault, Some(Fault::CrossDevice | Fault::TamperCopy)) {
            return Err(std::io::Error::from_raw_os_error(nix::libc::EXDEV));
        }

        fs::rename(&self.source, incoming)
    }

    fn promote(&self, incoming: &Path) -> std::io::Result<()> {
        #[cfg(test)]
        if self.fault == Some(Fault::FailPromote) {
            return Err(std::io::Error::other("simulated promote failure"));
        }

        fs::rename(incoming, &self.destination)
    }

    fn swap(&self, incoming: &Path) -> std::io::Result<()> {
        #[cfg(test)]
        if self.fault == Some(Fault::FailPromote) {
            return Err(std::io::Error::other("simulated exchange failure"));
        }

        exchange(incoming, &self.destination)
    }

    fn remove_backup(&self, path: &Path) -> bool {
        match fs::remove_dir_all(path) {
            Ok(()) => true,
            Err(source) => {
                let err = Error::Cleanup {
                    path: path.to_path_buf(),
                    source,
                };
                tracing::warn!(error = %err, "could not remove previous tree");
                false
            }
        }
    }

    fn remove_copied_source(&self, outcome: &PublishOutcome) {
        if !outcome.copied {
            return;
        }
        if let Err(source) = fs::remove_dir_all(&self.source) {
            let err = Error::Cleanup {
                path: self.source.clone(),
                source,
            };
            tracing::warn!(error = %err, "could not remove staging repository");
        }
    }

    fn failed(&self, backup: Option<PathBuf>, source: std::io::Error) -> Error {
        Error::PublishFailed {
            destination: self.destination.clone(),
            backup,
            source,
        }
    }
}

/// swap two directory entries in one step
#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn exchange(a: &Path, b: &Path) -> std::io::Result<()> {
    use nix::fcntl::{renameat2, RenameFlags, AT_FDCWD};

    renameat2(AT_FDCWD, a, AT_FDCWD, b, RenameFlags::RENAME_EXCHANGE).map_err(std::io::Error::from)
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn exchange(_a: &Path, _b: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "atomic directory exchange is not available on this platform",
    ))
}

/// restore `destination` from `destination.old` if the destination is missing
///
/// a backup next to a live destination is stale and is removed. returns true
/// if a backup was restored
pub fn recover(destination: &Path) -> Result<bool> {
    let backup = suffixed(destination, BACKUP_SUFFIX);

    if !backup.is_dir() {
        return Ok(false);
    }

    if destination.symlink_metadata().is_ok() {
        tracing::info!(path = %backup.display(), "removing stale backup");
        if let Err(source) = fs::remove_dir_all(&backup) {
            let err = Error::Cleanup { path: backup, source };
            tracing::warn!(error = %err, "could not remove stale backup");
        }
        return Ok(false);
    }

    tracing::warn!(
        backup = %backup.display(),
        path = %destination.display(),
        "restoring previous tree"
    );
    fs::rename(&backup, destination).map_err(|source| Error::PublishFailed {
        destination: destination.to_path_buf(),
        backup: Some(backup.clone()),
        source,
    })?;
    Ok(true)
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn sibling(path: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix);
    name.push(path.file_name().unwrap_or_default());
    name.push(suffix);
    path.with_file_name(name)
}
