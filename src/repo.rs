use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env::BuildEnvironment;
use crate::error::{Error, IoResultExt, Result};
use crate::process::{Cmd, CommandRunner, Output, OutputMode};
use crate::prune::{parse_log, CommitRecord};

/// phrase rpm-ostree prints when a compose produced no new content
pub const NO_CHANGES_SENTINEL: &str = "no apparent changes since previous commit";

/// on-disk repository format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepoMode {
    #[default]
    Archive,
    ArchiveZ2,
}

impl RepoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoMode::Archive => "archive",
            RepoMode::ArchiveZ2 => "archive-z2",
        }
    }
}

impl std::fmt::Display for RepoMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// result of a compose
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    /// a new commit was written
    Changed,
    /// the tool reported nothing new to commit
    Unchanged,
    Failed { exit_code: i32 },
}

impl BuildOutcome {
    /// classify a finished compose
    ///
    /// the sentinel is matched loosely; any successful exit without it counts
    /// as changed, so phrase drift only costs a redundant publish
    pub fn classify(output: &Output) -> Self {
        if !output.success() {
            return BuildOutcome::Failed {
                exit_code: output.exit_code,
            };
        }

        let unchanged = [&output.stdout, &output.stderr]
            .iter()
            .any(|s| s.to_lowercase().contains(NO_CHANGES_SENTINEL));
        if unchanged {
            BuildOutcome::Unchanged
        } else {
            BuildOutcome::Changed
        }
    }
}

/// an ostree repository on disk, driven through the ostree and rpm-ostree CLIs
#[derive(Clone, Debug)]
pub struct Repository {
    path: PathBuf,
    mode: RepoMode,
    ostree: String,
    rpm_ostree: String,
    timeout: Option<Duration>,
}

impl Repository {
    pub fn new(path: &Path, mode: RepoMode) -> Self {
        Self {
            path: path.to_path_buf(),
            mode,
            ostree: "ostree".to_string(),
            rpm_ostree: "rpm-ostree".to_string(),
            timeout: None,
        }
    }

    /// a repository at `path` using the tools and timeout of `env`
    pub fn from_env(env: &BuildEnvironment, path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            mode: env.repo_mode,
            ostree: env.tools.ostree.clone(),
            rpm_ostree: env.tools.rpm_ostree.clone(),
            timeout: env.command_timeout,
        }
    }

    pub fn with_tools(mut self, ostree: impl Into<String>, rpm_ostree: impl Into<String>) -> Self {
        self.ostree = ostree.into();
        self.rpm_ostree = rpm_ostree.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// repository root path
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> RepoMode {
        self.mode
    }

    fn repo_arg(&self) -> String {
        format!("--repo={}", self.path.display())
    }

    fn ostree_cmd(&self, subcommand: &str) -> Cmd {
        Cmd::new(&self.ostree)
            .arg(subcommand)
            .arg(self.repo_arg())
            .timeout(self.timeout)
    }

    /// true when the directory exists and has at least one entry
    pub fn is_populated(&self) -> Result<bool> {
        match fs::read_dir(&self.path) {
            Ok(mut entries) => Ok(entries.next().is_some()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    /// initialize the repository unless the directory already has content
    ///
    /// returns true when an init was performed. a failed init leaves no
    /// partially stamped directory behind.
    pub fn ensure_initialized(&self, runner: &dyn CommandRunner) -> Result<bool> {
        if self.is_populated()? {
            tracing::debug!(path = %self.path.display(), "repository already present");
            return Ok(false);
        }

        let created = !self.path.exists();
        fs::create_dir_all(&self.path).with_path(&self.path)?;

        let cmd = self
            .ostree_cmd("init")
            .arg(format!("--mode={}", self.mode));

        if let Err(e) = runner.run(&cmd) {
            if let Err(cleanup) = fs::remove_dir_all(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %cleanup, "could not remove half-initialized repository");
            } else if !created {
                let _ = fs::create_dir(&self.path);
            }
            return Err(e);
        }

        tracing::info!(path = %self.path.display(), mode = %self.mode, "initialized repository");
        Ok(true)
    }

    /// build the compose invocation
    ///
    /// the lockfile overlay is only passed when it exists and is non-empty
    pub fn compose_command(&self, tree_file: &Path, overlay: Option<&Path>, cache_dir: &Path) -> Cmd {
        let mut cmd = Cmd::new(&self.rpm_ostree)
            .args(["compose", "tree", "--unified-core"])
            .arg(format!("--cachedir={}", cache_dir.display()))
            .arg(self.repo_arg());

        if let Some(lockfile) = lockfile_overlay(overlay) {
            cmd = cmd.arg(format!("--ex-lockfile={}", lockfile.display()));
        }

        cmd.arg(tree_file.display().to_string())
            .mode(OutputMode::Tee)
            .timeout(self.timeout)
            .allow_failure()
    }

    /// compose the tree into this repository
    ///
    /// a failed compose is returned as [`Error::CommandFailed`]
    pub fn compose(
        &self,
        runner: &dyn CommandRunner,
        tree_file: &Path,
        overlay: Option<&Path>,
        cache_dir: &Path,
    ) -> Result<BuildOutcome> {
        let cmd = self.compose_command(tree_file, overlay, cache_dir);
        let output = runner.run(&cmd)?;

        match BuildOutcome::classify(&output) {
            BuildOutcome::Failed { exit_code } => Err(Error::CommandFailed {
                argv: cmd.argv(),
                exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            outcome => Ok(outcome),
        }
    }

    /// regenerate the summary file clients use to discover refs
    pub fn generate_summary(&self, runner: &dyn CommandRunner) -> Result<()> {
        runner.run(&self.ostree_cmd("summary").arg("--update"))?;
        Ok(())
    }

    /// commit history for a ref, newest first
    ///
    /// a ref that does not exist yet has an empty history
    pub fn log(&self, runner: &dyn CommandRunner, ref_name: &str) -> Result<Vec<CommitRecord>> {
        let cmd = self.ostree_cmd("log").arg(ref_name).allow_failure();
        let output = runner.run(&cmd)?;

        if output.success() {
            return Ok(parse_log(&output.stdout));
        }

        if is_missing_ref(&output.stderr) {
            tracing::debug!(ref_name, "ref has no history yet");
            return Ok(Vec::new());
        }

        Err(Error::CommandFailed {
            argv: cmd.argv(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// remove commits older than `older_than`
    pub fn prune(&self, runner: &dyn CommandRunner, older_than: &str) -> Result<()> {
        runner.run(
            &self
                .ostree_cmd("prune")
                .arg(format!("--keep-younger-than={}", older_than)),
        )?;
        Ok(())
    }
}

/// the lockfile to overlay, if it exists and is non-empty
pub fn lockfile_overlay(path: Option<&Path>) -> Option<&Path> {
    let path = path?;
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(path),
        _ => None,
    }
}

/// ostree reports an unknown ref as "Refspec '<ref>' not found"
fn is_missing_ref(stderr: &str) -> bool {
    stderr.lines().any(|line| {
        let line = line.to_lowercase();
        line.contains("refspec") && line.contains("not found")
    })
}
