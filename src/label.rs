//! mandatory access control labels for the served tree
//!
//! labeling is delegated to `chcon`; this module only decides whether it
//! applies and which type goes where.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env::BuildEnvironment;
use crate::error::Result;
use crate::process::{Cmd, CommandRunner};

/// where the kernel exposes SELinux state
pub const SELINUXFS: &str = "/sys/fs/selinux";

const LABEL_XATTR: &str = "security.selinux";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LabelMode {
    /// label when the host has SELinux enabled
    #[default]
    Auto,
    Enabled,
    Disabled,
}

impl std::str::FromStr for LabelMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(LabelMode::Auto),
            "enabled" | "on" => Ok(LabelMode::Enabled),
            "disabled" | "off" => Ok(LabelMode::Disabled),
            _ => Err(format!("unknown label mode: {}", s)),
        }
    }
}

/// reapplies security contexts to published paths
#[derive(Clone, Debug)]
pub struct LabelEnforcer {
    mode: LabelMode,
    content_type: String,
    rw_type: String,
    chcon: String,
    selinuxfs: PathBuf,
    timeout: Option<Duration>,
}

impl LabelEnforcer {
    pub fn new(mode: LabelMode, content_type: impl Into<String>, rw_type: impl Into<String>) -> Self {
        Self {
            mode,
            content_type: content_type.into(),
            rw_type: rw_type.into(),
            chcon: "chcon".to_string(),
            selinuxfs: PathBuf::from(SELINUXFS),
            timeout: None,
        }
    }

    pub fn from_env(env: &BuildEnvironment) -> Self {
        Self::new(env.label.mode, &env.label.content_type, &env.label.rw_type)
            .with_chcon(&env.tools.chcon)
            .with_timeout(env.command_timeout)
    }

    pub fn with_chcon(mut self, chcon: impl Into<String>) -> Self {
        self.chcon = chcon.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// look for the selinuxfs mount somewhere else
    pub fn with_selinuxfs(mut self, path: &Path) -> Self {
        self.selinuxfs = path.to_path_buf();
        self
    }

    pub fn mode(&self) -> LabelMode {
        self.mode
    }

    pub fn chcon(&self) -> &str {
        &self.chcon
    }

    /// true when labels will be applied on this host
    pub fn is_enabled(&self) -> bool {
        match self.mode {
            LabelMode::Enabled => true,
            LabelMode::Disabled => false,
            LabelMode::Auto => self.selinuxfs.join("enforce").exists(),
        }
    }

    fn chcon_cmd(&self, label_type: &str, path: &Path) -> Cmd {
        Cmd::new(&self.chcon)
            .args(["-R", "-t", label_type])
            .arg(path.display().to_string())
            .timeout(self.timeout)
    }

    /// recursively set `label_type` on `path`
    pub fn relabel(&self, runner: &dyn CommandRunner, path: &Path, label_type: &str) -> Result<()> {
        tracing::debug!(
            path = %path.display(),
            label_type,
            before = current_label(path).as_deref().unwrap_or("-"),
            "relabeling"
        );
        runner.run(&self.chcon_cmd(label_type, path))?;
        Ok(())
    }

    /// label a tree that is about to be served
    pub fn label_content(&self, runner: &dyn CommandRunner, path: &Path) -> Result<()> {
        self.relabel(runner, path, &self.content_type)
    }

    /// label the published tree read-only and the cache read-write
    ///
    /// returns false when labeling is disabled on this host
    pub fn apply(&self, runner: &dyn CommandRunner, publish_path: &Path, cache_dir: &Path) -> Result<bool> {
        if !self.is_enabled() {
            tracing::debug!("labels disabled, skipping");
            return Ok(false);
        }

        self.label_content(runner, publish_path)?;
        if cache_dir.exists() {
            self.relabel(runner, cache_dir, &self.rw_type)?;
        }

        tracing::info!(path = %publish_path.display(), "labels applied");
        Ok(true)
    }
}

/// current security context of `path`, if any
pub fn current_label(path: &Path) -> Option<String> {
    let raw = xattr::get(path, LABEL_XATTR).ok()??;
    let text = String::from_utf8_lossy(&raw);
    Some(text.trim_end_matches('\0').to_string())
}
