use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};
use crate::label::LabelMode;
use crate::repo::RepoMode;

/// build configuration stored in treepub.toml
///
/// every key has a default, so an empty file is a valid configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// repository name, used for the staging and publish directories
    pub name: String,
    /// tree definition handed to rpm-ostree (relative to the base directory)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_file: Option<PathBuf>,
    /// lockfile overlay, only used when present and non-empty; unset means
    /// src/overrides.yaml, an empty path turns the overlay off
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lockfile: Option<PathBuf>,
    /// ref whose history drives pruning
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,
    pub work_dir: PathBuf,
    pub srv_root: PathBuf,
    pub repo_mode: RepoMode,
    /// keep this many newest commits; pruning is off when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retain_commits: Option<usize>,
    /// per-command timeout; commands may run forever when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
    pub require_root: bool,
    /// copy the published repository into staging before composing
    pub seed_from_published: bool,
    pub tools: Tools,
    pub label: LabelConfig,
    pub cleanup: CleanupConfig,
}

/// external programs, by name or absolute path
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tools {
    pub ostree: String,
    pub rpm_ostree: String,
    pub chcon: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    pub mode: LabelMode,
    /// type applied to the published tree
    pub content_type: String,
    /// type applied to the rewritable cache directory
    pub rw_type: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// temporary directories left behind by the compose tool
    pub tmp_globs: Vec<String>,
    /// chown the work directory back to the invoking user
    pub restore_owner: bool,
}

impl Config {
    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// load config from file if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    /// tree definition path, defaulting to src/<name>.yaml
    pub fn tree_file(&self) -> PathBuf {
        self.tree_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("src").join(format!("{}.yaml", self.name)))
    }

    /// lockfile overlay path, if the overlay is not turned off
    pub fn lockfile(&self) -> Option<PathBuf> {
        match &self.lockfile {
            None => Some(PathBuf::from("src/overrides.yaml")),
            Some(path) if path.as_os_str().is_empty() => None,
            Some(path) => Some(path.clone()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "vauxite".to_string(),
            tree_file: None,
            lockfile: None,
            ref_name: None,
            work_dir: PathBuf::from("build"),
            srv_root: PathBuf::from("/srv/ostree"),
            repo_mode: RepoMode::Archive,
            retain_commits: None,
            command_timeout_secs: None,
            require_root: true,
            seed_from_published: true,
            tools: Tools::default(),
            label: LabelConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            ostree: "ostree".to_string(),
            rpm_ostree: "rpm-ostree".to_string(),
            chcon: "chcon".to_string(),
        }
    }
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            mode: LabelMode::Auto,
            content_type: "httpd_sys_content_t".to_string(),
            rw_type: "httpd_sys_rw_content_t".to_string(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            tmp_globs: vec!["/var/tmp/rpm-ostree.*".to_string()],
            restore_owner: true,
        }
    }
}
