use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{Config, LabelConfig, Tools};
use crate::error::{Error, Result};
use crate::repo::RepoMode;

/// resolved, absolute view of a [`Config`] for one run
///
/// built once at startup and handed to every component by reference
#[derive(Clone, Debug)]
pub struct BuildEnvironment {
    pub name: String,
    pub base_dir: PathBuf,
    pub tree_file: PathBuf,
    pub lockfile: Option<PathBuf>,
    pub ref_name: Option<String>,
    pub work_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub staging_repo: PathBuf,
    pub srv_root: PathBuf,
    pub publish_path: PathBuf,
    pub repo_mode: RepoMode,
    pub retain_commits: Option<usize>,
    pub command_timeout: Option<Duration>,
    pub require_root: bool,
    pub seed_from_published: bool,
    pub tools: Tools,
    pub label: LabelConfig,
    pub tmp_globs: Vec<String>,
    /// user to hand the work directory back to after a privileged run
    pub owner: Option<String>,
}

impl BuildEnvironment {
    /// resolve a config against a base directory
    pub fn resolve(config: &Config, base_dir: &Path, owner: Option<String>) -> Result<Self> {
        validate_name(&config.name)?;

        let absolute = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base_dir.join(p)
            }
        };

        let work_dir = absolute(&config.work_dir);
        let srv_root = absolute(&config.srv_root);
        let owner = owner.filter(|o| !o.is_empty() && config.cleanup.restore_owner);

        Ok(Self {
            name: config.name.clone(),
            base_dir: base_dir.to_path_buf(),
            tree_file: absolute(&config.tree_file()),
            lockfile: config.lockfile().as_deref().map(absolute),
            ref_name: config.ref_name.clone().filter(|r| !r.is_empty()),
            cache_dir: work_dir.join("cache"),
            staging_repo: work_dir.join(&config.name),
            publish_path: srv_root.join(&config.name),
            work_dir,
            srv_root,
            repo_mode: config.repo_mode,
            retain_commits: config.retain_commits,
            command_timeout: config.command_timeout_secs.map(Duration::from_secs),
            require_root: config.require_root,
            seed_from_published: config.seed_from_published,
            tools: config.tools.clone(),
            label: config.label.clone(),
            tmp_globs: config.cleanup.tmp_globs.clone(),
            owner,
        })
    }

    /// advisory lock guarding the publish path
    pub fn lock_path(&self) -> PathBuf {
        self.srv_root.join(format!(".{}.lock", self.name))
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!("invalid repository name: {:?}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults() {
        let env = BuildEnvironment::resolve(&Config::default(), Path::new("/home/me/vauxite"), None)
            .unwrap();

        assert_eq!(env.tree_file, PathBuf::from("/home/me/vauxite/src/vauxite.yaml"));
        assert_eq!(
            env.lockfile,
            Some(PathBuf::from("/home/me/vauxite/src/overrides.yaml"))
        );
        assert_eq!(env.cache_dir, PathBuf::from("/home/me/vauxite/build/cache"));
        assert_eq!(env.staging_repo, PathBuf::from("/home/me/vauxite/build/vauxite"));
        assert_eq!(env.publish_path, PathBuf::from("/srv/ostree/vauxite"));
        assert_eq!(env.lock_path(), PathBuf::from("/srv/ostree/.vauxite.lock"));
        assert!(env.command_timeout.is_none());
    }

    #[test]
    fn test_resolve_lockfile_can_be_turned_off() {
        let config = Config {
            lockfile: Some(PathBuf::new()),
            ..Config::default()
        };
        let env = BuildEnvironment::resolve(&config, Path::new("/b"), None).unwrap();
        assert!(env.lockfile.is_none());

        let config = Config {
            lockfile: Some(PathBuf::from("/etc/treepub/pins.yaml")),
            ..Config::default()
        };
        let env = BuildEnvironment::resolve(&config, Path::new("/b"), None).unwrap();
        assert_eq!(env.lockfile, Some(PathBuf::from("/etc/treepub/pins.yaml")));
    }

    #[test]
    fn test_resolve_owner_respects_restore_flag() {
        let mut config = Config::default();
        let env = BuildEnvironment::resolve(&config, Path::new("/b"), Some("alice".into())).unwrap();
        assert_eq!(env.owner.as_deref(), Some("alice"));

        config.cleanup.restore_owner = false;
        let env = BuildEnvironment::resolve(&config, Path::new("/b"), Some("alice".into())).unwrap();
        assert!(env.owner.is_none());

        config.cleanup.restore_owner = true;
        let env = BuildEnvironment::resolve(&config, Path::new("/b"), Some(String::new())).unwrap();
        assert!(env.owner.is_none());
    }

    #[test]
    fn test_resolve_rejects_bad_names() {
        for name in ["", "../etc", ".hidden", "a/b"] {
            let config = Config {
                name: name.to_string(),
                ..Config::default()
            };
            assert!(
                matches!(
                    BuildEnvironment::resolve(&config, Path::new("/b"), None),
                    Err(Error::InvalidConfig(_))
                ),
                "{name:?} accepted"
            );
        }
    }

    #[test]
    fn test_resolve_empty_ref_is_none() {
        let config = Config {
            ref_name: Some(String::new()),
            ..Config::default()
        };
        let env = BuildEnvironment::resolve(&config, Path::new("/b"), None).unwrap();
        assert!(env.ref_name.is_none());
    }
}
