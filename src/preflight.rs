//! checks that run before anything is touched
//!
//! every check here is read-only; a failure stops the run before a single
//! directory is created.

use std::fs;
use std::path::{Path, PathBuf};

use crate::env::BuildEnvironment;
use crate::error::{Error, Result};

/// fail unless running as root, when root is required
pub fn check_privileges(require_root: bool) -> Result<()> {
    if require_root && !nix::unistd::geteuid().is_root() {
        return Err(Error::NotPrivileged("treepub".to_string()));
    }
    Ok(())
}

/// resolve a tool by name or path
pub fn find_tool(tool: &str) -> Result<PathBuf> {
    which::which(tool).map_err(|_| Error::ToolNotFound(tool.to_string()))
}

/// check that specific tools are available
///
/// each tuple is (command, package)
pub fn check_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| find_tool(tool).is_err())
        .map(|(tool, package)| format!("{} (install: {})", tool, package))
        .collect();

    if !missing.is_empty() {
        return Err(Error::PrerequisiteMissing(format!(
            "missing required tools: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// the tree definition must exist and have content
pub fn check_inputs(tree_file: &Path) -> Result<()> {
    match fs::metadata(tree_file) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        _ => Err(Error::MissingInput(tree_file.to_path_buf())),
    }
}

/// every check for one run
pub fn run(env: &BuildEnvironment, labels_enabled: bool) -> Result<()> {
    check_privileges(env.require_root)?;

    let mut tools = vec![
        (env.tools.ostree.as_str(), "ostree"),
        (env.tools.rpm_ostree.as_str(), "rpm-ostree"),
    ];
    if labels_enabled {
        tools.push((env.tools.chcon.as_str(), "coreutils"));
    }
    check_tools(&tools)?;

    check_inputs(&env.tree_file)?;

    if let Some(lockfile) = &env.lockfile {
        if crate::repo::lockfile_overlay(Some(lockfile.as_path())).is_none() {
            tracing::debug!(path = %lockfile.display(), "no lockfile overlay");
        }
    }

    tracing::info!("preflight checks passed");
    Ok(())
}
