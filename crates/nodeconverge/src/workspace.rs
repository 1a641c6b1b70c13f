use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_root_dir() -> String {
    ".".into()
}

fn default_cache_dir() -> String {
    "cache".into()
}

fn default_work_dir() -> String {
    "work".into()
}

fn default_system_root() -> String {
    "/".into()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    Cache,
    Work,
    All,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    /// Filesystem root that tasks converge; "/" on a real node.
    #[serde(default = "default_system_root")]
    pub system_root: String,
    #[serde(default)]
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            cache_dir: default_cache_dir(),
            work_dir: default_work_dir(),
            system_root: default_system_root(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub cache_dir: PathBuf,
    pub work_dir: PathBuf,
    pub system_root: PathBuf,
}

impl WorkspacePaths {
    /// Maps an absolute path on the converged machine to a path under `system_root`.
    pub fn system_path(&self, abs: &str) -> Result<PathBuf> {
        let abs = abs.trim();
        if !abs.starts_with('/') {
            return Err(Error::msg(format!("expected absolute path, got '{abs}'")));
        }
        let rel = abs.trim_start_matches('/');
        reject_parent_dirs(rel)?;
        if rel.is_empty() {
            return Ok(self.system_root.clone());
        }
        Ok(self.system_root.join(rel))
    }

    pub fn resolve_under_work(&self, rel: &str) -> Result<PathBuf> {
        let rel = rel.trim();
        if rel.is_empty() {
            return Err(Error::msg("empty relative path"));
        }
        reject_parent_dirs(rel)?;
        let pb = PathBuf::from(rel);
        Ok(if pb.is_absolute() {
            pb
        } else {
            self.work_dir.join(pb)
        })
    }
}

/// Resolves paths relative to `base`, normally the directory holding the run file.
pub fn load_paths(cfg: &WorkspaceConfig, base: &Path) -> Result<WorkspacePaths> {
    let root = resolve_user_path(base, &cfg.root_dir)?;
    let cache_dir = resolve_user_dir(&root, &cfg.cache_dir)?;
    let work_dir = resolve_user_dir(&root, &cfg.work_dir)?;
    let system_root = resolve_user_path(&root, &cfg.system_root)?;
    Ok(WorkspacePaths {
        root,
        cache_dir,
        work_dir,
        system_root,
    })
}

pub fn init_dirs(cfg: &WorkspaceConfig, base: &Path) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg, base)?;

    match cfg.clean {
        CleanMode::None => {}
        CleanMode::Cache => safe_remove_dir_all(&paths.root, &paths.cache_dir)?,
        CleanMode::Work => safe_remove_dir_all(&paths.root, &paths.work_dir)?,
        CleanMode::All => {
            safe_remove_dir_all(&paths.root, &paths.cache_dir)?;
            safe_remove_dir_all(&paths.root, &paths.work_dir)?;
        }
    }

    for dir in [&paths.cache_dir, &paths.work_dir] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    }
    Ok(paths)
}

fn reject_parent_dirs(p: &str) -> Result<()> {
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::msg(format!("path '{p}' contains '..'")));
    }
    Ok(())
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace dir"));
    }
    reject_parent_dirs(p).map_err(|e| Error::config(format!("workspace dir: {e}")))?;
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { root.join(pb) })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (outside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))
}
