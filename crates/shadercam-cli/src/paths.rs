use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use directories_next::ProjectDirs;

pub const ENV_CONFIG_DIR: &str = "SHADERCAM_CONFIG_DIR";
pub const ENV_CACHE_DIR: &str = "SHADERCAM_CACHE_DIR";

const QUALIFIER: &str = "org";
const ORGANISATION: &str = "ShaderCam";
const APPLICATION: &str = "shadercam";

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    cache_dir: PathBuf,
}

impl AppPaths {
    pub fn discover() -> Result<Self> {
        let project_dirs = ProjectDirs::from(QUALIFIER, ORGANISATION, APPLICATION)
            .ok_or_else(|| anyhow!("failed to determine user directories"))?;

        let config_dir = resolve_dir(ENV_CONFIG_DIR, project_dirs.config_dir())
            .context("failed to resolve shadercam config directory")?;
        let cache_dir = resolve_dir(ENV_CACHE_DIR, project_dirs.cache_dir())
            .context("failed to resolve shadercam cache directory")?;

        Ok(Self {
            config_dir,
            cache_dir,
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// `config.toml` in the config directory, read when no `--config` is given.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Where in-progress recordings live until they are finalized.
    pub fn recording_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("recordings")
    }
}

#[cfg(test)]
impl AppPaths {
    pub fn from_raw(config_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            config_dir,
            cache_dir,
        }
    }
}

/// `shadercam_<date>_<time>.<extension>` inside `dir`.
pub fn timestamped_output(dir: &Path, extension: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("shadercam_{stamp}.{extension}"))
}

fn resolve_dir(env_var: &str, default: &Path) -> Result<PathBuf> {
    if let Some(value) = env_override(env_var) {
        return Ok(value);
    }
    Ok(default.to_path_buf())
}

fn env_override(name: &str) -> Option<PathBuf> {
    match env::var_os(name) {
        Some(value) if !value.as_os_str().is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}
