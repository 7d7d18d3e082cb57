//! Path utilities, XDG discovery and per-node directory derivation.

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// XDG-compliant paths for Peridot
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    /// Create a new Paths instance with XDG discovery
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("dev", "Peridot", "peridot"),
        }
    }

    /// Get user config directory (~/.config/peridot/)
    pub fn user_config_dir(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|p| p.config_dir().to_path_buf())
            .ok_or_else(|| {
                ConfigError::XdgError("Failed to determine user config directory".to_string())
            })
    }

    /// Get user config file path (~/.config/peridot/config.toml)
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.user_config_dir()?.join("config.toml"))
    }

    /// Get node config file path (peridot.toml)
    pub fn node_config_file(node_dir: impl AsRef<Path>) -> PathBuf {
        node_dir.as_ref().join("peridot.toml")
    }

    /// Get local config file path (peridot.local.toml, gitignored)
    pub fn local_config_file(node_dir: impl AsRef<Path>) -> PathBuf {
        node_dir.as_ref().join("peridot.local.toml")
    }

    /// The working directory of one node, derived from the fabric instance
    /// name and the node id.
    pub fn node_working_dir(
        data_root: impl AsRef<Path>,
        instance_name: &str,
        node_id: u64,
    ) -> PathBuf {
        data_root.as_ref().join(format!("{instance_name}-{node_id}"))
    }

    /// Shared transactional log location under the data root.
    pub fn shared_log_dir(data_root: impl AsRef<Path>) -> PathBuf {
        data_root.as_ref().join("shared-log")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
