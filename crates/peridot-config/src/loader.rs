//! Layered configuration loading.
//!
//! A node's effective configuration is the fold of every layer that exists,
//! weakest first:
//!
//! ```text
//! built-in defaults
//!   < ~/.config/peridot/config.toml      (user defaults)
//!   < {node_dir}/peridot.toml            (tracked node config)
//!   < {node_dir}/peridot.local.toml      (gitignored overrides)
//!   < PERIDOT_* environment variables
//! ```
//!
//! Absent layers contribute nothing; the result is path-resolved against
//! the node directory and validated before it is handed out.

use crate::{Paths, PeridotConfig};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Loads a [`PeridotConfig`] by folding the configuration layers.
pub struct ConfigLoader {
    node_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// Loader rooted at the process working directory.
    pub fn new() -> Self {
        Self::rooted_at(env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    /// Loader rooted at an explicit node directory.
    pub fn rooted_at(node_dir: impl AsRef<Path>) -> Self {
        Self {
            node_dir: node_dir.as_ref().to_path_buf(),
            env_prefix: "PERIDOT".to_string(),
        }
    }

    /// Overrides the environment variable prefix.
    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// The TOML layers in ascending precedence, filtered to those present.
    fn toml_layers(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::with_capacity(3);
        if let Ok(user_file) = Paths::new().user_config_file() {
            candidates.push(user_file);
        }
        candidates.push(Paths::node_config_file(&self.node_dir));
        candidates.push(Paths::local_config_file(&self.node_dir));

        candidates.into_iter().filter(|p| p.exists()).collect()
    }

    /// Folds the layers into the effective configuration.
    pub fn load(self) -> Result<PeridotConfig> {
        let defaults =
            config::Config::try_from(&PeridotConfig::default()).context("seeding defaults")?;

        let mut layered = config::Config::builder().add_source(defaults);
        for file in self.toml_layers() {
            layered = layered
                .add_source(config::File::from(file).format(config::FileFormat::Toml));
        }

        // Environment wins over every file layer.
        let environment = config::Environment::with_prefix(&self.env_prefix)
            .separator("_")
            .try_parsing(true);

        let mut loaded: PeridotConfig = layered
            .add_source(environment)
            .build()
            .and_then(config::Config::try_deserialize)
            .with_context(|| {
                format!("loading node configuration from {}", self.node_dir.display())
            })?;

        loaded.resolve_paths(&self.node_dir);
        loaded.validate()?;
        Ok(loaded)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
