//! Configuration management for Peridot
//!
//! A node's settings fold together from layered sources — built-in
//! defaults, the user's config file, the node's tracked and gitignored
//! TOML files, and `PERIDOT_*` environment variables, in that order of
//! increasing precedence (see [`ConfigLoader`]). The merged result is
//! path-resolved against the node directory and validated before use.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use peridot_ra::settings::RaSettings;
use peridot_replication::ReplicatedStoreSettings;
use peridot_store::LocalStoreSettings;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Peridot configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeridotConfig {
    pub node: NodeConfig,
    pub local_store: LocalStoreSettings,
    pub replicated_store: ReplicatedStoreSettings,
    pub ra: RaSettings,
}

/// Identity and placement of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Fabric instance this node belongs to.
    pub instance_name: String,

    pub node_id: u64,

    /// Root under which per-node working directories are derived.
    pub data_root: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance_name: "peridot".to_string(),
            node_id: 0,
            data_root: PathBuf::from(".peridot"),
        }
    }
}

impl PeridotConfig {
    /// Loads configuration from the standard sources.
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Resolves relative paths against `base` and derives the store
    /// directories from the node identity when left at their defaults.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.node.data_root.is_relative() {
            self.node.data_root = base.join(&self.node.data_root);
        }

        let node_working_dir =
            Paths::node_working_dir(&self.node.data_root, &self.node.instance_name, self.node.node_id);

        let defaults = LocalStoreSettings::default();
        if self.local_store.working_directory == defaults.working_directory {
            self.local_store.working_directory = node_working_dir.clone();
        } else if self.local_store.working_directory.is_relative() {
            self.local_store.working_directory = base.join(&self.local_store.working_directory);
        }
        if self.local_store.database_directory == defaults.database_directory {
            self.local_store.database_directory = node_working_dir.join("data");
        } else if self.local_store.database_directory.is_relative() {
            self.local_store.database_directory = base.join(&self.local_store.database_directory);
        }
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replicated_store.transaction_low_watermark
            > self.replicated_store.transaction_high_watermark
        {
            return Err(ConfigError::ValidationError(
                "transaction_low_watermark exceeds transaction_high_watermark".to_string(),
            ));
        }
        if self.ra.fm_message_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "fm_message_batch_size must be positive".to_string(),
            ));
        }
        let thresholds = self.ra.retryable_error_thresholds;
        if !(thresholds.warning <= thresholds.error
            && thresholds.error <= thresholds.restart
            && thresholds.restart <= thresholds.drop)
        {
            return Err(ConfigError::ValidationError(
                "retryable-error thresholds must be ordered warning <= error <= restart <= drop"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        PeridotConfig::default().validate().unwrap();
    }

    #[test]
    fn watermark_inversion_fails_validation() {
        let mut config = PeridotConfig::default();
        config.replicated_store.transaction_low_watermark = 10_000;
        config.replicated_store.transaction_high_watermark = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolve_paths_derives_node_working_dir() {
        let mut config = PeridotConfig::default();
        config.node.instance_name = "prod".to_string();
        config.node.node_id = 42;
        config.resolve_paths(Path::new("/var/fabric"));

        assert!(config.local_store.working_directory.is_absolute());
        assert!(
            config
                .local_store
                .working_directory
                .to_string_lossy()
                .contains("prod-42")
        );
        assert_eq!(
            config.local_store.database_directory,
            config.local_store.working_directory.join("data")
        );
    }
}
