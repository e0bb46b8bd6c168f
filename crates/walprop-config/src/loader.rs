//! Configuration loader with multi-source merging

use crate::WalProposerConfig;
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// File picked up from the project directory when no explicit file is given.
pub const DEFAULT_CONFIG_FILE: &str = "walprop.toml";

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    config_file: Option<PathBuf>,
    env_prefix: String,
    /// Replaces the process environment when set.
    env_vars: Option<config::Map<String, String>>,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config_file: None,
            env_prefix: "WALPROP".to_string(),
            env_vars: None,
        }
    }

    /// Set the directory searched for `walprop.toml`
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Use this file instead of `walprop.toml`; it must exist.
    pub fn with_config_file(mut self, path: impl AsRef<Path>) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix (default: "WALPROP")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Read overrides from `vars` instead of the process environment
    pub fn with_env_vars<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Load, merge and validate configuration from all sources
    pub fn load(self) -> Result<WalProposerConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        let defaults = WalProposerConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. Explicit file, or walprop.toml in the project directory
        match &self.config_file {
            Some(path) => {
                builder = builder.add_source(
                    config::File::from(path.clone())
                        .required(true)
                        .format(config::FileFormat::Toml),
                );
            }
            None => {
                let project_file = self.project_dir.join(DEFAULT_CONFIG_FILE);
                if project_file.exists() {
                    builder = builder.add_source(
                        config::File::from(project_file)
                            .required(false)
                            .format(config::FileFormat::Toml),
                    );
                }
            }
        }

        // 3. Environment variables (WALPROP_*). Keys contain underscores, so
        // nesting uses a double underscore:
        // WALPROP_BACKPRESSURE__MAX_REPLICATION_WRITE_LAG_MB.
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .source(self.env_vars.clone()),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let walprop_config: WalProposerConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        walprop_config
            .validate()
            .context("Invalid proposer configuration")?;

        Ok(walprop_config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
