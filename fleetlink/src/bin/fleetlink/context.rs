use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fleetlink::{AssociationEngine, EngineConfig, RedisStore};

/// Config file looked up in the working directory when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "fleetlink.toml";

/// Loaded configuration for one CLI invocation
pub struct CliContext {
    /// Where the configuration came from, if a file was used
    pub config_path: Option<PathBuf>,
    pub config: EngineConfig,
}

impl CliContext {
    /// Load from an explicit path, else `./fleetlink.toml` when present, else defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let candidate = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.exists().then_some(default)
            }
        };

        let config = match &candidate {
            Some(path) => EngineConfig::from_path(path).with_context(|| format!("Failed to load {}", path.display()))?,
            None => EngineConfig::default(),
        };

        Ok(Self {
            config_path: candidate,
            config,
        })
    }

    /// Get the Redis URL, expanding environment variables
    pub fn redis_url(&self) -> Result<String> {
        self.config
            .redis
            .resolved_url()
            .context("Set REDIS_URL or configure [redis] url")
    }

    pub async fn engine(&self) -> Result<AssociationEngine<RedisStore>> {
        let url = self.redis_url()?;
        log::debug!("connecting to {url}");
        let store = RedisStore::connect(&url)
            .await
            .with_context(|| format!("Failed to connect to Redis at {url}"))?;
        AssociationEngine::new(store, &self.config).context("Invalid engine configuration")
    }
}
