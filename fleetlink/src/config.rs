//! Engine configuration loaded from TOML.
//!
//! ```toml
//! prefix = "fleet"
//! service = "assoc"
//!
//! [store]
//! batch_get_limit = 100
//! max_transaction_items = 100
//!
//! [retry]
//! max_attempts = 4
//! base_delay_ms = 25
//! max_delay_ms = 1000
//!
//! [relations.device_sim]
//! cardinality = "one_to_one"
//!
//! [redis]
//! url = "${REDIS_URL}"
//! ```

use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    errors::FleetError,
    keys::KeyScheme,
    registry::RelationRegistry,
    runtime::retry::RetryPolicy,
    types::{Cardinality, RelationType},
};

const MIN_TRANSACTION_ITEMS: usize = 17;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub prefix: String,
    pub service: String,
    pub store: StoreSettings,
    pub retry: RetryPolicy,
    /// Per-relation overrides keyed by relation name (`device_sim`, ...).
    pub relations: BTreeMap<String, RelationSettings>,
    pub redis: RedisSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefix: "fleet".to_string(),
            service: "assoc".to_string(),
            store: StoreSettings::default(),
            retry: RetryPolicy::default(),
            relations: BTreeMap::new(),
            redis: RedisSettings::default(),
        }
    }
}

/// Limits of the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Maximum keys per multi-get round trip.
    pub batch_get_limit: usize,
    /// Maximum guards plus written items per transaction.
    pub max_transaction_items: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            batch_get_limit: 100,
            max_transaction_items: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSettings {
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "${REDIS_URL}".to_string(),
        }
    }
}

impl RedisSettings {
    /// The configured URL with a `${VAR}` placeholder expanded from the environment.
    pub fn resolved_url(&self) -> Result<String, FleetError> {
        expand_env(&self.url)
    }
}

fn expand_env(value: &str) -> Result<String, FleetError> {
    match value.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
        Some(var_name) => std::env::var(var_name).map_err(|_| FleetError::Config {
            message: format!("environment variable {var_name} not set"),
        }),
        None => Ok(value.to_string()),
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, FleetError> {
        let config: EngineConfig = toml::from_str(raw).map_err(|err| FleetError::Config {
            message: format!("failed to parse config: {err}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FleetError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| FleetError::Config {
            message: format!("failed to read {}: {err}", path.display()),
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        let config_error = |message: String| Err(FleetError::Config { message });
        if self.prefix.is_empty() || self.prefix.contains(':') {
            return config_error(format!("invalid key prefix `{}`", self.prefix));
        }
        if self.service.is_empty() || self.service.contains(':') {
            return config_error(format!("invalid service name `{}`", self.service));
        }
        if self.store.batch_get_limit == 0 {
            return config_error("store.batch_get_limit must be greater than zero".to_string());
        }
        // The largest plan is a one-to-one link: 6 guards and 11 written items.
        if self.store.max_transaction_items < MIN_TRANSACTION_ITEMS {
            return config_error(format!(
                "store.max_transaction_items must be at least {MIN_TRANSACTION_ITEMS}, got {}",
                self.store.max_transaction_items
            ));
        }
        if self.retry.max_attempts == 0 {
            return config_error("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return config_error("retry.base_delay_ms exceeds retry.max_delay_ms".to_string());
        }
        self.relation_registry().map(|_| ())
    }

    pub fn key_scheme(&self) -> KeyScheme {
        KeyScheme::new(&self.prefix, &self.service)
    }

    /// Default cardinalities with the configured overrides applied.
    pub fn relation_registry(&self) -> Result<RelationRegistry, FleetError> {
        let mut registry = RelationRegistry::default();
        for (name, settings) in &self.relations {
            let relation: RelationType = name.parse().map_err(|_| FleetError::Config {
                message: format!("unknown relation `{name}` in [relations]"),
            })?;
            registry.set(relation, settings.cardinality);
        }
        Ok(registry)
    }
}
