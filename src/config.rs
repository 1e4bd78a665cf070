use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::aggregator::AggregatorConfig;
use crate::descriptor::Descriptor;
use crate::engine::MessageDrivenConfig;
use crate::resource::ResourceKind;

/// Top-level configuration for the aggregation agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identifies this node in logs. Default: "local".
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Whether this node is the active node of the cluster. Periodic
    /// aggregator notifications are only emitted on the active node.
    /// Default: true.
    #[serde(default = "default_true")]
    pub active_node: bool,

    /// How often per-resource statistics are drained into the health
    /// metrics. Default: 10s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Attribute viewer API configuration.
    #[serde(default)]
    pub api: ApiConfig,

    /// Static foreign sources: source name to attribute values. Nested
    /// maps become composite values.
    #[serde(default)]
    pub sources: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,

    /// Resources hosted by this node.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Attribute viewer API configuration.
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_api_addr")]
    pub addr: String,
}

/// One hosted resource.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ResourceKind,

    /// Resource-level parameters (frequencies, parser, pool size).
    #[serde(default)]
    pub parameters: Descriptor,

    /// Attribute id to declaration.
    #[serde(default)]
    pub attributes: BTreeMap<String, Descriptor>,

    /// Event id to declaration. Aggregators only.
    #[serde(default)]
    pub events: BTreeMap<String, Descriptor>,
}

// --- Default functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_node_id() -> String {
    "local".to_string()
}

fn default_true() -> bool {
    true
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_api_addr() -> String {
    ":8080".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            node_id: default_node_id(),
            active_node: true,
            stats_interval: default_stats_interval(),
            health: HealthConfig::default(),
            api: ApiConfig::default(),
            sources: BTreeMap::new(),
            resources: Vec::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: default_api_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    ///
    /// Attribute and event declarations are not checked here: a bad
    /// declaration only keeps that attribute from going live.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            bail!("node_id must not be empty");
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        if self.health.addr.is_empty() {
            bail!("health.addr is required");
        }

        if self.api.addr.is_empty() {
            bail!("api.addr is required");
        }

        for name in self.sources.keys() {
            if name.is_empty() {
                bail!("sources: source name must not be empty");
            }
        }

        let mut names = HashSet::new();
        for (i, resource) in self.resources.iter().enumerate() {
            if resource.name.is_empty() {
                bail!("resources[{i}].name is required");
            }
            if !names.insert(resource.name.as_str()) {
                bail!("resources[{i}].name {:?} is duplicated", resource.name);
            }
            if self.sources.contains_key(&resource.name) {
                bail!(
                    "resources[{i}].name {:?} collides with a source of the same name",
                    resource.name
                );
            }

            match resource.kind {
                ResourceKind::Aggregator => {
                    AggregatorConfig::from_descriptor(&resource.parameters)
                        .with_context(|| format!("resources[{i}] ({})", resource.name))?;
                }
                ResourceKind::MessageDriven => {
                    MessageDrivenConfig::from_descriptor(&resource.name, &resource.parameters)
                        .with_context(|| format!("resources[{i}] ({})", resource.name))?;
                    if !resource.events.is_empty() {
                        bail!(
                            "resources[{i}].events: only aggregator resources declare events"
                        );
                    }
                }
            }
        }

        Ok(())
    }
}
