//! Static builder configuration and service-wide settings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::build::{Executable, Span};
use crate::id::BuilderId;

/// Recipe a builder runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipeConfig {
    pub name: String,
    pub cipd_package: String,
    pub cipd_version: String,
    /// `key:value` string properties.
    pub properties: Vec<String>,
    /// `key:<json>` properties.
    pub properties_j: Vec<String>,
}

/// A cache declared in builder or global configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Defaults to `path` when empty.
    pub name: String,
    pub path: String,
    pub wait_for_warm_cache_secs: u32,
    pub env_var: String,
}

/// Per-builder defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub name: String,
    /// `key:value` or `expiration_secs:key:value`. An empty value removes
    /// the dimension.
    pub dimensions: Vec<String>,
    pub recipe: Option<RecipeConfig>,
    pub exe: Option<Executable>,
    /// JSON object, used when there is no recipe.
    pub properties: String,
    pub caches: Vec<CacheConfig>,
    /// Experiment name to percentage of builds that get it (0..=100).
    pub experiments: BTreeMap<String, u8>,
    pub build_numbers: bool,
    pub auto_builder_dimension: bool,
    pub execution_timeout_secs: u32,
    pub expiration_secs: u32,
    pub grace_period: Option<Span>,
    pub priority: u32,
    pub service_account: String,
    pub task_host: String,
    pub critical: Option<bool>,
    pub wait_for_capacity: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            dimensions: Vec::new(),
            recipe: None,
            exe: None,
            properties: String::new(),
            caches: Vec::new(),
            experiments: BTreeMap::new(),
            build_numbers: false,
            auto_builder_dimension: true,
            execution_timeout_secs: 0,
            expiration_secs: 0,
            grace_period: None,
            priority: 0,
            service_account: String::new(),
            task_host: String::new(),
            critical: None,
            wait_for_capacity: false,
        }
    }
}

impl BuilderConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A builder config together with the bucket it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderEntry {
    pub id: BuilderId,
    pub config: BuilderConfig,
}

/// Service-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Used in log prefixes.
    pub app_id: String,
    pub logs_hostname: String,
    /// Empty disables result-store invocations.
    pub result_store_hostname: String,
    pub global_caches: Vec<CacheConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_id: "kiln".to_string(),
            logs_hostname: String::new(),
            result_store_hostname: String::new(),
            global_caches: Vec::new(),
        }
    }
}
