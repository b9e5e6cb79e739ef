//! Builder configuration parsing.
//!
//! ```kdl
//! project "chromium" {
//!     bucket "try" {
//!         builder "linux-rel" {
//!             dimension "os:Linux"
//!             dimension "60:cpu:x86-64"
//!             recipe "chromium" cipd-package="infra/recipe_bundles/chromium" {
//!                 property "mastername:tryserver.chromium.linux"
//!             }
//!             cache "git" path="git" wait-for-warm-cache-secs=120
//!             experiment "kiln.use_realms" 100
//!             build-numbers #true
//!         }
//!     }
//! }
//! ```

use kdl::{KdlDocument, KdlNode};
use kiln_core::BuilderId;
use kiln_core::build::{Executable, Span};
use kiln_core::builder::{BuilderConfig, BuilderEntry, CacheConfig, RecipeConfig};
use std::collections::HashSet;
use std::path::Path;

use crate::nodes::{
    all_string_args, bool_arg, first_string_arg, int_arg, int_prop, required_string_arg,
    string_prop,
};
use crate::{ConfigError, ConfigResult};

/// Parse builder definitions from KDL text.
pub fn parse_builders(kdl: &str) -> ConfigResult<Vec<BuilderEntry>> {
    let doc: KdlDocument = kdl.parse()?;
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    for project in doc.nodes() {
        if project.name().value() != "project" {
            continue;
        }
        let project_name = required_string_arg(project)?;
        for bucket in children(project) {
            if bucket.name().value() != "bucket" {
                continue;
            }
            let bucket_name = required_string_arg(bucket)?;
            for builder in children(bucket) {
                if builder.name().value() != "builder" {
                    continue;
                }
                let config = parse_builder(builder)?;
                let id = BuilderId::new(&project_name, &bucket_name, &config.name);
                id.validate()
                    .map_err(|e| ConfigError::invalid("builder", e.to_string()))?;
                if !seen.insert(id.clone()) {
                    return Err(ConfigError::Duplicate(format!("builder {id}")));
                }
                entries.push(BuilderEntry { id, config });
            }
        }
    }

    Ok(entries)
}

/// Read and parse a builders file.
pub fn load_builders(path: impl AsRef<Path>) -> ConfigResult<Vec<BuilderEntry>> {
    let text = std::fs::read_to_string(path)?;
    parse_builders(&text)
}

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|c| c.nodes().iter())
}

fn parse_builder(node: &KdlNode) -> ConfigResult<BuilderConfig> {
    let mut cfg = BuilderConfig::named(required_string_arg(node)?);

    for child in children(node) {
        match child.name().value() {
            "dimension" => {
                let dim = required_string_arg(child)?;
                validate_config_dimension(&dim)?;
                cfg.dimensions.push(dim);
            }
            "recipe" => cfg.recipe = Some(parse_recipe(child)?),
            "exe" => {
                cfg.exe = Some(Executable {
                    cipd_package: string_prop(child, "cipd-package").unwrap_or_default(),
                    cipd_version: string_prop(child, "cipd-version").unwrap_or_default(),
                    cmd: children(child)
                        .filter(|n| n.name().value() == "cmd")
                        .flat_map(all_string_args)
                        .collect(),
                });
            }
            "properties" => {
                let props = required_string_arg(child)?;
                match serde_json::from_str::<serde_json::Value>(&props) {
                    Ok(serde_json::Value::Object(_)) => cfg.properties = props,
                    _ => {
                        return Err(ConfigError::invalid(
                            "properties",
                            "must be a JSON object",
                        ));
                    }
                }
            }
            "cache" => cfg.caches.push(parse_cache(child)?),
            "experiment" => {
                let name = required_string_arg(child)?;
                let pct: u8 = child
                    .entries()
                    .iter()
                    .filter(|e| e.name().is_none())
                    .nth(1)
                    .and_then(|e| e.value().as_integer())
                    .and_then(|n| u8::try_from(n).ok())
                    .filter(|n| *n <= 100)
                    .ok_or_else(|| {
                        ConfigError::invalid(
                            format!("experiment {name}"),
                            "percentage must be in [0, 100]",
                        )
                    })?;
                cfg.experiments.insert(name, pct);
            }
            "build-numbers" => cfg.build_numbers = bool_arg(child)?,
            "auto-builder-dimension" => cfg.auto_builder_dimension = bool_arg(child)?,
            "execution-timeout-secs" => cfg.execution_timeout_secs = int_arg(child)?,
            "expiration-secs" => cfg.expiration_secs = int_arg(child)?,
            "grace-period-secs" => cfg.grace_period = Some(Span::seconds(int_arg(child)?)),
            "priority" => {
                let priority: u32 = int_arg(child)?;
                if priority > 255 {
                    return Err(ConfigError::invalid("priority", "must be in [0, 255]"));
                }
                cfg.priority = priority;
            }
            "service-account" => cfg.service_account = required_string_arg(child)?,
            "task-host" => cfg.task_host = required_string_arg(child)?,
            "critical" => cfg.critical = Some(bool_arg(child)?),
            "wait-for-capacity" => cfg.wait_for_capacity = bool_arg(child)?,
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(cfg)
}

fn parse_recipe(node: &KdlNode) -> ConfigResult<RecipeConfig> {
    let mut recipe = RecipeConfig {
        name: required_string_arg(node)?,
        cipd_package: string_prop(node, "cipd-package").unwrap_or_default(),
        cipd_version: string_prop(node, "cipd-version").unwrap_or_default(),
        ..Default::default()
    };

    for child in children(node) {
        match child.name().value() {
            "property" => {
                let prop = required_string_arg(child)?;
                if !prop.contains(':') {
                    return Err(ConfigError::invalid("recipe property", "must be key:value"));
                }
                recipe.properties.push(prop);
            }
            "property-j" => {
                let prop = required_string_arg(child)?;
                let (key, json) = prop.split_once(':').ok_or_else(|| {
                    ConfigError::invalid("recipe property-j", "must be key:<json>")
                })?;
                serde_json::from_str::<serde_json::Value>(json).map_err(|e| {
                    ConfigError::invalid(format!("recipe property-j {key}"), e.to_string())
                })?;
                recipe.properties_j.push(prop);
            }
            _ => {}
        }
    }

    Ok(recipe)
}

pub(crate) fn parse_cache(node: &KdlNode) -> ConfigResult<CacheConfig> {
    let name = first_string_arg(node).unwrap_or_default();
    let path = string_prop(node, "path").unwrap_or_else(|| name.clone());
    if path.is_empty() {
        return Err(ConfigError::MissingField("cache path".to_string()));
    }

    Ok(CacheConfig {
        name,
        path,
        wait_for_warm_cache_secs: int_prop(node, "wait-for-warm-cache-secs")?.unwrap_or(0),
        env_var: string_prop(node, "env-var").unwrap_or_default(),
    })
}

/// Checks `key:value` / `expiration:key:value` syntax.
fn validate_config_dimension(dim: &str) -> ConfigResult<()> {
    let (first, rest) = dim
        .split_once(':')
        .ok_or_else(|| ConfigError::invalid(format!("dimension {dim:?}"), "must contain ':'"))?;
    let key = match first.parse::<i64>() {
        Ok(exp) => {
            if exp < 0 || exp % 60 != 0 {
                return Err(ConfigError::invalid(
                    format!("dimension {dim:?}"),
                    "expiration must be a non-negative multiple of 60",
                ));
            }
            rest.split_once(':').map(|(k, _)| k).ok_or_else(|| {
                ConfigError::invalid(format!("dimension {dim:?}"), "missing key")
            })?
        }
        Err(_) => first,
    };
    if key.is_empty() {
        return Err(ConfigError::invalid(format!("dimension {dim:?}"), "missing key"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_builders() {
        let kdl = r#"
            project "chromium" {
                bucket "try" {
                    builder "linux-rel" {
                        dimension "os:Linux"
                        dimension "60:cpu:x86-64"
                        recipe "chromium" cipd-package="infra/recipes/chromium" {
                            property "mastername:tryserver"
                            property-j "targets:[\"all\"]"
                        }
                        cache "git" path="git_cache" wait-for-warm-cache-secs=120
                        experiment "kiln.use_realms" 100
                        build-numbers #true
                        execution-timeout-secs 3600
                        priority 40
                    }
                    builder "mac-rel" {
                        auto-builder-dimension #false
                    }
                }
            }
        "#;

        let builders = parse_builders(kdl).unwrap();
        assert_eq!(builders.len(), 2);

        let linux = &builders[0];
        assert_eq!(linux.id.to_string(), "chromium/try/linux-rel");
        assert_eq!(linux.config.dimensions, vec!["os:Linux", "60:cpu:x86-64"]);
        let recipe = linux.config.recipe.as_ref().unwrap();
        assert_eq!(recipe.name, "chromium");
        assert_eq!(recipe.properties_j, vec![r#"targets:["all"]"#]);
        assert_eq!(linux.config.caches[0].path, "git_cache");
        assert_eq!(linux.config.caches[0].wait_for_warm_cache_secs, 120);
        assert_eq!(linux.config.experiments["kiln.use_realms"], 100);
        assert!(linux.config.build_numbers);
        assert_eq!(linux.config.execution_timeout_secs, 3600);
        assert_eq!(linux.config.priority, 40);

        let mac = &builders[1];
        assert!(!mac.config.auto_builder_dimension);
        assert!(!mac.config.build_numbers);
    }

    #[test]
    fn test_duplicate_builder() {
        let kdl = r#"
            project "p" {
                bucket "b" {
                    builder "x"
                    builder "x"
                }
            }
        "#;
        assert!(matches!(
            parse_builders(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));
    }

    #[test]
    fn test_bad_experiment_percentage() {
        let kdl = r#"
            project "p" {
                bucket "b" {
                    builder "x" {
                        experiment "kiln.agent" 150
                    }
                }
            }
        "#;
        assert!(parse_builders(kdl).is_err());
    }

    #[test]
    fn test_config_dimension_syntax() {
        assert!(validate_config_dimension("os:Linux").is_ok());
        assert!(validate_config_dimension("os:").is_ok());
        assert!(validate_config_dimension("120:os:Linux").is_ok());
        assert!(validate_config_dimension("90:os:Linux").is_err());
        assert!(validate_config_dimension("novalue").is_err());
        assert!(validate_config_dimension(":x").is_err());
    }
}
