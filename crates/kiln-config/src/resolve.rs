//! Merges a builder's static configuration with a schedule request.
//!
//! [`resolve`] is pure: given the same inputs and the same random draws it
//! produces the same [`ResolvedBuild`].

use chrono::{DateTime, Utc};
use kiln_core::build::{
    BuildInfra, BuildInput, CacheEntry, Executable, LogsInfra, Notification, RecipeInfra,
    RequestedDimension, RequestedInfra, ResultStoreInfra, Span, StringPair, TaskInfra,
};
use kiln_core::builder::{BuilderConfig, BuilderEntry, CacheConfig, Settings};
use kiln_core::experiments::{self, AGENT, CANARY_SOFTWARE, NON_PRODUCTION};
use kiln_core::request::ScheduleBuildRequest;
use kiln_core::{Build, BuildId, BuilderId, Error, Result, Status};
use rand::Rng;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

pub const DEFAULT_EXECUTION_TIMEOUT: Span = Span::hours(3);
pub const DEFAULT_GRACE_PERIOD: Span = Span::seconds(30);
pub const DEFAULT_SCHEDULING_TIMEOUT: Span = Span::hours(6);

const DEFAULT_PRIORITY: u32 = 30;
const NON_PRODUCTION_PRIORITY: u32 = 255;
const DEFAULT_CIPD_VERSION: &str = "refs/heads/main";
const MAX_DIMENSION_EXPIRATIONS: usize = 6;
const BUILDER_CACHE_PATH: &str = "builder";
const BUILDER_CACHE_WAIT: Span = Span::minutes(4);

/// A build with every configurable field filled in, waiting for an id.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBuild {
    pub builder: BuilderId,
    pub exe: Executable,
    pub infra: BuildInfra,
    pub input: BuildInput,
    pub tags: Vec<StringPair>,
    pub experiments: Vec<String>,
    pub canary: bool,
    pub critical: Option<bool>,
    pub wait_for_capacity: bool,
    pub execution_timeout: Span,
    pub grace_period: Span,
    pub scheduling_timeout: Span,
    pub notify: Option<Notification>,
    /// Whether the builder hands out build numbers.
    pub build_numbers: bool,
}

impl ResolvedBuild {
    /// Turns the resolved build into a SCHEDULED build.
    ///
    /// The logs prefix is completed with the build id.
    pub fn into_build(self, id: BuildId, created_by: &str, now: DateTime<Utc>) -> Build {
        let mut infra = self.infra;
        infra.logs.prefix = format!("{}/{}", infra.logs.prefix, id);
        Build {
            id,
            builder: self.builder,
            number: None,
            created_by: created_by.to_string(),
            create_time: now,
            update_time: now,
            start_time: None,
            end_time: None,
            status: Status::Scheduled,
            status_changed_time: now,
            summary_markdown: String::new(),
            canary: self.canary,
            critical: self.critical,
            wait_for_capacity: self.wait_for_capacity,
            exe: self.exe,
            infra,
            input: self.input,
            tags: self.tags,
            experiments: self.experiments,
            execution_timeout: self.execution_timeout,
            grace_period: self.grace_period,
            scheduling_timeout: self.scheduling_timeout,
            notify: self.notify,
        }
    }
}

/// Resolves `req` against the builder's configuration.
///
/// `req` must already be validated and have its legacy flags normalized.
pub fn resolve<R: Rng>(
    req: &ScheduleBuildRequest,
    entry: &BuilderEntry,
    settings: &Settings,
    rng: &mut R,
) -> Result<ResolvedBuild> {
    let cfg = &entry.config;
    let builder = entry.id.clone();

    let experiments = resolve_experiments(req, cfg, rng);
    let enabled = |name: &str| experiments.get(name).copied().unwrap_or(false);

    let dimensions = resolve_dimensions(req, cfg)?;
    let caches = resolve_caches(&builder, cfg, settings);
    let exe = resolve_exe(req, cfg, enabled(AGENT));
    let properties = resolve_properties(req, cfg)?;
    let (execution_timeout, grace_period, scheduling_timeout) = resolve_timeouts(req, cfg)?;

    let priority = if req.priority > 0 {
        req.priority
    } else if enabled(NON_PRODUCTION) {
        NON_PRODUCTION_PRIORITY
    } else if cfg.priority > 0 {
        cfg.priority
    } else {
        DEFAULT_PRIORITY
    };

    let infra = BuildInfra {
        requested: RequestedInfra {
            dimensions: req.dimensions.clone(),
            properties: req.properties.clone().unwrap_or_default(),
        },
        logs: LogsInfra {
            hostname: settings.logs_hostname.clone(),
            project: builder.project.clone(),
            prefix: format!("kiln/{}", settings.app_id),
        },
        result_store: ResultStoreInfra {
            hostname: settings.result_store_hostname.clone(),
            invocation: String::new(),
        },
        recipe: cfg
            .recipe
            .as_ref()
            .map(|r| RecipeInfra {
                cipd_package: r.cipd_package.clone(),
                name: r.name.clone(),
            })
            .unwrap_or_default(),
        task: TaskInfra {
            hostname: cfg.task_host.clone(),
            priority,
            service_account: cfg.service_account.clone(),
            parent_run_id: req.parent_run_id.clone(),
            dimensions,
            caches,
        },
    };

    let input = BuildInput {
        properties,
        gitiles_commit: req.gitiles_commit.clone(),
        gerrit_changes: req.gerrit_changes.clone(),
        experimental: enabled(NON_PRODUCTION),
        experiments: experiments
            .iter()
            .filter(|(_, on)| **on)
            .map(|(name, _)| name.clone())
            .collect(),
    };

    let build_experiments = experiments
        .iter()
        .filter(|(name, on)| **on || name.as_str() != NON_PRODUCTION)
        .map(|(name, on)| format!("{}{name}", if *on { '+' } else { '-' }))
        .collect();

    Ok(ResolvedBuild {
        tags: resolve_tags(req, &builder),
        builder,
        exe,
        infra,
        input,
        experiments: build_experiments,
        canary: enabled(CANARY_SOFTWARE),
        critical: req.critical.or(cfg.critical),
        wait_for_capacity: cfg.wait_for_capacity,
        execution_timeout,
        grace_period,
        scheduling_timeout,
        notify: req.notify.clone(),
        build_numbers: cfg.build_numbers,
    })
}

/// Splits a config dimension into `(expiration, key, value)`.
fn parse_config_dimension(dim: &str) -> Result<(Option<Span>, &str, &str)> {
    let (first, rest) = dim
        .split_once(':')
        .ok_or_else(|| Error::invalid(format!("builder dimension {dim:?}: missing ':'")))?;
    if let Ok(secs) = first.parse::<i64>() {
        let (key, value) = rest.split_once(':').ok_or_else(|| {
            Error::invalid(format!("builder dimension {dim:?}: missing key"))
        })?;
        let expiration = (secs > 0).then_some(Span::seconds(secs));
        return Ok((expiration, key, value));
    }
    Ok((None, first, rest))
}

fn resolve_dimensions(
    req: &ScheduleBuildRequest,
    cfg: &BuilderConfig,
) -> Result<Vec<RequestedDimension>> {
    let mut builder_seen = false;
    let mut config_dims = Vec::with_capacity(cfg.dimensions.len());
    for dim in &cfg.dimensions {
        let (expiration, key, value) = parse_config_dimension(dim)?;
        builder_seen |= key == "builder";
        if value.is_empty() {
            continue;
        }
        config_dims.push(RequestedDimension {
            key: key.to_string(),
            value: value.to_string(),
            expiration,
        });
    }

    // A request dimension replaces every config dimension with that key.
    let request_keys: HashSet<&str> = req.dimensions.iter().map(|d| d.key.as_str()).collect();
    builder_seen |= request_keys.contains("builder");

    let mut dims: Vec<RequestedDimension> = config_dims
        .into_iter()
        .filter(|d| !request_keys.contains(d.key.as_str()))
        .chain(req.dimensions.iter().cloned())
        .collect();

    if !builder_seen && cfg.auto_builder_dimension {
        dims.push(RequestedDimension::new("builder", &cfg.name));
    }

    dims.sort_by(|a, b| {
        a.key
            .cmp(&b.key)
            .then(a.expiration_secs().cmp(&b.expiration_secs()))
    });

    let expirations: HashSet<i64> = dims.iter().map(RequestedDimension::expiration_secs).collect();
    if expirations.len() > MAX_DIMENSION_EXPIRATIONS {
        return Err(Error::invalid(format!(
            "dimensions: at most {MAX_DIMENSION_EXPIRATIONS} distinct expirations are allowed, got {}",
            expirations.len()
        )));
    }

    Ok(dims)
}

fn cache_entry(cache: &CacheConfig) -> CacheEntry {
    CacheEntry {
        name: if cache.name.is_empty() {
            cache.path.clone()
        } else {
            cache.name.clone()
        },
        path: cache.path.clone(),
        wait_for_warm_cache: (cache.wait_for_warm_cache_secs > 0)
            .then(|| Span::seconds(i64::from(cache.wait_for_warm_cache_secs))),
        env_var: cache.env_var.clone(),
    }
}

/// Name of the cache mounted at `builder` when the config declares none.
pub fn builder_cache_name(builder: &BuilderId) -> String {
    let digest = Sha256::digest(builder.to_string().as_bytes());
    format!("builder_{}_v2", hex::encode(digest))
}

fn resolve_caches(builder: &BuilderId, cfg: &BuilderConfig, settings: &Settings) -> Vec<CacheEntry> {
    let mut caches: Vec<CacheEntry> = cfg.caches.iter().map(cache_entry).collect();
    // Globals only yield to the builder's own caches, never to each other.
    let names: HashSet<String> = caches.iter().map(|c| c.name.clone()).collect();
    let paths: HashSet<String> = caches.iter().map(|c| c.path.clone()).collect();

    caches.extend(
        settings
            .global_caches
            .iter()
            .map(cache_entry)
            .filter(|g| !names.contains(&g.name) && !paths.contains(&g.path)),
    );

    if !paths.contains(BUILDER_CACHE_PATH) {
        caches.push(CacheEntry {
            name: builder_cache_name(builder),
            path: BUILDER_CACHE_PATH.to_string(),
            wait_for_warm_cache: Some(BUILDER_CACHE_WAIT),
            env_var: String::new(),
        });
    }

    caches.sort_by(|a, b| a.path.cmp(&b.path));
    caches
}

fn resolve_experiments<R: Rng>(
    req: &ScheduleBuildRequest,
    cfg: &BuilderConfig,
    rng: &mut R,
) -> BTreeMap<String, bool> {
    let mut exps = BTreeMap::new();
    // One draw per configured experiment, in name order.
    for (name, pct) in &cfg.experiments {
        let on = rng.gen_range(0..100u8) < *pct;
        exps.insert(name.clone(), on);
    }
    for (name, on) in &req.experiments {
        exps.insert(name.clone(), *on);
    }
    for name in experiments::WELL_KNOWN {
        exps.entry((*name).to_string()).or_insert(false);
    }
    exps
}

fn resolve_exe(req: &ScheduleBuildRequest, cfg: &BuilderConfig, agent: bool) -> Executable {
    let mut exe = match (&cfg.exe, &cfg.recipe) {
        (Some(exe), _) => exe.clone(),
        (None, Some(recipe)) => Executable {
            cipd_package: recipe.cipd_package.clone(),
            cipd_version: recipe.cipd_version.clone(),
            cmd: Vec::new(),
        },
        (None, None) => Executable::default(),
    };

    if exe.cipd_version.is_empty() && !exe.cipd_package.is_empty() {
        exe.cipd_version = DEFAULT_CIPD_VERSION.to_string();
    }
    if let Some(version) = req.exe.as_ref().map(|e| &e.cipd_version) {
        if !version.is_empty() {
            exe.cipd_version = version.clone();
        }
    }
    if exe.cmd.is_empty() {
        exe.cmd = vec![if agent { "kilnexe" } else { "recipes" }.to_string()];
    }
    exe
}

fn resolve_properties(
    req: &ScheduleBuildRequest,
    cfg: &BuilderConfig,
) -> Result<Map<String, Value>> {
    let mut props = Map::new();

    if let Some(recipe) = &cfg.recipe {
        for prop in &recipe.properties {
            if let Some((key, value)) = prop.split_once(':') {
                props.insert(key.to_string(), Value::String(value.to_string()));
            }
        }
        for prop in &recipe.properties_j {
            if let Some((key, json)) = prop.split_once(':') {
                let value = serde_json::from_str(json).map_err(|e| {
                    Error::invalid(format!("builder property {key:?}: {e}"))
                })?;
                props.insert(key.to_string(), value);
            }
        }
        props.insert("recipe".to_string(), Value::String(recipe.name.clone()));
    } else if !cfg.properties.is_empty() {
        match serde_json::from_str(&cfg.properties) {
            Ok(Value::Object(map)) => props = map,
            _ => {
                return Err(Error::invalid(format!(
                    "builder {}: properties must be a JSON object",
                    cfg.name
                )));
            }
        }
    }

    if let Some(overrides) = &req.properties {
        for (key, value) in overrides {
            props.insert(key.clone(), value.clone());
        }
    }
    Ok(props)
}

fn resolve_timeouts(req: &ScheduleBuildRequest, cfg: &BuilderConfig) -> Result<(Span, Span, Span)> {
    let execution = req.execution_timeout.unwrap_or_else(|| {
        if cfg.execution_timeout_secs > 0 {
            Span::seconds(i64::from(cfg.execution_timeout_secs))
        } else {
            DEFAULT_EXECUTION_TIMEOUT
        }
    });

    let grace = match (req.grace_period, cfg.grace_period) {
        (Some(span), _) => {
            span.validate_minutes()
                .map_err(|e| e.annotate("grace_period"))?;
            span
        }
        (None, Some(span)) => {
            span.validate_minutes()
                .map_err(|e| e.annotate(format!("builder {} grace_period", cfg.name)))?;
            span
        }
        (None, None) => DEFAULT_GRACE_PERIOD,
    };

    let scheduling = req.scheduling_timeout.unwrap_or_else(|| {
        if cfg.expiration_secs > 0 {
            Span::seconds(i64::from(cfg.expiration_secs))
        } else {
            DEFAULT_SCHEDULING_TIMEOUT
        }
    });

    Ok((execution, grace, scheduling))
}

fn resolve_tags(req: &ScheduleBuildRequest, builder: &BuilderId) -> Vec<StringPair> {
    let mut tags = req.tags.clone();
    tags.push(StringPair::new("builder", &builder.builder));
    if let Some(commit) = &req.gitiles_commit {
        if let Some(buildset) = commit.buildset() {
            tags.push(StringPair::new("buildset", buildset));
        }
        if !commit.ref_name.is_empty() {
            tags.push(StringPair::new("gitiles_ref", &commit.ref_name));
        }
    }
    for change in &req.gerrit_changes {
        tags.push(StringPair::new("buildset", change.buildset()));
    }
    tags.sort();
    tags.dedup();
    tags
}
