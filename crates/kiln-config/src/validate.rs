//! Schedule request validation.
//!
//! Everything here runs before the scheduler performs any side effect.

use kiln_core::build::{GerritChange, GitilesCommit, RequestedDimension, Span};
use kiln_core::experiments::{self, CANARY_SOFTWARE, NON_PRODUCTION, RESERVED_PREFIX};
use kiln_core::request::{MAX_REQUEST_ID_LEN, ScheduleBuildRequest};
use kiln_core::{BuilderId, Error, Result};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static EXPERIMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*(?:\.[a-z][a-z0-9_]*)*$").unwrap());

/// Top-level input properties owned by the server.
const PROHIBITED_PROPERTIES: &[&str] = &[
    "$recipe_engine/kiln",
    "buildbucket",
    "buildername",
    "branch",
    "repository",
];

/// Tag keys clients may not set.
const RESERVED_TAG_KEYS: &[&str] = &["build_address"];

const MAX_USER_DATA_LEN: usize = 4096;
const MAX_PRIORITY: u32 = 255;

/// Folds the legacy `canary`/`experimental` flags into `experiments`.
///
/// An explicit experiment entry wins over the legacy flag.
pub fn normalize_legacy(req: &mut ScheduleBuildRequest) {
    if let Some(canary) = req.canary.take() {
        req.experiments
            .entry(CANARY_SOFTWARE.to_string())
            .or_insert(canary);
    }
    if let Some(experimental) = req.experimental.take() {
        req.experiments
            .entry(NON_PRODUCTION.to_string())
            .or_insert(experimental);
    }
}

/// Validates every request, then rejects duplicate `(builder, request_id)`
/// pairs within the batch.
pub fn validate_batch(reqs: &[ScheduleBuildRequest]) -> Result<()> {
    for (i, req) in reqs.iter().enumerate() {
        validate_request(req).map_err(|e| e.annotate(format!("requests[{i}]")))?;
    }

    let mut seen: HashSet<(&BuilderId, &str)> = HashSet::new();
    for (i, req) in reqs.iter().enumerate() {
        let Some(builder) = req.builder.as_ref() else {
            continue;
        };
        if req.request_id.is_empty() {
            continue;
        }
        if !seen.insert((builder, req.request_id.as_str())) {
            return Err(Error::invalid(format!(
                "requests[{i}]: duplicate request_id {:?} for builder {builder}",
                req.request_id
            )));
        }
    }
    Ok(())
}

pub fn validate_request(req: &ScheduleBuildRequest) -> Result<()> {
    if req.request_id.contains('/') {
        return Err(Error::invalid("request_id: must not contain /"));
    }
    if req.request_id.len() > MAX_REQUEST_ID_LEN {
        return Err(Error::invalid(format!(
            "request_id: must be at most {MAX_REQUEST_ID_LEN} bytes"
        )));
    }

    match (&req.builder, req.template_build_id) {
        (None, None) => {
            return Err(Error::invalid(
                "builder or template_build_id is required",
            ));
        }
        (Some(builder), _) => builder.validate().map_err(|e| e.annotate("builder"))?,
        (None, Some(_)) => {}
    }

    for (i, dim) in req.dimensions.iter().enumerate() {
        validate_dimension(dim).map_err(|e| e.annotate(format!("dimensions[{i}]")))?;
    }

    if let Some(exe) = &req.exe {
        if !exe.cipd_package.is_empty() {
            return Err(Error::invalid("exe.cipd_package: not supported"));
        }
        if !exe.cmd.is_empty() {
            return Err(Error::invalid("exe.cmd: not supported"));
        }
    }

    if let Some(commit) = &req.gitiles_commit {
        validate_commit(commit).map_err(|e| e.annotate("gitiles_commit"))?;
    }
    for (i, change) in req.gerrit_changes.iter().enumerate() {
        validate_change(change).map_err(|e| e.annotate(format!("gerrit_changes[{i}]")))?;
    }

    if let Some(notify) = &req.notify {
        if notify.pubsub_topic.is_empty() {
            return Err(Error::invalid("notify.pubsub_topic: required"));
        }
        if notify.user_data.len() > MAX_USER_DATA_LEN {
            return Err(Error::invalid(format!(
                "notify.user_data: must be at most {MAX_USER_DATA_LEN} bytes"
            )));
        }
    }

    if req.priority > MAX_PRIORITY {
        return Err(Error::invalid(format!(
            "priority: must be in [0, {MAX_PRIORITY}]"
        )));
    }

    if let Some(props) = &req.properties {
        for key in PROHIBITED_PROPERTIES {
            if props.contains_key(*key) {
                return Err(Error::invalid(format!(
                    "properties: {key:?} must not be specified"
                )));
            }
        }
    }

    for name in req.experiments.keys() {
        validate_experiment_name(name).map_err(|e| e.annotate("experiments"))?;
    }

    for tag in &req.tags {
        if tag.key.is_empty() || tag.key.contains(':') {
            return Err(Error::invalid(format!(
                "tags: {tag} must be in key:value form"
            )));
        }
        if RESERVED_TAG_KEYS.contains(&tag.key.as_str()) {
            return Err(Error::invalid(format!("tags: {:?} is reserved", tag.key)));
        }
        if tag.key == "builder" {
            if let Some(builder) = &req.builder {
                if tag.value != builder.builder {
                    return Err(Error::invalid(format!(
                        "tags: builder tag {:?} does not match builder {:?}",
                        tag.value, builder.builder
                    )));
                }
            }
        }
    }

    for (field, span) in [
        ("execution_timeout", req.execution_timeout),
        ("scheduling_timeout", req.scheduling_timeout),
    ] {
        if let Some(span) = span {
            if span.seconds < 0 || span.nanos < 0 {
                return Err(Error::invalid(format!("{field}: must not be negative")));
            }
        }
    }

    if let Some(mask) = &req.fields {
        mask.validate().map_err(|e| e.annotate("fields"))?;
    }

    Ok(())
}

fn validate_dimension(dim: &RequestedDimension) -> Result<()> {
    if dim.key.is_empty() {
        return Err(Error::invalid("key: required"));
    }
    if dim.value.is_empty() {
        return Err(Error::invalid("value: required"));
    }
    match dim.key.as_str() {
        "caches" => {
            return Err(Error::invalid(
                "caches may only be specified in builder configs",
            ));
        }
        "pool" => {
            return Err(Error::invalid(
                "pool may only be specified in builder configs",
            ));
        }
        _ => {}
    }
    if let Some(exp) = dim.expiration {
        validate_expiration(exp).map_err(|e| e.annotate("expiration"))?;
    }
    Ok(())
}

fn validate_expiration(exp: Span) -> Result<()> {
    exp.validate_minutes()
}

fn validate_commit(commit: &GitilesCommit) -> Result<()> {
    if commit.host.is_empty() {
        return Err(Error::invalid("host: required"));
    }
    if commit.project.is_empty() {
        return Err(Error::invalid("project: required"));
    }
    if commit.id.is_empty() && commit.ref_name.is_empty() {
        return Err(Error::invalid("one of id or ref is required"));
    }
    if !commit.ref_name.is_empty() && !commit.ref_name.starts_with("refs/") {
        return Err(Error::invalid("ref: must start with \"refs/\""));
    }
    if !commit.id.is_empty()
        && (commit.id.len() != 40 || !commit.id.bytes().all(|b| b.is_ascii_hexdigit()))
    {
        return Err(Error::invalid("id: must be a 40-character hex revision"));
    }
    Ok(())
}

fn validate_change(change: &GerritChange) -> Result<()> {
    if change.host.is_empty() {
        return Err(Error::invalid("host: required"));
    }
    if change.project.is_empty() {
        return Err(Error::invalid("project: required"));
    }
    if change.change == 0 {
        return Err(Error::invalid("change: required"));
    }
    if change.patchset == 0 {
        return Err(Error::invalid("patchset: required"));
    }
    Ok(())
}

fn validate_experiment_name(name: &str) -> Result<()> {
    if !EXPERIMENT_NAME.is_match(name) {
        return Err(Error::invalid(format!("{name:?} is not a valid experiment name")));
    }
    if name.starts_with(RESERVED_PREFIX) && !experiments::is_well_known(name) {
        return Err(Error::invalid(format!(
            "{name:?} uses the reserved {RESERVED_PREFIX:?} prefix but is not a known experiment"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::build::{Executable, Notification, StringPair};
    use kiln_core::BuildId;

    fn request() -> ScheduleBuildRequest {
        ScheduleBuildRequest::for_builder(BuilderId::new("p", "b", "linux"))
    }

    #[test]
    fn test_valid_request() {
        let mut req = request().with_request_id("r1");
        req.dimensions
            .push(RequestedDimension::new("os", "Linux").with_expiration(Span::seconds(120)));
        req.experiments.insert("kiln.agent".to_string(), true);
        req.experiments.insert("my.experiment".to_string(), false);
        req.tags.push(StringPair::new("buildset", "x"));
        assert!(validate_request(&req).is_ok());
    }

    #[test]
    fn test_request_id() {
        assert!(validate_request(&request().with_request_id("a/b")).is_err());
        let long = "x".repeat(MAX_REQUEST_ID_LEN + 1);
        assert!(validate_request(&request().with_request_id(long)).is_err());
        let max = "x".repeat(MAX_REQUEST_ID_LEN);
        assert!(validate_request(&request().with_request_id(max)).is_ok());
    }

    #[test]
    fn test_builder_or_template_required() {
        assert!(validate_request(&ScheduleBuildRequest::default()).is_err());
        let req = ScheduleBuildRequest {
            template_build_id: Some(BuildId::new(42)),
            ..Default::default()
        };
        assert!(validate_request(&req).is_ok());
        let req = ScheduleBuildRequest::for_builder(BuilderId::new("p", "", "x"));
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_dimension_rules() {
        let cases = [
            RequestedDimension::new("", "v"),
            RequestedDimension::new("k", ""),
            RequestedDimension::new("caches", "x"),
            RequestedDimension::new("pool", "x"),
            RequestedDimension::new("os", "Linux").with_expiration(Span::seconds(30)),
        ];
        for dim in cases {
            let mut req = request();
            req.dimensions.push(dim.clone());
            assert!(validate_request(&req).is_err(), "{dim:?} should be rejected");
        }
    }

    #[test]
    fn test_exe_only_version() {
        let mut req = request();
        req.exe = Some(Executable {
            cipd_version: "latest".to_string(),
            ..Default::default()
        });
        assert!(validate_request(&req).is_ok());
        req.exe = Some(Executable {
            cipd_package: "pkg".to_string(),
            ..Default::default()
        });
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_prohibited_properties() {
        let mut req = request();
        let mut props = serde_json::Map::new();
        props.insert("buildername".to_string(), "x".into());
        req.properties = Some(props);
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_experiment_names() {
        assert!(validate_experiment_name("kiln.agent").is_ok());
        assert!(validate_experiment_name("chromium.fast_build").is_ok());
        assert!(validate_experiment_name("kiln.unknown").is_err());
        assert!(validate_experiment_name("Bad.Name").is_err());
        assert!(validate_experiment_name("trailing.").is_err());
    }

    #[test]
    fn test_tags() {
        let mut req = request();
        req.tags.push(StringPair::new("build_address", "x"));
        assert!(validate_request(&req).is_err());

        let mut req = request();
        req.tags.push(StringPair::new("builder", "other"));
        assert!(validate_request(&req).is_err());

        let mut req = request();
        req.tags.push(StringPair::new("builder", "linux"));
        assert!(validate_request(&req).is_ok());
    }

    #[test]
    fn test_notify() {
        let mut req = request();
        req.notify = Some(Notification::default());
        assert!(validate_request(&req).is_err());
        req.notify = Some(Notification {
            pubsub_topic: "projects/p/topics/t".to_string(),
            user_data: "x".repeat(MAX_USER_DATA_LEN + 1),
        });
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_duplicate_request_ids_in_batch() {
        let a = request().with_request_id("r1");
        let b = request().with_request_id("r1");
        let err = validate_batch(&[a.clone(), b]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let other = ScheduleBuildRequest::for_builder(BuilderId::new("p", "b", "mac"))
            .with_request_id("r1");
        assert!(validate_batch(&[a, other]).is_ok());
        assert!(validate_batch(&[request(), request()]).is_ok());
    }

    #[test]
    fn test_normalize_legacy() {
        let mut req = request();
        req.canary = Some(true);
        req.experimental = Some(true);
        req.experiments.insert(NON_PRODUCTION.to_string(), false);
        normalize_legacy(&mut req);

        assert_eq!(req.canary, None);
        assert_eq!(req.experimental, None);
        assert_eq!(req.experiments[CANARY_SOFTWARE], true);
        assert_eq!(req.experiments[NON_PRODUCTION], false);
    }
}
