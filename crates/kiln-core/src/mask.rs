//! Output field masks.
//!
//! A mask is a list of dotted paths into the JSON form of a build, e.g.
//! `["id", "status", "infra.task.dimensions"]`. `*` selects everything.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::build::Build;

/// Paths returned when the client does not send a mask.
pub const DEFAULT_FIELDS: &[&str] = &[
    "builder",
    "canary",
    "create_time",
    "created_by",
    "critical",
    "end_time",
    "id",
    "input.experimental",
    "input.gerrit_changes",
    "input.gitiles_commit",
    "number",
    "start_time",
    "status",
    "status_changed_time",
    "summary_markdown",
    "tags",
    "update_time",
];

/// Tag keys reserved by the server and hidden from clients.
const HIDDEN_TAG_KEYS: &[&str] = &["build_address", "builder", "gitiles_ref"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    pub paths: Vec<String>,
}

impl FieldMask {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn default_fields() -> Self {
        Self::new(DEFAULT_FIELDS.iter().copied())
    }

    /// Resolves an optional client mask, falling back to the defaults.
    pub fn or_default(mask: Option<&FieldMask>) -> FieldMask {
        match mask {
            Some(m) if !m.paths.is_empty() => m.clone(),
            _ => Self::default_fields(),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        for path in &self.paths {
            if path != "*" && (path.is_empty() || path.split('.').any(str::is_empty)) {
                return Err(crate::Error::invalid(format!("invalid field path {path:?}")));
            }
        }
        Ok(())
    }

    /// Renders `build` as JSON keeping only the masked paths.
    pub fn trim(&self, build: &Build) -> Value {
        let mut value = serde_json::to_value(build).unwrap_or(Value::Null);
        if let Some(tags) = value.get_mut("tags").and_then(Value::as_array_mut) {
            tags.retain(|t| {
                t.get("key")
                    .and_then(Value::as_str)
                    .is_none_or(|k| !HIDDEN_TAG_KEYS.contains(&k))
            });
        }
        if self.paths.iter().any(|p| p == "*") {
            return value;
        }
        let mut out = Map::new();
        for path in &self.paths {
            let segments: Vec<&str> = path.split('.').collect();
            if let Some(selected) = select(&value, &segments) {
                insert(&mut out, &segments, selected);
            }
        }
        Value::Object(out)
    }
}

fn select(value: &Value, segments: &[&str]) -> Option<Value> {
    let mut cur = value;
    for seg in segments {
        cur = cur.get(*seg)?;
    }
    Some(cur.clone())
}

fn insert(out: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            out.insert((*last).to_string(), value);
        }
        [first, rest @ ..] => {
            let child = out
                .entry((*first).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(map) = child {
                insert(map, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_nested_paths() {
        let source = json!({"infra": {"task": {"priority": 30, "hostname": "h"}}, "id": 7});
        let mut out = Map::new();
        for path in ["infra.task.priority", "id", "missing.path"] {
            let segments: Vec<&str> = path.split('.').collect();
            if let Some(v) = select(&source, &segments) {
                insert(&mut out, &segments, v);
            }
        }
        assert_eq!(
            Value::Object(out),
            json!({"infra": {"task": {"priority": 30}}, "id": 7})
        );
    }

    #[test]
    fn test_validate_rejects_empty_segments() {
        assert!(FieldMask::new(["infra..task"]).validate().is_err());
        assert!(FieldMask::new(["*", "id"]).validate().is_ok());
    }

    #[test]
    fn test_or_default() {
        assert_eq!(FieldMask::or_default(None), FieldMask::default_fields());
        let custom = FieldMask::new(["id"]);
        assert_eq!(FieldMask::or_default(Some(&custom)), custom);
    }
}
