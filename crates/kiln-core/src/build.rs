//! The build entity and its resolved configuration snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::{BuildId, BuilderId};
use crate::status::Status;

/// A wire duration with whole seconds and a sub-second remainder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub seconds: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub nanos: i32,
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

impl Span {
    pub const fn seconds(seconds: i64) -> Self {
        Self { seconds, nanos: 0 }
    }

    pub const fn minutes(minutes: i64) -> Self {
        Self::seconds(minutes * 60)
    }

    pub const fn hours(hours: i64) -> Self {
        Self::seconds(hours * 3600)
    }

    /// Checks the value is a non-negative whole number of minutes.
    pub fn validate_minutes(&self) -> crate::Result<()> {
        if self.nanos != 0 {
            Err(crate::Error::invalid("nanos must not be specified"))
        } else if self.seconds < 0 {
            Err(crate::Error::invalid("seconds must not be negative"))
        } else if self.seconds % 60 != 0 {
            Err(crate::Error::invalid("seconds must be a multiple of 60"))
        } else {
            Ok(())
        }
    }
}

/// A key/value worker requirement with an optional expiration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedDimension {
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<Span>,
}

impl RequestedDimension {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            expiration: None,
        }
    }

    pub fn with_expiration(mut self, expiration: Span) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn expiration_secs(&self) -> i64 {
        self.expiration.map(|e| e.seconds).unwrap_or(0)
    }
}

/// A named cache mounted into the build's task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_warm_cache: Option<Span>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub env_var: String,
}

/// What the build runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executable {
    #[serde(default)]
    pub cipd_package: String,
    #[serde(default)]
    pub cipd_version: String,
    #[serde(default)]
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitilesCommit {
    pub host: String,
    pub project: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "ref")]
    pub ref_name: String,
    #[serde(default)]
    pub position: u32,
}

impl GitilesCommit {
    /// The `buildset` tag value for this commit, if it names a revision.
    pub fn buildset(&self) -> Option<String> {
        if self.host.is_empty() || self.project.is_empty() || self.id.is_empty() {
            return None;
        }
        Some(format!(
            "commit/gitiles/{}/{}/+/{}",
            self.host, self.project, self.id
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GerritChange {
    pub host: String,
    pub project: String,
    pub change: u64,
    pub patchset: u64,
}

impl GerritChange {
    pub fn buildset(&self) -> String {
        format!("patch/gerrit/{}/{}/{}", self.host, self.change, self.patchset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StringPair {
    pub key: String,
    pub value: String,
}

impl StringPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parses `key:value`, splitting at the first colon.
    pub fn parse(s: &str) -> Option<Self> {
        s.split_once(':').map(|(k, v)| Self::new(k, v))
    }
}

impl std::fmt::Display for StringPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// Pub/sub callback requested by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub pubsub_topic: String,
    #[serde(default)]
    pub user_data: String,
}

/// What the client asked for, kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestedInfra {
    #[serde(default)]
    pub dimensions: Vec<RequestedDimension>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsInfra {
    pub hostname: String,
    pub project: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultStoreInfra {
    pub hostname: String,
    #[serde(default)]
    pub invocation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeInfra {
    pub cipd_package: String,
    pub name: String,
}

/// Parameters of the execution-backend task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfra {
    pub hostname: String,
    pub priority: u32,
    #[serde(default)]
    pub service_account: String,
    #[serde(default)]
    pub parent_run_id: String,
    #[serde(default)]
    pub dimensions: Vec<RequestedDimension>,
    #[serde(default)]
    pub caches: Vec<CacheEntry>,
}

/// Infrastructure snapshot. Stored apart from the build row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildInfra {
    pub requested: RequestedInfra,
    pub logs: LogsInfra,
    pub result_store: ResultStoreInfra,
    pub recipe: RecipeInfra,
    pub task: TaskInfra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildInput {
    /// Stored apart from the build row.
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitiles_commit: Option<GitilesCommit>,
    #[serde(default)]
    pub gerrit_changes: Vec<GerritChange>,
    #[serde(default)]
    pub experimental: bool,
    /// Names of enabled experiments, sorted.
    #[serde(default)]
    pub experiments: Vec<String>,
}

/// A build step, as reported by the execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary_markdown: String,
}

/// The steps of one build. Stored apart from the build row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSteps {
    pub build_id: BuildId,
    pub steps: Vec<Step>,
}

impl BuildSteps {
    /// Marks every step that has not ended as canceled.
    ///
    /// Returns whether anything changed.
    pub fn cancel_incomplete(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        for step in &mut self.steps {
            if !step.status.is_ended() {
                step.status = Status::Canceled;
                step.end_time = Some(now);
                changed = true;
            }
        }
        changed
    }
}

/// A persisted build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub builder: BuilderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    pub created_by: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: Status,
    pub status_changed_time: DateTime<Utc>,
    #[serde(default)]
    pub summary_markdown: String,
    #[serde(default)]
    pub canary: bool,
    #[serde(default)]
    pub critical: Option<bool>,
    #[serde(default)]
    pub wait_for_capacity: bool,
    pub exe: Executable,
    pub infra: BuildInfra,
    pub input: BuildInput,
    /// Sorted `key:value` pairs.
    #[serde(default)]
    pub tags: Vec<StringPair>,
    /// Every experiment known at creation, as `+name` or `-name`, sorted.
    #[serde(default)]
    pub experiments: Vec<String>,
    pub execution_timeout: Span,
    pub grace_period: Span,
    pub scheduling_timeout: Span,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<Notification>,
}

impl Build {
    pub fn is_ended(&self) -> bool {
        self.status.is_ended()
    }

    /// `Some(enabled)` if the experiment was known when the build was created.
    pub fn experiment(&self, name: &str) -> Option<bool> {
        self.experiments.iter().find_map(|e| {
            if e.strip_prefix('+') == Some(name) {
                Some(true)
            } else if e.strip_prefix('-') == Some(name) {
                Some(false)
            } else {
                None
            }
        })
    }

    pub fn tag_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_minute_granularity() {
        assert!(Span::seconds(120).validate_minutes().is_ok());
        assert!(Span::seconds(0).validate_minutes().is_ok());
        assert!(Span::seconds(90).validate_minutes().is_err());
        assert!(Span::seconds(-60).validate_minutes().is_err());
        assert!(
            Span {
                seconds: 60,
                nanos: 1
            }
            .validate_minutes()
            .is_err()
        );
    }

    #[test]
    fn test_cancel_incomplete_steps() {
        let now = Utc::now();
        let mut steps = BuildSteps {
            build_id: BuildId::new(1),
            steps: vec![
                Step {
                    name: "compile".to_string(),
                    status: Status::Success,
                    start_time: None,
                    end_time: None,
                    summary_markdown: String::new(),
                },
                Step {
                    name: "test".to_string(),
                    status: Status::Started,
                    start_time: Some(now),
                    end_time: None,
                    summary_markdown: String::new(),
                },
            ],
        };
        assert!(steps.cancel_incomplete(now));
        assert_eq!(steps.steps[0].status, Status::Success);
        assert_eq!(steps.steps[1].status, Status::Canceled);
        assert_eq!(steps.steps[1].end_time, Some(now));
        assert!(!steps.cancel_incomplete(now));
    }

    #[test]
    fn test_buildsets() {
        let commit = GitilesCommit {
            host: "gitiles.example.com".to_string(),
            project: "src".to_string(),
            id: "deadbeef".to_string(),
            ref_name: "refs/heads/main".to_string(),
            position: 0,
        };
        assert_eq!(
            commit.buildset().unwrap(),
            "commit/gitiles/gitiles.example.com/src/+/deadbeef"
        );
        let change = GerritChange {
            host: "review.example.com".to_string(),
            project: "src".to_string(),
            change: 123,
            patchset: 4,
        };
        assert_eq!(change.buildset(), "patch/gerrit/review.example.com/123/4");
    }
}
