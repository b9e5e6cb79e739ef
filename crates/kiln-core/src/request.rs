//! Client requests.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::build::{
    Build, Executable, GerritChange, GitilesCommit, Notification, RequestedDimension, Span,
    StringPair,
};
use crate::id::{BuildId, BuilderId};
use crate::mask::FieldMask;
use crate::status::Status;

/// Maximum length of a client-supplied `request_id`.
pub const MAX_REQUEST_ID_LEN: usize = 256;

/// A request to create one build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleBuildRequest {
    /// Idempotency key. Empty means no deduplication.
    pub request_id: String,
    pub builder: Option<BuilderId>,
    /// Build whose inputs seed this request; request fields win.
    pub template_build_id: Option<BuildId>,
    pub dimensions: Vec<RequestedDimension>,
    pub properties: Option<Map<String, Value>>,
    pub gitiles_commit: Option<GitilesCommit>,
    pub gerrit_changes: Vec<GerritChange>,
    pub experiments: BTreeMap<String, bool>,
    /// Legacy shortcut for the canary-software experiment.
    pub canary: Option<bool>,
    /// Legacy shortcut for the non-production experiment.
    pub experimental: Option<bool>,
    /// 0 means "not set".
    pub priority: u32,
    pub critical: Option<bool>,
    /// Only `cipd_version` may be set.
    pub exe: Option<Executable>,
    pub execution_timeout: Option<Span>,
    pub grace_period: Option<Span>,
    pub scheduling_timeout: Option<Span>,
    pub tags: Vec<StringPair>,
    pub notify: Option<Notification>,
    pub parent_run_id: String,
    pub fields: Option<FieldMask>,
}

impl ScheduleBuildRequest {
    pub fn for_builder(builder: BuilderId) -> Self {
        Self {
            builder: Some(builder),
            ..Default::default()
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetBuildRequest {
    pub id: Option<BuildId>,
    pub builder: Option<BuilderId>,
    pub build_number: Option<u32>,
    pub fields: Option<FieldMask>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchBuildsRequest {
    pub builder: Option<BuilderId>,
    pub status: Option<Status>,
    pub tags: Vec<StringPair>,
    pub page_size: u32,
    pub fields: Option<FieldMask>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CancelBuildRequest {
    pub id: BuildId,
    pub summary_markdown: String,
    pub fields: Option<FieldMask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItem {
    ScheduleBuild(ScheduleBuildRequest),
    GetBuild(GetBuildRequest),
    SearchBuilds(SearchBuildsRequest),
    CancelBuild(CancelBuildRequest),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub requests: Vec<BatchItem>,
}

/// Per-item error in a batch response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Unavailable,
    Internal,
}

impl From<&crate::Error> for ErrorCode {
    fn from(err: &crate::Error) -> Self {
        match err {
            crate::Error::InvalidInput(_) => ErrorCode::InvalidArgument,
            crate::Error::NotFound(_) => ErrorCode::NotFound,
            crate::Error::AlreadyExists(_) => ErrorCode::AlreadyExists,
            crate::Error::Conflict(_) => ErrorCode::FailedPrecondition,
            crate::Error::Transient(_) => ErrorCode::Unavailable,
            crate::Error::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<crate::Error> for ItemError {
    fn from(err: crate::Error) -> Self {
        Self {
            code: ErrorCode::from(&err),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemResponse {
    ScheduleBuild(Build),
    GetBuild(Build),
    SearchBuilds(Vec<Build>),
    CancelBuild(Build),
    Error(ItemError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub responses: Vec<BatchItemResponse>,
}
