//! Storage traits for builds and their satellite records.
//!
//! Reads and writes that must be atomic with a build go through a
//! [`Transaction`]. Everything else (builder configs, sequence counters,
//! builder stats, the tag index) is written in its own short statement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::build::{BuildInfra, BuildSteps, StringPair};
use kiln_core::builder::{BuilderConfig, BuilderEntry};
use kiln_core::task::Task;
use kiln_core::{Build, BuildId, BuilderId, Status};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::DbResult;

/// Maps `(builder, request_id)` to the build it created. Written once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestIdRecord {
    pub key: String,
    pub build_id: BuildId,
    pub create_time: DateTime<Utc>,
}

impl RequestIdRecord {
    pub fn key(builder: &BuilderId, request_id: &str) -> String {
        format!("{builder}/{request_id}")
    }
}

/// Filter for [`Store::search_builds`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildQuery {
    pub builder: Option<BuilderId>,
    pub status: Option<Status>,
    /// Every tag must be present on the build.
    pub tags: Vec<StringPair>,
    pub limit: usize,
}

impl BuildQuery {
    pub fn matches(&self, build: &Build) -> bool {
        self.builder.as_ref().is_none_or(|b| *b == build.builder)
            && self.status.is_none_or(|s| s == build.status)
            && self.tags.iter().all(|t| build.tags.contains(t))
    }
}

/// Sequence name of a builder's build-number counter.
pub fn sequence_name(builder: &BuilderId) -> String {
    builder.to_string()
}

/// A serializable transaction scoped to one build.
///
/// Dropping a transaction without calling [`Transaction::commit`] discards
/// every write made through it, including enqueued tasks.
#[async_trait]
pub trait Transaction: Send {
    async fn get_build(&mut self, id: BuildId) -> DbResult<Option<Build>>;

    async fn get_request_id(&mut self, key: &str) -> DbResult<Option<RequestIdRecord>>;

    async fn get_steps(&mut self, id: BuildId) -> DbResult<Option<BuildSteps>>;

    /// Inserts or replaces the build row together with its infra and input
    /// properties.
    async fn put_build(&mut self, build: &Build) -> DbResult<()>;

    /// Inserts a dedup record. An existing key is a `Duplicate` error.
    async fn put_request_id(&mut self, record: &RequestIdRecord) -> DbResult<()>;

    async fn put_steps(&mut self, steps: &BuildSteps) -> DbResult<()>;

    /// Adds a task to the outbox. Returns `false` when a task with the same
    /// dedup key already exists.
    async fn enqueue(&mut self, task: &Task) -> DbResult<bool>;

    async fn commit(self: Box<Self>) -> DbResult<()>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> DbResult<Box<dyn Transaction>>;

    async fn get_build(&self, id: BuildId) -> DbResult<Option<Build>>;

    async fn search_builds(&self, query: &BuildQuery) -> DbResult<Vec<Build>>;

    async fn get_builder(&self, id: &BuilderId) -> DbResult<Option<BuilderConfig>>;

    async fn put_builder(&self, entry: &BuilderEntry) -> DbResult<()>;

    /// Advances the named counter by `count` and returns the first value of
    /// the reserved range. Counters start at 1.
    async fn next_sequence(&self, name: &str, count: u32) -> DbResult<u32>;

    async fn update_builder_stats(
        &self,
        builders: &[BuilderId],
        now: DateTime<Utc>,
    ) -> DbResult<()>;

    async fn last_scheduled(&self, builder: &BuilderId) -> DbResult<Option<DateTime<Utc>>>;

    async fn index_tags(&self, entries: &[(StringPair, BuildId)]) -> DbResult<()>;

    async fn lookup_tag(&self, tag: &StringPair) -> DbResult<Vec<BuildId>>;
}

/// Splits a build into its row, infra and input properties.
pub(crate) fn split_build(build: &Build) -> (Build, BuildInfra, Map<String, Value>) {
    let mut row = build.clone();
    let infra = std::mem::take(&mut row.infra);
    let properties = std::mem::take(&mut row.input.properties);
    (row, infra, properties)
}

pub(crate) fn join_build(
    mut row: Build,
    infra: Option<BuildInfra>,
    properties: Option<Map<String, Value>>,
) -> Build {
    row.infra = infra.unwrap_or_default();
    row.input.properties = properties.unwrap_or_default();
    row
}
