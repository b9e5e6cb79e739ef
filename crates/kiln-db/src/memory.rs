//! In-memory store for tests and local development.
//!
//! Transactions hold the store's single lock from `begin` until commit or
//! drop, so they are trivially serializable. Writes are staged in the
//! transaction and applied on commit.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use kiln_core::build::{BuildInfra, BuildSteps, StringPair};
use kiln_core::builder::{BuilderConfig, BuilderEntry};
use kiln_core::task::Task;
use kiln_core::{Build, BuildId, BuilderId};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::queue::{
    CLAIM_LEASE_SECS, QueuedTask, STATUS_CLAIMED, STATUS_COMPLETED, STATUS_FAILED,
    STATUS_PENDING, TaskQueue,
};
use crate::store::{BuildQuery, RequestIdRecord, Store, Transaction, join_build, split_build};
use crate::{DbError, DbResult};

/// Failure points tests can arm.
#[derive(Debug, Default)]
pub struct Faults {
    /// Every `next_sequence` call fails permanently.
    pub sequence: AtomicBool,
    /// The next N `next_sequence` calls fail with a conflict.
    pub sequence_conflicts: AtomicU32,
    /// The next N commits fail with a conflict.
    pub commit_conflicts: AtomicU32,
    /// Every commit fails permanently.
    pub commit: AtomicBool,
    pub tag_index: AtomicBool,
    pub builder_stats: AtomicBool,
}

impl Faults {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Debug, Default)]
struct State {
    builds: BTreeMap<BuildId, Build>,
    infra: HashMap<BuildId, BuildInfra>,
    properties: HashMap<BuildId, Map<String, Value>>,
    steps: HashMap<BuildId, BuildSteps>,
    request_ids: HashMap<String, RequestIdRecord>,
    builders: HashMap<BuilderId, BuilderConfig>,
    sequences: HashMap<String, u32>,
    builder_stats: HashMap<BuilderId, DateTime<Utc>>,
    tag_index: HashMap<String, BTreeSet<BuildId>>,
    tasks: Vec<QueuedTask>,
    task_keys: HashSet<String>,
}

impl State {
    fn load(&self, id: BuildId) -> Option<Build> {
        let row = self.builds.get(&id)?.clone();
        Some(join_build(
            row,
            self.infra.get(&id).cloned(),
            self.properties.get(&id).cloned(),
        ))
    }

    fn store(&mut self, build: &Build) {
        let (row, infra, properties) = split_build(build);
        self.infra.insert(build.id, infra);
        self.properties.insert(build.id, properties);
        self.builds.insert(build.id, row);
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
    lease: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            faults: Arc::default(),
            lease: Duration::seconds(CLAIM_LEASE_SECS),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    pub async fn build_count(&self) -> usize {
        self.state.lock().await.builds.len()
    }

    pub async fn request_id_count(&self) -> usize {
        self.state.lock().await.request_ids.len()
    }

    /// Every task in the outbox, oldest first.
    pub async fn tasks(&self) -> Vec<QueuedTask> {
        self.state.lock().await.tasks.clone()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> DbResult<Box<dyn Transaction>> {
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            state: guard,
            faults: self.faults.clone(),
            builds: HashMap::new(),
            request_ids: HashMap::new(),
            steps: HashMap::new(),
            tasks: Vec::new(),
        }))
    }

    async fn get_build(&self, id: BuildId) -> DbResult<Option<Build>> {
        Ok(self.state.lock().await.load(id))
    }

    async fn search_builds(&self, query: &BuildQuery) -> DbResult<Vec<Build>> {
        let state = self.state.lock().await;
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        // Ascending ids are newest first.
        let builds = state
            .builds
            .values()
            .filter(|b| query.matches(b))
            .take(limit)
            .filter_map(|b| state.load(b.id))
            .collect();
        Ok(builds)
    }

    async fn get_builder(&self, id: &BuilderId) -> DbResult<Option<BuilderConfig>> {
        Ok(self.state.lock().await.builders.get(id).cloned())
    }

    async fn put_builder(&self, entry: &BuilderEntry) -> DbResult<()> {
        self.state
            .lock()
            .await
            .builders
            .insert(entry.id.clone(), entry.config.clone());
        Ok(())
    }

    async fn next_sequence(&self, name: &str, count: u32) -> DbResult<u32> {
        if self.faults.sequence.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable(format!("sequence {name}")));
        }
        if Faults::take(&self.faults.sequence_conflicts) {
            return Err(DbError::Conflict(format!("sequence {name}")));
        }
        let mut state = self.state.lock().await;
        let next = state.sequences.entry(name.to_string()).or_insert(1);
        let start = *next;
        *next += count;
        Ok(start)
    }

    async fn update_builder_stats(
        &self,
        builders: &[BuilderId],
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        if self.faults.builder_stats.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("builder stats".to_string()));
        }
        let mut state = self.state.lock().await;
        for builder in builders {
            let last = state.builder_stats.entry(builder.clone()).or_insert(now);
            *last = (*last).max(now);
        }
        Ok(())
    }

    async fn last_scheduled(&self, builder: &BuilderId) -> DbResult<Option<DateTime<Utc>>> {
        Ok(self.state.lock().await.builder_stats.get(builder).copied())
    }

    async fn index_tags(&self, entries: &[(StringPair, BuildId)]) -> DbResult<()> {
        if self.faults.tag_index.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("tag index".to_string()));
        }
        let mut state = self.state.lock().await;
        for (tag, id) in entries {
            state.tag_index.entry(tag.to_string()).or_default().insert(*id);
        }
        Ok(())
    }

    async fn lookup_tag(&self, tag: &StringPair) -> DbResult<Vec<BuildId>> {
        let state = self.state.lock().await;
        Ok(state
            .tag_index
            .get(&tag.to_string())
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }
}

pub struct MemoryTransaction {
    state: OwnedMutexGuard<State>,
    faults: Arc<Faults>,
    builds: HashMap<BuildId, Build>,
    request_ids: HashMap<String, RequestIdRecord>,
    steps: HashMap<BuildId, BuildSteps>,
    tasks: Vec<Task>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get_build(&mut self, id: BuildId) -> DbResult<Option<Build>> {
        Ok(match self.builds.get(&id) {
            Some(b) => Some(b.clone()),
            None => self.state.load(id),
        })
    }

    async fn get_request_id(&mut self, key: &str) -> DbResult<Option<RequestIdRecord>> {
        Ok(self
            .request_ids
            .get(key)
            .or_else(|| self.state.request_ids.get(key))
            .cloned())
    }

    async fn get_steps(&mut self, id: BuildId) -> DbResult<Option<BuildSteps>> {
        Ok(self
            .steps
            .get(&id)
            .or_else(|| self.state.steps.get(&id))
            .cloned())
    }

    async fn put_build(&mut self, build: &Build) -> DbResult<()> {
        self.builds.insert(build.id, build.clone());
        Ok(())
    }

    async fn put_request_id(&mut self, record: &RequestIdRecord) -> DbResult<()> {
        if self.request_ids.contains_key(&record.key)
            || self.state.request_ids.contains_key(&record.key)
        {
            return Err(DbError::Duplicate(format!("request id {}", record.key)));
        }
        self.request_ids.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn put_steps(&mut self, steps: &BuildSteps) -> DbResult<()> {
        self.steps.insert(steps.build_id, steps.clone());
        Ok(())
    }

    async fn enqueue(&mut self, task: &Task) -> DbResult<bool> {
        let exists = self.state.task_keys.contains(&task.dedup_key)
            || self.tasks.iter().any(|t| t.dedup_key == task.dedup_key);
        if exists {
            return Ok(false);
        }
        self.tasks.push(task.clone());
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        let MemoryTransaction {
            mut state,
            faults,
            builds,
            request_ids,
            steps,
            tasks,
        } = *self;

        if faults.commit.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("injected commit failure".to_string()));
        }
        if Faults::take(&faults.commit_conflicts) {
            return Err(DbError::Conflict("injected commit conflict".to_string()));
        }

        for build in builds.values() {
            state.store(build);
        }
        state.request_ids.extend(request_ids);
        state.steps.extend(steps);
        let now = Utc::now();
        for task in &tasks {
            state.task_keys.insert(task.dedup_key.clone());
            state.tasks.push(QueuedTask::pending(task, now));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for InMemoryStore {
    async fn claim(&self, worker_id: &str) -> DbResult<Option<QueuedTask>> {
        let now = Utc::now();
        let expired = now - self.lease;
        let mut state = self.state.lock().await;
        let claimable = |t: &&mut QueuedTask| {
            t.status == STATUS_PENDING
                || (t.status == STATUS_CLAIMED && t.claimed_at.is_some_and(|at| at < expired))
        };
        let Some(task) = state.tasks.iter_mut().find(claimable) else {
            return Ok(None);
        };
        task.status = STATUS_CLAIMED.to_string();
        task.claimed_by = Some(worker_id.to_string());
        task.claimed_at = Some(now);
        task.attempts += 1;
        Ok(Some(task.clone()))
    }

    async fn complete(&self, id: uuid::Uuid) -> DbResult<()> {
        self.set_status(id, STATUS_COMPLETED, None).await
    }

    async fn fail(&self, id: uuid::Uuid, error: &str) -> DbResult<()> {
        self.set_status(id, STATUS_FAILED, Some(error)).await
    }

    async fn release(&self, id: uuid::Uuid) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let task = find_task(&mut state, id)?;
        task.status = STATUS_PENDING.to_string();
        task.claimed_by = None;
        task.claimed_at = None;
        Ok(())
    }

    async fn tasks_for_build(&self, build_id: i64) -> DbResult<Vec<QueuedTask>> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.build_id == build_id)
            .cloned()
            .collect())
    }
}

impl InMemoryStore {
    async fn set_status(&self, id: uuid::Uuid, status: &str, error: Option<&str>) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let task = find_task(&mut state, id)?;
        task.status = status.to_string();
        task.error = error.map(str::to_string);
        Ok(())
    }
}

fn find_task(state: &mut State, id: uuid::Uuid) -> DbResult<&mut QueuedTask> {
    state
        .tasks
        .iter_mut()
        .find(|t| t.id == id)
        .ok_or_else(|| DbError::NotFound(format!("task {id}")))
}
