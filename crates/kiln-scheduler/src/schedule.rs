//! The scheduler: turns schedule requests into persisted builds.

use futures::future::{BoxFuture, FutureExt};
use futures::{StreamExt, TryStreamExt, stream};
use kiln_config::{normalize_legacy, resolve, validate_batch};
use kiln_core::build::Executable;
use kiln_core::builder::{BuilderEntry, Settings};
use kiln_core::clock::Clock;
use kiln_core::request::ScheduleBuildRequest;
use kiln_core::task::Task;
use kiln_core::{Build, BuildId, BuilderId, Error, Result};
use kiln_db::{RequestIdRecord, Store};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument};

use crate::MAX_CONCURRENCY;
use crate::buildid::IdAllocator;
use crate::numbers::{BUILD_ADDRESS_KEY, generate_build_numbers};
use crate::retry::retry_transient;
use crate::side_effects::{self, InvocationService, LocalInvocations};
use crate::status::StatusEngine;

/// Template tags regenerated for the new build rather than copied.
const TEMPLATE_SKIPPED_TAG_KEYS: &[&str] = &[BUILD_ADDRESS_KEY, "builder", "gitiles_ref"];

pub struct Scheduler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    settings: Settings,
    invocations: Arc<dyn InvocationService>,
    status: StatusEngine,
}

/// A build waiting to be committed.
struct Pending {
    build: Build,
    request_id: String,
    numbered: bool,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, settings: Settings) -> Self {
        Self {
            status: StatusEngine::new(store.clone()),
            store,
            clock,
            rng: Mutex::new(StdRng::from_entropy()),
            settings,
            invocations: Arc::new(LocalInvocations),
        }
    }

    /// Replaces the random source, e.g. with a seeded one in tests.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn with_invocations(mut self, invocations: Arc<dyn InvocationService>) -> Self {
        self.invocations = invocations;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn status(&self) -> &StatusEngine {
        &self.status
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn schedule_build(&self, req: ScheduleBuildRequest, identity: &str) -> Result<Build> {
        let mut builds = self.schedule_batch(vec![req], identity).await?;
        builds
            .pop()
            .ok_or_else(|| Error::Internal("schedule returned no build".to_string()))
    }

    /// Schedules every request, returning builds in request order.
    ///
    /// Either every request yields a build or the call fails. A request whose
    /// `request_id` was already used for its builder yields the stored build.
    #[instrument(skip_all, fields(requests = reqs.len(), identity = %identity))]
    pub async fn schedule_batch(
        &self,
        mut reqs: Vec<ScheduleBuildRequest>,
        identity: &str,
    ) -> Result<Vec<Build>> {
        if reqs.is_empty() {
            return Ok(Vec::new());
        }

        for req in &mut reqs {
            normalize_legacy(req);
        }
        self.expand_templates(&mut reqs).await?;
        validate_batch(&reqs)?;

        let configs = self.fetch_builders(&reqs).await?;

        // Resolution and id allocation draw from the shared rng; hold the
        // lock only for this synchronous section.
        let now = self.clock.now();
        let mut pending = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            let mut resolved = Vec::with_capacity(reqs.len());
            for (i, req) in reqs.iter().enumerate() {
                let entry = req
                    .builder
                    .as_ref()
                    .and_then(|b| configs.get(b))
                    .ok_or_else(|| Error::Internal(format!("requests[{i}]: builder not loaded")))?;
                let r = resolve(req, entry, &self.settings, &mut *rng)
                    .map_err(|e| e.annotate(format!("requests[{i}]")))?;
                resolved.push(r);
            }
            let ids = IdAllocator::allocate(now, resolved.len(), &mut *rng)?;
            resolved
                .into_iter()
                .zip(ids)
                .zip(&reqs)
                .map(|((r, id), req)| Pending {
                    numbered: r.build_numbers,
                    build: r.into_build(id, identity, now),
                    request_id: req.request_id.clone(),
                })
                .collect::<Vec<_>>()
        };

        generate_build_numbers(
            self.store.as_ref(),
            pending
                .iter_mut()
                .filter(|p| p.numbered)
                .map(|p| &mut p.build),
        )
        .await?;

        let mut builds: Vec<Build> = pending.iter().map(|p| p.build.clone()).collect();
        side_effects::run(
            self.store.as_ref(),
            self.invocations.as_ref(),
            &self.settings.result_store_hostname,
            &mut builds,
            now,
        )
        .await?;
        for (p, build) in pending.iter_mut().zip(builds) {
            p.build = build;
        }

        let commits: Vec<BoxFuture<'_, Result<Build>>> = pending
            .iter()
            .map(|p| self.commit_build(&p.build, &p.request_id).boxed())
            .collect();
        let builds: Vec<Build> = stream::iter(commits)
            .buffered(MAX_CONCURRENCY)
            .try_collect()
            .await?;

        info!(count = builds.len(), "scheduled builds");
        Ok(builds)
    }

    /// Fetches each distinct builder's config once.
    async fn fetch_builders(
        &self,
        reqs: &[ScheduleBuildRequest],
    ) -> Result<HashMap<BuilderId, BuilderEntry>> {
        let ids: BTreeSet<&BuilderId> = reqs.iter().filter_map(|r| r.builder.as_ref()).collect();
        let lookups: Vec<BoxFuture<'_, Result<(BuilderId, BuilderEntry)>>> = ids
            .into_iter()
            .map(|id| {
                let id = id.clone();
                async move {
                    let config = self
                        .store
                        .get_builder(&id)
                        .await?
                        .ok_or_else(|| Error::NotFound(format!("builder {id}")))?;
                    Ok::<_, Error>((id.clone(), BuilderEntry { id, config }))
                }
                .boxed()
            })
            .collect();
        stream::iter(lookups)
            .buffer_unordered(MAX_CONCURRENCY)
            .try_collect()
            .await
    }

    /// Fills requests that name a template build from that build.
    async fn expand_templates(&self, reqs: &mut [ScheduleBuildRequest]) -> Result<()> {
        for (i, req) in reqs.iter_mut().enumerate() {
            let Some(template_id) = req.template_build_id else {
                continue;
            };
            let template = self
                .store
                .get_build(template_id)
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!("requests[{i}]: template build {template_id}"))
                })?;
            apply_template(req, &template);
            debug!(template = %template_id, builder = %template.builder, "expanded template");
        }
        Ok(())
    }

    /// Persists one build with its dedup record and backend task.
    async fn commit_build(&self, build: &Build, request_id: &str) -> Result<Build> {
        retry_transient("commit_build", || async move {
            let mut txn = self.store.begin().await?;

            if !request_id.is_empty() {
                let key = RequestIdRecord::key(&build.builder, request_id);
                if let Some(record) = txn.get_request_id(&key).await? {
                    let existing = txn.get_build(record.build_id).await?.ok_or_else(|| {
                        Error::Internal(format!(
                            "request id {key} points at missing build {}",
                            record.build_id
                        ))
                    })?;
                    info!(build_id = %existing.id, %key, "deduplicated schedule request");
                    return Ok(existing);
                }
            }

            if txn.get_build(build.id).await?.is_some() {
                return Err(Error::AlreadyExists(format!("build {}", build.id)));
            }

            txn.put_build(build).await?;
            if !request_id.is_empty() {
                txn.put_request_id(&RequestIdRecord {
                    key: RequestIdRecord::key(&build.builder, request_id),
                    build_id: build.id,
                    create_time: build.create_time,
                })
                .await?;
            }
            txn.enqueue(&Task::create_backend_task(build.id)).await?;
            txn.commit().await?;

            debug!(build_id = %build.id, builder = %build.builder, "committed build");
            Ok(build.clone())
        })
        .await
        .map_err(|e| e.annotate(format!("build {}", build.id)))
    }

    pub async fn get_build(&self, id: BuildId) -> Result<Build> {
        self.store
            .get_build(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("build {id}")))
    }
}

/// Copies the template's inputs into `req`. Fields set on the request win.
fn apply_template(req: &mut ScheduleBuildRequest, template: &Build) {
    if req.builder.is_none() {
        req.builder = Some(template.builder.clone());
    }
    if req.critical.is_none() {
        req.critical = template.critical;
    }
    if req.exe.is_none() && !template.exe.cipd_version.is_empty() {
        req.exe = Some(Executable {
            cipd_version: template.exe.cipd_version.clone(),
            ..Default::default()
        });
    }
    if req.gerrit_changes.is_empty() {
        req.gerrit_changes = template.input.gerrit_changes.clone();
    }
    if req.gitiles_commit.is_none() {
        req.gitiles_commit = template.input.gitiles_commit.clone();
    }

    let mut properties = template.input.properties.clone();
    if let Some(overrides) = req.properties.take() {
        properties.extend(overrides);
    }
    req.properties = Some(properties);

    let mut tags: Vec<_> = template
        .tags
        .iter()
        .filter(|t| !TEMPLATE_SKIPPED_TAG_KEYS.contains(&t.key.as_str()))
        .cloned()
        .collect();
    tags.append(&mut req.tags);
    req.tags = tags;

    for exp in &template.experiments {
        let (name, on) = match (exp.strip_prefix('+'), exp.strip_prefix('-')) {
            (Some(name), _) => (name, true),
            (_, Some(name)) => (name, false),
            _ => continue,
        };
        req.experiments.entry(name.to_string()).or_insert(on);
    }
}
