//! Read, cancel, and batch operations on the scheduler.

use futures::future::{BoxFuture, FutureExt};
use futures::{StreamExt, stream};
use kiln_core::build::StringPair;
use kiln_core::request::{
    BatchItem, BatchItemResponse, BatchRequest, BatchResponse, CancelBuildRequest,
    GetBuildRequest, ItemError, ScheduleBuildRequest, SearchBuildsRequest,
};
use kiln_core::{Build, Error, Result};
use kiln_db::BuildQuery;
use tracing::{debug, instrument};

use crate::MAX_CONCURRENCY;
use crate::numbers::{BUILD_ADDRESS_KEY, build_address};
use crate::schedule::Scheduler;

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 1000;

impl Scheduler {
    /// Looks a build up by id, or by builder and build number.
    pub async fn get(&self, req: &GetBuildRequest) -> Result<Build> {
        if let Some(mask) = &req.fields {
            mask.validate()?;
        }
        match (req.id, &req.builder, req.build_number) {
            (Some(id), None, None) => self.get_build(id).await,
            (None, Some(builder), Some(number)) => {
                builder.validate()?;
                let tag = StringPair::new(BUILD_ADDRESS_KEY, build_address(builder, number));
                for id in self.store().lookup_tag(&tag).await? {
                    if let Some(build) = self.store().get_build(id).await? {
                        return Ok(build);
                    }
                }
                Err(Error::NotFound(format!("build {builder}/{number}")))
            }
            (Some(_), _, _) => Err(Error::invalid(
                "id is mutually exclusive with builder and build_number",
            )),
            _ => Err(Error::invalid("one of id or builder and build_number is required")),
        }
    }

    /// Builds matching every given predicate, newest first.
    pub async fn search(&self, req: &SearchBuildsRequest) -> Result<Vec<Build>> {
        if let Some(mask) = &req.fields {
            mask.validate()?;
        }
        if let Some(builder) = &req.builder {
            builder.validate()?;
        }
        let limit = match req.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        let query = BuildQuery {
            builder: req.builder.clone(),
            status: req.status,
            tags: req.tags.clone(),
            limit: limit as usize,
        };
        Ok(self.store().search_builds(&query).await?)
    }

    pub async fn cancel(&self, req: &CancelBuildRequest) -> Result<Build> {
        if let Some(mask) = &req.fields {
            mask.validate()?;
        }
        let now = self.clock().now();
        let outcome = self
            .status()
            .cancel_build(req.id, &req.summary_markdown, now)
            .await?;
        Ok(outcome.build)
    }

    /// Runs every item of `batch`, answering each in request order.
    ///
    /// Schedule items are scheduled together, so one failure among them fails
    /// every schedule item. Other items fail independently.
    #[instrument(skip_all, fields(items = batch.requests.len()))]
    pub async fn batch(&self, batch: BatchRequest, identity: &str) -> BatchResponse {
        let mut schedule_slots = Vec::new();
        let mut schedule_reqs: Vec<ScheduleBuildRequest> = Vec::new();
        let mut others = Vec::new();
        for (slot, item) in batch.requests.into_iter().enumerate() {
            match item {
                BatchItem::ScheduleBuild(req) => {
                    schedule_slots.push(slot);
                    schedule_reqs.push(req);
                }
                item => others.push((slot, item)),
            }
        }
        let total = schedule_slots.len() + others.len();

        let scheduled = async {
            if schedule_reqs.is_empty() {
                return Vec::new();
            }
            let results = match self.schedule_batch(schedule_reqs, identity).await {
                Ok(builds) => builds.into_iter().map(BatchItemResponse::ScheduleBuild).collect(),
                Err(e) => {
                    let err = ItemError::from(e);
                    schedule_slots
                        .iter()
                        .map(|_| BatchItemResponse::Error(err.clone()))
                        .collect::<Vec<_>>()
                }
            };
            schedule_slots.iter().copied().zip(results).collect()
        };
        let items: Vec<BoxFuture<'_, (usize, BatchItemResponse)>> = others
            .into_iter()
            .map(|(slot, item)| async move { (slot, self.run_item(item).await) }.boxed())
            .collect();
        let rest = stream::iter(items)
            .buffered(MAX_CONCURRENCY)
            .collect::<Vec<_>>();

        let (scheduled, rest) = tokio::join!(scheduled, rest);

        let mut slots: Vec<Option<BatchItemResponse>> = vec![None; total];
        for (slot, response) in scheduled.into_iter().chain(rest) {
            slots[slot] = Some(response);
        }
        let responses = slots
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    BatchItemResponse::Error(ItemError::from(Error::Internal(
                        "no response for batch item".to_string(),
                    )))
                })
            })
            .collect();
        debug!(items = total, "batch done");
        BatchResponse { responses }
    }

    async fn run_item(&self, item: BatchItem) -> BatchItemResponse {
        let result = match item {
            BatchItem::GetBuild(req) => self.get(&req).await.map(BatchItemResponse::GetBuild),
            BatchItem::SearchBuilds(req) => {
                self.search(&req).await.map(BatchItemResponse::SearchBuilds)
            }
            BatchItem::CancelBuild(req) => {
                self.cancel(&req).await.map(BatchItemResponse::CancelBuild)
            }
            BatchItem::ScheduleBuild(_) => Err(Error::Internal(
                "schedule items are handled together".to_string(),
            )),
        };
        result.unwrap_or_else(|e| BatchItemResponse::Error(ItemError::from(e)))
    }
}
