//! Build status transitions and completion fan-out.

use chrono::{DateTime, Utc};
use kiln_core::task::Task;
use kiln_core::{Build, BuildId, Error, Result, Status};
use kiln_db::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::retry::retry_transient;

/// Status signals reported for a build. Missing signals default to the
/// build's current status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusUpdate {
    /// What the build reports about itself.
    pub build_status: Option<Status>,
    /// What the execution backend reports about the build's task.
    pub task_status: Option<Status>,
    pub summary: Option<String>,
}

impl StatusUpdate {
    pub fn build(status: Status) -> Self {
        Self {
            build_status: Some(status),
            ..Default::default()
        }
    }

    pub fn task(status: Status) -> Self {
        Self {
            task_status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusOutcome {
    pub changed: bool,
    pub build: Build,
}

pub struct StatusEngine {
    store: Arc<dyn Store>,
}

impl StatusEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Applies `update` to the build.
    ///
    /// Updates to an ended build, and updates that would not move the build
    /// forward, are no-ops. Entering an ended status cancels unfinished steps
    /// and enqueues the completion tasks in the same transaction.
    pub async fn update_status(
        &self,
        id: BuildId,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<StatusOutcome> {
        if update.build_status.is_none() && update.task_status.is_none() {
            return Err(Error::invalid(
                "one of build_status or task_status is required",
            ));
        }
        let outcome = retry_transient("update_status", || async move {
            self.try_update(id, update, now).await
        })
        .await?;

        if outcome.changed && outcome.build.status == Status::Started {
            // Best effort: a lost STARTED notification only delays subscribers.
            if let Err(e) = self.notify_started(id).await {
                warn!(build_id = %id, error = %e, "failed to enqueue STARTED notification");
            }
        }
        Ok(outcome)
    }

    async fn try_update(
        &self,
        id: BuildId,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<StatusOutcome> {
        let mut txn = self.store.begin().await?;
        let mut build = txn
            .get_build(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("build {id}")))?;

        let current = build.status;
        let reported = update.build_status.unwrap_or(current);
        let combined = reported.combine(update.task_status.unwrap_or(current));

        if !current.can_transition_to(combined) {
            debug!(build_id = %id, %current, %combined, "status update is a no-op");
            return Ok(StatusOutcome {
                changed: false,
                build,
            });
        }

        build.status.transition_to(combined)?;
        build.status_changed_time = now;
        build.update_time = now;
        if let Some(summary) = &update.summary {
            build.summary_markdown = summary.clone();
        }

        if combined == Status::Started {
            build.start_time = Some(now);
        } else if combined.is_ended() {
            build.end_time = Some(now);
            build.start_time.get_or_insert(now);

            if let Some(mut steps) = txn.get_steps(id).await? {
                if steps.cancel_incomplete(now) {
                    txn.put_steps(&steps).await?;
                }
            }
            for task in [
                Task::notify_pubsub(id, combined),
                Task::export_bigquery(id),
                Task::finalize_result_db(id),
            ] {
                txn.enqueue(&task).await?;
            }
        }

        txn.put_build(&build).await?;
        txn.commit().await?;

        info!(build_id = %id, from = %current, to = %combined, "build status changed");
        Ok(StatusOutcome {
            changed: true,
            build,
        })
    }

    async fn notify_started(&self, id: BuildId) -> Result<()> {
        retry_transient("notify_started", || async move {
            let mut txn = self.store.begin().await?;
            txn.enqueue(&Task::notify_pubsub(id, Status::Started)).await?;
            txn.commit().await?;
            Ok(())
        })
        .await
    }

    /// Cancels the build. An already ended build is returned unchanged.
    pub async fn cancel_build(
        &self,
        id: BuildId,
        summary: &str,
        now: DateTime<Utc>,
    ) -> Result<StatusOutcome> {
        let mut update = StatusUpdate::build(Status::Canceled);
        if !summary.is_empty() {
            update.summary = Some(summary.to_string());
        }
        self.update_status(id, &update, now).await
    }

    /// Ends the build with INFRA_FAILURE. Used when the execution backend
    /// cannot take the build. A missing build is logged and ignored.
    pub async fn fail_build(
        &self,
        id: BuildId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusOutcome>> {
        let update = StatusUpdate {
            build_status: Some(Status::InfraFailure),
            task_status: Some(Status::InfraFailure),
            summary: Some(message.to_string()),
        };
        match self.update_status(id, &update, now).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(Error::NotFound(_)) => {
                warn!(build_id = %id, "cannot fail missing build");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
