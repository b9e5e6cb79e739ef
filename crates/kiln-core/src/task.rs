//! Downstream tasks enqueued alongside build mutations.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::id::BuildId;
use crate::status::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Asks the execution backend to create the build's task.
    #[display("create_backend_task")]
    CreateBackendTask,
    #[display("notify_pubsub")]
    NotifyPubSub,
    #[display("export_bigquery")]
    ExportBigQuery,
    #[display("finalize_result_db")]
    FinalizeResultDb,
}

impl std::str::FromStr for TaskKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        [
            TaskKind::CreateBackendTask,
            TaskKind::NotifyPubSub,
            TaskKind::ExportBigQuery,
            TaskKind::FinalizeResultDb,
        ]
        .into_iter()
        .find(|k| k.to_string() == s)
        .ok_or_else(|| crate::Error::invalid(format!("unknown task kind {s:?}")))
    }
}

/// The only payload downstream consumers receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub build_id: BuildId,
}

/// A task to enqueue. Enqueueing a task whose `dedup_key` already exists is a
/// no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub kind: TaskKind,
    pub payload: TaskPayload,
    pub dedup_key: String,
}

impl Task {
    pub fn create_backend_task(build_id: BuildId) -> Self {
        Self::once(TaskKind::CreateBackendTask, build_id)
    }

    /// Pub/sub notifications fire once per status the build enters.
    pub fn notify_pubsub(build_id: BuildId, status: Status) -> Self {
        Self {
            kind: TaskKind::NotifyPubSub,
            payload: TaskPayload { build_id },
            dedup_key: format!("{}:{}:{}", TaskKind::NotifyPubSub, build_id, status),
        }
    }

    pub fn export_bigquery(build_id: BuildId) -> Self {
        Self::once(TaskKind::ExportBigQuery, build_id)
    }

    pub fn finalize_result_db(build_id: BuildId) -> Self {
        Self::once(TaskKind::FinalizeResultDb, build_id)
    }

    fn once(kind: TaskKind, build_id: BuildId) -> Self {
        Self {
            kind,
            payload: TaskPayload { build_id },
            dedup_key: format!("{kind}:{build_id}"),
        }
    }
}
