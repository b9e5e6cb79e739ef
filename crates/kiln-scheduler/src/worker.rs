//! Worker that drains the task outbox.

use async_trait::async_trait;
use kiln_core::clock::Clock;
use kiln_core::task::{Task, TaskKind};
use kiln_core::{Error, Result};
use kiln_db::TaskQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::status::StatusEngine;

/// Delivers one task to its downstream consumer.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<()>;
}

/// Logs every task. Stands in for real consumers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl TaskHandler for LoggingHandler {
    async fn handle(&self, task: &Task) -> Result<()> {
        info!(kind = %task.kind, build_id = %task.payload.build_id, "delivered task");
        Ok(())
    }
}

/// A worker that claims and delivers tasks.
pub struct Worker {
    id: String,
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    status: Arc<StatusEngine>,
    clock: Arc<dyn Clock>,
    idle_delay: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn TaskHandler>,
        status: Arc<StatusEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            handler,
            status,
            clock,
            idle_delay: Duration::from_secs(1),
        }
    }

    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    /// Run the worker loop.
    pub async fn run(&self) {
        info!(worker_id = %self.id, "Starting worker");

        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => sleep(self.idle_delay).await,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim task");
                    sleep(self.idle_delay * 5).await;
                }
            }
        }
    }

    /// Claims and handles one task. Returns false if none was pending.
    ///
    /// A transiently failed task goes back to the queue and the worker waits
    /// one idle delay before returning, so it does not spin on the same task.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(queued) = self.queue.claim(&self.id).await? else {
            return Ok(false);
        };
        let task = match queued.task() {
            Ok(task) => task,
            Err(e) => {
                warn!(task_id = %queued.id, error = %e, "Dropping undecodable task");
                self.queue.fail(queued.id, &e.to_string()).await?;
                return Ok(true);
            }
        };
        debug!(task_id = %queued.id, kind = %task.kind, attempts = queued.attempts, "Claimed task");

        match self.handler.handle(&task).await {
            Ok(()) => self.queue.complete(queued.id).await?,
            Err(e) if e.is_transient() => {
                warn!(task_id = %queued.id, error = %e, "Task failed, will retry");
                self.queue.release(queued.id).await?;
                sleep(self.idle_delay).await;
            }
            Err(e) => {
                warn!(task_id = %queued.id, kind = %task.kind, error = %e, "Task failed");
                self.queue.fail(queued.id, &e.to_string()).await?;
                if task.kind == TaskKind::CreateBackendTask {
                    self.fail_build(&task, &e).await?;
                }
            }
        }
        Ok(true)
    }

    async fn fail_build(&self, task: &Task, err: &Error) -> Result<()> {
        let message = format!("failed to create backend task: {err}");
        self.status
            .fail_build(task.payload.build_id, &message, self.clock.now())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kiln_core::clock::TestClock;
    use kiln_core::BuildId;
    use kiln_db::InMemoryStore;
    use kiln_db::Store;
    use std::sync::Mutex;

    struct Recording {
        seen: Mutex<Vec<Task>>,
        fail_with: Option<fn() -> Error>,
    }

    #[async_trait]
    impl TaskHandler for Recording {
        async fn handle(&self, task: &Task) -> Result<()> {
            self.seen.lock().unwrap().push(task.clone());
            match self.fail_with {
                Some(err) => Err(err()),
                None => Ok(()),
            }
        }
    }

    fn worker(store: &InMemoryStore, fail_with: Option<fn() -> Error>) -> (Worker, Arc<Recording>) {
        let handler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail_with,
        });
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let worker = Worker::new(
            "w1",
            Arc::new(store.clone()),
            handler.clone(),
            Arc::new(StatusEngine::new(shared)),
            Arc::new(TestClock::new(Utc::now())),
        )
        .with_idle_delay(Duration::ZERO);
        (worker, handler)
    }

    async fn enqueue(store: &InMemoryStore, task: Task) {
        let mut txn = store.begin().await.unwrap();
        txn.enqueue(&task).await.unwrap();
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_once_empty_queue() {
        let store = InMemoryStore::new();
        let (worker, _) = worker(&store, None);
        assert!(!worker.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_run_once_delivers_and_completes() {
        let store = InMemoryStore::new();
        enqueue(&store, Task::export_bigquery(BuildId::new(7))).await;
        let (worker, handler) = worker(&store, None);

        assert!(worker.run_once().await.unwrap());
        assert_eq!(handler.seen.lock().unwrap().len(), 1);
        assert!(!worker.run_once().await.unwrap());

        let tasks = store.tasks_for_build(7).await.unwrap();
        assert_eq!(tasks[0].status, kiln_db::queue::STATUS_COMPLETED);
    }

    #[tokio::test]
    async fn test_transient_failure_releases_task() {
        let store = InMemoryStore::new();
        enqueue(&store, Task::export_bigquery(BuildId::new(7))).await;
        let (worker, handler) = worker(&store, Some(|| Error::Transient("busy".to_string())));

        assert!(worker.run_once().await.unwrap());
        assert!(worker.run_once().await.unwrap());
        assert_eq!(handler.seen.lock().unwrap().len(), 2);

        let tasks = store.tasks_for_build(7).await.unwrap();
        assert_eq!(tasks[0].status, kiln_db::queue::STATUS_PENDING);
        assert_eq!(tasks[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off() {
        let store = InMemoryStore::new();
        enqueue(&store, Task::export_bigquery(BuildId::new(7))).await;
        let (worker, _) = worker(&store, Some(|| Error::Transient("busy".to_string())));
        let worker = worker.with_idle_delay(Duration::from_millis(50));

        let started = std::time::Instant::now();
        assert!(worker.run_once().await.unwrap());
        assert!(started.elapsed() >= Duration::from_millis(50));

        let tasks = store.tasks_for_build(7).await.unwrap();
        assert_eq!(tasks[0].status, kiln_db::queue::STATUS_PENDING);
    }

    #[tokio::test]
    async fn test_backend_failure_for_missing_build_is_ignored() {
        let store = InMemoryStore::new();
        enqueue(&store, Task::create_backend_task(BuildId::new(7))).await;
        let (worker, _) = worker(&store, Some(|| Error::Internal("no capacity".to_string())));

        assert!(worker.run_once().await.unwrap());
        let tasks = store.tasks_for_build(7).await.unwrap();
        assert_eq!(tasks[0].status, kiln_db::queue::STATUS_FAILED);
        assert!(store.get_build(BuildId::new(7)).await.unwrap().is_none());
    }
}
