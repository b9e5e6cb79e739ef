//! End-to-end scheduling against the in-memory store.

use chrono::Utc;
use kiln_core::build::{BuildSteps, Step, StringPair};
use kiln_core::builder::{BuilderConfig, BuilderEntry, Settings};
use kiln_core::clock::{Clock, TestClock};
use kiln_core::experiments::NON_PRODUCTION;
use kiln_core::request::{
    BatchItem, BatchItemResponse, BatchRequest, ErrorCode, GetBuildRequest,
    ScheduleBuildRequest, SearchBuildsRequest,
};
use kiln_core::task::TaskKind;
use kiln_core::{BuildId, BuilderId, Error, Status};
use kiln_db::{InMemoryStore, Store};
use kiln_scheduler::{Scheduler, StatusUpdate};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

const IDENTITY: &str = "user:someone@example.com";

fn linux() -> BuilderId {
    BuilderId::new("chromium", "try", "linux")
}

async fn setup(config: BuilderConfig) -> (Arc<Scheduler>, InMemoryStore) {
    let (scheduler, store, _) = setup_with_clock(config).await;
    (scheduler, store)
}

async fn setup_with_clock(
    config: BuilderConfig,
) -> (Arc<Scheduler>, InMemoryStore, Arc<TestClock>) {
    let store = InMemoryStore::new();
    store
        .put_builder(&BuilderEntry {
            id: linux(),
            config,
        })
        .await
        .unwrap();
    let clock = Arc::new(TestClock::new(Utc::now()));
    let scheduler = Scheduler::new(Arc::new(store.clone()), clock.clone(), Settings::default())
        .with_rng(StdRng::seed_from_u64(42));
    (Arc::new(scheduler), store, clock)
}

fn numbered() -> BuilderConfig {
    BuilderConfig {
        build_numbers: true,
        ..BuilderConfig::named("linux")
    }
}

fn dedup_keys(tasks: &[kiln_db::QueuedTask]) -> Vec<&str> {
    tasks.iter().map(|t| t.dedup_key.as_str()).collect()
}

#[tokio::test]
async fn test_same_request_id_returns_same_build() {
    let (scheduler, store) = setup(BuilderConfig::named("linux")).await;
    let req = ScheduleBuildRequest::for_builder(linux()).with_request_id("r1");

    let first = scheduler.schedule_build(req.clone(), IDENTITY).await.unwrap();
    let second = scheduler.schedule_build(req, IDENTITY).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(store.build_count().await, 1);
    assert_eq!(store.request_id_count().await, 1);
    let backend: Vec<_> = store
        .tasks()
        .await
        .into_iter()
        .filter(|t| t.kind == TaskKind::CreateBackendTask.to_string())
        .collect();
    assert_eq!(backend.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_request_id_creates_one_build() {
    let (scheduler, store) = setup(numbered()).await;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let req = ScheduleBuildRequest::for_builder(linux()).with_request_id("r1");
                scheduler.schedule_build(req, IDENTITY).await
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().unwrap().id);
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(store.build_count().await, 1);
    assert_eq!(store.request_id_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_builds_get_consecutive_numbers() {
    let (scheduler, _store) = setup(numbered()).await;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .schedule_build(ScheduleBuildRequest::for_builder(linux()), IDENTITY)
                    .await
            })
        })
        .collect();

    let mut numbers = Vec::new();
    for handle in handles {
        let build = handle.await.unwrap().unwrap();
        let number = build.number.unwrap();
        let address = format!("kiln.chromium.try/linux/{number}");
        assert_eq!(build.tag_values("build_address").collect::<Vec<_>>(), vec![address]);
        numbers.push(number);
    }
    numbers.sort();
    assert_eq!(numbers, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_batch_numbers_follow_request_order() {
    let (scheduler, _store) = setup(numbered()).await;
    let reqs = vec![ScheduleBuildRequest::for_builder(linux()); 3];

    let builds = scheduler.schedule_batch(reqs, IDENTITY).await.unwrap();

    let numbers: Vec<_> = builds.iter().map(|b| b.number.unwrap()).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    let ids: HashSet<_> = builds.iter().map(|b| b.id).collect();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn test_unnumbered_builder_has_no_number() {
    let (scheduler, _store) = setup(BuilderConfig::named("linux")).await;
    let build = scheduler
        .schedule_build(ScheduleBuildRequest::for_builder(linux()), IDENTITY)
        .await
        .unwrap();
    assert_eq!(build.number, None);
    assert_eq!(build.status, Status::Scheduled);
    assert_eq!(build.created_by, IDENTITY);
    assert_eq!(build.tag_values("build_address").count(), 0);
}

#[tokio::test]
async fn test_unknown_builder_is_not_found() {
    let (scheduler, store) = setup(BuilderConfig::named("linux")).await;
    let req = ScheduleBuildRequest::for_builder(BuilderId::new("chromium", "try", "mac"));

    let err = scheduler.schedule_build(req, IDENTITY).await.unwrap_err();

    assert!(matches!(err, Error::NotFound(_)), "{err}");
    assert_eq!(store.build_count().await, 0);
}

#[tokio::test]
async fn test_invalid_request_fails_whole_batch() {
    let (scheduler, store) = setup(BuilderConfig::named("linux")).await;
    let reqs = vec![
        ScheduleBuildRequest::for_builder(linux()),
        ScheduleBuildRequest::for_builder(linux()).with_request_id("a/b"),
    ];

    let err = scheduler.schedule_batch(reqs, IDENTITY).await.unwrap_err();

    assert!(matches!(err, Error::InvalidInput(_)), "{err}");
    assert!(err.to_string().contains("requests[1]"), "{err}");
    assert_eq!(store.build_count().await, 0);
}

#[tokio::test]
async fn test_side_effect_failure_commits_nothing() {
    let (scheduler, store) = setup(numbered()).await;
    store.faults().tag_index.store(true, Ordering::SeqCst);

    let req = ScheduleBuildRequest::for_builder(linux()).with_request_id("r1");
    assert!(scheduler.schedule_build(req, IDENTITY).await.is_err());

    assert_eq!(store.build_count().await, 0);
    assert_eq!(store.request_id_count().await, 0);
    assert!(store.tasks().await.is_empty());

    store.faults().tag_index.store(false, Ordering::SeqCst);
    store.faults().builder_stats.store(true, Ordering::SeqCst);
    let req = ScheduleBuildRequest::for_builder(linux()).with_request_id("r1");
    assert!(scheduler.schedule_build(req, IDENTITY).await.is_err());
    assert_eq!(store.build_count().await, 0);
}

#[tokio::test]
async fn test_sequence_failure_fails_call() {
    let (scheduler, store) = setup(numbered()).await;
    store.faults().sequence.store(true, Ordering::SeqCst);

    let err = scheduler
        .schedule_build(ScheduleBuildRequest::for_builder(linux()), IDENTITY)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("generating build numbers"), "{err}");
    assert_eq!(store.build_count().await, 0);
}

#[tokio::test]
async fn test_transient_conflicts_are_retried() {
    let (scheduler, store) = setup(numbered()).await;
    store.faults().sequence_conflicts.store(2, Ordering::SeqCst);
    store.faults().commit_conflicts.store(2, Ordering::SeqCst);

    let build = scheduler
        .schedule_build(ScheduleBuildRequest::for_builder(linux()), IDENTITY)
        .await
        .unwrap();

    assert_eq!(build.number, Some(1));
    assert_eq!(store.build_count().await, 1);
}

#[tokio::test]
async fn test_status_moves_forward_and_fans_out_once() {
    let (scheduler, store) = setup(BuilderConfig::named("linux")).await;
    let build = scheduler
        .schedule_build(ScheduleBuildRequest::for_builder(linux()), IDENTITY)
        .await
        .unwrap();
    let id = build.id;
    let now = scheduler.clock().now();
    let status = scheduler.status();

    let started = status
        .update_status(id, &StatusUpdate::build(Status::Started), now)
        .await
        .unwrap();
    assert!(started.changed);
    assert_eq!(started.build.start_time, Some(now));

    let again = status
        .update_status(id, &StatusUpdate::task(Status::Started), now)
        .await
        .unwrap();
    assert!(!again.changed);

    let done = status
        .update_status(id, &StatusUpdate::build(Status::Success), now)
        .await
        .unwrap();
    assert!(done.changed);
    assert_eq!(done.build.status, Status::Success);
    assert_eq!(done.build.end_time, Some(now));

    let late = status
        .update_status(id, &StatusUpdate::build(Status::Failure), now)
        .await
        .unwrap();
    assert!(!late.changed);
    assert_eq!(late.build.status, Status::Success);

    let tasks = store.tasks().await;
    let keys = dedup_keys(&tasks);
    assert_eq!(
        keys,
        vec![
            format!("create_backend_task:{id}"),
            format!("notify_pubsub:{id}:STARTED"),
            format!("notify_pubsub:{id}:SUCCESS"),
            format!("export_bigquery:{id}"),
            format!("finalize_result_db:{id}"),
        ]
    );
}

#[tokio::test]
async fn test_scheduled_to_ended_skips_started_notification() {
    let (scheduler, store) = setup(BuilderConfig::named("linux")).await;
    let build = scheduler
        .schedule_build(ScheduleBuildRequest::for_builder(linux()), IDENTITY)
        .await
        .unwrap();
    let now = scheduler.clock().now();

    let update = StatusUpdate {
        build_status: Some(Status::Scheduled),
        task_status: Some(Status::InfraFailure),
        summary: None,
    };
    let outcome = scheduler
        .status()
        .update_status(build.id, &update, now)
        .await
        .unwrap();

    assert_eq!(outcome.build.status, Status::InfraFailure);
    assert_eq!(outcome.build.start_time, outcome.build.end_time);
    let tasks = store.tasks().await;
    assert!(
        !dedup_keys(&tasks)
            .iter()
            .any(|k| k.ends_with(":STARTED"))
    );
    assert_eq!(tasks.len(), 4);
}

#[tokio::test]
async fn test_cancel_cancels_unfinished_steps() {
    let (scheduler, store) = setup(BuilderConfig::named("linux")).await;
    let build = scheduler
        .schedule_build(ScheduleBuildRequest::for_builder(linux()), IDENTITY)
        .await
        .unwrap();
    let step = |name: &str, status| Step {
        name: name.to_string(),
        status,
        start_time: None,
        end_time: None,
        summary_markdown: String::new(),
    };
    let mut txn = store.begin().await.unwrap();
    txn.put_steps(&BuildSteps {
        build_id: build.id,
        steps: vec![step("compile", Status::Success), step("test", Status::Started)],
    })
    .await
    .unwrap();
    txn.commit().await.unwrap();

    let now = scheduler.clock().now();
    let outcome = scheduler
        .status()
        .cancel_build(build.id, "no longer needed", now)
        .await
        .unwrap();

    assert_eq!(outcome.build.status, Status::Canceled);
    assert_eq!(outcome.build.summary_markdown, "no longer needed");
    let mut txn = store.begin().await.unwrap();
    let steps = txn.get_steps(build.id).await.unwrap().unwrap();
    assert_eq!(steps.steps[0].status, Status::Success);
    assert_eq!(steps.steps[1].status, Status::Canceled);
    assert_eq!(steps.steps[1].end_time, Some(now));
}

#[tokio::test]
async fn test_template_build_seeds_request() {
    let (scheduler, _store) = setup(BuilderConfig::named("linux")).await;
    let mut req = ScheduleBuildRequest::for_builder(linux());
    req.properties = Some(serde_json::Map::from_iter([
        ("a".to_string(), json!(1)),
        ("b".to_string(), json!("x")),
    ]));
    req.tags.push(StringPair::new("user", "x"));
    let template = scheduler.schedule_build(req, IDENTITY).await.unwrap();

    let mut req = ScheduleBuildRequest {
        template_build_id: Some(template.id),
        ..Default::default()
    };
    req.properties = Some(serde_json::Map::from_iter([("b".to_string(), json!("y"))]));
    let build = scheduler.schedule_build(req, IDENTITY).await.unwrap();

    assert_eq!(build.builder, linux());
    assert_ne!(build.id, template.id);
    assert_eq!(build.input.properties["a"], 1);
    assert_eq!(build.input.properties["b"], "y");
    assert_eq!(build.tag_values("user").collect::<Vec<_>>(), vec!["x"]);
}

#[tokio::test]
async fn test_missing_template_is_not_found() {
    let (scheduler, _store) = setup(BuilderConfig::named("linux")).await;
    let req = ScheduleBuildRequest {
        template_build_id: Some(BuildId::new(12345)),
        ..Default::default()
    };
    let err = scheduler.schedule_build(req, IDENTITY).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{err}");
}

#[tokio::test]
async fn test_legacy_experimental_flag() {
    let (scheduler, _store) = setup(BuilderConfig::named("linux")).await;
    let req = ScheduleBuildRequest {
        experimental: Some(true),
        ..ScheduleBuildRequest::for_builder(linux())
    };

    let build = scheduler.schedule_build(req, IDENTITY).await.unwrap();

    assert_eq!(build.experiment(NON_PRODUCTION), Some(true));
    assert_eq!(build.infra.task.priority, 255);
}

#[tokio::test]
async fn test_batch_reports_per_item_errors() {
    let (scheduler, _store) = setup(numbered()).await;
    let batch = BatchRequest {
        requests: vec![
            BatchItem::GetBuild(GetBuildRequest {
                id: Some(BuildId::new(1)),
                ..Default::default()
            }),
            BatchItem::ScheduleBuild(ScheduleBuildRequest::for_builder(linux())),
            BatchItem::SearchBuilds(SearchBuildsRequest {
                builder: Some(linux()),
                ..Default::default()
            }),
        ],
    };

    let response = scheduler.batch(batch, IDENTITY).await;

    assert_eq!(response.responses.len(), 3);
    match &response.responses[0] {
        BatchItemResponse::Error(e) => assert_eq!(e.code, ErrorCode::NotFound),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        response.responses[1],
        BatchItemResponse::ScheduleBuild(_)
    ));
    assert!(matches!(
        response.responses[2],
        BatchItemResponse::SearchBuilds(_)
    ));
}

#[tokio::test]
async fn test_batch_schedule_failure_fails_every_schedule_item() {
    let (scheduler, store) = setup(BuilderConfig::named("linux")).await;
    let batch = BatchRequest {
        requests: vec![
            BatchItem::ScheduleBuild(ScheduleBuildRequest::for_builder(linux())),
            BatchItem::ScheduleBuild(ScheduleBuildRequest::for_builder(BuilderId::new(
                "chromium", "try", "mac",
            ))),
        ],
    };

    let response = scheduler.batch(batch, IDENTITY).await;

    for r in &response.responses {
        match r {
            BatchItemResponse::Error(e) => assert_eq!(e.code, ErrorCode::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(store.build_count().await, 0);
}

#[tokio::test]
async fn test_get_by_builder_and_number() {
    let (scheduler, _store) = setup(numbered()).await;
    let builds = scheduler
        .schedule_batch(vec![ScheduleBuildRequest::for_builder(linux()); 2], IDENTITY)
        .await
        .unwrap();

    let found = scheduler
        .get(&GetBuildRequest {
            builder: Some(linux()),
            build_number: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.id, builds[1].id);

    let err = scheduler
        .get(&GetBuildRequest {
            builder: Some(linux()),
            build_number: Some(3),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_search_newest_first() {
    let (scheduler, _store, clock) = setup_with_clock(BuilderConfig::named("linux")).await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        let build = scheduler
            .schedule_build(ScheduleBuildRequest::for_builder(linux()), IDENTITY)
            .await
            .unwrap();
        ids.push(build.id);
        clock.advance(chrono::Duration::seconds(1));
    }

    let found = scheduler
        .search(&SearchBuildsRequest {
            builder: Some(linux()),
            page_size: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    let found: Vec<_> = found.iter().map(|b| b.id).collect();
    assert_eq!(found, vec![ids[2], ids[1]]);
}

#[tokio::test]
async fn test_scheduling_records_last_scheduled() {
    let (scheduler, store, clock) = setup_with_clock(BuilderConfig::named("linux")).await;
    assert_eq!(store.last_scheduled(&linux()).await.unwrap(), None);

    scheduler
        .schedule_build(ScheduleBuildRequest::for_builder(linux()), IDENTITY)
        .await
        .unwrap();
    assert_eq!(store.last_scheduled(&linux()).await.unwrap(), Some(clock.now()));

    clock.advance(chrono::Duration::minutes(1));
    scheduler
        .schedule_build(ScheduleBuildRequest::for_builder(linux()), IDENTITY)
        .await
        .unwrap();
    assert_eq!(store.last_scheduled(&linux()).await.unwrap(), Some(clock.now()));
}

#[tokio::test]
async fn test_failed_status_commit_enqueues_nothing() {
    let (scheduler, store) = setup(BuilderConfig::named("linux")).await;
    let build = scheduler
        .schedule_build(ScheduleBuildRequest::for_builder(linux()), IDENTITY)
        .await
        .unwrap();
    let now = scheduler.clock().now();

    store.faults().commit.store(true, Ordering::SeqCst);
    let result = scheduler
        .status()
        .update_status(build.id, &StatusUpdate::build(Status::Success), now)
        .await;
    assert!(result.is_err());
    store.faults().commit.store(false, Ordering::SeqCst);

    let stored = store.get_build(build.id).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Scheduled);
    assert_eq!(stored.end_time, None);
    let tasks = store.tasks().await;
    assert_eq!(
        dedup_keys(&tasks),
        vec![format!("create_backend_task:{}", build.id)]
    );
}

fn assert_send<T: Send>(_: &T) {}

#[tokio::test]
async fn test_scheduler_futures_can_be_spawned() {
    let (scheduler, _store) = setup(numbered()).await;

    let schedule = scheduler.schedule_build(ScheduleBuildRequest::for_builder(linux()), IDENTITY);
    assert_send(&schedule);
    drop(schedule);

    let batch = BatchRequest {
        requests: vec![
            BatchItem::ScheduleBuild(ScheduleBuildRequest::for_builder(linux())),
            BatchItem::GetBuild(GetBuildRequest {
                id: Some(BuildId::new(1)),
                ..Default::default()
            }),
        ],
    };
    let scheduler = scheduler.clone();
    let response = tokio::spawn(async move { scheduler.batch(batch, IDENTITY).await })
        .await
        .unwrap();
    assert_eq!(response.responses.len(), 2);
    assert!(matches!(response.responses[0], BatchItemResponse::ScheduleBuild(_)));
}
