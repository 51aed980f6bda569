#![allow(clippy::unwrap_used)]

use durable_research::providers::Provider;
use durable_research::providers::in_memory::InMemoryProvider;
use durable_research::providers::sqlite::SqliteProvider;
use durable_research::{
    ActivityContext, ActivityRegistry, Client, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus,
    Runtime, RuntimeOptions,
};
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::fault_injection::FailingAckProvider;

fn pipeline() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("Pipeline", |ctx: OrchestrationContext, input: String| async move {
            let fetched = ctx.schedule_activity("Fetch", input).into_activity().await?;
            Ok(format!("stored {fetched}"))
        })
        .build()
}

fn fetch_activities(delay: Duration) -> Arc<ActivityRegistry> {
    Arc::new(
        ActivityRegistry::builder()
            .register("Fetch", move |_ctx: ActivityContext, input: String| async move {
                tokio::time::sleep(delay).await;
                Ok(format!("<{input}>"))
            })
            .build(),
    )
}

async fn expect_completed(client: &Client, instance: &str, output: &str) {
    assert_eq!(
        client
            .wait_for_orchestration(instance, Duration::from_secs(10))
            .await
            .unwrap(),
        OrchestrationStatus::Completed {
            output: output.to_string()
        }
    );
}

#[tokio::test]
async fn restart_resumes_in_flight_activity() {
    let td = tempfile::tempdir().unwrap();
    let url = common::sqlite_url(&td);
    let options = RuntimeOptions {
        worker_lock_timeout: Duration::from_secs(1),
        ..common::fast_options()
    };

    // First process: the activity never finishes before shutdown.
    let store1: Arc<dyn Provider> = Arc::new(SqliteProvider::new(&url, None).await.unwrap());
    let rt1 = Runtime::start_with_options(
        store1.clone(),
        fetch_activities(Duration::from_secs(60)),
        pipeline(),
        options.clone(),
    )
    .await;
    Client::new(store1.clone())
        .start_orchestration("restart-1", "Pipeline", "doc")
        .await
        .unwrap();
    assert!(
        common::wait_for_history(
            store1.clone(),
            "restart-1",
            |hist| common::count_kind(hist, "ActivityScheduled") == 1,
            5_000
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    rt1.shutdown().await;

    // Second process over the same file picks the work up once the lock lapses.
    let store2: Arc<dyn Provider> = Arc::new(SqliteProvider::new(&url, None).await.unwrap());
    let rt2 = Runtime::start_with_options(store2.clone(), fetch_activities(Duration::ZERO), pipeline(), options).await;
    let client = Client::new(store2.clone());
    expect_completed(&client, "restart-1", "stored <doc>").await;

    let hist = store2.read("restart-1").await.unwrap();
    assert_eq!(common::count_kind(&hist, "ActivityScheduled"), 1);
    assert_eq!(common::count_kind(&hist, "ActivityCompleted"), 1);
    rt2.shutdown().await;
}

#[tokio::test]
async fn completed_instances_survive_reopening() {
    let (store, td) = common::create_sqlite_store_disk().await;
    let rt = Runtime::start_with_options(store.clone(), fetch_activities(Duration::ZERO), pipeline(), common::fast_options())
        .await;
    let client = Client::new(store.clone());
    client.start_orchestration("durable-1", "Pipeline", "a").await.unwrap();
    expect_completed(&client, "durable-1", "stored <a>").await;
    rt.shutdown().await;
    let before = store.read("durable-1").await.unwrap();
    drop(client);
    drop(store);

    let reopened: Arc<dyn Provider> = Arc::new(SqliteProvider::new(&common::sqlite_url(&td), None).await.unwrap());
    let client = Client::new(reopened.clone());
    assert_eq!(
        client.get_orchestration_status("durable-1").await.unwrap(),
        OrchestrationStatus::Completed {
            output: "stored <a>".to_string()
        }
    );
    assert_eq!(reopened.read("durable-1").await.unwrap(), before);
}

#[tokio::test]
async fn retryable_commit_failures_are_retried_in_place() {
    let inner: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let faulty = Arc::new(FailingAckProvider::new(inner));
    faulty.fail_next_acks(2, true);
    let store: Arc<dyn Provider> = faulty.clone();

    let rt = Runtime::start_with_options(store.clone(), fetch_activities(Duration::ZERO), pipeline(), common::fast_options())
        .await;
    let client = Client::new(store.clone());
    client.start_orchestration("flaky-db", "Pipeline", "x").await.unwrap();
    expect_completed(&client, "flaky-db", "stored <x>").await;

    assert_eq!(faulty.rejected_acks(), 2);
    let hist = store.read("flaky-db").await.unwrap();
    assert_eq!(common::count_kind(&hist, "OrchestrationStarted"), 1);
    assert_eq!(common::count_kind(&hist, "ActivityScheduled"), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn rejected_turn_is_replayed_from_scratch() {
    let inner: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let faulty = Arc::new(FailingAckProvider::new(inner));
    faulty.fail_next_acks(1, false);
    let store: Arc<dyn Provider> = faulty.clone();

    let rt = Runtime::start_with_options(store.clone(), fetch_activities(Duration::ZERO), pipeline(), common::fast_options())
        .await;
    let client = Client::new(store.clone());
    client.start_orchestration("lost-turn", "Pipeline", "y").await.unwrap();
    expect_completed(&client, "lost-turn", "stored <y>").await;

    assert_eq!(faulty.rejected_acks(), 1);
    let hist = store.read("lost-turn").await.unwrap();
    assert_eq!(common::count_kind(&hist, "ActivityScheduled"), 1);
    assert_eq!(common::count_kind(&hist, "ActivityCompleted"), 1);
    let ids: Vec<u64> = hist.iter().map(|e| e.event_id).collect();
    assert_eq!(ids, (1..=hist.len() as u64).collect::<Vec<_>>());
    rt.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_in_flight_activities() {
    let store = common::create_sqlite_store_memory().await;
    let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = finished.clone();
    let activities = ActivityRegistry::builder()
        .register("Fetch", move |_ctx: ActivityContext, input: String| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(input)
            }
        })
        .build();
    let rt = Runtime::start_with_options(store.clone(), Arc::new(activities), pipeline(), common::fast_options()).await;
    Client::new(store.clone())
        .start_orchestration("halted", "Pipeline", "z")
        .await
        .unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            "halted",
            |hist| common::count_kind(hist, "ActivityScheduled") == 1,
            5_000
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    rt.shutdown().await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!finished.load(std::sync::atomic::Ordering::SeqCst));
    let hist = store.read("halted").await.unwrap();
    assert_eq!(common::count_kind(&hist, "ActivityCompleted"), 0);
}
