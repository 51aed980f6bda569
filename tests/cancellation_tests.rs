#![allow(clippy::unwrap_used)]

use durable_research::{
    ActivityContext, ActivityRegistry, Client, EventKind, OrchestrationContext, OrchestrationRegistry,
    OrchestrationStatus, Runtime,
};
use std::sync::Arc;
use std::time::Duration;

mod common;

fn registries() -> (Arc<ActivityRegistry>, OrchestrationRegistry) {
    let activities = ActivityRegistry::builder()
        .register("Stall", |_ctx: ActivityContext, _input: String| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("late".to_string())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Child", |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_activity("Stall", input).into_activity().await
        })
        .register("Parent", |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_sub_orchestration("Child", input).into_sub_orchestration().await
        })
        .build();
    (Arc::new(activities), orchestrations)
}

#[tokio::test]
async fn cancel_terminates_instance_and_its_children() {
    let store = common::create_sqlite_store_memory().await;
    let (activities, orchestrations) = registries();
    let rt = Runtime::start_with_options(store.clone(), activities, orchestrations, common::fast_options()).await;
    let client = Client::new(store.clone());

    client.start_orchestration("cancel-1", "Parent", "x").await.unwrap();
    let child = "cancel-1::1::sub::2";
    assert!(
        common::wait_for_history(
            store.clone(),
            child,
            |hist| common::count_kind(hist, "ActivityScheduled") == 1,
            5_000
        )
        .await,
        "child never scheduled its activity"
    );

    client.cancel_instance("cancel-1", "user request").await.unwrap();
    assert_eq!(
        client
            .wait_for_orchestration("cancel-1", Duration::from_secs(5))
            .await
            .unwrap(),
        OrchestrationStatus::Terminated {
            reason: "user request".to_string()
        }
    );
    assert_eq!(
        client.wait_for_orchestration(child, Duration::from_secs(5)).await.unwrap(),
        OrchestrationStatus::Terminated {
            reason: "parent canceled: user request".to_string()
        }
    );

    let hist = store.read("cancel-1").await.unwrap();
    assert_eq!(common::count_kind(&hist, "OrchestrationCancelRequested"), 1);
    assert!(matches!(
        hist.last().unwrap().kind,
        EventKind::OrchestrationTerminated { .. }
    ));
    rt.shutdown().await;
}

#[tokio::test]
async fn cancel_after_completion_is_ignored() {
    let store = common::create_sqlite_store_memory().await;
    let orchestrations = OrchestrationRegistry::builder()
        .register("Quick", |_ctx: OrchestrationContext, input: String| async move { Ok(input) })
        .build();
    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(ActivityRegistry::builder().build()),
        orchestrations,
        common::fast_options(),
    )
    .await;
    let client = Client::new(store.clone());

    client.start_orchestration("cancel-2", "Quick", "done").await.unwrap();
    client
        .wait_for_orchestration("cancel-2", Duration::from_secs(5))
        .await
        .unwrap();
    client.cancel_instance("cancel-2", "too late").await.unwrap();

    // Give the dispatcher time to drain the message.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        client.get_orchestration_status("cancel-2").await.unwrap(),
        OrchestrationStatus::Completed {
            output: "done".to_string()
        }
    );
    let hist = store.read("cancel-2").await.unwrap();
    assert_eq!(common::count_kind(&hist, "OrchestrationCancelRequested"), 0);
    rt.shutdown().await;
}

#[tokio::test]
async fn cancel_unknown_instance_reports_not_found() {
    let store = common::create_sqlite_store_memory().await;
    let (activities, orchestrations) = registries();
    let rt = Runtime::start_with_options(store.clone(), activities, orchestrations, common::fast_options()).await;
    let client = Client::new(store);

    client.cancel_instance("nobody", "why not").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        client.get_orchestration_status("nobody").await.unwrap(),
        OrchestrationStatus::NotFound
    );
    rt.shutdown().await;
}
