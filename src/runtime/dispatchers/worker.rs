//! Worker (activity) dispatcher implementation for Runtime
//!
//! This module contains the worker dispatcher logic that:
//! - Spawns concurrent activity workers
//! - Runs each activity under its retry policy
//! - Acks the final outcome together with the completion message

use super::AbortOnDrop;
use crate::providers::{Provider, WorkItem};
use crate::runtime::{ActivityHandler, Runtime, registry::ActivityRegistry};
use crate::{ActivityContext, ActivityError, AppErrorKind, ConfigErrorKind, ErrorDetails, RetryPolicy};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Identity of one scheduled activity, shared by all of its attempts.
struct ActivityCall {
    instance: String,
    execution_id: u64,
    id: u64,
    orchestration: String,
    name: String,
}

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers for executing activities
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>, activities: Arc<ActivityRegistry>) -> JoinHandle<()> {
        let concurrency = self.options.worker_concurrency.max(1);

        tokio::spawn(async move {
            let mut worker_handles = Vec::with_capacity(concurrency);
            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let activities = Arc::clone(&activities);
                let worker_id = format!("work-{worker_idx}-{}", rt.runtime_id);
                worker_handles.push(AbortOnDrop(tokio::spawn(async move {
                    while !rt.shutdown_flag.load(Ordering::Relaxed) {
                        match rt.history_store.fetch_work_item(rt.options.worker_lock_timeout).await {
                            Ok(Some((item, token))) => rt.execute_work_item(&activities, item, &token, &worker_id).await,
                            Ok(None) => tokio::time::sleep(rt.options.dispatcher_idle_sleep).await,
                            Err(e) => {
                                warn!(worker_id = %worker_id, error = %e, "Error fetching work item");
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                })));
            }

            for handle in worker_handles.iter_mut() {
                handle.join().await;
            }
        })
    }

    async fn execute_work_item(&self, activities: &ActivityRegistry, item: WorkItem, token: &str, worker_id: &str) {
        let WorkItem::ActivityExecute {
            instance,
            execution_id,
            id,
            orchestration,
            name,
            input,
            retry,
        } = item
        else {
            error!(worker_id = %worker_id, kind = ?item, "Unexpected work item on worker queue; dropping");
            if let Err(e) = self.history_store.ack_work_item(token, None).await {
                warn!(worker_id = %worker_id, error = %e, "Failed to drop unexpected work item");
            }
            return;
        };

        let call = ActivityCall {
            instance,
            execution_id,
            id,
            orchestration,
            name,
        };

        let renewal = AbortOnDrop(spawn_lock_renewal_task(
            Arc::clone(&self.history_store),
            token.to_string(),
            self.options.worker_lock_timeout,
            self.options.worker_lock_renewal_buffer,
            Arc::clone(&self.shutdown_flag),
        ));

        let start_time = Instant::now();
        let completion = match activities.get(&call.name) {
            Some(handler) => {
                let (result, attempts) = run_with_retry(handler, &call, input, &retry, worker_id).await;
                let duration_ms = start_time.elapsed().as_millis() as u64;
                match result {
                    Ok(result) => {
                        debug!(
                            instance_id = %call.instance,
                            execution_id = call.execution_id,
                            activity_name = %call.name,
                            activity_id = call.id,
                            worker_id = %worker_id,
                            attempts,
                            duration_ms,
                            "Activity completed"
                        );
                        WorkItem::ActivityCompleted {
                            instance: call.instance.clone(),
                            execution_id: call.execution_id,
                            id: call.id,
                            result,
                            attempts,
                        }
                    }
                    Err(e) => {
                        warn!(
                            instance_id = %call.instance,
                            execution_id = call.execution_id,
                            activity_name = %call.name,
                            activity_id = call.id,
                            worker_id = %worker_id,
                            attempts,
                            duration_ms,
                            retryable = e.retryable,
                            error = %e.message,
                            "Activity failed"
                        );
                        WorkItem::ActivityFailed {
                            instance: call.instance.clone(),
                            execution_id: call.execution_id,
                            id: call.id,
                            details: ErrorDetails::Application {
                                kind: AppErrorKind::ActivityFailed,
                                message: e.message,
                                retryable: e.retryable,
                            },
                            attempts,
                        }
                    }
                }
            }
            None => {
                error!(
                    instance_id = %call.instance,
                    execution_id = call.execution_id,
                    activity_name = %call.name,
                    worker_id = %worker_id,
                    "Activity is not registered"
                );
                WorkItem::ActivityFailed {
                    instance: call.instance.clone(),
                    execution_id: call.execution_id,
                    id: call.id,
                    details: ErrorDetails::Configuration {
                        kind: ConfigErrorKind::UnregisteredActivity,
                        resource: call.name.clone(),
                        message: None,
                    },
                    attempts: 0,
                }
            }
        };

        drop(renewal);

        let acked = self
            .execute_with_retry(
                || {
                    let store = Arc::clone(&self.history_store);
                    let token = token.to_string();
                    let completion = completion.clone();
                    async move { store.ack_work_item(&token, Some(completion)).await }
                },
                "ack_work_item",
            )
            .await;
        if let Err(e) = acked {
            // The item comes back once its lock expires
            warn!(
                instance_id = %call.instance,
                execution_id = call.execution_id,
                activity_id = call.id,
                worker_id = %worker_id,
                error = %e,
                "Failed to ack activity result"
            );
        }
    }
}

/// Run attempts until one succeeds or the policy says stop.
///
/// Returns the final result and the number of attempts made.
async fn run_with_retry(
    handler: Arc<dyn ActivityHandler>,
    call: &ActivityCall,
    input: String,
    retry: &RetryPolicy,
    worker_id: &str,
) -> (Result<String, ActivityError>, u32) {
    let mut attempt: u32 = 1;
    loop {
        let ctx = ActivityContext::new(
            call.instance.clone(),
            call.execution_id,
            call.orchestration.clone(),
            call.name.clone(),
            call.id,
            attempt,
        );
        let invocation = AssertUnwindSafe(handler.invoke(ctx, input.clone())).catch_unwind();
        let outcome = match retry.timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(ActivityError::transient(format!(
                    "attempt timed out after {}ms",
                    limit.as_millis()
                )))),
            },
            None => invocation.await,
        };
        let result = outcome.unwrap_or_else(|payload| {
            let msg = panic_message(payload.as_ref());
            warn!(
                instance_id = %call.instance,
                activity_name = %call.name,
                worker_id = %worker_id,
                attempt,
                panic = %msg,
                "Activity panicked"
            );
            Err(ActivityError::terminal(format!("panicked: {msg}")))
        });

        match result {
            Ok(output) => return (Ok(output), attempt),
            Err(e) if retry.should_retry(attempt, &e) => {
                let delay = retry.delay_for_attempt(attempt);
                debug!(
                    instance_id = %call.instance,
                    activity_name = %call.name,
                    worker_id = %worker_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e.message,
                    "Activity attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "activity panicked".to_string()
    }
}

/// Interval between lock renewals.
///
/// Long locks renew `buffer` before expiry; short ones renew at half the timeout.
fn calculate_renewal_interval(lock_timeout: Duration, buffer: Duration) -> Duration {
    if lock_timeout >= Duration::from_secs(15) {
        lock_timeout.saturating_sub(buffer).max(Duration::from_secs(1))
    } else {
        (lock_timeout / 2).max(Duration::from_millis(100))
    }
}

/// Keep an in-flight activity's lock alive until the returned handle is aborted.
fn spawn_lock_renewal_task(
    store: Arc<dyn Provider>,
    token: String,
    lock_timeout: Duration,
    buffer: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let renewal_interval = calculate_renewal_interval(lock_timeout, buffer);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(renewal_interval);
        interval.tick().await; // first tick is immediate

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match store.renew_work_item_lock(&token, lock_timeout).await {
                Ok(()) => trace!(lock_token = %token, "Renewed work item lock"),
                Err(e) => {
                    // Acked or expired
                    debug!(lock_token = %token, error = %e, "Lock renewal stopped");
                    break;
                }
            }
        }
    })
}
