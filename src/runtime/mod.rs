//! In-process runtime: orchestration and worker dispatchers over a [`Provider`].

use crate::providers::{Provider, ProviderError};
use crate::{ActivityContext, ActivityError, ErrorDetails, OrchestrationContext};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

mod dispatchers;
pub mod registry;
pub mod replay_engine;

pub use registry::{ActivityRegistry, OrchestrationRegistry, VersionPolicy};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Sleep between polls when a queue is empty.
    pub dispatcher_idle_sleep: Duration,
    /// Number of concurrent orchestration dispatchers.
    pub orchestration_concurrency: usize,
    /// Number of concurrent activity workers.
    pub worker_concurrency: usize,
    pub orchestrator_lock_timeout: Duration,
    pub worker_lock_timeout: Duration,
    /// How long before expiry a worker renews its lock (timeouts of 15s or more only).
    pub worker_lock_renewal_buffer: Duration,
    /// Delete history of earlier executions once an instance continues as new.
    pub prune_continued_executions: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep: Duration::from_millis(10),
            orchestration_concurrency: 2,
            worker_concurrency: 4,
            orchestrator_lock_timeout: Duration::from_secs(30),
            worker_lock_timeout: Duration::from_secs(60),
            worker_lock_renewal_buffer: Duration::from_secs(10),
            prune_continued_executions: true,
        }
    }
}

/// Status of an instance as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    /// Also reported for an execution that just continued as new.
    Running,
    Completed { output: String },
    Failed { details: ErrorDetails },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F>(pub F);

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers. One call is one attempt.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityError>;
}

pub struct FnActivity<F>(pub F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityError> {
        (self.0)(ctx, input).await
    }
}

/// Runs orchestration turns and activities against a shared provider.
///
/// Several runtimes may share one provider; instance locks keep each
/// instance on a single dispatcher at a time.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    options: RuntimeOptions,
    runtime_id: String,
    shutdown_flag: Arc<AtomicBool>,
}

impl Runtime {
    /// Start a runtime with default options.
    pub async fn start_with_store(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    pub async fn start_with_options(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        debug!(
            target: "durable_research::runtime",
            runtime_id = %runtime_id,
            provider = history_store.name(),
            orchestration_concurrency = options.orchestration_concurrency,
            worker_concurrency = options.worker_concurrency,
            "Starting runtime"
        );

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            options,
            runtime_id,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        });

        let orch_handle = runtime.clone().start_orchestration_dispatcher();
        let work_handle = runtime.clone().start_work_dispatcher(activity_registry);
        runtime.joins.lock().await.extend([orch_handle, work_handle]);

        runtime
    }

    pub fn store(&self) -> Arc<dyn Provider> {
        Arc::clone(&self.history_store)
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Stop all dispatchers and the workers they spawned.
    ///
    /// Aborted workers drop their in-flight turn or activity without acking
    /// it. The abandoned items are picked up again once their locks expire.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
        debug!(target: "durable_research::runtime", runtime_id = %self.runtime_id, "Runtime stopped");
    }

    /// Retry a provider call with exponential backoff (10ms * 2^n, 5 attempts)
    /// while the error stays retryable.
    async fn execute_with_retry<F, R>(&self, operation: F, operation_tag: &str) -> Result<(), ProviderError>
    where
        F: Fn() -> R,
        R: Future<Output = Result<(), ProviderError>>,
    {
        const MAX_ATTEMPTS: u32 = 5;
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    let backoff = Duration::from_millis(10u64.saturating_mul(1 << attempt));
                    warn!(
                        target: "durable_research::runtime",
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "{operation_tag} failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(target: "durable_research::runtime", attempts = attempt + 1, error = %e, "{operation_tag} failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn runtime_for_tests() -> Runtime {
        Runtime {
            joins: Mutex::new(Vec::new()),
            history_store: Arc::new(crate::providers::in_memory::InMemoryProvider::new()),
            orchestration_registry: OrchestrationRegistry::default(),
            options: RuntimeOptions::default(),
            runtime_id: "test".into(),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn retry_stops_on_permanent_error() {
        let rt = runtime_for_tests();
        let calls = &AtomicU32::new(0);
        let result = rt
            .execute_with_retry(
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::permanent("ack", "stale lock"))
                },
                "ack",
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let rt = runtime_for_tests();
        let calls = &AtomicU32::new(0);
        let result = rt
            .execute_with_retry(
                || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProviderError::retryable("ack", "database is locked"))
                    } else {
                        Ok(())
                    }
                },
                "ack",
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_five_attempts() {
        let rt = runtime_for_tests();
        let calls = &AtomicU32::new(0);
        let result = rt
            .execute_with_retry(
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::retryable("ack", "busy"))
                },
                "ack",
            )
            .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!OrchestrationStatus::Running.is_terminal());
        assert!(!OrchestrationStatus::NotFound.is_terminal());
        assert!(OrchestrationStatus::Terminated { reason: "x".into() }.is_terminal());
    }
}
