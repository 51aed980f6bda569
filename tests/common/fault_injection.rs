//! Provider wrapper that fails commits on demand.

use async_trait::async_trait;
use durable_research::Event;
use durable_research::providers::error::ProviderError;
use durable_research::providers::{ExecutionMetadata, InstanceInfo, OrchestrationItem, Provider, WorkItem};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Delegates to `inner` but rejects the next `n` orchestration acks.
pub struct FailingAckProvider {
    inner: Arc<dyn Provider>,
    fail_next_acks: AtomicU32,
    retryable: AtomicBool,
    rejected: AtomicU32,
}

impl FailingAckProvider {
    pub fn new(inner: Arc<dyn Provider>) -> Self {
        Self {
            inner,
            fail_next_acks: AtomicU32::new(0),
            retryable: AtomicBool::new(true),
            rejected: AtomicU32::new(0),
        }
    }

    pub fn fail_next_acks(&self, n: u32, retryable: bool) {
        self.retryable.store(retryable, Ordering::SeqCst);
        self.fail_next_acks.store(n, Ordering::SeqCst);
    }

    pub fn rejected_acks(&self) -> u32 {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FailingAckProvider {
    fn name(&self) -> &str {
        "failing-ack"
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(OrchestrationItem, String)>, ProviderError> {
        self.inner.fetch_orchestration_item(lock_timeout).await
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        let armed = self
            .fail_next_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(if self.retryable.load(Ordering::SeqCst) {
                ProviderError::retryable("ack_orchestration_item", "injected: database is locked")
            } else {
                ProviderError::permanent("ack_orchestration_item", "injected: constraint violation")
            });
        }
        self.inner
            .ack_orchestration_item(
                lock_token,
                execution_id,
                history_delta,
                worker_items,
                orchestrator_items,
                metadata,
            )
            .await
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        self.inner.abandon_orchestration_item(lock_token, delay).await
    }

    async fn enqueue_for_orchestrator(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError> {
        self.inner.enqueue_for_orchestrator(item, delay).await
    }

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        self.inner.fetch_work_item(lock_timeout).await
    }

    async fn ack_work_item(&self, token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError> {
        self.inner.ack_work_item(token, completion).await
    }

    async fn abandon_work_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        self.inner.abandon_work_item(token, delay).await
    }

    async fn renew_work_item_lock(&self, token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        self.inner.renew_work_item_lock(token, extend_for).await
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.inner.read(instance).await
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        self.inner.read_with_execution(instance, execution_id).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances().await
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        self.inner.list_executions(instance).await
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        self.inner.get_instance_info(instance).await
    }
}
