use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::_typed_codec::{Codec, Json};
use crate::providers::{ExecutionStatus, Provider, ProviderError, WorkItem};
use crate::runtime::OrchestrationStatus;
use crate::{AppErrorKind, ErrorDetails, Event, EventKind};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

/// Errors surfaced by [`Client`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("timed out waiting for instance {instance} after {timeout:?}")]
    Timeout { instance: String, timeout: Duration },
    #[error("failed to encode input: {0}")]
    Encode(String),
    #[error("failed to decode output: {0}")]
    Decode(String),
    /// Returned by typed waits when the instance did not complete.
    #[error("instance {instance} did not complete: {status:?}")]
    NotCompleted {
        instance: String,
        status: OrchestrationStatus,
    },
}

/// Thin client for control-plane operations.
///
/// The client talks to the runtime only through the shared [`Provider`]:
/// starts and cancels are enqueued messages, and status is read from
/// the instance and execution rows.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Provider>,
}

impl Client {
    /// Create a client bound to a provider.
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    /// Start a new instance under a generated id and return that id.
    pub async fn schedule_new_orchestration(
        &self,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<String, ClientError> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.start_orchestration(&instance, orchestration, input).await?;
        Ok(instance)
    }

    /// Start an orchestration instance with string input.
    ///
    /// Starting an id that already exists is a no-op.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.enqueue_start(instance, orchestration, input.into(), None).await
    }

    /// Start an orchestration instance pinned to a specific version.
    pub async fn start_orchestration_versioned(
        &self,
        instance: &str,
        orchestration: &str,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.enqueue_start(instance, orchestration, input.into(), Some(version.into()))
            .await
    }

    /// Start an orchestration with typed input (serialized to JSON).
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Encode)?;
        self.enqueue_start(instance, orchestration, payload, None).await
    }

    async fn enqueue_start(
        &self,
        instance: &str,
        orchestration: &str,
        input: String,
        version: Option<String>,
    ) -> Result<(), ClientError> {
        debug!(instance_id = %instance, orchestration_name = %orchestration, "Enqueue start");
        let item = WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            input,
            version,
            parent_instance: None,
            parent_id: None,
            parent_execution_id: None,
        };
        self.store.enqueue_for_orchestrator(item, None).await?;
        Ok(())
    }

    /// Request cancellation. The instance terminates on its next turn and
    /// forwards the request to its running children.
    pub async fn cancel_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        let item = WorkItem::CancelInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        };
        self.store.enqueue_for_orchestrator(item, None).await?;
        Ok(())
    }

    /// Current status of the latest execution.
    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ClientError> {
        let Some(info) = self.store.get_instance_info(instance).await? else {
            return Ok(OrchestrationStatus::NotFound);
        };
        let output = info.output.unwrap_or_default();
        Ok(match info.status {
            ExecutionStatus::Running | ExecutionStatus::ContinuedAsNew => OrchestrationStatus::Running,
            ExecutionStatus::Completed => OrchestrationStatus::Completed { output },
            ExecutionStatus::Terminated => OrchestrationStatus::Terminated { reason: output },
            ExecutionStatus::Failed => {
                let history = self.store.read(instance).await?;
                let details = failure_details(&history).unwrap_or(ErrorDetails::Application {
                    kind: AppErrorKind::OrchestrationFailed,
                    message: output,
                    retryable: false,
                });
                OrchestrationStatus::Failed { details }
            }
        })
    }

    /// Poll until the instance is terminal or `timeout` elapses.
    ///
    /// Polling backs off from 5ms to 100ms.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, ClientError> {
        let deadline = Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let status = self.get_orchestration_status(instance).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout {
                    instance: instance.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }

    /// Wait for completion and decode the output.
    ///
    /// Failed or terminated instances come back as [`ClientError::NotCompleted`].
    pub async fn wait_for_orchestration_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Out, ClientError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => Json::decode(&output).map_err(ClientError::Decode),
            status => Err(ClientError::NotCompleted {
                instance: instance.to_string(),
                status,
            }),
        }
    }

    /// Every instance the store knows, including sub-orchestrations.
    pub async fn list_all_instances(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.store.list_instances().await?)
    }

    /// Execution ids of an instance, ascending.
    pub async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ClientError> {
        Ok(self.store.list_executions(instance).await?)
    }

    /// History of one execution. Empty once pruned.
    pub async fn read_execution_history(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ClientError> {
        Ok(self.store.read_with_execution(instance, execution_id).await?)
    }
}

fn failure_details(history: &[Event]) -> Option<ErrorDetails> {
    history.iter().rev().find_map(|e| match &e.kind {
        EventKind::OrchestrationFailed { details } => Some(details.clone()),
        _ => None,
    })
}
