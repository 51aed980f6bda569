//! Storage abstraction for orchestration history and the two work queues.
//!
//! A provider owns three things:
//! - the append-only history of every execution of every instance,
//! - the orchestrator queue (messages addressed to an instance),
//! - the worker queue (activity executions).
//!
//! Both queues use peek-lock semantics. A fetched item stays invisible to
//! other dispatchers until it is acked, abandoned, or its lock expires. The
//! orchestrator side additionally locks the whole instance so only one
//! dispatcher runs a turn for it at a time.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ErrorDetails, Event, RetryPolicy};

pub mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::ProviderError;

/// Messages carried by the orchestrator and worker queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
        version: Option<String>,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
        parent_execution_id: Option<u64>,
    },
    /// Worker queue only.
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        orchestration: String,
        name: String,
        input: String,
        retry: RetryPolicy,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
        attempts: u32,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: ErrorDetails,
        attempts: u32,
    },
    SubOrchCompleted {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        details: ErrorDetails,
    },
    CancelInstance {
        instance: String,
        reason: String,
    },
    ContinueAsNew {
        instance: String,
        orchestration: String,
        input: String,
        version: Option<String>,
    },
}

impl WorkItem {
    /// Instance whose orchestrator queue this item belongs to.
    ///
    /// `None` for worker-queue items.
    pub fn orchestrator_instance(&self) -> Option<&str> {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::CancelInstance { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. } => Some(instance),
            WorkItem::SubOrchCompleted { parent_instance, .. } | WorkItem::SubOrchFailed { parent_instance, .. } => {
                Some(parent_instance)
            }
            WorkItem::ActivityExecute { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::SubOrchCompleted { .. } => "SubOrchCompleted",
            WorkItem::SubOrchFailed { .. } => "SubOrchFailed",
            WorkItem::CancelInstance { .. } => "CancelInstance",
            WorkItem::ContinueAsNew { .. } => "ContinueAsNew",
        }
    }
}

/// Everything a dispatcher needs to run one turn of an instance.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    /// Empty when the instance has no history and no start message in the batch.
    pub orchestration_name: String,
    /// Current execution. `1` for instances that do not exist yet.
    pub execution_id: u64,
    pub version: Option<String>,
    /// History of the current execution.
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
}

/// Lifecycle state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    ContinuedAsNew,
    Terminated,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::ContinuedAsNew => "ContinuedAsNew",
            ExecutionStatus::Terminated => "Terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Running" => Ok(ExecutionStatus::Running),
            "Completed" => Ok(ExecutionStatus::Completed),
            "Failed" => Ok(ExecutionStatus::Failed),
            "ContinuedAsNew" => Ok(ExecutionStatus::ContinuedAsNew),
            "Terminated" => Ok(ExecutionStatus::Terminated),
            other => Err(ProviderError::permanent(
                "parse_status",
                format!("unknown execution status '{other}'"),
            )),
        }
    }
}

/// Facts the runtime computed about a turn, stored next to the history.
///
/// Providers never inspect event payloads; whatever they need to answer
/// status queries comes through here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionMetadata {
    /// New status for the acked execution, if it changed.
    pub status: Option<ExecutionStatus>,
    pub output: Option<String>,
    /// Set on the first turn of an instance.
    pub orchestration_name: Option<String>,
    pub orchestration_version: Option<String>,
    pub parent_instance_id: Option<String>,
    /// Delete history of every execution below this id.
    pub prune_history_before: Option<u64>,
}

/// Summary of one instance and its current execution.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub orchestration_name: String,
    pub orchestration_version: Option<String>,
    pub current_execution_id: u64,
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub parent_instance_id: Option<String>,
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Lock the next instance with visible messages and return its batch.
    ///
    /// Returns the item and a lock token. `None` when nothing is ready.
    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(OrchestrationItem, String)>, ProviderError>;

    /// Commit a turn atomically: append history, update execution metadata,
    /// enqueue follow-up work, delete the fetched messages and release the lock.
    ///
    /// Fails without side effects when the lock expired or was taken over.
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError>;

    /// Release the instance lock and make the batch visible again after `delay`.
    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    async fn enqueue_for_orchestrator(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError>;

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Delete a worker item and, in the same transaction, enqueue its completion.
    async fn ack_work_item(&self, token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError>;

    async fn abandon_work_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    async fn renew_work_item_lock(&self, token: &str, extend_for: Duration) -> Result<(), ProviderError>;

    /// History of the latest execution. Empty for unknown instances.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Execution ids known for an instance, ascending.
    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError>;

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_route_to_the_awaiting_instance() {
        let done = WorkItem::SubOrchCompleted {
            parent_instance: "parent".into(),
            parent_execution_id: 1,
            parent_id: 4,
            result: "ok".into(),
        };
        assert_eq!(done.orchestrator_instance(), Some("parent"));

        let exec = WorkItem::ActivityExecute {
            instance: "i".into(),
            execution_id: 1,
            id: 2,
            orchestration: "O".into(),
            name: "A".into(),
            input: String::new(),
            retry: RetryPolicy::default(),
        };
        assert_eq!(exec.orchestrator_instance(), None);
        assert_eq!(exec.kind(), "ActivityExecute");
    }

    #[test]
    fn status_strings_parse_back() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::ContinuedAsNew,
            ExecutionStatus::Terminated,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!("Paused".parse::<ExecutionStatus>().is_err());
        assert!(!ExecutionStatus::Running.is_terminal());
    }
}
