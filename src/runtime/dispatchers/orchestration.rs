//! Orchestration dispatcher implementation for Runtime
//!
//! Each dispatcher task loops over:
//! 1. fetch a locked `OrchestrationItem` (history + pending messages),
//! 2. decide which execution the batch belongs to and replay one turn,
//! 3. commit history delta, status and outgoing work in a single ack.

use super::AbortOnDrop;
use crate::providers::{ExecutionMetadata, ExecutionStatus, OrchestrationItem, WorkItem};
use crate::runtime::replay_engine::{ReplayEngine, TurnResult};
use crate::runtime::Runtime;
use crate::{Action, AppErrorKind, ConfigErrorKind, ErrorDetails, Event, EventKind};
use semver::Version;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Parent waiting on this instance as a sub-orchestration.
#[derive(Debug, Clone)]
struct ParentLink {
    instance: String,
    execution_id: u64,
    id: u64,
}

/// Identity of a running execution, read from its `OrchestrationStarted` event.
#[derive(Debug, Clone)]
struct ExecutionInfo {
    name: String,
    version: String,
    input: String,
    parent: Option<ParentLink>,
}

impl ExecutionInfo {
    fn from_history(history: &[Event]) -> Option<Self> {
        history.iter().find_map(|e| match &e.kind {
            EventKind::OrchestrationStarted {
                name,
                version,
                input,
                parent_instance,
                parent_id,
                parent_execution_id,
            } => Some(Self {
                name: name.clone(),
                version: version.clone(),
                input: input.clone(),
                parent: parent_link(parent_instance.clone(), *parent_id, *parent_execution_id),
            }),
            _ => None,
        })
    }
}

fn parent_link(instance: Option<String>, id: Option<u64>, execution_id: Option<u64>) -> Option<ParentLink> {
    Some(ParentLink {
        instance: instance?,
        id: id?,
        // Children started before the execution id was tracked answer execution 1
        execution_id: execution_id.unwrap_or(1),
    })
}

/// Everything one turn commits in a single ack.
#[derive(Debug)]
struct TurnCommit {
    execution_id: u64,
    history_delta: Vec<Event>,
    worker_items: Vec<WorkItem>,
    orchestrator_items: Vec<WorkItem>,
    metadata: ExecutionMetadata,
}

impl TurnCommit {
    /// Consume the batch without changing the instance.
    fn drop_batch(execution_id: u64) -> Self {
        Self {
            execution_id,
            history_delta: Vec::new(),
            worker_items: Vec::new(),
            orchestrator_items: Vec::new(),
            metadata: ExecutionMetadata::default(),
        }
    }
}

/// How a new execution came to be.
struct NewExecution {
    instance: String,
    execution_id: u64,
    name: String,
    input: String,
    requested_version: Option<String>,
    parent: Option<ParentLink>,
    continued: bool,
}

impl Runtime {
    /// Start the orchestration dispatcher with N concurrent workers
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        // Instance-level locking in the provider keeps one worker per instance
        let concurrency = self.options.orchestration_concurrency.max(1);

        tokio::spawn(async move {
            let mut worker_handles = Vec::with_capacity(concurrency);
            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let worker_id = format!("orch-{worker_idx}-{}", rt.runtime_id);
                worker_handles.push(AbortOnDrop(tokio::spawn(async move {
                    while !rt.shutdown_flag.load(Ordering::Relaxed) {
                        match rt
                            .history_store
                            .fetch_orchestration_item(rt.options.orchestrator_lock_timeout)
                            .await
                        {
                            Ok(Some((item, lock_token))) => {
                                rt.process_orchestration_item(item, &lock_token, &worker_id).await;
                            }
                            Ok(None) => tokio::time::sleep(rt.options.dispatcher_idle_sleep).await,
                            Err(e) => {
                                warn!(worker_id = %worker_id, error = %e, "Error fetching orchestration item");
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

    async fn process_orchestration_item(self: &Arc<Self>, item: OrchestrationItem, lock_token: &str, worker_id: &str) {
        let instance = item.instance.clone();
        debug!(
            instance_id = %instance,
            execution_id = item.execution_id,
            worker_id = %worker_id,
            messages = item.messages.len(),
            history_len = item.history.len(),
            "Processing orchestration item"
        );

        let commit = self.plan_turn(item);

        debug!(
            instance_id = %instance,
            execution_id = commit.execution_id,
            history_delta = commit.history_delta.len(),
            worker_items = commit.worker_items.len(),
            orchestrator_items = commit.orchestrator_items.len(),
            "Acking orchestration item"
        );

        let acked = self
            .execute_with_retry(
                || {
                    let store = Arc::clone(&self.history_store);
                    let token = lock_token.to_string();
                    let execution_id = commit.execution_id;
                    let history_delta = commit.history_delta.clone();
                    let worker_items = commit.worker_items.clone();
                    let orchestrator_items = commit.orchestrator_items.clone();
                    let metadata = commit.metadata.clone();
                    async move {
                        store
                            .ack_orchestration_item(
                                &token,
                                execution_id,
                                history_delta,
                                worker_items,
                                orchestrator_items,
                                metadata,
                            )
                            .await
                    }
                },
                "ack_orchestration_item",
            )
            .await;

        if let Err(e) = acked {
            // Nothing was committed; the same turn runs again from the same history
            warn!(instance_id = %instance, worker_id = %worker_id, error = %e, "Abandoning orchestration item");
            if let Err(e) = self
                .history_store
                .abandon_orchestration_item(lock_token, Some(Duration::from_millis(50)))
                .await
            {
                warn!(instance_id = %instance, error = %e, "Failed to abandon orchestration item");
            }
        }
    }

    /// Decide what this batch means for the instance and compute the commit.
    fn plan_turn(&self, item: OrchestrationItem) -> TurnCommit {
        let OrchestrationItem {
            instance,
            execution_id,
            history,
            messages,
            ..
        } = item;

        if let Some(last) = history.last().filter(|e| e.is_terminal()) {
            let continue_as_new = messages.iter().find_map(|m| match m {
                WorkItem::ContinueAsNew {
                    orchestration,
                    input,
                    version,
                    ..
                } => Some((orchestration.clone(), input.clone(), version.clone())),
                _ => None,
            });
            return match (&last.kind, continue_as_new) {
                (EventKind::OrchestrationContinuedAsNew { .. }, Some((name, input, requested_version))) => {
                    let parent = ExecutionInfo::from_history(&history).and_then(|info| info.parent);
                    self.start_execution(
                        NewExecution {
                            instance,
                            execution_id: execution_id + 1,
                            name,
                            input,
                            requested_version,
                            parent,
                            continued: true,
                        },
                        messages,
                    )
                }
                _ => {
                    debug!(
                        instance_id = %instance,
                        execution_id,
                        dropped = messages.len(),
                        "Instance is terminal; dropping messages"
                    );
                    TurnCommit::drop_batch(execution_id)
                }
            };
        }

        if history.is_empty() {
            let start = messages.iter().find_map(|m| match m {
                WorkItem::StartOrchestration {
                    orchestration,
                    input,
                    version,
                    parent_instance,
                    parent_id,
                    parent_execution_id,
                    ..
                } => Some(NewExecution {
                    instance: instance.clone(),
                    execution_id,
                    name: orchestration.clone(),
                    input: input.clone(),
                    requested_version: version.clone(),
                    parent: parent_link(parent_instance.clone(), *parent_id, *parent_execution_id),
                    continued: false,
                }),
                _ => None,
            });
            return match start {
                Some(start) => self.start_execution(start, messages),
                None => {
                    warn!(
                        instance_id = %instance,
                        dropped = messages.len(),
                        "No start message for unknown instance; dropping messages"
                    );
                    TurnCommit::drop_batch(execution_id)
                }
            };
        }

        let Some(info) = ExecutionInfo::from_history(&history) else {
            warn!(instance_id = %instance, execution_id, "History has no OrchestrationStarted; dropping messages");
            return TurnCommit::drop_batch(execution_id);
        };

        // Replay always runs the version pinned at start
        let handler = Version::parse(&info.version)
            .ok()
            .and_then(|v| self.orchestration_registry.resolve_handler_exact(&info.name, &v));

        let mut engine = ReplayEngine::new(instance, execution_id, history);
        engine.prep_completions(messages);
        let result = match handler {
            Some(handler) => engine.execute_orchestration(handler, info.input.clone()),
            None => TurnResult::Failed(unregistered_orchestration(&info.name)),
        };
        self.finish_turn(engine, result, &info, ExecutionMetadata::default())
    }

    fn start_execution(&self, start: NewExecution, messages: Vec<WorkItem>) -> TurnCommit {
        let resolved = match &start.requested_version {
            Some(v) => Version::parse(v).ok().and_then(|version| {
                self.orchestration_registry
                    .resolve_handler_exact(&start.name, &version)
                    .map(|h| (version, h))
            }),
            None => self.orchestration_registry.resolve_handler(&start.name),
        };
        let version = resolved
            .as_ref()
            .map(|(v, _)| v.to_string())
            .unwrap_or_else(|| "0.0.0".to_string());

        let parent = start.parent.clone();
        let started = EventKind::OrchestrationStarted {
            name: start.name.clone(),
            version: version.clone(),
            input: start.input.clone(),
            parent_instance: parent.as_ref().map(|p| p.instance.clone()),
            parent_id: parent.as_ref().map(|p| p.id),
            parent_execution_id: parent.as_ref().map(|p| p.execution_id),
        };

        info!(
            instance_id = %start.instance,
            execution_id = start.execution_id,
            orchestration_name = %start.name,
            orchestration_version = %version,
            continued_as_new = start.continued,
            "Starting execution"
        );

        let metadata = ExecutionMetadata {
            status: Some(ExecutionStatus::Running),
            output: None,
            orchestration_name: Some(start.name.clone()),
            orchestration_version: Some(version.clone()),
            parent_instance_id: parent.as_ref().map(|p| p.instance.clone()),
            prune_history_before: (start.continued && self.options.prune_continued_executions)
                .then_some(start.execution_id),
        };
        let info = ExecutionInfo {
            name: start.name.clone(),
            version,
            input: start.input.clone(),
            parent,
        };

        let mut engine = ReplayEngine::start_execution(start.instance, start.execution_id, started);
        engine.prep_completions(messages);
        let result = match resolved {
            Some((_, handler)) => engine.execute_orchestration(handler, start.input),
            None => TurnResult::Failed(unregistered_orchestration(&start.name)),
        };
        self.finish_turn(engine, result, &info, metadata)
    }

    /// Turn the result of a turn into history, status and outgoing work.
    fn finish_turn(
        &self,
        mut engine: ReplayEngine,
        result: TurnResult,
        info: &ExecutionInfo,
        mut metadata: ExecutionMetadata,
    ) -> TurnCommit {
        let instance = engine.instance.clone();
        let execution_id = engine.execution_id;
        let mut worker_items = Vec::new();
        let mut orchestrator_items = Vec::new();

        match result {
            TurnResult::Continue => {
                for action in engine.pending_actions().to_vec() {
                    match action {
                        Action::CallActivity {
                            scheduling_event_id,
                            name,
                            input,
                            retry,
                        } => worker_items.push(WorkItem::ActivityExecute {
                            instance: instance.clone(),
                            execution_id,
                            id: scheduling_event_id,
                            orchestration: info.name.clone(),
                            name,
                            input,
                            retry,
                        }),
                        Action::StartSubOrchestration {
                            scheduling_event_id,
                            name,
                            version,
                            instance: child,
                            input,
                        } => orchestrator_items.push(WorkItem::StartOrchestration {
                            instance: child,
                            orchestration: name,
                            input,
                            version,
                            parent_instance: Some(instance.clone()),
                            parent_id: Some(scheduling_event_id),
                            parent_execution_id: Some(execution_id),
                        }),
                        Action::ContinueAsNew { .. } => {}
                    }
                }
            }
            TurnResult::Completed(output) => {
                info!(instance_id = %instance, execution_id, orchestration_name = %info.name, "Orchestration completed");
                engine.append(EventKind::OrchestrationCompleted { output: output.clone() });
                metadata.status = Some(ExecutionStatus::Completed);
                metadata.output = Some(output.clone());
                if let Some(parent) = &info.parent {
                    orchestrator_items.push(WorkItem::SubOrchCompleted {
                        parent_instance: parent.instance.clone(),
                        parent_execution_id: parent.execution_id,
                        parent_id: parent.id,
                        result: output,
                    });
                }
            }
            TurnResult::Failed(details) => {
                warn!(
                    instance_id = %instance,
                    execution_id,
                    orchestration_name = %info.name,
                    error_category = details.category(),
                    error = %details,
                    "Orchestration failed"
                );
                engine.append(EventKind::OrchestrationFailed {
                    details: details.clone(),
                });
                metadata.status = Some(ExecutionStatus::Failed);
                metadata.output = Some(details.display_message());
                if let Some(parent) = &info.parent {
                    orchestrator_items.push(WorkItem::SubOrchFailed {
                        parent_instance: parent.instance.clone(),
                        parent_execution_id: parent.execution_id,
                        parent_id: parent.id,
                        details,
                    });
                }
            }
            TurnResult::ContinueAsNew { input, version } => {
                info!(instance_id = %instance, execution_id, orchestration_name = %info.name, "Orchestration continued as new");
                engine.append(EventKind::OrchestrationContinuedAsNew { input: input.clone() });
                metadata.status = Some(ExecutionStatus::ContinuedAsNew);
                metadata.output = Some(input.clone());
                orchestrator_items.push(WorkItem::ContinueAsNew {
                    instance: instance.clone(),
                    orchestration: info.name.clone(),
                    input,
                    version,
                });
            }
            TurnResult::Cancelled(reason) => {
                info!(instance_id = %instance, execution_id, reason = %reason, "Orchestration terminated");
                for child in engine.open_children() {
                    orchestrator_items.push(WorkItem::CancelInstance {
                        instance: child,
                        reason: format!("parent canceled: {reason}"),
                    });
                }
                engine.append(EventKind::OrchestrationTerminated { reason: reason.clone() });
                metadata.status = Some(ExecutionStatus::Terminated);
                metadata.output = Some(reason.clone());
                if let Some(parent) = &info.parent {
                    orchestrator_items.push(WorkItem::SubOrchFailed {
                        parent_instance: parent.instance.clone(),
                        parent_execution_id: parent.execution_id,
                        parent_id: parent.id,
                        details: ErrorDetails::Application {
                            kind: AppErrorKind::Cancelled,
                            message: reason,
                            retryable: false,
                        },
                    });
                }
            }
        }

        TurnCommit {
            execution_id,
            history_delta: engine.into_delta(),
            worker_items,
            orchestrator_items,
            metadata,
        }
    }
}

fn unregistered_orchestration(name: &str) -> ErrorDetails {
    ErrorDetails::Configuration {
        kind: ConfigErrorKind::UnregisteredOrchestration,
        resource: name.to_string(),
        message: None,
    }
}
