use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{
    ExecutionMetadata, ExecutionStatus, InstanceInfo, OrchestrationItem, Provider, ProviderError, WorkItem,
};
use crate::Event;

struct OrchestratorMessage {
    id: u64,
    instance: String,
    item: WorkItem,
    visible_at: u64,
    lock_token: Option<String>,
}

struct WorkerMessage {
    id: u64,
    item: WorkItem,
    visible_at: u64,
    lock_token: Option<String>,
    locked_until: u64,
}

struct ExecutionRecord {
    status: ExecutionStatus,
    output: Option<String>,
    history: Vec<Event>,
}

struct InstanceRecord {
    orchestration_name: String,
    orchestration_version: Option<String>,
    current_execution_id: u64,
    parent_instance_id: Option<String>,
    executions: BTreeMap<u64, ExecutionRecord>,
}

struct InstanceLock {
    token: String,
    locked_until: u64,
}

#[derive(Default)]
struct State {
    next_message_id: u64,
    orchestrator_queue: Vec<OrchestratorMessage>,
    worker_queue: Vec<WorkerMessage>,
    instances: HashMap<String, InstanceRecord>,
    // insertion order for list_instances
    instance_order: Vec<String>,
    locks: HashMap<String, InstanceLock>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_message_id += 1;
        self.next_message_id
    }

    fn push_orchestrator(&mut self, item: WorkItem, visible_at: u64) -> Result<(), ProviderError> {
        let instance = item
            .orchestrator_instance()
            .ok_or_else(|| ProviderError::permanent("enqueue_for_orchestrator", "Invalid work item type"))?
            .to_string();
        let id = self.next_id();
        self.orchestrator_queue.push(OrchestratorMessage {
            id,
            instance,
            item,
            visible_at,
            lock_token: None,
        });
        Ok(())
    }

    fn push_worker(&mut self, item: WorkItem, visible_at: u64) {
        let id = self.next_id();
        self.worker_queue.push(WorkerMessage {
            id,
            item,
            visible_at,
            lock_token: None,
            locked_until: 0,
        });
    }

    fn instance_locked(&self, instance: &str, now: u64) -> bool {
        self.locks.get(instance).is_some_and(|l| l.locked_until > now)
    }

    fn instance_for_token(&self, token: &str) -> Option<String> {
        self.locks
            .iter()
            .find(|(_, lock)| lock.token == token)
            .map(|(instance, _)| instance.clone())
    }
}

fn lock_token() -> String {
    format!("lock_{}", uuid::Uuid::new_v4())
}

fn after(now: u64, d: Duration) -> u64 {
    now.saturating_add(d.as_millis().min(u64::MAX as u128) as u64)
}

/// Provider that keeps everything in process memory.
///
/// Same queue and locking semantics as [`SqliteProvider`](super::sqlite::SqliteProvider),
/// without durability. Used by tests and short-lived tools.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting on both queues, locked or not.
    pub async fn queue_depths(&self) -> (usize, usize) {
        let g = self.state.lock().await;
        (g.orchestrator_queue.len(), g.worker_queue.len())
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(OrchestrationItem, String)>, ProviderError> {
        let mut g = self.state.lock().await;
        let now = crate::now_millis();

        let Some(instance) = g
            .orchestrator_queue
            .iter()
            .filter(|m| m.visible_at <= now && !g.instance_locked(&m.instance, now))
            .min_by_key(|m| m.id)
            .map(|m| m.instance.clone())
        else {
            return Ok(None);
        };

        let token = lock_token();
        g.locks.insert(
            instance.clone(),
            InstanceLock {
                token: token.clone(),
                locked_until: after(now, lock_timeout),
            },
        );

        // Claim every visible message, including ones left behind by an expired lock
        let mut messages = Vec::new();
        for m in g.orchestrator_queue.iter_mut() {
            if m.instance == instance && m.visible_at <= now {
                m.lock_token = Some(token.clone());
                messages.push((m.id, m.item.clone()));
            }
        }
        messages.sort_by_key(|(id, _)| *id);
        let messages: Vec<WorkItem> = messages.into_iter().map(|(_, item)| item).collect();

        let item = match g.instances.get(&instance) {
            Some(record) => OrchestrationItem {
                instance: instance.clone(),
                orchestration_name: record.orchestration_name.clone(),
                execution_id: record.current_execution_id,
                version: record.orchestration_version.clone(),
                history: record
                    .executions
                    .get(&record.current_execution_id)
                    .map(|e| e.history.clone())
                    .unwrap_or_default(),
                messages,
            },
            None => {
                let (name, version) = messages
                    .iter()
                    .find_map(|m| match m {
                        WorkItem::StartOrchestration {
                            orchestration, version, ..
                        }
                        | WorkItem::ContinueAsNew {
                            orchestration, version, ..
                        } => Some((orchestration.clone(), version.clone())),
                        _ => None,
                    })
                    .unwrap_or_default();
                OrchestrationItem {
                    instance: instance.clone(),
                    orchestration_name: name,
                    execution_id: 1,
                    version,
                    history: Vec::new(),
                    messages,
                }
            }
        };

        tracing::debug!(
            target: "durable_research::providers::in_memory",
            instance = %instance,
            messages = item.messages.len(),
            history_len = item.history.len(),
            "Fetched orchestration item"
        );
        Ok(Some((item, token)))
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
        let mut g = self.state.lock().await;
        let now = crate::now_millis();

        let instance = g
            .instance_for_token(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "Invalid lock token"))?;
        if !g.instance_locked(&instance, now) {
            return Err(ProviderError::permanent("ack_orchestration_item", "Instance lock expired"));
        }

        // Validate before touching anything so a rejected ack leaves no trace
        if history_delta.iter().any(|e| e.event_id == 0) {
            return Err(ProviderError::permanent(
                "ack_orchestration_item",
                "event_id must be set by runtime",
            ));
        }
        if let Some(record) = g.instances.get(&instance)
            && let Some(exec) = record.executions.get(&execution_id)
            && let Some(dup) = history_delta
                .iter()
                .find(|e| exec.history.iter().any(|h| h.event_id == e.event_id))
        {
            return Err(ProviderError::permanent(
                "ack_orchestration_item",
                format!("Constraint violation: duplicate event_id {}", dup.event_id),
            ));
        }
        if orchestrator_items.iter().any(|i| i.orchestrator_instance().is_none()) {
            return Err(ProviderError::permanent("ack_orchestration_item", "Invalid work item type"));
        }

        g.orchestrator_queue
            .retain(|m| m.lock_token.as_deref() != Some(lock_token));

        let creates_instance = metadata.orchestration_name.is_some() || !history_delta.is_empty();
        if !g.instances.contains_key(&instance) && creates_instance {
            g.instance_order.push(instance.clone());
            g.instances.insert(
                instance.clone(),
                InstanceRecord {
                    orchestration_name: metadata.orchestration_name.clone().unwrap_or_default(),
                    orchestration_version: metadata.orchestration_version.clone(),
                    current_execution_id: execution_id,
                    parent_instance_id: metadata.parent_instance_id.clone(),
                    executions: BTreeMap::new(),
                },
            );
        }

        if let Some(record) = g.instances.get_mut(&instance) {
            if let Some(name) = &metadata.orchestration_name {
                record.orchestration_name = name.clone();
            }
            if let Some(version) = &metadata.orchestration_version {
                record.orchestration_version = Some(version.clone());
            }
            record.current_execution_id = record.current_execution_id.max(execution_id);

            let exec = record.executions.entry(execution_id).or_insert_with(|| ExecutionRecord {
                status: ExecutionStatus::Running,
                output: None,
                history: Vec::new(),
            });
            exec.history.extend(history_delta);
            if let Some(status) = metadata.status {
                exec.status = status;
                exec.output = metadata.output.clone();
            }

            if let Some(before) = metadata.prune_history_before {
                for (id, old) in record.executions.iter_mut() {
                    if *id < before {
                        old.history.clear();
                    }
                }
            }
        }

        for item in worker_items {
            g.push_worker(item, now);
        }
        for item in orchestrator_items {
            g.push_orchestrator(item, now)?;
        }

        g.locks.remove(&instance);
        tracing::debug!(
            target: "durable_research::providers::in_memory",
            instance = %instance,
            execution_id,
            "Acknowledged orchestration item and released lock"
        );
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let now = crate::now_millis();
        let instance = g
            .instance_for_token(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_orchestration_item", "Invalid lock token"))?;
        g.locks.remove(&instance);

        let visible_at = delay.map(|d| after(now, d));
        for m in g.orchestrator_queue.iter_mut().filter(|m| m.instance == instance) {
            m.lock_token = None;
            if let Some(at) = visible_at
                && m.visible_at <= now
            {
                m.visible_at = at;
            }
        }
        Ok(())
    }

    async fn enqueue_for_orchestrator(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let now = crate::now_millis();
        let visible_at = delay.map(|d| after(now, d)).unwrap_or(now);
        g.push_orchestrator(item, visible_at)
    }

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut g = self.state.lock().await;
        let now = crate::now_millis();
        let Some(msg) = g
            .worker_queue
            .iter_mut()
            .filter(|m| m.visible_at <= now && (m.lock_token.is_none() || m.locked_until <= now))
            .min_by_key(|m| m.id)
        else {
            return Ok(None);
        };
        let token = lock_token();
        msg.lock_token = Some(token.clone());
        msg.locked_until = after(now, lock_timeout);
        Ok(Some((msg.item.clone(), token)))
    }

    async fn ack_work_item(&self, token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if let Some(c) = &completion
            && !matches!(c, WorkItem::ActivityCompleted { .. } | WorkItem::ActivityFailed { .. })
        {
            return Err(ProviderError::permanent(
                "ack_work_item",
                "Invalid completion type for worker ack",
            ));
        }
        let before = g.worker_queue.len();
        g.worker_queue.retain(|m| m.lock_token.as_deref() != Some(token));
        if g.worker_queue.len() == before {
            return Err(ProviderError::permanent("ack_work_item", "Invalid lock token or already acked"));
        }
        if let Some(c) = completion {
            let now = crate::now_millis();
            g.push_orchestrator(c, now)?;
        }
        Ok(())
    }

    async fn abandon_work_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let now = crate::now_millis();
        let msg = g
            .worker_queue
            .iter_mut()
            .find(|m| m.lock_token.as_deref() == Some(token))
            .ok_or_else(|| ProviderError::permanent("abandon_work_item", "Invalid lock token or already acked"))?;
        msg.lock_token = None;
        msg.locked_until = 0;
        msg.visible_at = delay.map(|d| after(now, d)).unwrap_or(now);
        Ok(())
    }

    async fn renew_work_item_lock(&self, token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let now = crate::now_millis();
        let msg = g
            .worker_queue
            .iter_mut()
            .find(|m| m.lock_token.as_deref() == Some(token) && m.locked_until > now)
            .ok_or_else(|| ProviderError::permanent("renew_work_item_lock", "Lock token invalid or expired"))?;
        msg.locked_until = after(now, extend_for);
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.instances
            .get(instance)
            .and_then(|r| r.executions.values().next_back())
            .map(|e| e.history.clone())
            .unwrap_or_default())
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.instances
            .get(instance)
            .and_then(|r| r.executions.get(&execution_id))
            .map(|e| e.history.clone())
            .unwrap_or_default())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.state.lock().await.instance_order.clone())
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.instances
            .get(instance)
            .map(|r| r.executions.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.instances.get(instance).map(|r| {
            let current = r.executions.get(&r.current_execution_id);
            InstanceInfo {
                instance_id: instance.to_string(),
                orchestration_name: r.orchestration_name.clone(),
                orchestration_version: r.orchestration_version.clone(),
                current_execution_id: r.current_execution_id,
                status: current.map(|e| e.status).unwrap_or(ExecutionStatus::Running),
                output: current.and_then(|e| e.output.clone()),
                parent_instance_id: r.parent_instance_id.clone(),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventKind, RetryPolicy};

    fn start(instance: &str) -> WorkItem {
        WorkItem::StartOrchestration {
            instance: instance.into(),
            orchestration: "Orch".into(),
            input: "in".into(),
            version: None,
            parent_instance: None,
            parent_id: None,
            parent_execution_id: None,
        }
    }

    fn started(instance: &str, execution_id: u64) -> Event {
        Event::with_event_id(
            1,
            instance,
            execution_id,
            None,
            EventKind::OrchestrationStarted {
                name: "Orch".into(),
                version: "1.0.0".into(),
                input: "in".into(),
                parent_instance: None,
                parent_id: None,
                parent_execution_id: None,
            },
        )
    }

    fn first_turn_metadata() -> ExecutionMetadata {
        ExecutionMetadata {
            status: Some(ExecutionStatus::Running),
            orchestration_name: Some("Orch".into()),
            orchestration_version: Some("1.0.0".into()),
            ..Default::default()
        }
    }

    const LOCK: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn fetch_locks_instance_until_ack() {
        let store = InMemoryProvider::new();
        store.enqueue_for_orchestrator(start("a"), None).await.unwrap();

        let (item, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert_eq!(item.instance, "a");
        assert_eq!(item.orchestration_name, "Orch");
        assert_eq!(item.execution_id, 1);
        assert!(item.history.is_empty());

        // New message for the locked instance stays invisible until the ack
        store
            .enqueue_for_orchestrator(
                WorkItem::CancelInstance {
                    instance: "a".into(),
                    reason: "r".into(),
                },
                None,
            )
            .await
            .unwrap();
        assert!(store.fetch_orchestration_item(LOCK).await.unwrap().is_none());

        store
            .ack_orchestration_item(&token, 1, vec![started("a", 1)], vec![], vec![], first_turn_metadata())
            .await
            .unwrap();

        let (item, _) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert_eq!(item.history.len(), 1);
        assert!(matches!(item.messages[..], [WorkItem::CancelInstance { .. }]));
    }

    #[tokio::test]
    async fn abandon_makes_messages_visible_again() {
        let store = InMemoryProvider::new();
        store.enqueue_for_orchestrator(start("a"), None).await.unwrap();
        let (_, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        store.abandon_orchestration_item(&token, None).await.unwrap();

        let (item, token2) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert_ne!(token, token2);
        assert_eq!(item.messages.len(), 1);

        // Stale token cannot ack
        let err = store
            .ack_orchestration_item(&token, 1, vec![], vec![], vec![], ExecutionMetadata::default())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn expired_lock_is_taken_over() {
        let store = InMemoryProvider::new();
        store.enqueue_for_orchestrator(start("a"), None).await.unwrap();
        let (_, stale) = store
            .fetch_orchestration_item(Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (item, fresh) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert_eq!(item.messages.len(), 1);
        assert!(
            store
                .ack_orchestration_item(&stale, 1, vec![], vec![], vec![], ExecutionMetadata::default())
                .await
                .is_err()
        );
        store
            .ack_orchestration_item(&fresh, 1, vec![started("a", 1)], vec![], vec![], first_turn_metadata())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ack_enqueues_worker_items_and_worker_ack_routes_completion() {
        let store = InMemoryProvider::new();
        store.enqueue_for_orchestrator(start("a"), None).await.unwrap();
        let (_, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        let exec = WorkItem::ActivityExecute {
            instance: "a".into(),
            execution_id: 1,
            id: 2,
            orchestration: "Orch".into(),
            name: "A".into(),
            input: "x".into(),
            retry: RetryPolicy::default(),
        };
        store
            .ack_orchestration_item(
                &token,
                1,
                vec![started("a", 1)],
                vec![exec.clone()],
                vec![],
                first_turn_metadata(),
            )
            .await
            .unwrap();

        let (item, wtoken) = store.fetch_work_item(LOCK).await.unwrap().unwrap();
        assert_eq!(item, exec);
        assert!(store.fetch_work_item(LOCK).await.unwrap().is_none());
        store.renew_work_item_lock(&wtoken, LOCK).await.unwrap();

        store
            .ack_work_item(
                &wtoken,
                Some(WorkItem::ActivityCompleted {
                    instance: "a".into(),
                    execution_id: 1,
                    id: 2,
                    result: "r".into(),
                    attempts: 1,
                }),
            )
            .await
            .unwrap();
        assert!(store.ack_work_item(&wtoken, None).await.is_err());

        let (item, _) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert!(matches!(item.messages[..], [WorkItem::ActivityCompleted { id: 2, .. }]));
    }

    #[tokio::test]
    async fn multi_execution_and_pruning() {
        let store = InMemoryProvider::new();
        store.enqueue_for_orchestrator(start("a"), None).await.unwrap();
        let (_, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        let can = Event::with_event_id(
            2,
            "a",
            1,
            None,
            EventKind::OrchestrationContinuedAsNew { input: "next".into() },
        );
        store
            .ack_orchestration_item(
                &token,
                1,
                vec![started("a", 1), can],
                vec![],
                vec![WorkItem::ContinueAsNew {
                    instance: "a".into(),
                    orchestration: "Orch".into(),
                    input: "next".into(),
                    version: None,
                }],
                ExecutionMetadata {
                    status: Some(ExecutionStatus::ContinuedAsNew),
                    ..first_turn_metadata()
                },
            )
            .await
            .unwrap();

        let (item, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert_eq!(item.execution_id, 1);
        assert_eq!(item.history.len(), 2);
        store
            .ack_orchestration_item(
                &token,
                2,
                vec![started("a", 2)],
                vec![],
                vec![],
                ExecutionMetadata {
                    status: Some(ExecutionStatus::Running),
                    prune_history_before: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(store.list_executions("a").await.unwrap(), vec![1, 2]);
        assert!(store.read_with_execution("a", 1).await.unwrap().is_empty());
        assert_eq!(store.read("a").await.unwrap().len(), 1);
        let info = store.get_instance_info("a").await.unwrap().unwrap();
        assert_eq!(info.current_execution_id, 2);
        assert_eq!(info.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_rejected_atomically() {
        let store = InMemoryProvider::new();
        store.enqueue_for_orchestrator(start("a"), None).await.unwrap();
        let (_, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        store
            .ack_orchestration_item(&token, 1, vec![started("a", 1)], vec![], vec![], first_turn_metadata())
            .await
            .unwrap();

        store.enqueue_for_orchestrator(start("a"), None).await.unwrap();
        let (_, token) = store.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        let err = store
            .ack_orchestration_item(&token, 1, vec![started("a", 1)], vec![], vec![], ExecutionMetadata::default())
            .await
            .unwrap_err();
        assert!(err.message.contains("duplicate"));
        // Messages are still queued for a retry
        assert_eq!(store.queue_depths().await, (1, 0));
    }
}
