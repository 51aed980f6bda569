use crate::providers::WorkItem;
use crate::runtime::OrchestrationHandler;
use crate::{Action, AppErrorKind, ConfigErrorKind, ErrorDetails, Event, EventKind};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of executing an orchestration turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResult {
    /// Orchestration is waiting on scheduled work
    Continue,
    Completed(String),
    Failed(ErrorDetails),
    /// Takes precedence over any output produced in the same turn
    ContinueAsNew { input: String, version: Option<String> },
    Cancelled(String),
}

fn nondeterminism(message: String) -> ErrorDetails {
    ErrorDetails::Configuration {
        kind: ConfigErrorKind::Nondeterminism,
        resource: String::new(),
        message: Some(message),
    }
}

/// Replays history and executes one deterministic orchestration evaluation.
pub struct ReplayEngine {
    pub(crate) instance: String,
    pub(crate) execution_id: u64,
    /// History persisted before this turn
    pub(crate) baseline_history: Vec<Event>,
    /// Events produced by this turn, not yet persisted
    pub(crate) history_delta: Vec<Event>,
    /// Actions to dispatch once the turn is persisted
    pub(crate) pending_actions: Vec<Action>,
    pub(crate) next_event_id: u64,
    /// First system-level error seen; fails the turn before user code runs
    pub(crate) abort_error: Option<ErrorDetails>,
}

impl ReplayEngine {
    pub fn new(instance: String, execution_id: u64, baseline_history: Vec<Event>) -> Self {
        let next_event_id = baseline_history.last().map(|e| e.event_id() + 1).unwrap_or(1);
        Self {
            instance,
            execution_id,
            baseline_history,
            history_delta: Vec::new(),
            pending_actions: Vec::new(),
            next_event_id,
            abort_error: None,
        }
    }

    /// Engine for a brand new execution whose first event is `started`.
    pub fn start_execution(instance: String, execution_id: u64, started: EventKind) -> Self {
        let mut engine = Self::new(instance, execution_id, Vec::new());
        engine.push_event(None, started);
        engine
    }

    fn push_event(&mut self, source_event_id: Option<u64>, kind: EventKind) {
        let event = Event::with_event_id(
            self.next_event_id,
            self.instance.clone(),
            self.execution_id,
            source_event_id,
            kind,
        );
        self.next_event_id += 1;
        self.history_delta.push(event);
    }

    fn all_events(&self) -> impl Iterator<Item = &Event> {
        self.baseline_history.iter().chain(self.history_delta.iter())
    }

    fn scheduled_kind(&self, id: u64) -> Option<&'static str> {
        self.all_events().find(|e| e.event_id == id).and_then(|e| match e.kind {
            EventKind::ActivityScheduled { .. } => Some("activity"),
            EventKind::SubOrchestrationScheduled { .. } => Some("sub-orchestration"),
            _ => None,
        })
    }

    fn has_completion_for(&self, id: u64) -> bool {
        self.all_events().any(|e| {
            e.source_event_id == Some(id)
                && matches!(
                    e.kind,
                    EventKind::ActivityCompleted { .. }
                        | EventKind::ActivityFailed { .. }
                        | EventKind::SubOrchestrationCompleted { .. }
                        | EventKind::SubOrchestrationFailed { .. }
                )
        })
    }

    /// Check a completion against the schedule it answers. `false` drops it.
    fn accept_completion(&mut self, execution_id: u64, id: u64, expected: &'static str) -> bool {
        if execution_id != self.execution_id {
            warn!(
                instance = %self.instance,
                completion_execution_id = execution_id,
                current_execution_id = self.execution_id,
                "ignoring completion from a different execution"
            );
            return false;
        }
        if self.has_completion_for(id) {
            warn!(instance = %self.instance, id, "ignoring duplicate completion");
            return false;
        }
        match self.scheduled_kind(id) {
            Some(kind) if kind == expected => true,
            Some(kind) => {
                let err = nondeterminism(format!(
                    "completion kind mismatch for id={id}, expected '{kind}', got '{expected}'"
                ));
                warn!(instance = %self.instance, error = %err, "detected nondeterminism in completion batch");
                self.abort_error.get_or_insert(err);
                false
            }
            None => {
                let err = nondeterminism(format!("no matching schedule for {expected} completion id={id}"));
                warn!(instance = %self.instance, error = %err, "detected nondeterminism in completion batch");
                self.abort_error.get_or_insert(err);
                false
            }
        }
    }

    /// Record a system error carried by a completion. Application errors flow to user code.
    fn note_system_error(&mut self, details: &ErrorDetails) {
        if matches!(
            details,
            ErrorDetails::Configuration { .. } | ErrorDetails::Infrastructure { .. }
        ) {
            warn!(instance = %self.instance, error = %details, "system error aborts turn");
            self.abort_error.get_or_insert_with(|| details.clone());
        }
    }

    /// Stage 1: turn completion messages into history events.
    ///
    /// Start and continue-as-new messages are handled by the dispatcher and
    /// skipped here.
    pub fn prep_completions(&mut self, messages: Vec<WorkItem>) {
        debug!(instance = %self.instance, message_count = messages.len(), "converting messages to events");

        for msg in messages {
            match msg {
                WorkItem::ActivityCompleted {
                    execution_id,
                    id,
                    result,
                    attempts,
                    ..
                } => {
                    if self.accept_completion(execution_id, id, "activity") {
                        self.push_event(Some(id), EventKind::ActivityCompleted { result, attempts });
                    }
                }
                WorkItem::ActivityFailed {
                    execution_id,
                    id,
                    details,
                    attempts,
                    ..
                } => {
                    if self.accept_completion(execution_id, id, "activity") {
                        self.note_system_error(&details);
                        self.push_event(Some(id), EventKind::ActivityFailed { details, attempts });
                    }
                }
                WorkItem::SubOrchCompleted {
                    parent_execution_id,
                    parent_id,
                    result,
                    ..
                } => {
                    if self.accept_completion(parent_execution_id, parent_id, "sub-orchestration") {
                        self.push_event(Some(parent_id), EventKind::SubOrchestrationCompleted { result });
                    }
                }
                WorkItem::SubOrchFailed {
                    parent_execution_id,
                    parent_id,
                    details,
                    ..
                } => {
                    if self.accept_completion(parent_execution_id, parent_id, "sub-orchestration") {
                        self.note_system_error(&details);
                        self.push_event(Some(parent_id), EventKind::SubOrchestrationFailed { details });
                    }
                }
                WorkItem::CancelInstance { reason, .. } => {
                    let already = self
                        .all_events()
                        .any(|e| matches!(e.kind, EventKind::OrchestrationCancelRequested { .. }));
                    if !already {
                        self.push_event(None, EventKind::OrchestrationCancelRequested { reason });
                    }
                }
                WorkItem::StartOrchestration { .. } | WorkItem::ContinueAsNew { .. } => {}
                WorkItem::ActivityExecute { .. } => {
                    warn!(instance = %self.instance, "worker item on orchestrator queue ignored");
                }
            }
        }
    }

    /// Number of completions persisted before this turn.
    pub fn turn_index(&self) -> u64 {
        self.baseline_history
            .iter()
            .filter(|e| e.source_event_id.is_some())
            .count() as u64
    }

    /// Input of the running execution.
    pub fn input(&self) -> Option<String> {
        self.all_events().find_map(|e| match &e.kind {
            EventKind::OrchestrationStarted { input, .. } => Some(input.clone()),
            _ => None,
        })
    }

    /// Stage 2: run one turn of the orchestration over baseline + completions.
    pub fn execute_orchestration(&mut self, handler: Arc<dyn OrchestrationHandler>, input: String) -> TurnResult {
        if let Some(err) = self.abort_error.clone() {
            return TurnResult::Failed(err);
        }

        let persisted_through = self.baseline_history.last().map(|e| e.event_id).unwrap_or(0);
        let working_history: Vec<Event> = self.all_events().cloned().collect();
        let working_len = working_history.len();
        let turn_index = self.turn_index();
        let instance = self.instance.clone();
        let execution_id = self.execution_id;

        debug!(instance = %instance, execution_id, turn_index, "executing orchestration turn");

        let run_result = catch_unwind(AssertUnwindSafe(|| {
            crate::run_turn_with_status(
                &instance,
                execution_id,
                working_history,
                persisted_through,
                turn_index,
                move |ctx| async move { handler.invoke(ctx, input).await },
            )
        }));

        let outcome = match run_result {
            Ok(outcome) => outcome,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "orchestration panicked".to_string()
                };
                return TurnResult::Failed(ErrorDetails::Application {
                    kind: AppErrorKind::OrchestrationFailed,
                    message: format!("panicked: {msg}"),
                    retryable: false,
                });
            }
        };

        if let Some(err) = outcome.nondeterminism {
            return TurnResult::Failed(nondeterminism(err));
        }

        if outcome.history.len() > working_len {
            self.history_delta.extend(outcome.history[working_len..].iter().cloned());
            self.next_event_id = self.all_events().last().map(|e| e.event_id + 1).unwrap_or(1);
        }
        self.pending_actions = outcome.actions;

        if let Some(reason) = self.all_events().find_map(|e| match &e.kind {
            EventKind::OrchestrationCancelRequested { reason } => Some(reason.clone()),
            _ => None,
        }) {
            return TurnResult::Cancelled(reason);
        }

        let finishing = outcome.output.is_some()
            || self
                .pending_actions
                .iter()
                .any(|a| matches!(a, Action::ContinueAsNew { .. }));
        if finishing && !outcome.unclaimed_schedules.is_empty() {
            return TurnResult::Failed(nondeterminism(format!(
                "orchestration finished without reaching scheduled event(s) {:?}",
                outcome.unclaimed_schedules
            )));
        }

        if let Some(Action::ContinueAsNew { input, version }) = self
            .pending_actions
            .iter()
            .find(|a| matches!(a, Action::ContinueAsNew { .. }))
        {
            return TurnResult::ContinueAsNew {
                input: input.clone(),
                version: version.clone(),
            };
        }

        match outcome.output {
            Some(Ok(result)) => TurnResult::Completed(result),
            Some(Err(error)) => TurnResult::Failed(ErrorDetails::Application {
                kind: AppErrorKind::OrchestrationFailed,
                message: error,
                retryable: false,
            }),
            None => TurnResult::Continue,
        }
    }

    /// Append a terminal (or any runtime-generated) event to this turn's delta.
    pub(crate) fn append(&mut self, kind: EventKind) {
        self.push_event(None, kind);
    }

    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }

    pub fn into_delta(self) -> Vec<Event> {
        self.history_delta
    }

    /// Child instances scheduled in this execution that have not reported back.
    pub fn open_children(&self) -> Vec<String> {
        self.all_events()
            .filter_map(|e| match &e.kind {
                EventKind::SubOrchestrationScheduled { instance, .. } if !self.has_completion_for(e.event_id) => {
                    Some(instance.clone())
                }
                _ => None,
            })
            .collect()
    }
}
