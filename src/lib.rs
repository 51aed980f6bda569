//! Durable, replay-safe orchestrations with an iterative research workflow on top.
//!
//! An orchestration is an `async fn(OrchestrationContext, String) -> Result<String, String>`.
//! Every call it makes through the context (activities, sub-orchestrations,
//! continue-as-new) is recorded as an [`Event`] in the instance history. When
//! the instance resumes, the function is replayed from the start of its current
//! execution and every previously recorded step resolves synchronously from
//! history. Only steps beyond the recorded history produce new [`Action`]s.
//!
//! ```rust,no_run
//! use durable_research::{ActivityContext, Client, OrchestrationContext, OrchestrationStatus};
//! use durable_research::providers::sqlite::SqliteProvider;
//! use durable_research::runtime::{self, registry::{ActivityRegistry, OrchestrationRegistry}};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteProvider::new_in_memory().await?);
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx: ActivityContext, name: String| async move { Ok(format!("hello {name}")) })
//!     .build();
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("Hello", |ctx: OrchestrationContext, name: String| async move {
//!         ctx.schedule_activity("Greet", name).into_activity().await
//!     })
//!     .build();
//! let rt = runtime::Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
//! let client = Client::new(store);
//! client.start_orchestration("inst-1", "Hello", "world").await?;
//! if let OrchestrationStatus::Completed { output } =
//!     client.wait_for_orchestration("inst-1", std::time::Duration::from_secs(5)).await?
//! {
//!     assert_eq!(output, "hello world");
//! }
//! rt.shutdown().await;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod client;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod research;
pub mod runtime;

pub use client::{Client, ClientError};
pub use crate::futures::{DurableFuture, DurableOutput, JoinFuture};
pub use runtime::registry::{
    ActivityKey, ActivityRegistry, ActivityRegistryBuilder, OrchestrationKey, OrchestrationRegistry,
    OrchestrationRegistryBuilder, VersionPolicy,
};
pub use runtime::{OrchestrationStatus, Runtime, RuntimeOptions};

use crate::_typed_codec::Codec;

// Internal codec utilities for typed I/O
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    /// Strict JSON. A `String` payload travels quoted so it round-trips exactly.
    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            serde_json::to_string(v).map_err(|e| e.to_string())
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            serde_json::from_str(s).map_err(|e| e.to_string())
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// History
// ============================================================================

/// One append-only history record.
///
/// `event_id` is the 1-based position of the event inside its execution and is
/// always assigned by the runtime. Completions point back at the event that
/// scheduled them through `source_event_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: u64,
    pub source_event_id: Option<u64>,
    pub instance_id: String,
    pub execution_id: u64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EventKind {
    /// First event of every execution.
    OrchestrationStarted {
        name: String,
        version: String,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
        #[serde(default)]
        parent_execution_id: Option<u64>,
    },
    ActivityScheduled {
        name: String,
        input: String,
        retry: RetryPolicy,
    },
    ActivityCompleted {
        result: String,
        attempts: u32,
    },
    ActivityFailed {
        details: ErrorDetails,
        attempts: u32,
    },
    SubOrchestrationScheduled {
        name: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        result: String,
    },
    SubOrchestrationFailed {
        details: ErrorDetails,
    },
    OrchestrationCancelRequested {
        reason: String,
    },
    /// Terminal event of an execution that restarted with a fresh input.
    OrchestrationContinuedAsNew {
        input: String,
    },
    OrchestrationCompleted {
        output: String,
    },
    OrchestrationFailed {
        details: ErrorDetails,
    },
    OrchestrationTerminated {
        reason: String,
    },
}

impl Event {
    pub fn with_event_id(
        event_id: u64,
        instance_id: impl Into<String>,
        execution_id: u64,
        source_event_id: Option<u64>,
        kind: EventKind,
    ) -> Self {
        Self {
            event_id,
            source_event_id,
            instance_id: instance_id.into(),
            execution_id,
            timestamp_ms: now_millis(),
            kind,
        }
    }

    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    pub(crate) fn set_event_id(&mut self, id: u64) {
        self.event_id = id;
    }

    pub fn source_event_id(&self) -> Option<u64> {
        self.source_event_id
    }

    /// Events that schedule work the orchestration will later await.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ActivityScheduled { .. } | EventKind::SubOrchestrationScheduled { .. }
        )
    }

    /// Events that end an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::OrchestrationCompleted { .. }
                | EventKind::OrchestrationFailed { .. }
                | EventKind::OrchestrationContinuedAsNew { .. }
                | EventKind::OrchestrationTerminated { .. }
        )
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            EventKind::OrchestrationStarted { .. } => "OrchestrationStarted",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::SubOrchestrationScheduled { .. } => "SubOrchestrationScheduled",
            EventKind::SubOrchestrationCompleted { .. } => "SubOrchestrationCompleted",
            EventKind::SubOrchestrationFailed { .. } => "SubOrchestrationFailed",
            EventKind::OrchestrationCancelRequested { .. } => "OrchestrationCancelRequested",
            EventKind::OrchestrationContinuedAsNew { .. } => "OrchestrationContinuedAsNew",
            EventKind::OrchestrationCompleted { .. } => "OrchestrationCompleted",
            EventKind::OrchestrationFailed { .. } => "OrchestrationFailed",
            EventKind::OrchestrationTerminated { .. } => "OrchestrationTerminated",
        }
    }
}

/// Decisions produced by one orchestration turn, dispatched after the turn is persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
        retry: RetryPolicy,
    },
    StartSubOrchestration {
        scheduling_event_id: u64,
        name: String,
        version: Option<String>,
        instance: String,
        input: String,
    },
    ContinueAsNew {
        input: String,
        version: Option<String>,
    },
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppErrorKind {
    ActivityFailed,
    OrchestrationFailed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigErrorKind {
    Nondeterminism,
    UnregisteredActivity,
    UnregisteredOrchestration,
}

/// Structured failure recorded in history and surfaced through the client.
///
/// `Application` errors are the only ones orchestration code ever observes.
/// `Configuration` and `Infrastructure` errors abort the turn and fail the instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorDetails {
    Application {
        kind: AppErrorKind,
        message: String,
        retryable: bool,
    },
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
}

impl ErrorDetails {
    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Application { .. } => "application",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Infrastructure { .. } => "infrastructure",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorDetails::Application { retryable, .. } | ErrorDetails::Infrastructure { retryable, .. } => {
                *retryable
            }
            ErrorDetails::Configuration { .. } => false,
        }
    }

    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application { kind, message, .. } => match kind {
                AppErrorKind::Cancelled => format!("canceled: {message}"),
                AppErrorKind::ActivityFailed | AppErrorKind::OrchestrationFailed => message.clone(),
            },
            ErrorDetails::Configuration { kind, resource, message } => match kind {
                ConfigErrorKind::Nondeterminism => match message {
                    Some(m) => format!("nondeterministic: {m}"),
                    None => "nondeterministic".to_string(),
                },
                ConfigErrorKind::UnregisteredActivity | ConfigErrorKind::UnregisteredOrchestration => {
                    format!("unregistered:{resource}")
                }
            },
            ErrorDetails::Infrastructure { operation, message, .. } => {
                format!("infrastructure:{operation}: {message}")
            }
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_message())
    }
}

/// Error returned by an activity attempt.
///
/// Transient errors (rate limiting, temporary unavailability, timeouts) are
/// retried by the worker according to the invocation's [`RetryPolicy`]. Terminal
/// errors resolve the invocation as failed right away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityError {
    pub message: String,
    pub retryable: bool,
}

impl ActivityError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<String> for ActivityError {
    fn from(message: String) -> Self {
        Self::terminal(message)
    }
}

impl From<&str> for ActivityError {
    fn from(message: &str) -> Self {
        Self::terminal(message)
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Delay between activity attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    None,
    Fixed { delay: Duration },
    /// `base * attempt`, capped at `max`.
    Linear { base: Duration, max: Duration },
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackoffStrategy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt.max(1)).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                if base.is_zero() {
                    return Duration::ZERO;
                }
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let factor = multiplier.powi(exp);
                let millis = base.as_millis() as f64 * factor;
                if !millis.is_finite() || millis >= max.as_millis() as f64 {
                    *max
                } else {
                    Duration::from_millis(millis.round() as u64).min(*max)
                }
            }
        }
    }
}

/// Retry policy attached to each activity invocation and persisted with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Per-attempt timeout. A timed out attempt counts as a transient failure.
    pub timeout: Option<Duration>,
    /// Retry terminal errors as well as transient ones.
    #[serde(default)]
    pub retry_terminal_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_millis(100),
                multiplier: 2.0,
                max: Duration::from_secs(30),
            },
            timeout: None,
            retry_terminal_errors: false,
        }
    }
}

impl RetryPolicy {
    /// # Panics
    ///
    /// Panics if `max_attempts` is zero.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1).with_backoff(BackoffStrategy::None)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retry_all_errors(mut self) -> Self {
        self.retry_terminal_errors = true;
        self
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }

    /// Whether a failure on `attempt` should be followed by another attempt.
    pub fn should_retry(&self, attempt: u32, error: &ActivityError) -> bool {
        attempt < self.max_attempts && (error.retryable || self.retry_terminal_errors)
    }
}

// ============================================================================
// Activity context
// ============================================================================

/// Metadata handed to every activity attempt.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance_id: String,
    execution_id: u64,
    orchestration_name: String,
    activity_name: String,
    activity_id: u64,
    attempt: u32,
}

impl ActivityContext {
    pub(crate) fn new(
        instance_id: String,
        execution_id: u64,
        orchestration_name: String,
        activity_name: String,
        activity_id: u64,
        attempt: u32,
    ) -> Self {
        Self {
            instance_id,
            execution_id,
            orchestration_name,
            activity_name,
            activity_id,
            attempt,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    pub fn orchestration_name(&self) -> &str {
        &self.orchestration_name
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    pub fn activity_id(&self) -> u64 {
        self.activity_id
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "durable_research::activity",
            instance_id = %self.instance_id,
            execution_id = %self.execution_id,
            activity_name = %self.activity_name,
            activity_id = %self.activity_id,
            attempt = %self.attempt,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "durable_research::activity",
            instance_id = %self.instance_id,
            execution_id = %self.execution_id,
            activity_name = %self.activity_name,
            activity_id = %self.activity_id,
            attempt = %self.attempt,
            "{}",
            message.into()
        );
    }
}

// ============================================================================
// Orchestration context
// ============================================================================

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) instance_id: String,
    pub(crate) execution_id: u64,
    pub(crate) history: Vec<Event>,
    pub(crate) actions: Vec<Action>,
    pub(crate) next_event_id: u64,
    pub(crate) claimed_scheduling_events: HashSet<u64>,
    pub(crate) consumed_completions: HashSet<u64>,
    pub(crate) nondeterminism_error: Option<String>,
    // Highest event id that was already persisted before this turn
    persisted_through: u64,
    replaying: bool,
    turn_index: u64,
}

impl CtxInner {
    fn new(instance_id: String, execution_id: u64, history: Vec<Event>, persisted_through: u64) -> Self {
        let next_event_id = history.last().map(|e| e.event_id + 1).unwrap_or(1);
        let replaying = history
            .iter()
            .any(|e| e.event_id <= persisted_through && !matches!(e.kind, EventKind::OrchestrationStarted { .. }));
        Self {
            instance_id,
            execution_id,
            history,
            actions: Vec::new(),
            next_event_id,
            claimed_scheduling_events: HashSet::new(),
            consumed_completions: HashSet::new(),
            nondeterminism_error: None,
            persisted_through,
            replaying,
            turn_index: 0,
        }
    }

    pub(crate) fn record_action(&mut self, action: Action) {
        self.replaying = false;
        self.actions.push(action);
    }

    pub(crate) fn alloc_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    pub(crate) fn mark_consumed(&mut self, completion_event_id: u64) {
        self.consumed_completions.insert(completion_event_id);
        if completion_event_id > self.persisted_through {
            self.replaying = false;
        }
    }
}

/// Handle given to orchestration code for scheduling durable work.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(instance_id: String, execution_id: u64, history: Vec<Event>, persisted_through: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(
                instance_id,
                execution_id,
                history,
                persisted_through,
            ))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    pub fn execution_id(&self) -> u64 {
        self.lock().execution_id
    }

    pub fn turn_index(&self) -> u64 {
        self.lock().turn_index
    }

    /// True while the orchestration is re-walking steps that were already persisted.
    pub fn is_replaying(&self) -> bool {
        self.lock().replaying
    }

    pub fn is_logging_enabled(&self) -> bool {
        !self.is_replaying()
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        let message = message.into();
        crate::durable_info!(self, "{}", message);
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        let message = message.into();
        crate::durable_warn!(self, "{}", message);
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        let message = message.into();
        crate::durable_error!(self, "{}", message);
    }

    /// Schedule an activity with the default retry policy.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule_activity_with_retry(name, input, RetryPolicy::default())
    }

    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        retry: RetryPolicy,
    ) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.into(), input.into(), retry)
    }

    pub fn schedule_activity_typed<In: Serialize, Out: serde::de::DeserializeOwned>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> impl Future<Output = Result<Out, String>> {
        self.schedule_activity_with_retry_typed(name, input, RetryPolicy::default())
    }

    pub fn schedule_activity_with_retry_typed<In: Serialize, Out: serde::de::DeserializeOwned>(
        &self,
        name: impl Into<String>,
        input: &In,
        retry: RetryPolicy,
    ) -> impl Future<Output = Result<Out, String>> {
        let encoded = _typed_codec::Json::encode(input);
        let ctx = self.clone();
        let name = name.into();
        async move {
            let input = encoded?;
            ctx.schedule_activity_with_retry(name, input, retry)
                .into_activity_typed::<Out>()
                .await
        }
    }

    /// Call an activity through its typed key.
    pub fn call_activity<In: Serialize, Out: serde::de::DeserializeOwned>(
        &self,
        key: ActivityKey<In, Out>,
        input: &In,
    ) -> impl Future<Output = Result<Out, String>> {
        self.schedule_activity_typed(key.name(), input)
    }

    pub fn call_activity_with_retry<In: Serialize, Out: serde::de::DeserializeOwned>(
        &self,
        key: ActivityKey<In, Out>,
        input: &In,
        retry: RetryPolicy,
    ) -> impl Future<Output = Result<Out, String>> {
        self.schedule_activity_with_retry_typed(key.name(), input, retry)
    }

    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::sub_orchestration(self.clone(), name.into(), None, input.into())
    }

    pub fn schedule_sub_orchestration_versioned(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::sub_orchestration(self.clone(), name.into(), Some(version.into()), input.into())
    }

    pub fn schedule_sub_orchestration_typed<In: Serialize, Out: serde::de::DeserializeOwned>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> impl Future<Output = Result<Out, String>> {
        let encoded = _typed_codec::Json::encode(input);
        let ctx = self.clone();
        let name = name.into();
        async move {
            let input = encoded?;
            ctx.schedule_sub_orchestration(name, input)
                .into_sub_orchestration_typed::<Out>()
                .await
        }
    }

    /// Run a child orchestration through its typed key.
    pub fn call_sub_orchestration<In: Serialize, Out: serde::de::DeserializeOwned>(
        &self,
        key: OrchestrationKey<In, Out>,
        input: &In,
    ) -> impl Future<Output = Result<Out, String>> {
        self.schedule_sub_orchestration_typed(key.name(), input)
    }

    /// Wait for every future, returning outputs in the order given.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    /// End this execution and start a new one of the same instance with `input`.
    ///
    /// The returned future never resolves; the runtime replaces the current
    /// execution once the turn is persisted.
    pub fn continue_as_new(&self, input: impl Into<String>) -> impl Future<Output = Result<String, String>> {
        self.lock().record_action(Action::ContinueAsNew {
            input: input.into(),
            version: None,
        });
        std::future::pending()
    }

    pub fn continue_as_new_versioned(
        &self,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> impl Future<Output = Result<String, String>> {
        self.lock().record_action(Action::ContinueAsNew {
            input: input.into(),
            version: Some(version.into()),
        });
        std::future::pending()
    }

    pub fn continue_as_new_typed<In: Serialize>(
        &self,
        input: &In,
    ) -> impl Future<Output = Result<String, String>> {
        let encoded = _typed_codec::Json::encode(input);
        let ctx = self.clone();
        async move {
            let payload = encoded?;
            ctx.continue_as_new(payload).await
        }
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().actions)
    }

    fn set_turn_index(&self, idx: u64) {
        self.lock().turn_index = idx;
    }
}

// ============================================================================
// Turn execution
// ============================================================================

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    // SAFETY: every vtable function ignores the data pointer, so a null pointer is valid.
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    fut.poll(&mut cx)
}

/// Everything one poll of an orchestration produced.
#[derive(Debug)]
pub struct TurnOutcome<O> {
    /// Input history plus the scheduling events appended during the turn.
    pub history: Vec<Event>,
    pub actions: Vec<Action>,
    pub output: Option<O>,
    pub nondeterminism: Option<String>,
    /// Scheduling events from the input history that the orchestration never reached.
    pub unclaimed_schedules: Vec<u64>,
}

/// Poll an orchestration once against `history`.
///
/// Every event up to `persisted_through` is treated as replay.
pub fn run_turn_with_status<O, F>(
    instance_id: &str,
    execution_id: u64,
    history: Vec<Event>,
    persisted_through: u64,
    turn_index: u64,
    orchestrator: impl FnOnce(OrchestrationContext) -> F,
) -> TurnOutcome<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(instance_id.to_string(), execution_id, history, persisted_through);
    ctx.set_turn_index(turn_index);
    let fut = orchestrator(ctx.clone());
    let mut fut = std::pin::pin!(fut);
    let output = match poll_once(fut.as_mut()) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };
    let actions = ctx.take_actions();
    let inner = ctx.lock();
    let unclaimed_schedules = inner
        .history
        .iter()
        .filter(|e| e.is_scheduling() && !inner.claimed_scheduling_events.contains(&e.event_id))
        .map(|e| e.event_id)
        .collect();
    TurnOutcome {
        history: inner.history.clone(),
        actions,
        output,
        nondeterminism: inner.nondeterminism_error.clone(),
        unclaimed_schedules,
    }
}

/// Poll an orchestration once against a fully persisted history.
///
/// Handy for checking determinism without a runtime: replaying the same
/// history must always yield the same actions.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl FnOnce(OrchestrationContext) -> F) -> TurnOutcome<O>
where
    F: Future<Output = O>,
{
    let persisted_through = history.last().map(|e| e.event_id).unwrap_or(0);
    let (instance_id, execution_id) = history
        .first()
        .map(|e| (e.instance_id.clone(), e.execution_id))
        .unwrap_or_else(|| ("test-instance".to_string(), 1));
    run_turn_with_status(&instance_id, execution_id, history, persisted_through, 0, orchestrator)
}
