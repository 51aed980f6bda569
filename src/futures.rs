use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::_typed_codec::Codec;
use crate::{Action, CtxInner, Event, EventKind, OrchestrationContext, RetryPolicy};

/// Output of a resolved [`DurableFuture`].
#[derive(Debug, Clone, PartialEq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    SubOrchestration(Result<String, String>),
}

/// A unit of durable work scheduled from orchestration code.
///
/// Scheduling is lazy: the future claims its place in history on first poll,
/// so the order in which futures are first polled is the order recorded.
pub struct DurableFuture(pub(crate) Kind);

pub(crate) enum Kind {
    Activity {
        name: String,
        input: String,
        retry: RetryPolicy,
        claimed_event_id: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
    SubOrch {
        name: String,
        version: Option<String>,
        instance: RefCell<String>,
        input: String,
        claimed_event_id: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
}

/// What the next unclaimed scheduling event in history looks like.
enum Claim {
    Matched(u64),
    Mismatch(String),
    Absent,
}

fn describe(event: &Event) -> String {
    match &event.kind {
        EventKind::ActivityScheduled { name, input, .. } => format!("ActivityScheduled('{name}','{input}')"),
        EventKind::SubOrchestrationScheduled { name, input, .. } => {
            format!("SubOrchestrationScheduled('{name}','{input}')")
        }
        _ => event.type_name().to_string(),
    }
}

/// Find the next scheduling event nobody has claimed yet and compare it with
/// what the orchestration is asking for now.
fn next_unclaimed(inner: &CtxInner, expected: &str, matches: impl Fn(&EventKind) -> bool) -> Claim {
    let next = inner
        .history
        .iter()
        .find(|e| e.is_scheduling() && !inner.claimed_scheduling_events.contains(&e.event_id));
    match next {
        Some(event) if matches(&event.kind) => Claim::Matched(event.event_id),
        Some(event) => Claim::Mismatch(format!(
            "schedule order mismatch: next is {} but expected {expected}",
            describe(event)
        )),
        None => Claim::Absent,
    }
}

/// Completion recorded for the scheduling event `source`, if any.
fn completion_for(inner: &CtxInner, source: u64) -> Option<(u64, Result<String, String>)> {
    inner.history.iter().find_map(|e| {
        if e.source_event_id != Some(source) {
            return None;
        }
        match &e.kind {
            EventKind::ActivityCompleted { result, .. } | EventKind::SubOrchestrationCompleted { result } => {
                Some((e.event_id, Ok(result.clone())))
            }
            EventKind::ActivityFailed { details, .. } | EventKind::SubOrchestrationFailed { details } => {
                Some((e.event_id, Err(details.display_message())))
            }
            _ => None,
        }
    })
}

impl DurableFuture {
    pub(crate) fn activity(ctx: OrchestrationContext, name: String, input: String, retry: RetryPolicy) -> Self {
        DurableFuture(Kind::Activity {
            name,
            input,
            retry,
            claimed_event_id: Cell::new(None),
            ctx,
        })
    }

    pub(crate) fn sub_orchestration(
        ctx: OrchestrationContext,
        name: String,
        version: Option<String>,
        input: String,
    ) -> Self {
        DurableFuture(Kind::SubOrch {
            name,
            version,
            instance: RefCell::new(String::new()),
            input,
            claimed_event_id: Cell::new(None),
            ctx,
        })
    }

    /// Await an activity result as a raw string.
    pub async fn into_activity(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Activity(r) => r,
            DurableOutput::SubOrchestration(_) => Err("into_activity used on a sub-orchestration future".into()),
        }
    }

    /// Await an activity result decoded to `Out`.
    pub async fn into_activity_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, String> {
        let raw = self.into_activity().await?;
        crate::_typed_codec::Json::decode::<Out>(&raw)
    }

    /// Await a child orchestration's output as a raw string.
    pub async fn into_sub_orchestration(self) -> Result<String, String> {
        match self.await {
            DurableOutput::SubOrchestration(r) => r,
            DurableOutput::Activity(_) => Err("into_sub_orchestration used on an activity future".into()),
        }
    }

    pub async fn into_sub_orchestration_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, String> {
        let raw = self.into_sub_orchestration().await?;
        crate::_typed_codec::Json::decode::<Out>(&raw)
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.0 {
            Kind::Activity {
                name,
                input,
                retry,
                claimed_event_id,
                ctx,
            } => {
                let mut inner = ctx.lock();
                if inner.nondeterminism_error.is_some() {
                    return Poll::Pending;
                }

                if claimed_event_id.get().is_none() {
                    let expected = format!("ActivityScheduled('{name}','{input}')");
                    let claim = next_unclaimed(&inner, &expected, |kind| {
                        matches!(kind, EventKind::ActivityScheduled { name: n, input: i, .. } if n == name && i == input)
                    });
                    let event_id = match claim {
                        Claim::Matched(id) => id,
                        Claim::Mismatch(msg) => {
                            inner.nondeterminism_error = Some(msg);
                            return Poll::Pending;
                        }
                        Claim::Absent => {
                            let new_id = inner.alloc_event_id();
                            let event = Event::with_event_id(
                                new_id,
                                inner.instance_id.clone(),
                                inner.execution_id,
                                None,
                                EventKind::ActivityScheduled {
                                    name: name.clone(),
                                    input: input.clone(),
                                    retry: retry.clone(),
                                },
                            );
                            inner.history.push(event);
                            inner.record_action(Action::CallActivity {
                                scheduling_event_id: new_id,
                                name: name.clone(),
                                input: input.clone(),
                                retry: retry.clone(),
                            });
                            new_id
                        }
                    };
                    inner.claimed_scheduling_events.insert(event_id);
                    claimed_event_id.set(Some(event_id));
                }

                let Some(our_id) = claimed_event_id.get() else {
                    return Poll::Pending;
                };
                if let Some((completion_id, result)) = completion_for(&inner, our_id)
                    && !inner.consumed_completions.contains(&completion_id)
                {
                    inner.mark_consumed(completion_id);
                    return Poll::Ready(DurableOutput::Activity(result));
                }
                Poll::Pending
            }
            Kind::SubOrch {
                name,
                version,
                instance,
                input,
                claimed_event_id,
                ctx,
            } => {
                let mut inner = ctx.lock();
                if inner.nondeterminism_error.is_some() {
                    return Poll::Pending;
                }

                if claimed_event_id.get().is_none() {
                    let expected = format!("SubOrchestrationScheduled('{name}','{input}')");
                    let claim = next_unclaimed(&inner, &expected, |kind| {
                        matches!(kind, EventKind::SubOrchestrationScheduled { name: n, input: i, .. } if n == name && i == input)
                    });
                    let event_id = match claim {
                        Claim::Matched(id) => {
                            if let Some(Event {
                                kind: EventKind::SubOrchestrationScheduled { instance: child, .. },
                                ..
                            }) = inner.history.iter().find(|e| e.event_id == id)
                            {
                                *instance.borrow_mut() = child.clone();
                            }
                            id
                        }
                        Claim::Mismatch(msg) => {
                            inner.nondeterminism_error = Some(msg);
                            return Poll::Pending;
                        }
                        Claim::Absent => {
                            let new_id = inner.alloc_event_id();
                            let child = format!("{}::{}::sub::{new_id}", inner.instance_id, inner.execution_id);
                            *instance.borrow_mut() = child.clone();
                            let event = Event::with_event_id(
                                new_id,
                                inner.instance_id.clone(),
                                inner.execution_id,
                                None,
                                EventKind::SubOrchestrationScheduled {
                                    name: name.clone(),
                                    instance: child.clone(),
                                    input: input.clone(),
                                },
                            );
                            inner.history.push(event);
                            inner.record_action(Action::StartSubOrchestration {
                                scheduling_event_id: new_id,
                                name: name.clone(),
                                version: version.clone(),
                                instance: child,
                                input: input.clone(),
                            });
                            new_id
                        }
                    };
                    inner.claimed_scheduling_events.insert(event_id);
                    claimed_event_id.set(Some(event_id));
                }

                let Some(our_id) = claimed_event_id.get() else {
                    return Poll::Pending;
                };
                if let Some((completion_id, result)) = completion_for(&inner, our_id)
                    && !inner.consumed_completions.contains(&completion_id)
                {
                    inner.mark_consumed(completion_id);
                    return Poll::Ready(DurableOutput::SubOrchestration(result));
                }
                Poll::Pending
            }
        }
    }
}

/// Waits for all children; outputs come back in the order the children were given.
pub struct JoinFuture {
    children: Vec<DurableFuture>,
    results: Vec<Option<DurableOutput>>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        let results = children.iter().map(|_| None).collect();
        Self { children, results }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (child, slot) in this.children.iter_mut().zip(this.results.iter_mut()) {
            if slot.is_none()
                && let Poll::Ready(out) = Pin::new(child).poll(cx)
            {
                *slot = Some(out);
            }
        }
        if this.results.iter().all(Option::is_some) {
            Poll::Ready(this.results.iter_mut().filter_map(Option::take).collect())
        } else {
            Poll::Pending
        }
    }
}
