//! Durable, replay-driven workflow engine.
//!
//! An orchestration is an async Rust function that schedules named activities
//! through an [`OrchestrationContext`] and awaits their results. Progress is
//! recorded as an append-only history of [`Event`]s per workflow instance;
//! re-executing the orchestration against that history (replay) deterministically
//! reproduces every prior decision, so a crashed instance resumes from nothing
//! but its persisted log. New work is issued only for suspension points with no
//! recorded completion yet.
//!
//! The crate ships the replay core (this module plus [`futures`]), a bounded
//! [`retry`] policy engine applied on the worker dispatch path, pluggable
//! history [`providers`], the [`runtime`] that drives turns and executes
//! activities, a thin control-plane [`client`], and the flagship [`quorum`]
//! workflow: fan a prompt out to several solver backends in parallel, join all
//! answers, and let a judge pick the best one.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use serde::{Deserialize, Serialize};

pub mod client;
pub mod futures;
pub mod providers;
pub mod quorum;
pub mod retry;
pub mod runtime;

pub use crate::client::Client;
pub use crate::futures::{JoinFuture, TaskFuture};
pub use crate::retry::{BackoffStrategy, RetryPolicy};

/// One record in a workflow instance's append-only history. The sequence
/// number of an event is its position in the log; events are immutable once
/// written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// First event of every instance; carries the orchestration name used to
    /// resolve the handler on replay, and the opaque input payload.
    OrchestratorStarted { name: String, input: String },
    /// A task was issued. `id` is assigned by position of first request during
    /// replay and is never reused within an instance.
    TaskScheduled { id: u64, name: String, input: String },
    /// The task's activity succeeded (possibly after retries).
    TaskCompleted { id: u64, result: String },
    /// The task exhausted its retry policy; `attempts` is the number of
    /// invocation attempts that were made.
    TaskFailed { id: u64, error: String, attempts: u32 },
    /// Terminal success; no further events are appended.
    OrchestratorCompleted { output: String },
    /// Terminal failure; no further events are appended.
    OrchestratorFailed { error: String },
}

impl Event {
    /// True for the two terminal orchestrator events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestratorCompleted { .. } | Event::OrchestratorFailed { .. }
        )
    }
}

/// A scheduling decision produced by one replay turn. Actions are pure data;
/// the runtime materializes them as worker queue items after the history
/// delta has been persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    CallActivity {
        id: u64,
        name: String,
        input: String,
        policy: RetryPolicy,
    },
}

pub(crate) struct CtxInner {
    /// Full history: persisted prefix plus events appended this turn.
    pub(crate) history: Vec<Event>,
    /// Length of the persisted prefix; everything past it is this turn's delta.
    baseline: usize,
    pub(crate) actions: Vec<Action>,
    /// Scheduling events already matched to a task future this replay.
    pub(crate) claimed: HashSet<u64>,
    pub(crate) next_task_id: u64,
    /// Set when replay diverges from history (schedule-order mismatch).
    pub(crate) nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        let next_task_id = history
            .iter()
            .filter_map(|e| match e {
                Event::TaskScheduled { id, .. } => Some(*id),
                _ => None,
            })
            .max()
            .map(|m| m + 1)
            .unwrap_or(1);
        let baseline = history.len();
        Self {
            history,
            baseline,
            actions: Vec::new(),
            claimed: HashSet::new(),
            next_task_id,
            nondeterminism: None,
        }
    }

    pub(crate) fn record_action(&mut self, a: Action) {
        self.actions.push(a);
    }
}

/// Handle through which an orchestration schedules work. Cloneable; all task
/// futures created from the same context share one replay cursor.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    /// Schedule a single activity invocation with no retries.
    pub fn schedule_task(&self, name: impl Into<String>, input: impl Into<String>) -> TaskFuture {
        self.schedule_task_with_retry(name, input, RetryPolicy::new(1))
    }

    /// Schedule an activity invocation wrapped by the given retry policy. The
    /// future resolves once the task has a completion event in history:
    /// `Ok(result)` on success, `Err(summary)` once retries are exhausted.
    pub fn schedule_task_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> TaskFuture {
        TaskFuture::new(self.clone(), name.into(), input.into(), policy)
    }

    /// Fan-out/join: all children claim their scheduling events in one replay
    /// pass, and the join resolves only once every child has a completion
    /// event. Results are ordered by task id, not by arrival order.
    pub fn join(&self, children: Vec<TaskFuture>) -> JoinFuture {
        JoinFuture::new(children)
    }

    fn take_turn(&self) -> (Vec<Event>, Vec<Action>, Option<String>) {
        let mut inner = self.inner.lock().expect("ctx mutex poisoned");
        let baseline = inner.baseline;
        let delta = inner.history.split_off(baseline);
        let actions = std::mem::take(&mut inner.actions);
        let nondet = inner.nondeterminism.take();
        (delta, actions, nondet)
    }
}

/// Result of one replay turn.
#[derive(Debug)]
pub struct Turn {
    /// Events appended during this turn (new `TaskScheduled` records).
    pub history_delta: Vec<Event>,
    /// Work for the runtime to dispatch after persisting the delta.
    pub actions: Vec<Action>,
    /// `Some` when the orchestration reached its end this turn; `None` means
    /// it is suspended awaiting one or more task completions.
    pub output: Option<Result<String, String>>,
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: &mut F) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    // Safety: fut is not moved for the lifetime of this call.
    let pinned = unsafe { Pin::new_unchecked(fut) };
    pinned.poll(&mut cx)
}

/// Replay the orchestration function once against `history` and report what
/// changed: re-execution feeds recorded completions back into task futures
/// (no side effects), and only suspension points with no matching history
/// entry produce new `TaskScheduled` events and `CallActivity` actions.
///
/// A schedule-order mismatch between code and history means the orchestration
/// violated the determinism contract; the turn surfaces that as a terminal
/// failure rather than persisting diverged decisions.
pub fn run_turn<F, Fut>(history: Vec<Event>, orchestrator: F) -> Turn
where
    F: Fn(OrchestrationContext) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(history);
    let mut fut = orchestrator(ctx.clone());
    let polled = poll_once(&mut fut);
    let (history_delta, actions, nondet) = ctx.take_turn();

    if let Some(msg) = nondet {
        return Turn {
            history_delta: Vec::new(),
            actions: Vec::new(),
            output: Some(Err(msg)),
        };
    }

    match polled {
        Poll::Ready(out) => Turn {
            history_delta,
            actions,
            output: Some(out),
        },
        Poll::Pending => Turn {
            history_delta,
            actions,
            output: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_resume_after_highest_scheduled() {
        let history = vec![
            Event::OrchestratorStarted {
                name: "o".into(),
                input: "i".into(),
            },
            Event::TaskScheduled {
                id: 3,
                name: "a".into(),
                input: "x".into(),
            },
        ];
        let ctx = OrchestrationContext::new(history);
        assert_eq!(ctx.inner.lock().unwrap().next_task_id, 4);
    }

    #[test]
    fn empty_history_starts_ids_at_one() {
        let ctx = OrchestrationContext::new(Vec::new());
        assert_eq!(ctx.inner.lock().unwrap().next_task_id, 1);
    }

    #[test]
    fn terminal_events_are_terminal() {
        assert!(Event::OrchestratorCompleted { output: "o".into() }.is_terminal());
        assert!(Event::OrchestratorFailed { error: "e".into() }.is_terminal());
        assert!(!Event::OrchestratorStarted {
            name: "n".into(),
            input: "i".into()
        }
        .is_terminal());
    }
}
