//! Durable task futures: the suspension points of an orchestration.
//!
//! A [`TaskFuture`] never performs work itself. On every poll it first claims
//! the next unclaimed `TaskScheduled` event in history (adopting the recorded
//! decision on replay, or appending a new one on first execution), then looks
//! for a matching completion event. No completion means the orchestration is
//! suspended; the runtime resumes it by appending the completion and replaying.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::retry::RetryPolicy;
use crate::{Action, Event, OrchestrationContext};

/// Future for a single scheduled task. Output is `Ok(result)` from
/// `TaskCompleted` or `Err(error)` from `TaskFailed` (retries exhausted).
pub struct TaskFuture {
    pub(crate) name: String,
    pub(crate) input: String,
    pub(crate) policy: RetryPolicy,
    pub(crate) claimed_id: Cell<Option<u64>>,
    pub(crate) ctx: OrchestrationContext,
}

impl TaskFuture {
    pub(crate) fn new(
        ctx: OrchestrationContext,
        name: String,
        input: String,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            name,
            input,
            policy,
            claimed_id: Cell::new(None),
            ctx,
        }
    }

    /// Claim our scheduling event: adopt the next unclaimed `TaskScheduled`
    /// from history, or append a new one and record the dispatch action.
    /// Returns `false` when replay has diverged from history.
    fn claim(&self) -> bool {
        if self.claimed_id.get().is_some() {
            return true;
        }
        let mut inner = self.ctx.inner.lock().expect("ctx mutex poisoned");

        // Scan for the next unclaimed scheduling event before touching any
        // mutable state; a mismatch there means replay has diverged.
        let mut found: Option<Result<u64, String>> = None;
        for event in &inner.history {
            if let Event::TaskScheduled { id, name, input } = event {
                if inner.claimed.contains(id) {
                    continue;
                }
                if name != &self.name || input != &self.input {
                    found = Some(Err(format!(
                        "nondeterministic: schedule order mismatch: history has TaskScheduled('{name}', '{input}') but code requested TaskScheduled('{}', '{}')",
                        self.name, self.input
                    )));
                } else {
                    found = Some(Ok(*id));
                }
                break;
            }
        }

        let id = match found {
            Some(Err(msg)) => {
                inner.nondeterminism = Some(msg);
                return false;
            }
            Some(Ok(id)) => id,
            None => {
                // First execution of this suspension point.
                let id = inner.next_task_id;
                inner.next_task_id += 1;
                inner.history.push(Event::TaskScheduled {
                    id,
                    name: self.name.clone(),
                    input: self.input.clone(),
                });
                inner.record_action(Action::CallActivity {
                    id,
                    name: self.name.clone(),
                    input: self.input.clone(),
                    policy: self.policy.clone(),
                });
                id
            }
        };

        inner.claimed.insert(id);
        self.claimed_id.set(Some(id));
        true
    }

    fn completion(&self) -> Option<Result<String, String>> {
        let id = self.claimed_id.get()?;
        let inner = self.ctx.inner.lock().expect("ctx mutex poisoned");
        inner.history.iter().find_map(|e| match e {
            Event::TaskCompleted { id: cid, result } if *cid == id => Some(Ok(result.clone())),
            Event::TaskFailed { id: cid, error, .. } if *cid == id => Some(Err(error.clone())),
            _ => None,
        })
    }
}

impl Future for TaskFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.claim() {
            return Poll::Pending;
        }
        match this.completion() {
            Some(out) => Poll::Ready(out),
            None => Poll::Pending,
        }
    }
}

/// All-or-nothing join over a set of task futures.
///
/// Polling the join polls every child, so a fan-out of N tasks claims all N
/// scheduling events in a single replay pass and they are persisted in one
/// history delta. The join resolves only when every child has resolved;
/// outputs are ordered by task id regardless of completion arrival order.
/// Callers treat any `Err` element as a join failure.
pub struct JoinFuture {
    children: Vec<TaskFuture>,
    results: Vec<Option<Result<String, String>>>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<TaskFuture>) -> Self {
        let results = children.iter().map(|_| None).collect();
        Self { children, results }
    }
}

impl Future for JoinFuture {
    type Output = Vec<Result<String, String>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        for (i, child) in this.children.iter_mut().enumerate() {
            if this.results[i].is_some() {
                continue;
            }
            if let Poll::Ready(out) = Pin::new(child).poll(cx) {
                this.results[i] = Some(out);
            }
        }

        if this.results.iter().any(|r| r.is_none()) {
            return Poll::Pending;
        }

        // Gather by task id: completion arrival order must not matter.
        let mut items: Vec<(u64, Result<String, String>)> = this
            .results
            .iter_mut()
            .enumerate()
            .map(|(i, r)| {
                let id = this.children[i]
                    .claimed_id
                    .get()
                    .expect("resolved child must have claimed an id");
                (id, r.take().expect("checked above"))
            })
            .collect();
        items.sort_by_key(|(id, _)| *id);
        Poll::Ready(items.into_iter().map(|(_, out)| out).collect())
    }
}

// poll() projects &mut self into children; both future types must stay Unpin.
const fn assert_unpin<T: Unpin>() {}
const _: () = {
    assert_unpin::<TaskFuture>();
    assert_unpin::<JoinFuture>();
};
