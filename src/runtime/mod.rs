//! In-process runtime: drives orchestration turns and executes activities,
//! persisting all progress through a [`HistoryStore`] provider.
//!
//! Two dispatcher loops run per runtime. The orchestrator dispatcher consumes
//! the orchestrator queue one item at a time — it is the single writer for
//! every instance's history, which is what makes per-instance replay
//! serialized and deterministic. The worker dispatcher consumes the worker
//! queue, runs activities under their retry policy, and feeds completions
//! back through the orchestrator queue. Recovery needs nothing beyond the
//! provider: an unacked queue item is redelivered and the next turn replays
//! from persisted history.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::providers::{HistoryStore, QueueKind, StoreError, WorkItem};
use crate::{run_turn, Event, OrchestrationContext};

pub mod instances;
pub mod registry;

pub use instances::{instance_status, workflow_instance, InstanceStatus, WorkflowInstance};
pub use registry::{
    ActivityHandler, ActivityRegistry, OrchestrationHandler, OrchestrationRegistry,
};

/// Configuration options for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Polling interval in milliseconds when dispatcher queues are empty.
    /// Lower values = more responsive, higher idle CPU. Default: 10ms.
    pub dispatcher_idle_sleep_ms: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
        }
    }
}

/// Runtime driving orchestrations and activities against a provider.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn HistoryStore>,
    orchestration_registry: OrchestrationRegistry,
    options: RuntimeOptions,
}

impl Runtime {
    /// Start a runtime with default options.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: ActivityRegistry,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a runtime with custom options.
    pub async fn start_with_options(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: ActivityRegistry,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times).
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            options,
        });

        let orch_handle = runtime.clone().start_orchestration_dispatcher();
        runtime.joins.lock().await.push(orch_handle);

        let work_handle = runtime.clone().start_work_dispatcher(activity_registry);
        runtime.joins.lock().await.push(work_handle);

        runtime
    }

    /// Abort background dispatcher tasks.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self
                    .history_store
                    .dequeue_peek_lock(QueueKind::Orchestrator)
                    .await
                {
                    self.process_orchestration_item(item, &token).await;
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.options.dispatcher_idle_sleep_ms,
                    ))
                    .await;
                }
            }
        })
    }

    /// One turn: fold the incoming item into history, replay, commit.
    async fn process_orchestration_item(self: &Arc<Self>, item: WorkItem, token: &str) {
        let instance = item.instance().to_string();
        let history = self.history_store.read(&instance).await;

        // Terminal instances accept no further events; drop stragglers.
        if history.iter().any(Event::is_terminal) {
            warn!(
                instance = %instance,
                kind = item.kind(),
                "instance is terminal, acking work item without processing"
            );
            self.ack_with_retry(QueueKind::Orchestrator, token).await;
            return;
        }

        // Events the triggering item contributes before replay.
        let mut delta: Vec<Event> = Vec::new();
        let start_request = match &item {
            WorkItem::StartOrchestration {
                orchestration,
                input,
                ..
            } => Some((orchestration.clone(), input.clone())),
            WorkItem::ActivityCompleted { id, result, .. } => {
                if !has_completion(&history, *id) {
                    delta.push(Event::TaskCompleted {
                        id: *id,
                        result: result.clone(),
                    });
                }
                None
            }
            WorkItem::ActivityFailed {
                id, error, attempts, ..
            } => {
                if !has_completion(&history, *id) {
                    delta.push(Event::TaskFailed {
                        id: *id,
                        error: error.clone(),
                        attempts: *attempts,
                    });
                }
                None
            }
            WorkItem::ActivityExecute { .. } => {
                error!(?item, "unexpected WorkItem in orchestrator dispatcher; state corruption");
                panic!("unexpected WorkItem in orchestrator dispatcher");
            }
        };

        // Resolve orchestration name and input: from the start request for a
        // fresh instance, from the recorded start event otherwise.
        let recorded = history.iter().find_map(|e| match e {
            Event::OrchestratorStarted { name, input } => Some((name.clone(), input.clone())),
            _ => None,
        });
        let (name, input) = match (&recorded, &start_request) {
            (Some(r), _) => r.clone(),
            (None, Some(s)) => s.clone(),
            (None, None) => {
                warn!(
                    instance = %instance,
                    kind = item.kind(),
                    "completion for an instance with no start event, acking"
                );
                self.ack_with_retry(QueueKind::Orchestrator, token).await;
                return;
            }
        };
        if recorded.is_none() {
            // A duplicate start for an already-started instance appends
            // nothing; this branch only runs for a genuinely fresh history.
            delta.insert(
                0,
                Event::OrchestratorStarted {
                    name: name.clone(),
                    input: input.clone(),
                },
            );
        }

        let handler = match self.orchestration_registry.get(&name) {
            Some(h) => h,
            None => {
                delta.push(Event::OrchestratorFailed {
                    error: format!("unregistered:{name}"),
                });
                self.commit_turn(token, &instance, delta, Vec::new()).await;
                return;
            }
        };

        let mut full_history = history;
        full_history.extend(delta.iter().cloned());

        debug!(instance = %instance, orchestration = %name, kind = item.kind(), "running turn");
        let turn = run_turn(full_history, |ctx: OrchestrationContext| {
            let h = handler.clone();
            let inp = input.clone();
            async move { h.invoke(ctx, inp).await }
        });

        delta.extend(turn.history_delta);
        if let Some(outcome) = turn.output {
            match outcome {
                Ok(output) => delta.push(Event::OrchestratorCompleted { output }),
                Err(error) => delta.push(Event::OrchestratorFailed { error }),
            }
        }

        let worker_items: Vec<WorkItem> = turn
            .actions
            .into_iter()
            .map(|a| match a {
                crate::Action::CallActivity {
                    id,
                    name,
                    input,
                    policy,
                } => WorkItem::ActivityExecute {
                    instance: instance.clone(),
                    id,
                    name,
                    input,
                    policy,
                },
            })
            .collect();

        debug!(
            instance = %instance,
            delta = delta.len(),
            worker = worker_items.len(),
            "committing turn"
        );
        self.commit_turn(token, &instance, delta, worker_items).await;
    }

    /// Persist the turn atomically through the provider, retrying transient
    /// storage failures; on exhaustion the item is abandoned for redelivery
    /// so storage unavailability never fails the instance.
    async fn commit_turn(
        &self,
        token: &str,
        instance: &str,
        delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
    ) {
        let store = self.history_store.clone();
        let committed = self
            .execute_with_retry(
                || {
                    store.ack_orchestrator(token, instance, delta.clone(), worker_items.clone())
                },
                "ack_orchestrator",
            )
            .await;
        if let Err(e) = committed {
            warn!(instance = %instance, error = %e, "turn commit failed; abandoning item for redelivery");
            if let Err(e) = store.abandon(QueueKind::Orchestrator, token).await {
                warn!(instance = %instance, error = %e, "abandon failed; item stays locked until recovery");
            }
        }
    }

    async fn ack_with_retry(&self, kind: QueueKind, token: &str) {
        let store = self.history_store.clone();
        let acked = self
            .execute_with_retry(|| store.ack(kind, token), "ack")
            .await;
        if let Err(e) = acked {
            warn!(error = %e, "ack failed; abandoning item for redelivery");
            if let Err(e) = store.abandon(kind, token).await {
                warn!(error = %e, "abandon failed; item stays locked until recovery");
            }
        }
    }

    /// Bounded retry with exponential backoff for provider operations.
    /// Retryable errors are retried up to the bound; the final error is
    /// returned so the caller can abandon its peek-locked item, putting it
    /// back in the queue to be redelivered once storage recovers.
    async fn execute_with_retry<F, R>(&self, operation: F, operation_tag: &str) -> Result<(), StoreError>
    where
        F: Fn() -> R,
        R: std::future::Future<Output = Result<(), StoreError>>,
    {
        let mut attempts: u32 = 0;
        let max_attempts: u32 = 5;

        loop {
            match operation().await {
                Ok(()) => {
                    debug!("{operation_tag} succeeded");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(attempts, backoff_ms, error = %e, "{operation_tag} failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(attempts, error = %e, "failed to {operation_tag}");
                    return Err(e);
                }
            }
        }
    }

    fn start_work_dispatcher(self: Arc<Self>, activities: ActivityRegistry) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) =
                    self.history_store.dequeue_peek_lock(QueueKind::Worker).await
                {
                    match item {
                        WorkItem::ActivityExecute {
                            instance,
                            id,
                            name,
                            input,
                            policy,
                        } => {
                            // Each execution runs on its own task so a
                            // fan-out proceeds in parallel and a retry sleep
                            // blocks only the task serving that activity.
                            let store = self.history_store.clone();
                            let activities = activities.clone();
                            tokio::spawn(async move {
                                let completion = match activities.get(&name) {
                                    Some(handler) => {
                                        invoke_with_retry(
                                            handler, &instance, id, &name, input, &policy,
                                        )
                                        .await
                                    }
                                    None => WorkItem::ActivityFailed {
                                        instance: instance.clone(),
                                        id,
                                        error: format!("unregistered:{name}"),
                                        attempts: 0,
                                    },
                                };

                                let enqueued = store
                                    .enqueue_work(QueueKind::Orchestrator, completion)
                                    .await;
                                // Only settle the work item once its completion
                                // is durably queued; otherwise let it be
                                // redelivered.
                                if enqueued.is_ok() {
                                    let _ = store.ack(QueueKind::Worker, &token).await;
                                } else {
                                    warn!(instance = %instance, id, "worker: enqueue completion failed; not acking");
                                }
                            });
                        }
                        other => {
                            error!(?other, "unexpected WorkItem in worker dispatcher; state corruption");
                            panic!("unexpected WorkItem in worker dispatcher");
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.options.dispatcher_idle_sleep_ms,
                    ))
                    .await;
                }
            }
        })
    }
}

fn has_completion(history: &[Event], task_id: u64) -> bool {
    history.iter().any(|e| match e {
        Event::TaskCompleted { id, .. } | Event::TaskFailed { id, .. } => *id == task_id,
        _ => false,
    })
}

/// Retry engine: run the activity up to `policy.max_attempts` times, sleeping
/// the backoff delay between attempts. The sleep blocks only this dispatch
/// path; orchestration replay never waits on it. The outcome work item is
/// what ultimately becomes the task's completion history event.
async fn invoke_with_retry(
    handler: Arc<dyn ActivityHandler>,
    instance: &str,
    id: u64,
    name: &str,
    input: String,
    policy: &crate::RetryPolicy,
) -> WorkItem {
    let mut attempt: u32 = 1;
    loop {
        match handler.invoke(input.clone()).await {
            Ok(result) => {
                return WorkItem::ActivityCompleted {
                    instance: instance.to_string(),
                    id,
                    result,
                };
            }
            Err(error) => {
                if attempt >= policy.max_attempts {
                    return WorkItem::ActivityFailed {
                        instance: instance.to_string(),
                        id,
                        error,
                        attempts: attempt,
                    };
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    instance,
                    id,
                    activity = name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "activity attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
