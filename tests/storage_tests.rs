//! Storage unavailability: retryable failures are retried by the runtime's
//! calling harness, a commit that cannot go through has its item abandoned
//! for redelivery, and the instance is never marked Failed for storage.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use quorumflow::providers::in_memory::InMemoryHistoryStore;
use quorumflow::providers::{HistoryStore, InstanceInfo, QueueKind, StoreError, WorkItem};
use quorumflow::runtime::registry::{ActivityRegistryBuilder, OrchestrationRegistryBuilder};
use quorumflow::runtime::{InstanceStatus, Runtime};
use quorumflow::{Client, Event};

/// Store wrapper that fails the first `failures` turn commits, then behaves
/// like its in-memory inner store. Failures happen before any inner effect.
struct FlakyCommitStore {
    inner: InMemoryHistoryStore,
    commit_calls: AtomicU32,
    failures: u32,
    retryable: bool,
}

impl FlakyCommitStore {
    fn new(failures: u32, retryable: bool) -> Self {
        Self {
            inner: InMemoryHistoryStore::new(),
            commit_calls: AtomicU32::new(0),
            failures,
            retryable,
        }
    }
}

#[async_trait]
impl HistoryStore for FlakyCommitStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.inner.read(instance).await
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), StoreError> {
        self.inner.append(instance, new_events).await
    }

    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        self.inner.create_instance(instance).await
    }

    async fn list_instances(&self) -> Vec<String> {
        self.inner.list_instances().await
    }

    async fn instance_info(&self, instance: &str) -> Option<InstanceInfo> {
        self.inner.instance_info(instance).await
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError> {
        self.inner.enqueue_work(kind, item).await
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        self.inner.dequeue_peek_lock(kind).await
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        self.inner.ack(kind, token).await
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        self.inner.abandon(kind, token).await
    }

    async fn ack_orchestrator(
        &self,
        token: &str,
        instance: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
    ) -> Result<(), StoreError> {
        let call = self.commit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return if self.retryable {
                Err(StoreError::retryable("ack_orchestrator", "storage unavailable"))
            } else {
                Err(StoreError::permanent("ack_orchestrator", "storage rejected commit"))
            };
        }
        self.inner
            .ack_orchestrator(token, instance, history_delta, worker_items)
            .await
    }

    async fn reset(&self) {
        self.inner.reset().await
    }
}

async fn run_echo(store: Arc<FlakyCommitStore>) -> (InstanceStatus, u32) {
    let activities = ActivityRegistryBuilder::new().build();
    let orchestrations = OrchestrationRegistryBuilder::new()
        .register("echo", |_ctx, input| async move { Ok(input) })
        .build();

    let runtime = Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());

    let instance = client.start_new("echo", "payload").await.unwrap();
    let status = client
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    runtime.shutdown().await;

    (status, store.commit_calls.load(Ordering::SeqCst))
}

#[tokio::test]
async fn failed_commit_abandons_the_item_and_redelivery_completes_it() {
    let store = Arc::new(FlakyCommitStore::new(1, false));
    let (status, commit_calls) = run_echo(store).await;

    assert_eq!(
        status,
        InstanceStatus::Completed {
            output: "payload".into()
        }
    );
    // First delivery's commit failed, the item was abandoned, and the
    // redelivered item committed on its own turn.
    assert_eq!(commit_calls, 2);
}

#[tokio::test]
async fn retryable_commit_failures_are_retried_within_one_delivery() {
    let store = Arc::new(FlakyCommitStore::new(3, true));
    let (status, commit_calls) = run_echo(store).await;

    assert_eq!(
        status,
        InstanceStatus::Completed {
            output: "payload".into()
        }
    );
    // Three retryable failures plus the succeeding attempt, all against the
    // same peek-locked item; storage trouble never marks the instance Failed.
    assert_eq!(commit_calls, 4);
}
