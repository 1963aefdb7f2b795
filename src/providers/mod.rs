//! Storage abstraction: per-instance append-only history plus the durable
//! orchestrator/worker queues the runtime consumes with peek-lock delivery.
//!
//! Providers are datastores only; the runtime owns dispatch. Queue delivery is
//! at-least-once, so history append is idempotent for completion-like events.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::Event;

/// In-memory provider for tests.
pub mod in_memory;
/// Filesystem-backed provider (JSONL per instance) for local durability.
pub mod fs;

/// Message routed through a provider queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkItem {
    /// Client request to begin (or re-poke) an instance. Orchestrator queue.
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
    },
    /// Dispatch one task to the activity executor under the given retry
    /// policy. Worker queue.
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
        policy: RetryPolicy,
    },
    /// Activity succeeded; becomes a `TaskCompleted` event. Orchestrator queue.
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    /// Retries exhausted; becomes a `TaskFailed` event. Orchestrator queue.
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
        attempts: u32,
    },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. } => instance,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Orchestrator,
    Worker,
}

/// Storage error with retry classification. Retryable errors (storage
/// unavailability) are retried by the runtime's calling harness; the instance
/// is never marked Failed for them. Permanent errors indicate corruption or
/// misuse and are surfaced immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation}: {message}")]
pub struct StoreError {
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl StoreError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Creation/update timestamps tracked per instance (epoch milliseconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Idempotence key for completion-like events. Terminal orchestrator events
/// share one slot each because at most one may ever exist per instance.
pub(crate) fn dedup_key(e: &Event) -> Option<(u64, &'static str)> {
    match e {
        Event::TaskCompleted { id, .. } => Some((*id, "tc")),
        Event::TaskFailed { id, .. } => Some((*id, "tf")),
        Event::OrchestratorCompleted { .. } => Some((0, "oc")),
        Event::OrchestratorFailed { .. } => Some((0, "of")),
        _ => None,
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Append-only history plus durable work queues for one deployment.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read the full log for an instance in write order. Empty for unknown
    /// instances.
    async fn read(&self, instance: &str) -> Vec<Event>;

    /// Durably append events. Append is the only mutation; no event is ever
    /// rewritten or deleted while an instance is active. Implementations
    /// must drop completion-like events that are already present so that
    /// at-least-once queue delivery cannot double-append.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), StoreError>;

    /// Create a new, empty instance. Fails if the instance already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError>;

    /// Enumerate known instances.
    async fn list_instances(&self) -> Vec<String>;

    /// Timestamps for a known instance, `None` otherwise.
    async fn instance_info(&self, instance: &str) -> Option<InstanceInfo>;

    /// Enqueue one work item.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError>;

    /// Dequeue the next item under a lock token. The item stays invisible
    /// until acked or abandoned; a crash before ack redelivers it.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    /// Settle a peek-locked item.
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError>;

    /// Return a peek-locked item to the front of its queue for redelivery.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError>;

    /// Commit one orchestration turn: persist the history delta, enqueue the
    /// newly scheduled worker items, and ack the orchestrator item that
    /// triggered the turn. The default implementation sequences the three
    /// steps; providers with stronger transactional guarantees can override.
    async fn ack_orchestrator(
        &self,
        token: &str,
        instance: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
    ) -> Result<(), StoreError> {
        if !history_delta.is_empty() {
            self.append(instance, history_delta).await?;
        }
        for item in worker_items {
            self.enqueue_work(QueueKind::Worker, item).await?;
        }
        self.ack(QueueKind::Orchestrator, token).await
    }

    /// Clear all data (test utility).
    async fn reset(&self);
}
