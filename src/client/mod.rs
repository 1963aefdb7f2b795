//! Client API for starting workflow instances and observing their status.
//!
//! The client talks only to the [`HistoryStore`]; it shares no state with the
//! runtime. Starting an instance is create-then-enqueue, and every status
//! query is derived from persisted history, so a client works the same
//! whether the runtime is in the same process or behind a shared provider.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::providers::{HistoryStore, QueueKind, StoreError, WorkItem};
use crate::runtime::{instance_status, workflow_instance, InstanceStatus, WorkflowInstance};

/// Errors surfaced by client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("timed out waiting for instance {instance} after {waited_ms}ms")]
    Timeout { instance: String, waited_ms: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handle for starting and inspecting workflow instances.
#[derive(Clone)]
pub struct Client {
    history_store: Arc<dyn HistoryStore>,
}

static INSTANCE_SEQ: AtomicU64 = AtomicU64::new(0);

fn generate_instance_id(orchestration: &str) -> String {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let seq = INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{orchestration}-{now_ms:x}-{seq:04x}")
}

impl Client {
    pub fn new(history_store: Arc<dyn HistoryStore>) -> Self {
        Self { history_store }
    }

    /// Start a new instance of `orchestration` with a generated id.
    /// Returns the instance id to poll with [`Client::wait_for_completion`].
    pub async fn start_new(
        &self,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<String, ClientError> {
        let instance = generate_instance_id(orchestration);
        self.start_new_with_id(&instance, orchestration, input)
            .await?;
        Ok(instance)
    }

    /// Start a new instance with a caller-chosen id. Starting an id that
    /// already has history appends nothing; the enqueued item only pokes the
    /// runtime to resume replay of the existing instance.
    pub async fn start_new_with_id(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        let input = input.into();
        debug!(instance, orchestration, "starting orchestration instance");
        if self.history_store.instance_info(instance).await.is_none() {
            self.history_store.create_instance(instance).await?;
        }
        self.history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: orchestration.to_string(),
                    input,
                },
            )
            .await?;
        Ok(())
    }

    /// Current status of an instance, derived from its history.
    pub async fn get_status(&self, instance: &str) -> InstanceStatus {
        instance_status(self.history_store.as_ref(), instance).await
    }

    /// Full snapshot of an instance: status, input, output, timestamps.
    pub async fn get_instance(&self, instance: &str) -> Result<WorkflowInstance, ClientError> {
        workflow_instance(self.history_store.as_ref(), instance)
            .await
            .ok_or_else(|| ClientError::NotFound(instance.to_string()))
    }

    /// Poll until the instance reaches a terminal status or `timeout` passes.
    pub async fn wait_for_completion(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<InstanceStatus, ClientError> {
        let started = Instant::now();
        loop {
            let status = self.get_status(instance).await;
            if status.is_terminal() {
                return Ok(status);
            }
            if started.elapsed() >= timeout {
                return Err(ClientError::Timeout {
                    instance: instance.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Raw history of an instance, mainly for diagnostics and tests.
    pub async fn read_history(&self, instance: &str) -> Vec<crate::Event> {
        self.history_store.read(instance).await
    }
}
