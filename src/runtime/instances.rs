//! Instance status derived from the persisted history.
//!
//! The history log is the single source of truth: status is computed from it
//! on demand rather than stored as separate mutable state, so a restarted
//! process reports the same status as the one that crashed.

use crate::providers::HistoryStore;
use crate::Event;

/// High-level instance status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Unknown instance id.
    NotFound,
    /// Created, but the scheduler has not run its first turn yet.
    Pending,
    Running,
    Completed { output: String },
    Failed { error: String },
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed { .. } | InstanceStatus::Failed { .. }
        )
    }
}

/// Point-in-time snapshot of one workflow instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowInstance {
    pub id: String,
    pub status: InstanceStatus,
    /// Input payload, once the first scheduler pass recorded it.
    pub input: Option<String>,
    /// Output payload; present only for Completed instances.
    pub output: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Compute the instance's status from its history.
pub async fn instance_status(store: &dyn HistoryStore, instance: &str) -> InstanceStatus {
    if store.instance_info(instance).await.is_none() {
        return InstanceStatus::NotFound;
    }
    status_from_history(&store.read(instance).await)
}

/// Status for a known instance given its full history.
pub fn status_from_history(history: &[Event]) -> InstanceStatus {
    if history.is_empty() {
        return InstanceStatus::Pending;
    }
    for e in history.iter().rev() {
        match e {
            Event::OrchestratorCompleted { output } => {
                return InstanceStatus::Completed {
                    output: output.clone(),
                }
            }
            Event::OrchestratorFailed { error } => {
                return InstanceStatus::Failed {
                    error: error.clone(),
                }
            }
            _ => {}
        }
    }
    InstanceStatus::Running
}

/// Full snapshot, `None` for unknown ids.
pub async fn workflow_instance(
    store: &dyn HistoryStore,
    instance: &str,
) -> Option<WorkflowInstance> {
    let info = store.instance_info(instance).await?;
    let history = store.read(instance).await;
    let status = status_from_history(&history);
    let input = history.iter().find_map(|e| match e {
        Event::OrchestratorStarted { input, .. } => Some(input.clone()),
        _ => None,
    });
    let output = match &status {
        InstanceStatus::Completed { output } => Some(output.clone()),
        _ => None,
    };
    Some(WorkflowInstance {
        id: instance.to_string(),
        status,
        input,
        output,
        created_at_ms: info.created_at_ms,
        updated_at_ms: info.updated_at_ms,
    })
}
