use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::{dedup_key, now_ms, HistoryStore, InstanceInfo, QueueKind, StoreError, WorkItem};
use crate::Event;

const CAP: usize = 1024;

struct InstanceState {
    events: Vec<Event>,
    info: InstanceInfo,
}

/// In-memory store for tests: histories and queues live in process memory,
/// with the same peek-lock and idempotent-append semantics as the durable
/// providers.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<HashMap<String, InstanceState>>,
    orchestrator_q: Mutex<Vec<WorkItem>>,
    worker_q: Mutex<Vec<WorkItem>>,
    // Peek-locked items, invisible until ack/abandon.
    invisible_orchestrator: Mutex<HashMap<String, WorkItem>>,
    invisible_worker: Mutex<HashMap<String, WorkItem>>,
    token_seq: AtomicU64,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_token(&self, kind: QueueKind) -> String {
        let n = self.token_seq.fetch_add(1, Ordering::Relaxed);
        match kind {
            QueueKind::Orchestrator => format!("o:{n}"),
            QueueKind::Worker => format!("w:{n}"),
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        let g = self.inner.lock().await;
        g.get(instance).map(|s| s.events.clone()).unwrap_or_default()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), StoreError> {
        let mut g = self.inner.lock().await;
        let state = g
            .get_mut(instance)
            .ok_or_else(|| StoreError::permanent("append", format!("instance not found: {instance}")))?;
        if state.events.len() + new_events.len() > CAP {
            return Err(StoreError::permanent(
                "append",
                format!(
                    "history cap exceeded (cap={}, have={}, append={})",
                    CAP,
                    state.events.len(),
                    new_events.len()
                ),
            ));
        }
        let mut seen: std::collections::HashSet<(u64, &'static str)> =
            state.events.iter().filter_map(dedup_key).collect();
        for e in new_events {
            if let Some(k) = dedup_key(&e) {
                if !seen.insert(k) {
                    continue;
                }
            }
            state.events.push(e);
        }
        state.info.updated_at_ms = now_ms();
        Ok(())
    }

    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let mut g = self.inner.lock().await;
        if g.contains_key(instance) {
            return Err(StoreError::permanent(
                "create_instance",
                format!("instance already exists: {instance}"),
            ));
        }
        let now = now_ms();
        g.insert(
            instance.to_string(),
            InstanceState {
                events: Vec::new(),
                info: InstanceInfo {
                    created_at_ms: now,
                    updated_at_ms: now,
                },
            },
        );
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    async fn instance_info(&self, instance: &str) -> Option<InstanceInfo> {
        self.inner.lock().await.get(instance).map(|s| s.info)
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError> {
        let q = match kind {
            QueueKind::Orchestrator => &self.orchestrator_q,
            QueueKind::Worker => &self.worker_q,
        };
        let mut qg = q.lock().await;
        if !qg.contains(&item) {
            qg.push(item);
        }
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let q = match kind {
            QueueKind::Orchestrator => &self.orchestrator_q,
            QueueKind::Worker => &self.worker_q,
        };
        let item = {
            let mut qg = q.lock().await;
            if qg.is_empty() {
                return None;
            }
            qg.remove(0)
        };
        let token = self.next_token(kind);
        let invisible = match kind {
            QueueKind::Orchestrator => &self.invisible_orchestrator,
            QueueKind::Worker => &self.invisible_worker,
        };
        invisible.lock().await.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let invisible = match kind {
            QueueKind::Orchestrator => &self.invisible_orchestrator,
            QueueKind::Worker => &self.invisible_worker,
        };
        invisible.lock().await.remove(token);
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let invisible = match kind {
            QueueKind::Orchestrator => &self.invisible_orchestrator,
            QueueKind::Worker => &self.invisible_worker,
        };
        let item = invisible.lock().await.remove(token);
        if let Some(item) = item {
            let q = match kind {
                QueueKind::Orchestrator => &self.orchestrator_q,
                QueueKind::Worker => &self.worker_q,
            };
            q.lock().await.insert(0, item);
        }
        Ok(())
    }

    async fn reset(&self) {
        self.inner.lock().await.clear();
        self.orchestrator_q.lock().await.clear();
        self.worker_q.lock().await.clear();
        self.invisible_orchestrator.lock().await.clear();
        self.invisible_worker.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_requires_created_instance() {
        let store = InMemoryHistoryStore::new();
        let err = store
            .append(
                "missing",
                vec![Event::OrchestratorStarted {
                    name: "o".into(),
                    input: "i".into(),
                }],
            )
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn duplicate_completions_are_dropped() {
        let store = InMemoryHistoryStore::new();
        store.create_instance("i1").await.unwrap();
        let completion = Event::TaskCompleted {
            id: 1,
            result: "r".into(),
        };
        store.append("i1", vec![completion.clone()]).await.unwrap();
        store.append("i1", vec![completion]).await.unwrap();
        assert_eq!(store.read("i1").await.len(), 1);
    }

    #[tokio::test]
    async fn abandon_requeues_at_front() {
        let store = InMemoryHistoryStore::new();
        let item = WorkItem::StartOrchestration {
            instance: "i1".into(),
            orchestration: "o".into(),
            input: "in".into(),
        };
        store
            .enqueue_work(QueueKind::Orchestrator, item.clone())
            .await
            .unwrap();
        let (got, token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        assert_eq!(got, item);
        // Invisible while locked.
        assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
        store.abandon(QueueKind::Orchestrator, &token).await.unwrap();
        let (again, token2) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        assert_eq!(again, item);
        store.ack(QueueKind::Orchestrator, &token2).await.unwrap();
        assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
    }
}
