use std::io::Write as _;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

use super::{dedup_key, now_ms, HistoryStore, InstanceInfo, QueueKind, StoreError, WorkItem};
use crate::Event;

const CAP: usize = 1024;

/// Filesystem-backed store writing one JSONL history file per instance plus
/// JSONL queue files, with lock files carrying peek-locked items so that an
/// unacked item survives a process crash and is redelivered.
pub struct FsHistoryStore {
    root: PathBuf,
    orch_queue_file: PathBuf,
    work_queue_file: PathBuf,
    cap: usize,
    // Serializes queue-file rewrites across the two dispatchers.
    io_lock: Mutex<()>,
}

impl FsHistoryStore {
    /// Create a store rooted at the given directory. With `reset_on_create`,
    /// delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let orch_q = path.join("orch-queue.jsonl");
        let work_q = path.join("work-queue.jsonl");
        // best-effort create
        let _ = std::fs::create_dir_all(path.join("instances"));
        let _ = std::fs::create_dir_all(path.join(".locks"));
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&orch_q);
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&work_q);
        let store = Self {
            root: path,
            orch_queue_file: orch_q,
            work_queue_file: work_q,
            cap: CAP,
            io_lock: Mutex::new(()),
        };
        if !reset_on_create {
            store.recover_orphaned_locks();
        }
        store
    }

    /// Requeue items whose lock files survived a crash: a peek-locked item
    /// that was never acked or abandoned goes back to the front of its queue
    /// so it is redelivered to the new process.
    fn recover_orphaned_locks(&self) {
        let Ok(rd) = std::fs::read_dir(self.root.join(".locks")) else {
            return;
        };
        for ent in rd.flatten() {
            let path = ent.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let kind = if name.starts_with("o:") {
                QueueKind::Orchestrator
            } else if name.starts_with("w:") {
                QueueKind::Worker
            } else {
                continue;
            };
            let Ok(data) = std::fs::read_to_string(&path) else {
                continue;
            };
            let item: WorkItem = match serde_json::from_str(&data) {
                Ok(item) => item,
                Err(e) => {
                    warn!(lock = name, error = %e, "skipping unparseable lock file");
                    continue;
                }
            };
            warn!(lock = name, kind = ?kind, "requeueing peek-locked item left by a previous process");
            let mut items = self.read_queue(kind);
            if !items.contains(&item) {
                items.insert(0, item);
            }
            if self.write_queue(kind, &items).is_ok() {
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    fn history_path(&self, instance: &str) -> PathBuf {
        self.root.join("instances").join(format!("{instance}.jsonl"))
    }

    fn meta_path(&self, instance: &str) -> PathBuf {
        self.root.join("instances").join(format!("{instance}.meta.json"))
    }

    fn queue_file(&self, kind: QueueKind) -> &PathBuf {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_file,
            QueueKind::Worker => &self.work_queue_file,
        }
    }

    fn lock_path(&self, token: &str) -> PathBuf {
        self.root.join(".locks").join(format!("{token}.lock"))
    }

    fn read_queue(&self, kind: QueueKind) -> Vec<WorkItem> {
        let content = std::fs::read_to_string(self.queue_file(kind)).unwrap_or_default();
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str::<WorkItem>(l) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(kind = ?kind, error = %e, "skipping unparseable queue line");
                    None
                }
            })
            .collect()
    }

    fn write_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), StoreError> {
        let qf = self.queue_file(kind);
        let tmp = qf.with_extension("jsonl.tmp");
        {
            let mut tf = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| StoreError::retryable("write_queue", e.to_string()))?;
            for it in items {
                let line = serde_json::to_string(it)
                    .map_err(|e| StoreError::permanent("write_queue", e.to_string()))?;
                tf.write_all(line.as_bytes())
                    .and_then(|_| tf.write_all(b"\n"))
                    .map_err(|e| StoreError::retryable("write_queue", e.to_string()))?;
            }
        }
        std::fs::rename(&tmp, qf).map_err(|e| StoreError::retryable("write_queue", e.to_string()))
    }

    fn write_meta(&self, instance: &str, info: InstanceInfo) -> Result<(), StoreError> {
        let data = serde_json::to_string(&info)
            .map_err(|e| StoreError::permanent("write_meta", e.to_string()))?;
        std::fs::write(self.meta_path(instance), data)
            .map_err(|e| StoreError::retryable("write_meta", e.to_string()))
    }

    fn token_prefix(kind: QueueKind) -> &'static str {
        match kind {
            QueueKind::Orchestrator => "o",
            QueueKind::Worker => "w",
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    /// Read the instance's JSONL file and deserialize each line.
    async fn read(&self, instance: &str) -> Vec<Event> {
        let data = tokio::fs::read_to_string(self.history_path(instance))
            .await
            .unwrap_or_default();
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str::<Event>(l) {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!(instance, error = %e, "skipping unparseable history line");
                    None
                }
            })
            .collect()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), StoreError> {
        let _g = self.io_lock.lock().await;
        let path = self.history_path(instance);
        if !path.exists() {
            return Err(StoreError::permanent(
                "append",
                format!("instance not found: {instance}"),
            ));
        }
        let existing = {
            let data = std::fs::read_to_string(&path)
                .map_err(|e| StoreError::retryable("append", e.to_string()))?;
            data.lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|l| match serde_json::from_str::<Event>(l) {
                    Ok(e) => Some(e),
                    Err(e) => {
                        warn!(instance, error = %e, "skipping unparseable history line");
                        None
                    }
                })
                .collect::<Vec<Event>>()
        };
        if existing.len() + new_events.len() > self.cap {
            return Err(StoreError::permanent(
                "append",
                format!(
                    "history cap exceeded (cap={}, have={}, append={})",
                    self.cap,
                    existing.len(),
                    new_events.len()
                ),
            ));
        }
        let mut seen: std::collections::HashSet<(u64, &'static str)> =
            existing.iter().filter_map(dedup_key).collect();
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::retryable("append", e.to_string()))?;
        for e in new_events {
            if let Some(k) = dedup_key(&e) {
                if !seen.insert(k) {
                    continue;
                }
            }
            let line = serde_json::to_string(&e)
                .map_err(|err| StoreError::permanent("append", err.to_string()))?;
            f.write_all(line.as_bytes())
                .and_then(|_| f.write_all(b"\n"))
                .map_err(|err| StoreError::retryable("append", err.to_string()))?;
        }
        f.sync_all()
            .map_err(|e| StoreError::retryable("append", e.to_string()))?;
        if let Some(mut info) = self.instance_info(instance).await {
            info.updated_at_ms = now_ms();
            self.write_meta(instance, info)?;
        }
        Ok(())
    }

    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let _g = self.io_lock.lock().await;
        let path = self.history_path(instance);
        if path.exists() {
            return Err(StoreError::permanent(
                "create_instance",
                format!("instance already exists: {instance}"),
            ));
        }
        std::fs::create_dir_all(self.root.join("instances"))
            .map_err(|e| StoreError::retryable("create_instance", e.to_string()))?;
        std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::retryable("create_instance", e.to_string()))?;
        let now = now_ms();
        self.write_meta(
            instance,
            InstanceInfo {
                created_at_ms: now,
                updated_at_ms: now,
            },
        )
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = tokio::fs::read_dir(self.root.join("instances")).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if let Some(name) = ent.file_name().to_str() {
                    if let Some(stem) = name.strip_suffix(".jsonl") {
                        out.push(stem.to_string());
                    }
                }
            }
        }
        out
    }

    async fn instance_info(&self, instance: &str) -> Option<InstanceInfo> {
        let data = tokio::fs::read_to_string(self.meta_path(instance)).await.ok()?;
        serde_json::from_str(&data).ok()
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError> {
        let _g = self.io_lock.lock().await;
        let mut items = self.read_queue(kind);
        // Idempotent enqueue.
        if items.contains(&item) {
            return Ok(());
        }
        items.push(item);
        self.write_queue(kind, &items)
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _g = self.io_lock.lock().await;
        let mut items = self.read_queue(kind);
        if items.is_empty() {
            return None;
        }
        let item = items.remove(0);
        self.write_queue(kind, &items).ok()?;
        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let token = format!("{}:{:x}-{:x}", Self::token_prefix(kind), now_ns, std::process::id());
        let payload = serde_json::to_string(&item).ok()?;
        std::fs::write(self.lock_path(&token), payload).ok()?;
        Some((item, token))
    }

    async fn ack(&self, _kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let _g = self.io_lock.lock().await;
        let path = self.lock_path(token);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| StoreError::retryable("ack", e.to_string()))?;
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let _g = self.io_lock.lock().await;
        let path = self.lock_path(token);
        if !path.exists() {
            return Ok(());
        }
        let data = std::fs::read_to_string(&path)
            .map_err(|e| StoreError::retryable("abandon", e.to_string()))?;
        let item: WorkItem = serde_json::from_str(&data)
            .map_err(|e| StoreError::permanent("abandon", e.to_string()))?;
        let mut items = self.read_queue(kind);
        items.insert(0, item);
        self.write_queue(kind, &items)?;
        std::fs::remove_file(&path).map_err(|e| StoreError::retryable("abandon", e.to_string()))
    }

    async fn reset(&self) {
        let _ = tokio::fs::remove_dir_all(&self.root).await;
    }
}
