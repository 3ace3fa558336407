//! `TaskManager`: admission control, priority queue, lifecycle dispatch and
//! the snapshot/query surface (spec §4.7). Owns every live [`Task`] and is
//! the sole mutator of the task registry; mutations happen under a single
//! lock, reads copy out.

use crate::config::Configuration;
use crate::error::TaskError;
use crate::events::{EventBus, TaskEventKind};
use crate::http::HttpContext;
use crate::model::{Plan, PriorityClass, TaskSnapshot};
use crate::task::Task;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

/// Queue entry ordered by `(priority_class, submission sequence)`; a
/// monotonic counter stands in for `submitted_at` (spec §4.7) and keeps
/// admission order deterministic without depending on wall-clock
/// resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEntry {
    priority: PriorityClass,
    seq: u64,
    task_id: String,
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.priority, self.seq).cmp(&(&other.priority, other.seq))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct TaskManager {
    tasks: Mutex<HashMap<String, Arc<Task>>>,
    pending: Mutex<BinaryHeap<Reverse<PendingEntry>>>,
    admission: Arc<Semaphore>,
    events: EventBus,
    config: Configuration,
    http: HttpContext,
    seq: AtomicU64,
}

impl TaskManager {
    pub fn new(config: Configuration) -> Arc<Self> {
        let http = HttpContext::new(&config);
        let admission = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Arc::new(TaskManager {
            tasks: Mutex::new(HashMap::new()),
            pending: Mutex::new(BinaryHeap::new()),
            admission,
            events: EventBus::new(),
            config,
            http,
            seq: AtomicU64::new(0),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn on(&self) -> crate::events::Subscription {
        self.events.subscribe()
    }

    /// Enqueue a plan and immediately attempt admission. Returns the new
    /// task's id.
    pub async fn submit(self: &Arc<Self>, plan: Plan, priority: PriorityClass) -> String {
        let task_id = uuid::Uuid::new_v4().to_string();
        let task = Task::new(
            task_id.clone(),
            plan,
            self.config.clone(),
            self.http.clone(),
            self.events.clone(),
        );

        self.tasks.lock().await.insert(task_id.clone(), task);
        self.events.publish(task_id.clone(), TaskEventKind::Created);

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().await.push(Reverse(PendingEntry {
            priority,
            seq,
            task_id: task_id.clone(),
        }));

        self.try_admit().await;
        task_id
    }

    /// Admit as many queued tasks as there is spare capacity for. Safe to
    /// call opportunistically: every call uses only non-blocking permit
    /// acquisition, so it never stalls the caller waiting on a running
    /// task's slot.
    async fn try_admit(self: &Arc<Self>) {
        loop {
            let permit = match self.admission.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let next = self.pending.lock().await.pop();
            let Some(Reverse(entry)) = next else {
                drop(permit);
                return;
            };

            let task = self.tasks.lock().await.get(&entry.task_id).cloned();
            let Some(task) = task else {
                continue;
            };
            if task.status().await.is_terminal() {
                continue;
            }

            let manager = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                task.run().await;
                manager.try_admit().await;
            });
        }
    }

    fn find(&self, tasks: &HashMap<String, Arc<Task>>, id: &str) -> Result<Arc<Task>, TaskError> {
        tasks
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    pub async fn pause(&self, id: &str) -> Result<(), TaskError> {
        let tasks = self.tasks.lock().await;
        let task = self.find(&tasks, id)?;
        if task.status().await.is_terminal() {
            return Err(TaskError::AlreadyTerminal);
        }
        task.pause();
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<(), TaskError> {
        let tasks = self.tasks.lock().await;
        let task = self.find(&tasks, id)?;
        if task.status().await.is_terminal() {
            return Err(TaskError::AlreadyTerminal);
        }
        task.resume();
        Ok(())
    }

    pub async fn cancel(&self, id: &str) -> Result<(), TaskError> {
        let tasks = self.tasks.lock().await;
        let task = self.find(&tasks, id)?;
        task.cancel();
        Ok(())
    }

    /// Remove a task record. A non-terminal task is canceled first, then
    /// its record is dropped once it reaches a terminal state (spec §4.7:
    /// "requires terminal state or performs an implicit cancel first").
    /// `submit` → `cancel` → `remove` is idempotent after the first cancel
    /// (spec §8): a second `remove` simply reports `NotFound`.
    pub async fn remove(&self, id: &str) -> Result<(), TaskError> {
        let task = {
            let tasks = self.tasks.lock().await;
            self.find(&tasks, id)?
        };

        if !task.status().await.is_terminal() {
            task.cancel();
            for _ in 0..500 {
                if task.status().await.is_terminal() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }

        self.tasks.lock().await.remove(id);
        Ok(())
    }

    /// Consistent snapshot of every known task. Held under the registry
    /// lock only long enough to clone the `Arc<Task>` handles; the
    /// per-task snapshot reads happen outside it (spec §4.7: "no torn
    /// reads across tasks" refers to the registry, not to a single instant
    /// across every task's internal state).
    pub async fn list(&self) -> Vec<TaskSnapshot> {
        let handles: Vec<Arc<Task>> = self.tasks.lock().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for task in handles {
            snapshots.push(task.snapshot().await);
        }
        snapshots
    }

    pub async fn snapshot_of(&self, id: &str) -> Result<TaskSnapshot, TaskError> {
        let task = {
            let tasks = self.tasks.lock().await;
            self.find(&tasks, id)?
        };
        Ok(task.snapshot().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EncryptionSpec, Segment};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn plan_for(server_uri: &str, output: std::path::PathBuf) -> Plan {
        Plan {
            display_name: "test".into(),
            segments: vec![Segment::new(0, format!("{server_uri}/a.ts"))],
            encryption: EncryptionSpec::none(),
            total_duration_secs: Some(10.0),
            is_live: false,
            output_path: output,
            sequence_base: 0,
        }
    }

    #[tokio::test]
    async fn submit_runs_to_completion_and_is_listed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"AAA".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = Configuration::builder().prefer_transcoder(false).build();
        let manager = TaskManager::new(config);
        let plan = plan_for(&server.uri(), dir.path().join("out.ts"));
        let id = manager.submit(plan, PriorityClass::Normal).await;

        let mut completed = false;
        for _ in 0..100 {
            let snapshot = manager.snapshot_of(&id).await.unwrap();
            if snapshot.status.is_terminal() {
                completed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(completed);
        let all = manager.list().await;
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn admission_respects_max_concurrent_tasks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.ts"))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(200)).set_body_bytes(b"AAA".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = Configuration::builder()
            .max_concurrent_tasks(1)
            .prefer_transcoder(false)
            .build();
        let manager = TaskManager::new(config);

        let mut ids = Vec::new();
        for i in 0..3 {
            let plan = plan_for(&server.uri(), dir.path().join(format!("out{i}.ts")));
            ids.push(manager.submit(plan, PriorityClass::Normal).await);
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let running = futures::future::join_all(ids.iter().map(|id| manager.snapshot_of(id)))
            .await
            .into_iter()
            .filter_map(|s| s.ok())
            .filter(|s| s.status == crate::model::TaskStatus::Running)
            .count();
        assert!(running <= 1);
    }

    #[tokio::test]
    async fn remove_unknown_task_is_not_found() {
        let manager = TaskManager::new(Configuration::default());
        let err = manager.remove("does-not-exist").await.unwrap_err();
        assert!(matches!(err, TaskError::NotFound(_)));
    }

    /// spec §8: `submit` then `cancel` then `remove` is idempotent after the
    /// first cancel — a second `remove` simply reports `NotFound` rather
    /// than panicking or double-freeing anything.
    #[tokio::test]
    async fn submit_cancel_remove_is_idempotent_after_first_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.ts"))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(200)).set_body_bytes(b"AAA".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = Configuration::builder().prefer_transcoder(false).build();
        let manager = TaskManager::new(config);
        let plan = plan_for(&server.uri(), dir.path().join("out.ts"));
        let id = manager.submit(plan, PriorityClass::Normal).await;

        manager.cancel(&id).await.unwrap();
        manager.remove(&id).await.unwrap();

        let err = manager.remove(&id).await.unwrap_err();
        assert!(matches!(err, TaskError::NotFound(_)));
    }
}
