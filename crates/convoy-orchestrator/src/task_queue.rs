use crate::event_bus::EventBus;
use chrono::{DateTime, Utc};
use convoy_core::{ConvoyError, ConvoyResult, EventPriority, EventType, Task, TaskStatus};
use convoy_store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Ordered set of queued task ids.
pub const PENDING_KEY: &str = "convoy:queue:pending";
/// Set of task ids handed to a worker and not yet settled.
pub const PROCESSING_KEY: &str = "convoy:queue:processing";
/// Set of every stored task id.
pub const TASK_INDEX_KEY: &str = "convoy:tasks";
const SEQ_KEY: &str = "convoy:queue:seq";

/// Width of one priority bucket in the ordering score. Sequence numbers
/// wrap inside it, which keeps every score an exact integer in an `f64`.
const BUCKET_SPAN: u64 = 1_000_000_000_000;

/// Store key holding a task body.
pub fn task_key(task_id: Uuid) -> String {
    format!("convoy:task:{task_id}")
}

/// Ordering score: priority bucket first, enqueue order inside it.
pub fn ordering_score(priority: convoy_core::Priority, seq: u64) -> f64 {
    (u64::from(priority.score()) * BUCKET_SPAN + seq % BUCKET_SPAN) as f64
}

fn ensure_open(stored: &Task) -> ConvoyResult<()> {
    if stored.status.is_terminal() {
        return Err(ConvoyError::Conflict(format!(
            "task {} is already {}",
            stored.task_id, stored.status
        )));
    }
    Ok(())
}

/// Queue configuration (`[queue]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Publish `task.*` lifecycle events.
    pub publish_events: bool,
    /// Terminal tasks older than this are removed by the reaper.
    pub reap_after_secs: u64,
    /// First worker sleep after an empty poll.
    pub poll_initial_ms: u64,
    /// Ceiling for the worker's exponential poll backoff.
    pub poll_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            publish_events: true,
            reap_after_secs: 7 * 24 * 3600,
            poll_initial_ms: 100,
            poll_max_ms: 5_000,
        }
    }
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Tasks waiting to be dequeued.
    pub pending: u64,
    /// Tasks handed to a worker and not yet settled or released.
    pub processing: u64,
    /// Every task body still stored, finished ones included until reaped.
    pub total: u64,
}

/// Store-backed priority queue.
///
/// Task bodies live under `convoy:task:{id}`; queued ids sit in one ordered
/// set scored by [`ordering_score`]. `dequeue` is a single pop-min, so any
/// number of workers in any number of processes can share the queue and
/// each task is handed out once.
///
/// Store failures are returned to the caller. Event publication is best
/// effort: a failed publish is logged and the queue operation stands.
pub struct TaskQueue {
    store: Arc<dyn Store>,
    events: Option<Arc<EventBus>>,
}

impl TaskQueue {
    /// Queue over `store` that publishes no lifecycle events.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            events: None,
        }
    }

    /// Publish lifecycle events on `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// The backing store, shared with the other components.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Store the task and queue it. Terminal tasks are rejected.
    pub async fn enqueue(&self, task: &Task) -> ConvoyResult<Uuid> {
        if task.status.is_terminal() {
            return Err(ConvoyError::validation(format!(
                "cannot enqueue task {} in terminal status {}",
                task.task_id, task.status
            )));
        }
        self.write_body(task).await?;
        self.index(task).await?;
        info!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            priority = %task.priority,
            "Task enqueued"
        );
        self.announce(task, EventType::TaskCreated, Some(task.source.as_str()))
            .await;
        Ok(task.task_id)
    }

    /// Pop the most urgent task and mark it processing. `None` when empty.
    ///
    /// Ids whose body has been reaped, and tasks settled while they were
    /// still queued, are dropped and the next id is tried.
    pub async fn dequeue(&self) -> ConvoyResult<Option<Task>> {
        loop {
            let Some((member, _)) = self.store.zpopmin(PENDING_KEY).await? else {
                return Ok(None);
            };
            let Ok(task_id) = member.parse::<Uuid>() else {
                warn!(member = %member, "Dropping malformed queue entry");
                continue;
            };
            self.store.sadd(PROCESSING_KEY, &member).await?;
            match self.get(task_id).await? {
                Some(task) if !task.status.is_terminal() => {
                    debug!(task_id = %task_id, priority = %task.priority, "Task dequeued");
                    return Ok(Some(task));
                }
                Some(_) | None => {
                    debug!(task_id = %task_id, "Skipping settled or vanished task");
                    self.store.srem(PROCESSING_KEY, &member).await?;
                }
            }
        }
    }

    /// Stored copy of a task, or `None` when it never existed or was reaped.
    pub async fn get(&self, task_id: Uuid) -> ConvoyResult<Option<Task>> {
        match self.store.get(&task_key(task_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Load a task or fail with `NotFound`.
    pub async fn load(&self, task_id: Uuid) -> ConvoyResult<Task> {
        self.get(task_id)
            .await?
            .ok_or_else(|| ConvoyError::NotFound(format!("task {task_id}")))
    }

    /// Overwrite the stored task.
    ///
    /// Fails with `Conflict` when the stored copy is already terminal, so a
    /// stale working copy can never revive a settled task. Terminal and
    /// blocked tasks leave both the queue and the processing set.
    pub async fn update(&self, task: &Task) -> ConvoyResult<()> {
        if let Some(stored) = self.get(task.task_id).await? {
            ensure_open(&stored)?;
        }
        self.write(task).await
    }

    async fn write(&self, task: &Task) -> ConvoyResult<()> {
        self.write_body(task).await?;
        self.store
            .sadd(TASK_INDEX_KEY, &task.task_id.to_string())
            .await?;
        if task.status.is_terminal() || task.status == TaskStatus::Blocked {
            let member = task.task_id.to_string();
            self.store.zrem(PENDING_KEY, &member).await?;
            self.store.srem(PROCESSING_KEY, &member).await?;
        }
        Ok(())
    }

    /// Record `child_id` in the parent's lineage. Settled parents keep
    /// their status; only the child list changes.
    pub async fn link_child(&self, parent_id: Uuid, child_id: Uuid) -> ConvoyResult<Task> {
        let mut parent = self.load(parent_id).await?;
        parent.add_child(child_id);
        self.write_body(&parent).await?;
        Ok(parent)
    }

    /// Move a task to `status`, record `error` if given, and publish the
    /// matching `task.*` event.
    pub async fn transition(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> ConvoyResult<Task> {
        self.settle(task_id, status, error, None).await
    }

    /// Complete a task with the agent's result.
    pub async fn complete(
        &self,
        task_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> ConvoyResult<Task> {
        self.settle(task_id, TaskStatus::Completed, None, result)
            .await
    }

    async fn settle(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) -> ConvoyResult<Task> {
        let mut task = self.load(task_id).await?;
        let from = task.status;
        task.transition(status)?;
        if error.is_some() {
            task.error = error;
        }
        if result.is_some() {
            task.result = result;
        }
        self.write(&task).await?;
        info!(task_id = %task_id, from = %from, to = %status, "Task status changed");
        if let Some(event_type) = EventType::for_status(status) {
            self.announce(&task, event_type, None).await;
        }
        Ok(task)
    }

    /// Put a stored task back in the queue as `pending`, optionally counting
    /// a retry and recording `error`. Used for retries and for tasks released
    /// by an approval.
    ///
    /// The stored copy is reloaded first; a task that reached a terminal
    /// status in the meantime is left alone and `Conflict` is returned.
    pub async fn requeue(
        &self,
        task_id: Uuid,
        count_retry: bool,
        error: Option<String>,
    ) -> ConvoyResult<Task> {
        let mut task = self.load(task_id).await?;
        if let Err(e) = ensure_open(&task) {
            self.drop_processing(task_id).await?;
            return Err(e);
        }
        task.transition(TaskStatus::Pending)?;
        if count_retry {
            task.retry_count += 1;
        }
        if error.is_some() {
            task.error = error;
        }
        self.write_body(&task).await?;
        self.index(&task).await?;
        self.drop_processing(task_id).await?;
        info!(
            task_id = %task.task_id,
            retry_count = task.retry_count,
            "Task requeued"
        );
        Ok(task)
    }

    /// Return a dequeued task to the back of its bucket without touching
    /// the stored body. Settled tasks only leave the processing set and
    /// `Conflict` is returned.
    pub async fn release(&self, task_id: Uuid) -> ConvoyResult<()> {
        let task = self.load(task_id).await?;
        if let Err(e) = ensure_open(&task) {
            self.drop_processing(task_id).await?;
            return Err(e);
        }
        self.index(&task).await?;
        self.drop_processing(task_id).await
    }

    async fn drop_processing(&self, task_id: Uuid) -> ConvoyResult<()> {
        self.store
            .srem(PROCESSING_KEY, &task_id.to_string())
            .await?;
        Ok(())
    }

    /// Delete terminal tasks completed before `now - older_than`. Returns
    /// how many were removed.
    pub async fn reap(&self, older_than: chrono::Duration) -> ConvoyResult<usize> {
        self.reap_at(older_than, Utc::now()).await
    }

    /// [`TaskQueue::reap`] with an explicit clock.
    pub async fn reap_at(
        &self,
        older_than: chrono::Duration,
        now: DateTime<Utc>,
    ) -> ConvoyResult<usize> {
        let horizon = now - older_than;
        let mut removed = 0;
        for member in self.store.smembers(TASK_INDEX_KEY).await? {
            let Ok(task_id) = member.parse::<Uuid>() else {
                self.store.srem(TASK_INDEX_KEY, &member).await?;
                continue;
            };
            let expired = match self.get(task_id).await? {
                Some(task) => {
                    task.status.is_terminal()
                        && task.completed_at.is_some_and(|at| at < horizon)
                }
                None => true,
            };
            if !expired {
                continue;
            }
            self.store.delete(&task_key(task_id)).await?;
            self.store.srem(TASK_INDEX_KEY, &member).await?;
            self.store.srem(PROCESSING_KEY, &member).await?;
            self.store.zrem(PENDING_KEY, &member).await?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "Reaped finished tasks");
        }
        Ok(removed)
    }

    /// Current queue depths. The three counts are separate reads and may be
    /// momentarily inconsistent with each other.
    pub async fn stats(&self) -> ConvoyResult<QueueStats> {
        Ok(QueueStats {
            pending: self.store.zcard(PENDING_KEY).await?,
            processing: self.store.scard(PROCESSING_KEY).await?,
            total: self.store.scard(TASK_INDEX_KEY).await?,
        })
    }

    async fn write_body(&self, task: &Task) -> ConvoyResult<()> {
        let raw = serde_json::to_string(task)?;
        self.store.set(&task_key(task.task_id), &raw, None).await
    }

    async fn index(&self, task: &Task) -> ConvoyResult<()> {
        let seq = self.store.incr(SEQ_KEY, 1).await?;
        let score = ordering_score(task.priority, seq.unsigned_abs());
        let member = task.task_id.to_string();
        self.store.zadd(PENDING_KEY, &member, score).await?;
        self.store.sadd(TASK_INDEX_KEY, &member).await?;
        Ok(())
    }

    async fn announce(&self, task: &Task, event_type: EventType, source: Option<&str>) {
        let Some(bus) = &self.events else {
            return;
        };
        let source = source
            .or(task.assigned_to.as_deref())
            .unwrap_or("orchestrator");
        let priority = match event_type {
            EventType::TaskFailed => EventPriority::High,
            _ => EventPriority::Medium,
        };
        let payload = serde_json::json!({
            "task_type": task.task_type,
            "priority": task.priority,
            "status": task.status,
            "assigned_to": task.assigned_to,
            "error": task.error,
        });
        if let Err(e) = bus
            .publish(
                event_type,
                source,
                payload,
                Some(task.task_id),
                Some(task.trace_id),
                Some(priority),
            )
            .await
        {
            warn!(task_id = %task.task_id, event_type = %event_type, error = %e, "Event publish failed");
        }
    }
}
