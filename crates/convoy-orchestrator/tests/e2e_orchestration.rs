#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end orchestration tests.
//!
//! Drives the queue, the event bus, the HITL gate and workers together over
//! an in-memory store.

use async_trait::async_trait;
use convoy_core::{
    BudgetPeriod, ConvoyError, ConvoyResult, Event, EventType, Priority, Task, TaskStatus,
    TaskType,
};
use convoy_governance::{MemoryReputationStore, ReputationConfig, ReputationEngine};
use convoy_orchestrator::*;
use convoy_store::{MemoryStore, Store};
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    queue: Arc<TaskQueue>,
    bus: Arc<EventBus>,
    hitl: Arc<HitlGate>,
    router: Arc<TaskRouter>,
    reputation: Arc<ReputationEngine>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(store.clone()));
    let queue = Arc::new(TaskQueue::new(store).with_events(bus.clone()));
    let hitl = Arc::new(HitlGate::new(HitlConfig::default()).with_events(bus.clone()));
    let reputation = Arc::new(ReputationEngine::new(
        Arc::new(MemoryReputationStore::new()),
        ReputationConfig::default(),
    ));
    Harness {
        queue,
        bus,
        hitl,
        router: Arc::new(TaskRouter::new()),
        reputation,
    }
}

impl Harness {
    fn worker(&self, agent: &str, handler: Arc<dyn AgentHandler>) -> AgentWorker {
        AgentWorker::new("worker-1", self.queue.clone(), self.hitl.clone(), self.bus.clone())
            .with_router(self.router.clone())
            .with_reputation(self.reputation.clone())
            .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
            .register(agent, handler)
    }

    async fn submit(&self, task_type: TaskType, priority: Priority) -> Task {
        let mut task = Task::new(task_type, serde_json::json!({})).with_priority(priority);
        self.router.assign(&mut task).unwrap();
        self.queue.enqueue(&task).await.unwrap();
        task
    }
}

/// Succeeds with a fixed result.
struct Succeed;

#[async_trait]
impl AgentHandler for Succeed {
    async fn handle(&self, task: &Task) -> ConvoyResult<Option<serde_json::Value>> {
        Ok(Some(serde_json::json!({"handled": task.task_id})))
    }
}

/// Fails every call with a non-governance error.
struct Flaky {
    calls: AtomicUsize,
}

#[async_trait]
impl AgentHandler for Flaky {
    async fn handle(&self, _task: &Task) -> ConvoyResult<Option<serde_json::Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ConvoyError::Internal("build server unreachable".into()))
    }
}

/// Hits the budget ceiling.
struct OverBudget;

#[async_trait]
impl AgentHandler for OverBudget {
    async fn handle(&self, task: &Task) -> ConvoyResult<Option<serde_json::Value>> {
        Err(ConvoyError::BudgetExceeded {
            trace_id: task.trace_id.to_string(),
            period: BudgetPeriod::Task,
            tokens: 120_000,
            max_tokens: 100_000,
            usd: 1.0,
            max_usd: 5.0,
        })
    }
}

/// Cancels its own task mid-flight, the way an operator would through the
/// API, then fails.
struct CancelledMidway {
    queue: Arc<TaskQueue>,
}

#[async_trait]
impl AgentHandler for CancelledMidway {
    async fn handle(&self, task: &Task) -> ConvoyResult<Option<serde_json::Value>> {
        self.queue
            .transition(task.task_id, TaskStatus::Cancelled, None)
            .await?;
        Err(ConvoyError::Internal("connection reset".into()))
    }
}

struct Counter {
    seen: AtomicUsize,
}

#[async_trait]
impl EventHandler for Counter {
    async fn handle(&self, _event: &Event) -> ConvoyResult<()> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl EventHandler for Failing {
    async fn handle(&self, _event: &Event) -> ConvoyResult<()> {
        Err(ConvoyError::Internal("handler exploded".into()))
    }
}

#[tokio::test]
async fn test_priority_order_and_fifo() {
    let h = harness();
    let p2 = h.submit(TaskType::Bugfix, Priority::P2).await;
    let p0 = h.submit(TaskType::Alert, Priority::P0).await;
    let p3 = h.submit(TaskType::Refactor, Priority::P3).await;
    let p1 = h.submit(TaskType::Deploy, Priority::P1).await;
    let p2_later = h.submit(TaskType::Faq, Priority::P2).await;

    let mut order = Vec::new();
    while let Some(task) = h.queue.dequeue().await.unwrap() {
        order.push(task.task_id);
    }
    assert_eq!(
        order,
        vec![p0.task_id, p1.task_id, p2.task_id, p2_later.task_id, p3.task_id]
    );
}

#[tokio::test]
async fn test_concurrent_dequeue_hands_out_each_task_once() {
    let h = harness();
    let mut submitted = HashSet::new();
    for i in 0..200 {
        let priority = Priority::ALL[i % 4];
        submitted.insert(h.submit(TaskType::Bugfix, priority).await.task_id);
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = h.queue.clone();
        handles.push(tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(task) = queue.dequeue().await.unwrap() {
                got.push(task.task_id);
            }
            got
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "task {id} dequeued twice");
        }
    }
    assert_eq!(total, 200);
    assert_eq!(seen, submitted);
    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 200);
}

#[tokio::test]
async fn test_p3_starves_under_sustained_p0_load() {
    let h = harness();
    let low = h.submit(TaskType::Refactor, Priority::P3).await;
    for _ in 0..50 {
        h.submit(TaskType::Alert, Priority::P0).await;
        let next = h.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(next.priority, Priority::P0);
    }
    assert_eq!(h.queue.stats().await.unwrap().pending, 1);
    let next = h.queue.dequeue().await.unwrap().unwrap();
    assert_eq!(next.task_id, low.task_id);
}

#[tokio::test]
async fn test_worker_completes_task_and_rewards_agent() {
    let h = harness();
    let mut events = h
        .bus
        .stream(&[EventType::TaskStarted, EventType::TaskCompleted])
        .await
        .unwrap();
    let worker = h.worker("code_agent", Arc::new(Succeed));
    let task = h.submit(TaskType::Bugfix, Priority::P2).await;

    let outcome = worker.run_once().await.unwrap();
    assert_eq!(outcome, PollOutcome::Settled(TaskStatus::Completed));

    let stored = h.queue.get(task.task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert!(stored.started_at.is_some());
    assert_eq!(stored.result.unwrap()["handled"], task.task_id.to_string());
    assert_eq!(h.reputation.get_reputation_score("code_agent").await.unwrap(), 110);

    let started = events.next().await.unwrap();
    assert_eq!(started.event_type, EventType::TaskStarted);
    assert_eq!(started.trace_id, task.trace_id);
    let completed = events.next().await.unwrap();
    assert_eq!(completed.event_type, EventType::TaskCompleted);
    assert_eq!(h.queue.stats().await.unwrap().processing, 0);
}

#[tokio::test]
async fn test_unhandled_agent_releases_task() {
    let h = harness();
    let worker = h.worker("code_agent", Arc::new(Succeed));
    let task = h.submit(TaskType::Monitor, Priority::P2).await;

    assert_eq!(worker.run_once().await.unwrap(), PollOutcome::Released);
    let stored = h.queue.get(task.task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Assigned);
    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.processing, 0);
}

#[tokio::test]
async fn test_high_risk_task_waits_for_approval() {
    let h = harness();
    let worker = h.worker("deploy_agent", Arc::new(Succeed));
    let task = h.submit(TaskType::Deploy, Priority::P1).await;

    assert_eq!(
        worker.run_once().await.unwrap(),
        PollOutcome::Settled(TaskStatus::Blocked)
    );
    let pending = h.hitl.get_pending_approvals().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task_id, task.task_id);
    assert_eq!(worker.run_once().await.unwrap(), PollOutcome::Idle);

    let approved = h.hitl.approve(pending[0].approval_id, "oncall").await.unwrap();
    let released = h.hitl.settle(&h.queue, &approved).await.unwrap();
    assert_eq!(released.status, TaskStatus::Pending);

    assert_eq!(
        worker.run_once().await.unwrap(),
        PollOutcome::Settled(TaskStatus::Completed)
    );
}

#[tokio::test]
async fn test_rejected_approval_cancels_task() {
    let h = harness();
    let worker = h.worker("deploy_agent", Arc::new(Succeed));
    let task = h.submit(TaskType::Deploy, Priority::P0).await;
    worker.run_once().await.unwrap();

    let pending = h.hitl.get_pending_approvals().await;
    let rejected = h
        .hitl
        .reject(pending[0].approval_id, "oncall", Some("change freeze".into()))
        .await
        .unwrap();
    let cancelled = h.hitl.settle(&h.queue, &rejected).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(cancelled.error.as_deref(), Some("change freeze"));
    let stored = h.queue.get(task.task_id).await.unwrap().unwrap();
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn test_retries_then_fails() {
    let h = harness();
    let flaky = Arc::new(Flaky {
        calls: AtomicUsize::new(0),
    });
    let worker = h.worker("code_agent", flaky.clone());
    let mut task = Task::new(TaskType::Bugfix, serde_json::json!({})).with_max_retries(2);
    h.router.assign(&mut task).unwrap();
    h.queue.enqueue(&task).await.unwrap();

    assert_eq!(worker.run_once().await.unwrap(), PollOutcome::Retried);
    assert_eq!(worker.run_once().await.unwrap(), PollOutcome::Retried);
    assert_eq!(
        worker.run_once().await.unwrap(),
        PollOutcome::Settled(TaskStatus::Failed)
    );
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

    let stored = h.queue.get(task.task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.retry_count, 2);
    assert!(stored.error.unwrap().contains("build server unreachable"));
    assert_eq!(h.reputation.get_reputation_score("code_agent").await.unwrap(), 85);
}

#[tokio::test]
async fn test_retry_does_not_revive_cancelled_task() {
    let h = harness();
    let handler = Arc::new(CancelledMidway {
        queue: h.queue.clone(),
    });
    let worker = h.worker("code_agent", handler);
    let task = h.submit(TaskType::Bugfix, Priority::P2).await;

    assert_eq!(
        worker.run_once().await.unwrap(),
        PollOutcome::Settled(TaskStatus::Cancelled)
    );
    let stored = h.queue.load(task.task_id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Cancelled);
    assert_eq!(stored.retry_count, 0);
    assert_eq!(worker.run_once().await.unwrap(), PollOutcome::Idle);
    let stats = h.queue.stats().await.unwrap();
    assert_eq!((stats.pending, stats.processing), (0, 0));
}

#[tokio::test]
async fn test_governance_error_escalates_to_human() {
    let h = harness();
    let worker = h.worker("code_agent", Arc::new(OverBudget));
    let task = h.submit(TaskType::Feature, Priority::P2).await;

    assert_eq!(
        worker.run_once().await.unwrap(),
        PollOutcome::Settled(TaskStatus::Blocked)
    );
    let stored = h.queue.get(task.task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Blocked);
    assert!(stored.error.unwrap().contains("tokens=120000/100000"));
    let pending = h.hitl.get_pending_approvals().await;
    assert_eq!(pending.len(), 1);
    assert!(pending[0].reason.starts_with("escalated"));
    assert_eq!(h.reputation.get_reputation_score("code_agent").await.unwrap(), 90);
}

#[tokio::test]
async fn test_worker_run_stops_on_cancel() {
    let h = harness();
    let worker = Arc::new(h.worker("code_agent", Arc::new(Succeed)));
    let cancel = CancellationToken::new();
    let handle = {
        let worker = worker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    let task = h.submit(TaskType::Bugfix, Priority::P2).await;
    let done = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stored = h.queue.get(task.task_id).await.unwrap().unwrap();
            if stored.status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(done.is_ok(), "worker never completed the task");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_listener_dispatches_and_stops_on_cancel() {
    let h = harness();
    let counter = Arc::new(Counter {
        seen: AtomicUsize::new(0),
    });
    h.bus.subscribe(&[EventType::KbUpdated], counter.clone());
    h.bus.subscribe(&[EventType::KbUpdated], Arc::new(Failing));

    let cancel = CancellationToken::new();
    let handle = {
        let bus = h.bus.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { bus.listen(cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let store = h.queue.store().clone();
    store
        .publish("convoy:events:kb.updated", "{not json")
        .await
        .unwrap();
    h.bus
        .publish(EventType::TaskCreated, "api", serde_json::json!({}), None, None, None)
        .await
        .unwrap();
    h.bus
        .publish(EventType::KbUpdated, "knowledge_agent", serde_json::json!({}), None, None, None)
        .await
        .unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(2), async {
        while counter.seen.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(delivered.is_ok());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("listener did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
}
