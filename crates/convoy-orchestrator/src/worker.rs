use crate::event_bus::EventBus;
use crate::hitl::HitlGate;
use crate::router::TaskRouter;
use crate::task_queue::TaskQueue;
use async_trait::async_trait;
use chrono::Utc;
use convoy_core::{
    ApprovalStatus, ConvoyError, ConvoyResult, EventPriority, EventType, Task, TaskStatus,
};
use convoy_governance::ReputationEngine;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Agent business logic invoked by an [`AgentWorker`].
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Do the work. The returned value is stored as the task result.
    ///
    /// Governance errors (permission, budget, policy) escalate the task to a
    /// human; any other error is retried.
    async fn handle(&self, task: &Task) -> ConvoyResult<Option<serde_json::Value>>;
}

/// What one poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The queue was empty.
    Idle,
    /// The task belongs to an agent this worker has no handler for.
    Released,
    /// The handler failed and the task went back into the queue.
    Retried,
    /// The task reached this status.
    Settled(TaskStatus),
}

/// Exponential delay between empty polls.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Start at `initial` (at least 1ms) and never exceed `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Back to the initial delay, after a poll found work.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Polling loop that feeds queued tasks to registered agent handlers.
///
/// Workers share nothing but the store: any number of them, in any number
/// of processes, can poll the same queue.
pub struct AgentWorker {
    name: String,
    queue: Arc<TaskQueue>,
    hitl: Arc<HitlGate>,
    events: Arc<EventBus>,
    router: Option<Arc<TaskRouter>>,
    reputation: Option<Arc<ReputationEngine>>,
    handlers: HashMap<String, Arc<dyn AgentHandler>>,
    poll_initial: Duration,
    poll_max: Duration,
}

impl AgentWorker {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<TaskQueue>,
        hitl: Arc<HitlGate>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            hitl,
            events,
            router: None,
            reputation: None,
            handlers: HashMap::new(),
            poll_initial: Duration::from_millis(100),
            poll_max: Duration::from_secs(5),
        }
    }

    /// Route tasks that reach the worker without an owner.
    pub fn with_router(mut self, router: Arc<TaskRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Record reputation events for task outcomes.
    pub fn with_reputation(mut self, reputation: Arc<ReputationEngine>) -> Self {
        self.reputation = Some(reputation);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_initial = initial;
        self.poll_max = max;
        self
    }

    /// Handle tasks assigned to `agent`.
    pub fn register(mut self, agent: impl Into<String>, handler: Arc<dyn AgentHandler>) -> Self {
        self.handlers.insert(agent.into(), handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Poll until `cancel` fires. Empty polls back off exponentially; a
    /// settled task resets the delay.
    pub async fn run(&self, cancel: CancellationToken) -> ConvoyResult<()> {
        let mut backoff = Backoff::new(self.poll_initial, self.poll_max);
        info!(worker = %self.name, agents = ?self.handlers.keys().collect::<Vec<_>>(), "Worker started");

        while !cancel.is_cancelled() {
            let outcome = tokio::select! {
                () = cancel.cancelled() => break,
                outcome = self.run_once() => outcome,
            };
            let idle = match outcome {
                Ok(PollOutcome::Settled(_) | PollOutcome::Retried) => false,
                Ok(PollOutcome::Idle | PollOutcome::Released) => true,
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "Poll failed");
                    true
                }
            };
            if !idle {
                backoff.reset();
                continue;
            }
            let delay = backoff.next_delay();
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        info!(worker = %self.name, "Worker stopped");
        Ok(())
    }

    /// Take one task from the queue and drive it as far as it can go.
    pub async fn run_once(&self) -> ConvoyResult<PollOutcome> {
        let Some(mut task) = self.queue.dequeue().await? else {
            return Ok(PollOutcome::Idle);
        };
        self.watch_sla(&task).await;

        if task.assigned_to.is_none() {
            if let Some(router) = &self.router {
                router.assign(&mut task)?;
                self.queue.update(&task).await?;
            }
        }
        let Some(handler) = task
            .assigned_to
            .as_deref()
            .and_then(|agent| self.handlers.get(agent))
            .cloned()
        else {
            debug!(worker = %self.name, task_id = %task.task_id, agent = ?task.assigned_to, "No handler, releasing task");
            return match self.queue.release(task.task_id).await {
                Ok(()) => Ok(PollOutcome::Released),
                Err(ConvoyError::Conflict(_)) => self.settled_elsewhere(task.task_id).await,
                Err(e) => Err(e),
            };
        };
        let agent = task.assigned_to.clone().unwrap_or_default();

        if let Some(reason) = self.hitl.approval_reason(&task) {
            match self.hitl.decision_for(task.task_id).await {
                Some(ApprovalStatus::Approved) => {}
                Some(ApprovalStatus::Rejected | ApprovalStatus::Timeout) => {
                    self.queue
                        .transition(
                            task.task_id,
                            TaskStatus::Cancelled,
                            Some("approval was not granted".to_string()),
                        )
                        .await?;
                    return Ok(PollOutcome::Settled(TaskStatus::Cancelled));
                }
                Some(ApprovalStatus::Pending) | None => {
                    self.block_for_approval(&task, reason).await?;
                    return Ok(PollOutcome::Settled(TaskStatus::Blocked));
                }
            }
        }

        let task = self
            .queue
            .transition(task.task_id, TaskStatus::InProgress, None)
            .await?;
        info!(worker = %self.name, task_id = %task.task_id, agent = %agent, "Task started");

        match handler.handle(&task).await {
            Ok(result) => {
                self.queue.complete(task.task_id, result).await?;
                self.reputation_event(&agent, "task_completed", &task, None)
                    .await;
                Ok(PollOutcome::Settled(TaskStatus::Completed))
            }
            Err(e) if e.is_governance() => {
                warn!(task_id = %task.task_id, agent = %agent, error = %e, "Governance denial, escalating");
                let mut task = task;
                task.error = Some(e.to_string());
                self.block_for_approval(&task, format!("escalated: {e}"))
                    .await?;
                self.reputation_event(&agent, "human_escalation", &task, Some(&e.to_string()))
                    .await;
                Ok(PollOutcome::Settled(TaskStatus::Blocked))
            }
            Err(e) if task.can_retry() => {
                warn!(
                    task_id = %task.task_id,
                    agent = %agent,
                    retry = task.retry_count + 1,
                    max_retries = task.max_retries,
                    error = %e,
                    "Task failed, retrying"
                );
                match self
                    .queue
                    .requeue(task.task_id, true, Some(e.to_string()))
                    .await
                {
                    Ok(_) => Ok(PollOutcome::Retried),
                    Err(ConvoyError::Conflict(_)) => self.settled_elsewhere(task.task_id).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                error!(task_id = %task.task_id, agent = %agent, error = %e, "Task failed");
                self.queue
                    .transition(task.task_id, TaskStatus::Failed, Some(e.to_string()))
                    .await?;
                self.reputation_event(&agent, "task_failed", &task, Some(&e.to_string()))
                    .await;
                Ok(PollOutcome::Settled(TaskStatus::Failed))
            }
        }
    }

    /// The task reached a terminal status outside this worker (cancelled
    /// through the API, for example) while it was being handled.
    async fn settled_elsewhere(&self, task_id: Uuid) -> ConvoyResult<PollOutcome> {
        let status = self.queue.load(task_id).await?.status;
        info!(worker = %self.name, task_id = %task_id, status = %status, "Task settled elsewhere, dropping it");
        Ok(PollOutcome::Settled(status))
    }

    async fn block_for_approval(&self, task: &Task, reason: String) -> ConvoyResult<()> {
        self.queue
            .transition(task.task_id, TaskStatus::Blocked, task.error.clone())
            .await?;
        let approval_id = self.hitl.request_approval(task, reason, None).await?;
        info!(task_id = %task.task_id, approval_id = %approval_id, "Task blocked on approval");
        Ok(())
    }

    async fn watch_sla(&self, task: &Task) {
        let now = Utc::now();
        let (event_type, priority) = if task.is_sla_violated(now) {
            (EventType::SlaViolated, EventPriority::Critical)
        } else if task.is_sla_at_risk(now) {
            (EventType::SlaWarning, EventPriority::High)
        } else {
            return;
        };
        let deadline = task.sla.as_ref().map(|sla| sla.deadline);
        warn!(task_id = %task.task_id, event_type = %event_type, deadline = ?deadline, "SLA alert");
        let payload = serde_json::json!({
            "deadline": deadline,
            "target": task.sla.as_ref().map(|sla| sla.target.clone()),
        });
        if let Err(e) = self
            .events
            .publish(
                event_type,
                &self.name,
                payload,
                Some(task.task_id),
                Some(task.trace_id),
                Some(priority),
            )
            .await
        {
            warn!(task_id = %task.task_id, error = %e, "SLA event publish failed");
        }
    }

    async fn reputation_event(&self, agent: &str, event: &str, task: &Task, reason: Option<&str>) {
        let Some(reputation) = &self.reputation else {
            return;
        };
        let trace = task.trace_id.to_string();
        let recorded = match reputation.get_or_create_agent(agent).await {
            Ok(agent_id) => {
                reputation
                    .record_event(&agent_id, event, Some(&trace), reason)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = recorded {
            warn!(agent = %agent, event = %event, error = %e, "Reputation update failed");
        }
    }
}
