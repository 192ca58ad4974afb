use crate::event_bus::EventBus;
use crate::task_queue::TaskQueue;
use chrono::{DateTime, Utc};
use convoy_core::{
    ApprovalRequest, ApprovalStatus, ConvoyError, ConvoyResult, EventPriority, EventType,
    Priority, Task, TaskStatus, TaskType,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// HITL gate configuration (`[hitl]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HitlConfig {
    /// Pending requests older than this time out.
    pub timeout_secs: u64,
    /// Resolved requests kept in memory.
    pub history_limit: usize,
    /// How often the server sweeps for timed-out requests.
    pub sweep_interval_secs: u64,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            history_limit: 1000,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Default)]
struct GateState {
    pending: HashMap<Uuid, ApprovalRequest>,
    /// task id → its pending approval id.
    by_task: HashMap<Uuid, Uuid>,
    /// Latest resolution per task with a request still in history.
    decisions: HashMap<Uuid, ApprovalStatus>,
    /// approval id → trace id of its task, while pending.
    traces: HashMap<Uuid, Uuid>,
    history: VecDeque<ApprovalRequest>,
}

impl GateState {
    /// Move a resolved request to history. Returns the trace id of its task.
    fn archive(&mut self, request: ApprovalRequest, limit: usize) -> Option<Uuid> {
        self.by_task.remove(&request.task_id);
        let trace_id = self.traces.remove(&request.approval_id);
        self.decisions.insert(request.task_id, request.status);
        self.history.push_back(request);
        while self.history.len() > limit {
            let Some(dropped) = self.history.pop_front() else {
                break;
            };
            if !self.history.iter().any(|r| r.task_id == dropped.task_id) {
                self.decisions.remove(&dropped.task_id);
            }
        }
        trace_id
    }
}

/// Manual-approval checkpoint for high-risk tasks.
///
/// Holds at most one pending request per task. Resolved requests move to a
/// bounded, immutable history.
pub struct HitlGate {
    state: RwLock<GateState>,
    config: HitlConfig,
    events: Option<Arc<EventBus>>,
}

impl HitlGate {
    pub fn new(config: HitlConfig) -> Self {
        Self {
            state: RwLock::new(GateState::default()),
            config,
            events: None,
        }
    }

    /// Publish `approval.*` events on `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn config(&self) -> &HitlConfig {
        &self.config
    }

    /// Why `task` needs sign-off, or `None` if it does not.
    pub fn approval_reason(&self, task: &Task) -> Option<String> {
        if matches!(task.priority, Priority::P0 | Priority::P1) {
            return Some(format!("{} priority task", task.priority));
        }
        let production = task
            .environment()
            .is_some_and(|env| matches!(env, "production" | "prod"));
        if production
            && matches!(
                task.task_type,
                TaskType::Deploy | TaskType::Feature | TaskType::Refactor
            )
        {
            return Some(format!("{} targeting production", task.task_type));
        }
        let flag_change = task
            .metadata
            .get("feature_flag_change")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if flag_change {
            return Some("feature flag change".to_string());
        }
        None
    }

    pub fn requires_approval(&self, task: &Task) -> bool {
        self.approval_reason(task).is_some()
    }

    /// Open an approval request for `task`. A second request while one is
    /// pending returns the existing id.
    pub async fn request_approval(
        &self,
        task: &Task,
        reason: impl Into<String>,
        approver: Option<String>,
    ) -> ConvoyResult<Uuid> {
        let request = {
            let mut state = self.state.write().await;
            if let Some(existing) = state.by_task.get(&task.task_id) {
                return Ok(*existing);
            }
            let request = ApprovalRequest::new(task.task_id, reason, approver);
            state.by_task.insert(task.task_id, request.approval_id);
            state.traces.insert(request.approval_id, task.trace_id);
            state.pending.insert(request.approval_id, request.clone());
            request
        };

        info!(
            approval_id = %request.approval_id,
            task_id = %task.task_id,
            reason = %request.reason,
            "Approval requested"
        );
        self.announce(
            EventType::ApprovalRequested,
            &request,
            Some(task.trace_id),
            EventPriority::High,
        )
        .await;
        Ok(request.approval_id)
    }

    pub async fn approve(&self, approval_id: Uuid, approver: &str) -> ConvoyResult<ApprovalRequest> {
        self.resolve(approval_id, ApprovalStatus::Approved, approver, None, Utc::now())
            .await
    }

    pub async fn reject(
        &self,
        approval_id: Uuid,
        approver: &str,
        reason: Option<String>,
    ) -> ConvoyResult<ApprovalRequest> {
        self.resolve(approval_id, ApprovalStatus::Rejected, approver, reason, Utc::now())
            .await
    }

    async fn resolve(
        &self,
        approval_id: Uuid,
        status: ApprovalStatus,
        by: &str,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> ConvoyResult<ApprovalRequest> {
        let (resolved, trace_id) = {
            let mut state = self.state.write().await;
            let Some(mut request) = state.pending.remove(&approval_id) else {
                if state.history.iter().any(|r| r.approval_id == approval_id) {
                    return Err(ConvoyError::Conflict(format!(
                        "approval {approval_id} is already resolved"
                    )));
                }
                return Err(ConvoyError::NotFound(format!("approval {approval_id}")));
            };
            if let Err(e) = request.resolve(status, by, reason, at) {
                state.pending.insert(approval_id, request);
                return Err(e);
            }
            let trace_id = state.archive(request.clone(), self.config.history_limit);
            (request, trace_id)
        };

        info!(
            approval_id = %approval_id,
            task_id = %resolved.task_id,
            status = ?resolved.status,
            by = %by,
            "Approval resolved"
        );
        self.announce(
            EventType::ApprovalResolved,
            &resolved,
            trace_id,
            EventPriority::Medium,
        )
        .await;
        Ok(resolved)
    }

    /// Time out pending requests older than the configured timeout.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Vec<ApprovalRequest> {
        let timeout =
            chrono::Duration::from_std(std::time::Duration::from_secs(self.config.timeout_secs))
                .unwrap_or(chrono::Duration::MAX);
        let expired = {
            let mut state = self.state.write().await;
            let stale: Vec<Uuid> = state
                .pending
                .values()
                .filter(|r| now - r.requested_at >= timeout)
                .map(|r| r.approval_id)
                .collect();
            let mut expired = Vec::with_capacity(stale.len());
            for id in stale {
                let Some(mut request) = state.pending.remove(&id) else {
                    continue;
                };
                if request
                    .resolve(ApprovalStatus::Timeout, "system", Some("approval timed out".into()), now)
                    .is_ok()
                {
                    let trace_id = state.archive(request.clone(), self.config.history_limit);
                    expired.push((request, trace_id));
                }
            }
            expired
        };

        for (request, trace_id) in &expired {
            warn!(
                approval_id = %request.approval_id,
                task_id = %request.task_id,
                "Approval timed out"
            );
            self.announce(
                EventType::ApprovalResolved,
                request,
                *trace_id,
                EventPriority::High,
            )
            .await;
        }
        expired.into_iter().map(|(request, _)| request).collect()
    }

    /// Pending requests, oldest first.
    pub async fn get_pending_approvals(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<ApprovalRequest> =
            self.state.read().await.pending.values().cloned().collect();
        pending.sort_by_key(|r| r.requested_at);
        pending
    }

    pub async fn get_approval_status(&self, approval_id: Uuid) -> Option<ApprovalRequest> {
        let state = self.state.read().await;
        state.pending.get(&approval_id).cloned().or_else(|| {
            state
                .history
                .iter()
                .find(|r| r.approval_id == approval_id)
                .cloned()
        })
    }

    /// Resolved requests, newest first.
    pub async fn history(&self, limit: usize) -> Vec<ApprovalRequest> {
        self.state
            .read()
            .await
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Latest resolution for a task, if any.
    pub async fn decision_for(&self, task_id: Uuid) -> Option<ApprovalStatus> {
        self.state.read().await.decisions.get(&task_id).copied()
    }

    pub async fn is_approved(&self, task_id: Uuid) -> bool {
        self.decision_for(task_id).await == Some(ApprovalStatus::Approved)
    }

    pub async fn pending_count(&self) -> usize {
        self.state.read().await.pending.len()
    }

    /// Apply a resolution to its task: approved tasks blocked on it go back
    /// into the queue, rejected and timed-out tasks are cancelled.
    pub async fn settle(&self, queue: &TaskQueue, request: &ApprovalRequest) -> ConvoyResult<Task> {
        let task = queue.load(request.task_id).await?;
        match request.status {
            ApprovalStatus::Approved if task.status == TaskStatus::Blocked => {
                queue.requeue(task.task_id, false, None).await
            }
            ApprovalStatus::Approved | ApprovalStatus::Pending => Ok(task),
            ApprovalStatus::Rejected | ApprovalStatus::Timeout if task.status.is_terminal() => {
                Ok(task)
            }
            ApprovalStatus::Rejected | ApprovalStatus::Timeout => {
                let why = request
                    .rejection_reason
                    .clone()
                    .unwrap_or_else(|| "approval rejected".to_string());
                queue
                    .transition(task.task_id, TaskStatus::Cancelled, Some(why))
                    .await
            }
        }
    }

    async fn announce(
        &self,
        event_type: EventType,
        request: &ApprovalRequest,
        trace_id: Option<Uuid>,
        priority: EventPriority,
    ) {
        let Some(bus) = &self.events else {
            return;
        };
        let payload = match serde_json::to_value(request) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Cannot serialize approval for event");
                return;
            }
        };
        if let Err(e) = bus
            .publish(
                event_type,
                "hitl_gate",
                payload,
                Some(request.task_id),
                trace_id,
                Some(priority),
            )
            .await
        {
            warn!(approval_id = %request.approval_id, error = %e, "Approval event publish failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn gate() -> HitlGate {
        HitlGate::new(HitlConfig::default())
    }

    #[test]
    fn test_high_priority_requires_approval() {
        let gate = gate();
        let task = Task::new(TaskType::Faq, serde_json::json!({})).with_priority(Priority::P1);
        assert_eq!(gate.approval_reason(&task).unwrap(), "P1 priority task");
        let task = Task::new(TaskType::Faq, serde_json::json!({})).with_priority(Priority::P2);
        assert!(!gate.requires_approval(&task));
    }

    #[test]
    fn test_production_changes_require_approval() {
        let gate = gate();
        let deploy = Task::new(TaskType::Deploy, serde_json::json!({"environment": "prod"}));
        assert!(gate.requires_approval(&deploy));
        let staging = Task::new(TaskType::Deploy, serde_json::json!({"environment": "staging"}));
        assert!(!gate.requires_approval(&staging));
        let monitor = Task::new(TaskType::Monitor, serde_json::json!({}))
            .with_metadata("environment", serde_json::json!("production"));
        assert!(!gate.requires_approval(&monitor));
        let flag = Task::new(TaskType::Bugfix, serde_json::json!({}))
            .with_metadata("feature_flag_change", serde_json::json!(true));
        assert_eq!(gate.approval_reason(&flag).unwrap(), "feature flag change");
    }

    #[tokio::test]
    async fn test_request_is_idempotent_per_task() {
        let gate = gate();
        let task = Task::new(TaskType::Deploy, serde_json::json!({}));
        let a = gate.request_approval(&task, "deploy", None).await.unwrap();
        let b = gate.request_approval(&task, "deploy again", None).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(gate.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_resolution_rules() {
        let gate = gate();
        let task = Task::new(TaskType::Deploy, serde_json::json!({}));
        let id = gate.request_approval(&task, "deploy", None).await.unwrap();
        let resolved = gate.approve(id, "alice").await.unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert!(gate.is_approved(task.task_id).await);

        let err = gate.reject(id, "bob", None).await.unwrap_err();
        assert!(matches!(err, ConvoyError::Conflict(_)));
        let err = gate.approve(Uuid::new_v4(), "bob").await.unwrap_err();
        assert!(matches!(err, ConvoyError::NotFound(_)));

        assert_eq!(gate.history(10).await.len(), 1);
        assert_eq!(
            gate.get_approval_status(id).await.unwrap().approved_by.as_deref(),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn test_new_request_after_resolution() {
        let gate = gate();
        let task = Task::new(TaskType::Deploy, serde_json::json!({}));
        let first = gate.request_approval(&task, "deploy", None).await.unwrap();
        gate.reject(first, "alice", Some("not today".into()))
            .await
            .unwrap();
        let second = gate.request_approval(&task, "deploy", None).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(gate.decision_for(task.task_id).await, Some(ApprovalStatus::Rejected));
    }

    #[tokio::test]
    async fn test_expire_stale() {
        let gate = HitlGate::new(HitlConfig {
            timeout_secs: 60,
            ..HitlConfig::default()
        });
        let task = Task::new(TaskType::Deploy, serde_json::json!({}));
        let id = gate.request_approval(&task, "deploy", None).await.unwrap();

        assert!(gate.expire_stale(Utc::now()).await.is_empty());
        let later = Utc::now() + chrono::Duration::seconds(61);
        let expired = gate.expire_stale(later).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, ApprovalStatus::Timeout);
        assert!(gate.get_pending_approvals().await.is_empty());
        assert_eq!(
            gate.get_approval_status(id).await.unwrap().status,
            ApprovalStatus::Timeout
        );
    }

    #[tokio::test]
    async fn test_history_is_bounded_newest_first() {
        let gate = HitlGate::new(HitlConfig {
            history_limit: 2,
            ..HitlConfig::default()
        });
        let mut ids = Vec::new();
        for _ in 0..3 {
            let task = Task::new(TaskType::Deploy, serde_json::json!({}));
            let id = gate.request_approval(&task, "deploy", None).await.unwrap();
            gate.approve(id, "alice").await.unwrap();
            ids.push(id);
        }
        let history = gate.history(10).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].approval_id, ids[2]);
        assert_eq!(history[1].approval_id, ids[1]);
    }

    #[tokio::test]
    async fn test_decisions_pruned_with_history() {
        let gate = HitlGate::new(HitlConfig {
            history_limit: 3,
            ..HitlConfig::default()
        });
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let task = Task::new(TaskType::Deploy, serde_json::json!({}));
            let id = gate.request_approval(&task, "deploy", None).await.unwrap();
            gate.approve(id, "alice").await.unwrap();
            tasks.push(task.task_id);
        }
        assert_eq!(gate.state.read().await.decisions.len(), 3);
        assert!(gate.decision_for(tasks[0]).await.is_none());
        assert_eq!(
            gate.decision_for(tasks[9]).await,
            Some(ApprovalStatus::Approved)
        );

        // A task still in history keeps its decision when an older request
        // of the same task is dropped.
        let task = Task::new(TaskType::Deploy, serde_json::json!({}));
        let first = gate.request_approval(&task, "deploy", None).await.unwrap();
        gate.reject(first, "bob", None).await.unwrap();
        let second = gate.request_approval(&task, "deploy", None).await.unwrap();
        gate.approve(second, "alice").await.unwrap();
        for _ in 0..2 {
            let other = Task::new(TaskType::Deploy, serde_json::json!({}));
            let id = gate.request_approval(&other, "deploy", None).await.unwrap();
            gate.approve(id, "alice").await.unwrap();
        }
        assert!(gate.is_approved(task.task_id).await);
    }
}
