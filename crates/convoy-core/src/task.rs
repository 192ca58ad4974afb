use crate::{ConvoyError, ConvoyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of work a task represents. Closed set: unknown strings are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Answer a question from the knowledge base.
    Faq,
    /// Fix a reported defect.
    Bugfix,
    /// Ship a build to an environment.
    Deploy,
    /// Root-cause an incident or anomaly.
    Investigate,
    /// Watch a system for a period of time.
    Monitor,
    /// React to a fired alert.
    Alert,
    /// Restructure existing code.
    Refactor,
    /// Build new functionality.
    Feature,
    /// Update the knowledge base.
    KbUpdate,
}

impl TaskType {
    /// Every task type, in declaration order.
    pub const ALL: [TaskType; 9] = [
        TaskType::Faq,
        TaskType::Bugfix,
        TaskType::Deploy,
        TaskType::Investigate,
        TaskType::Monitor,
        TaskType::Alert,
        TaskType::Refactor,
        TaskType::Feature,
        TaskType::KbUpdate,
    ];

    /// Wire name, e.g. `kb_update`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Faq => "faq",
            TaskType::Bugfix => "bugfix",
            TaskType::Deploy => "deploy",
            TaskType::Investigate => "investigate",
            TaskType::Monitor => "monitor",
            TaskType::Alert => "alert",
            TaskType::Refactor => "refactor",
            TaskType::Feature => "feature",
            TaskType::KbUpdate => "kb_update",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ConvoyError::validation(format!("unknown task type '{s}'")))
    }
}

/// Task priority. `P0` is the most urgent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Priority {
    /// Drop everything.
    P0,
    /// Urgent.
    P1,
    /// Normal.
    #[default]
    P2,
    /// Whenever there is spare capacity.
    P3,
}

impl Priority {
    /// Every priority, highest first.
    pub const ALL: [Priority; 4] = [Priority::P0, Priority::P1, Priority::P2, Priority::P3];

    /// Numeric queue score: P0=1 … P3=4, lower is dequeued first.
    pub fn score(&self) -> u8 {
        match self {
            Priority::P0 => 1,
            Priority::P1 => 2,
            Priority::P2 => 3,
            Priority::P3 => 4,
        }
    }

    /// Inverse of [`Priority::score`].
    pub fn from_score(score: u8) -> Option<Self> {
        Priority::ALL.iter().copied().find(|p| p.score() == score)
    }

    /// Wire name, e.g. `P1`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "P0" => Ok(Priority::P0),
            "P1" => Ok(Priority::P1),
            "P2" => Ok(Priority::P2),
            "P3" => Ok(Priority::P3),
            _ => Err(ConvoyError::validation(format!("unknown priority '{s}'"))),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting in the queue.
    Pending,
    /// Routed to an agent.
    Assigned,
    /// An agent is working on it.
    InProgress,
    /// Finished successfully. Terminal.
    Completed,
    /// Gave up. Terminal.
    Failed,
    /// Withdrawn. Terminal.
    Cancelled,
    /// Waiting on something external, usually a human approval.
    Blocked,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Blocked,
    ];

    /// Wire name, e.g. `in_progress`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Blocked => "blocked",
        }
    }

    /// Completed, failed and cancelled tasks are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| ConvoyError::validation(format!("unknown task status '{s}'")))
    }
}

fn default_alert_threshold() -> f64 {
    0.8
}

/// Service-level agreement attached to a task. Advisory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sla {
    /// Free-text description of the target ("respond within 1h").
    pub target: String,
    /// Absolute deadline.
    pub deadline: DateTime<Utc>,
    /// Fraction of the created→deadline span after which the SLA is at risk.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
}

impl Sla {
    /// Create an SLA with the default 0.8 alert threshold.
    pub fn new(target: impl Into<String>, deadline: DateTime<Utc>) -> Self {
        Self {
            target: target.into(),
            deadline,
            alert_threshold: default_alert_threshold(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

/// A unit of work crossing agent boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id.
    pub task_id: Uuid,
    /// Correlates the task with its events, cost and reputation records.
    pub trace_id: Uuid,
    /// What kind of work this is.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Queue priority.
    #[serde(default)]
    pub priority: Priority,
    /// Who created the task.
    pub source: String,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Type-specific data, opaque to the core.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Free-form annotations (environment, feature-flag markers, …).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Agent that owns the task. Set once by the router.
    #[serde(default)]
    pub assigned_to: Option<String>,
    /// Output written back by the owning agent.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First time the task entered `in_progress`.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Time the task reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Optional advisory deadline.
    #[serde(default)]
    pub sla: Option<Sla>,
    /// Parent task when this is a sub-task.
    #[serde(default)]
    pub parent_task_id: Option<Uuid>,
    /// Sub-tasks spawned from this task.
    #[serde(default)]
    pub child_task_ids: Vec<Uuid>,
    /// Last failure message.
    #[serde(default)]
    pub error: Option<String>,
    /// Attempts already retried.
    #[serde(default)]
    pub retry_count: u32,
    /// Retry ceiling before the task fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Task {
    /// Create a pending task with fresh task and trace ids.
    pub fn new(task_type: TaskType, payload: serde_json::Value) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            task_type,
            priority: Priority::default(),
            source: "api".to_string(),
            status: TaskStatus::Pending,
            payload,
            metadata: HashMap::new(),
            assigned_to: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            sla: None,
            parent_task_id: None,
            child_task_ids: Vec::new(),
            error: None,
            retry_count: 0,
            max_retries: default_max_retries(),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set who created the task.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Reuse an existing trace id.
    pub fn with_trace_id(mut self, trace_id: Uuid) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Attach an SLA.
    pub fn with_sla(mut self, sla: Sla) -> Self {
        self.sla = Some(sla);
        self
    }

    /// Mark this task as a sub-task of `parent`.
    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_task_id = Some(parent);
        self
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Override the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Record a spawned sub-task.
    pub fn add_child(&mut self, child: Uuid) {
        if !self.child_task_ids.contains(&child) {
            self.child_task_ids.push(child);
        }
    }

    /// Assign the task to an agent. Assignment happens once; re-assigning to
    /// the same agent is a no-op, to another agent an error.
    pub fn assign(&mut self, agent: impl Into<String>) -> ConvoyResult<()> {
        let agent = agent.into();
        match &self.assigned_to {
            Some(current) if *current == agent => Ok(()),
            Some(current) => Err(ConvoyError::Conflict(format!(
                "task {} is already assigned to {current}",
                self.task_id
            ))),
            None => {
                self.assigned_to = Some(agent);
                if self.status == TaskStatus::Pending {
                    self.status = TaskStatus::Assigned;
                }
                Ok(())
            }
        }
    }

    /// Move the task to `next`, maintaining the timestamp invariants.
    ///
    /// Terminal tasks reject every transition. `started_at` is only written the
    /// first time the task enters `in_progress`.
    pub fn transition(&mut self, next: TaskStatus) -> ConvoyResult<()> {
        self.transition_at(next, Utc::now())
    }

    /// [`Task::transition`] with an explicit clock.
    pub fn transition_at(&mut self, next: TaskStatus, now: DateTime<Utc>) -> ConvoyResult<()> {
        if self.status.is_terminal() {
            return Err(ConvoyError::Conflict(format!(
                "task {} is {} and cannot move to {next}",
                self.task_id, self.status
            )));
        }
        if next == TaskStatus::InProgress && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Whether another retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// True once `now` is past the SLA deadline. Always false without an SLA.
    pub fn is_sla_violated(&self, now: DateTime<Utc>) -> bool {
        self.sla.as_ref().is_some_and(|sla| now > sla.deadline)
    }

    /// True once the elapsed share of the created→deadline span reaches the
    /// SLA's alert threshold (and the deadline is not yet past).
    pub fn is_sla_at_risk(&self, now: DateTime<Utc>) -> bool {
        let Some(sla) = &self.sla else {
            return false;
        };
        if now > sla.deadline {
            return false;
        }
        let span = (sla.deadline - self.created_at).num_milliseconds();
        if span <= 0 {
            return true;
        }
        let elapsed = (now - self.created_at).num_milliseconds();
        elapsed as f64 / span as f64 >= sla.alert_threshold
    }

    /// Read an environment hint from metadata, falling back to the payload.
    pub fn environment(&self) -> Option<&str> {
        self.metadata
            .get("environment")
            .and_then(|v| v.as_str())
            .or_else(|| self.payload.get("environment").and_then(|v| v.as_str()))
    }
}
