use crate::task::TaskStatus;
use crate::{ConvoyError, ConvoyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Channel prefix shared by every event topic.
pub const EVENT_CHANNEL_PREFIX: &str = "convoy:events:";

/// Wildcard channel that receives every published event.
pub const WILDCARD_CHANNEL: &str = "convoy:events:*";

macro_rules! event_types {
    ($($variant:ident => $wire:literal, $doc:literal;)+) => {
        /// Closed set of event types. Wire names are dotted (`task.created`).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum EventType {
            $(
                #[doc = $doc]
                #[serde(rename = $wire)]
                $variant,
            )+
        }

        impl EventType {
            /// Every event type.
            pub const ALL: &'static [EventType] = &[$(EventType::$variant),+];

            /// Dotted wire name.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(EventType::$variant => $wire,)+
                }
            }
        }
    };
}

event_types! {
    TaskCreated => "task.created", "A task entered the queue.";
    TaskAssigned => "task.assigned", "A task was routed to an agent.";
    TaskStarted => "task.started", "An agent began work on a task.";
    TaskCompleted => "task.completed", "A task finished successfully.";
    TaskFailed => "task.failed", "A task gave up after its retries.";
    TaskCancelled => "task.cancelled", "A task was withdrawn.";
    TaskBlocked => "task.blocked", "A task is waiting on something external.";
    PrOpened => "pr.opened", "A pull request was opened.";
    PrMerged => "pr.merged", "A pull request was merged.";
    PrReviewRequested => "pr.review_requested", "A pull request needs review.";
    DeployStarted => "deploy.started", "A deployment started.";
    DeploySucceeded => "deploy.succeeded", "A deployment finished successfully.";
    DeployFailed => "deploy.failed", "A deployment failed.";
    DeployRolledBack => "deploy.rolled_back", "A deployment was rolled back.";
    AlertTriggered => "alert.triggered", "A monitoring alert fired.";
    AlertResolved => "alert.resolved", "A monitoring alert cleared.";
    KbUpdated => "kb.updated", "The knowledge base changed.";
    SlaWarning => "sla.warning", "A task is close to its SLA deadline.";
    SlaViolated => "sla.violated", "A task is past its SLA deadline.";
    HealthCheck => "health.check", "Periodic health report.";
    HealthDegraded => "health.degraded", "A component entered a degraded mode.";
    CiPassed => "ci.passed", "A CI run passed.";
    CiFailed => "ci.failed", "A CI run failed.";
    ApprovalRequested => "approval.requested", "A task is waiting for human approval.";
    ApprovalResolved => "approval.resolved", "A human approved, rejected or timed out a request.";
}

impl EventType {
    /// Namespace before the dot, e.g. `task`.
    pub fn namespace(&self) -> &'static str {
        let name = self.as_str();
        name.split_once('.').map(|(ns, _)| ns).unwrap_or(name)
    }

    /// Pub/sub channel carrying this event type.
    pub fn channel(&self) -> String {
        format!("{EVENT_CHANNEL_PREFIX}{}", self.as_str())
    }

    /// Event announcing that a task entered `status`, if there is one.
    pub fn for_status(status: TaskStatus) -> Option<EventType> {
        match status {
            TaskStatus::Pending => None,
            TaskStatus::Assigned => Some(EventType::TaskAssigned),
            TaskStatus::InProgress => Some(EventType::TaskStarted),
            TaskStatus::Completed => Some(EventType::TaskCompleted),
            TaskStatus::Failed => Some(EventType::TaskFailed),
            TaskStatus::Cancelled => Some(EventType::TaskCancelled),
            TaskStatus::Blocked => Some(EventType::TaskBlocked),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ConvoyError::validation(format!("unknown event type '{s}'")))
    }
}

/// Urgency of an event for consumers that triage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    /// Page someone.
    Critical,
    /// Act soon.
    High,
    /// Normal.
    #[default]
    Medium,
    /// Informational.
    Low,
}

impl FromStr for EventPriority {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(EventPriority::Critical),
            "high" => Ok(EventPriority::High),
            "medium" => Ok(EventPriority::Medium),
            "low" => Ok(EventPriority::Low),
            _ => Err(ConvoyError::validation(format!(
                "unknown event priority '{s}'"
            ))),
        }
    }
}

/// An immutable fact broadcast after something happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    pub event_id: Uuid,
    /// What happened.
    pub event_type: EventType,
    /// Consumer-facing urgency.
    #[serde(default)]
    pub priority: EventPriority,
    /// Agent (or component) that published the event.
    pub source_agent: String,
    /// Correlation id.
    pub trace_id: Uuid,
    /// Related task, if any.
    #[serde(default)]
    pub task_id: Option<Uuid>,
    /// Event-specific data.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event with a fresh id and trace id.
    pub fn new(
        event_type: EventType,
        source_agent: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            priority: EventPriority::default(),
            source_agent: source_agent.into(),
            trace_id: Uuid::new_v4(),
            task_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Link the event to a task and adopt its trace id.
    pub fn for_task(mut self, task_id: Uuid, trace_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self.trace_id = trace_id;
        self
    }

    /// Set the trace id.
    pub fn with_trace_id(mut self, trace_id: Uuid) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> ConvoyResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from the wire. Unknown event types are rejected.
    pub fn from_json(raw: &str) -> ConvoyResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(EventType::TaskCreated.as_str(), "task.created");
        assert_eq!(EventType::DeployRolledBack.namespace(), "deploy");
        assert_eq!(
            EventType::CiFailed.channel(),
            "convoy:events:ci.failed".to_string()
        );
        let json = serde_json::to_string(&EventType::PrReviewRequested).unwrap();
        assert_eq!(json, "\"pr.review_requested\"");
    }

    #[test]
    fn test_unknown_event_type_is_an_error() {
        assert!("task.exploded".parse::<EventType>().is_err());
        let raw = r#"{"event_id":"6f1c5a2e-9d7b-4f47-9a3e-0d5c1b2a3f4e","event_type":"task.exploded",
            "source_agent":"x","trace_id":"6f1c5a2e-9d7b-4f47-9a3e-0d5c1b2a3f4e","timestamp":"2026-01-01T00:00:00Z"}"#;
        assert!(Event::from_json(raw).is_err());
    }

    #[test]
    fn test_all_event_types_roundtrip_through_from_str() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), *t);
        }
    }

    #[test]
    fn test_status_events() {
        assert_eq!(EventType::for_status(TaskStatus::Pending), None);
        assert_eq!(
            EventType::for_status(TaskStatus::Completed),
            Some(EventType::TaskCompleted)
        );
    }

    #[test]
    fn test_event_for_task_adopts_trace() {
        let task_id = Uuid::new_v4();
        let trace_id = Uuid::new_v4();
        let event = Event::new(EventType::TaskStarted, "code_agent", serde_json::json!({}))
            .for_task(task_id, trace_id)
            .with_priority(EventPriority::High);
        assert_eq!(event.task_id, Some(task_id));
        assert_eq!(event.trace_id, trace_id);
        let parsed = Event::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(parsed, event);
    }
}
