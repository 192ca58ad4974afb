#![allow(clippy::unwrap_used, clippy::expect_used)]

use convoy_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Task wire format roundtrip with lineage, SLA and metadata
// ---------------------------------------------------------------------------

#[test]
fn task_wire_roundtrip_preserves_everything() {
    let parent = Uuid::new_v4();
    let deadline = chrono::Utc::now() + chrono::Duration::hours(2);
    let mut task = Task::new(TaskType::Deploy, serde_json::json!({"service": "billing"}))
        .with_priority(Priority::P1)
        .with_source("monitor_agent")
        .with_parent(parent)
        .with_sla(Sla::new("deploy within 2h", deadline))
        .with_metadata("environment", serde_json::json!("production"));
    task.add_child(Uuid::new_v4());
    task.assign("deploy_agent").unwrap();

    let json = serde_json::to_string(&task).unwrap();
    let back: Task = serde_json::from_str(&json).unwrap();

    assert_eq!(back.task_id, task.task_id);
    assert_eq!(back.task_type, TaskType::Deploy);
    assert_eq!(back.priority, Priority::P1);
    assert_eq!(back.status, TaskStatus::Assigned);
    assert_eq!(back.parent_task_id, Some(parent));
    assert_eq!(back.child_task_ids.len(), 1);
    assert_eq!(back.sla.as_ref().unwrap().deadline, deadline);
    assert_eq!(back.environment(), Some("production"));
}

// ---------------------------------------------------------------------------
// 2. Minimal JSON accepted by the API gets sane defaults
// ---------------------------------------------------------------------------

#[test]
fn task_minimal_json_defaults() {
    let raw = serde_json::json!({
        "task_id": Uuid::new_v4(),
        "trace_id": Uuid::new_v4(),
        "type": "faq",
        "source": "slack",
        "status": "pending",
        "created_at": "2026-03-01T12:00:00Z"
    });
    let task: Task = serde_json::from_value(raw).unwrap();
    assert_eq!(task.priority, Priority::P2);
    assert_eq!(task.max_retries, 3);
    assert!(task.child_task_ids.is_empty());
    assert!(task.payload.is_null());
}

#[test]
fn task_unknown_type_rejected_on_the_wire() {
    let raw = serde_json::json!({
        "task_id": Uuid::new_v4(),
        "trace_id": Uuid::new_v4(),
        "type": "teleport",
        "source": "slack",
        "status": "pending",
        "created_at": "2026-03-01T12:00:00Z"
    });
    assert!(serde_json::from_value::<Task>(raw).is_err());
}

// ---------------------------------------------------------------------------
// 3. Lifecycle: full happy path and terminal immutability
// ---------------------------------------------------------------------------

#[test]
fn task_full_lifecycle() {
    let mut task = Task::new(TaskType::Bugfix, serde_json::Value::Null);
    task.assign("code_agent").unwrap();
    task.transition(TaskStatus::InProgress).unwrap();
    let started = task.started_at.unwrap();
    task.transition(TaskStatus::Completed).unwrap();
    assert_eq!(task.started_at, Some(started));
    assert!(task.completed_at.unwrap() >= started);

    for next in TaskStatus::ALL {
        assert!(task.transition(next).is_err(), "{next} should be rejected");
    }
}

// ---------------------------------------------------------------------------
// 4. Events: every status maps to a task.* event in the task namespace
// ---------------------------------------------------------------------------

#[test]
fn status_events_live_in_task_namespace() {
    for status in TaskStatus::ALL {
        if let Some(event_type) = EventType::for_status(status) {
            assert_eq!(event_type.namespace(), "task");
        }
    }
}

#[test]
fn event_channels_are_distinct_from_wildcard() {
    for t in EventType::ALL {
        assert!(t.channel().starts_with(EVENT_CHANNEL_PREFIX));
        assert_ne!(t.channel(), WILDCARD_CHANNEL);
    }
}

// ---------------------------------------------------------------------------
// 5. Errors: governance denials are distinguishable
// ---------------------------------------------------------------------------

#[test]
fn governance_errors_are_flagged() {
    let policy = ConvoyError::PolicyViolation {
        category: "secrets_access".into(),
        pattern: "AKIA".into(),
        severity: RiskLevel::Critical,
        message: "AWS key in command".into(),
    };
    assert!(policy.is_governance());
    assert_eq!(policy.code(), "policy_violation");

    let conflict = ConvoyError::Conflict("already approved".into());
    assert!(!conflict.is_governance());
    assert_eq!(conflict.code(), "conflict");
}
