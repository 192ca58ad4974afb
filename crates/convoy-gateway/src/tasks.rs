use crate::error::{ApiError, ApiResponse, ApiResult};
use crate::server::AppState;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use convoy_core::{ConvoyError, EventType, Priority, Sla, Task, TaskStatus, TaskType};
use convoy_security::{Identity, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// `POST /tasks` body.
#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub priority: Option<String>,
    pub source: Option<String>,
    pub sla_target: Option<String>,
    pub sla_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub parent_task_id: Option<Uuid>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: Uuid,
    pub assigned_to: Option<String>,
    pub task: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub status: String,
}

impl CreateTaskRequest {
    /// Build the task, rejecting unknown enum values.
    pub fn into_task(self, default_source: &str) -> Result<Task, ConvoyError> {
        let task_type: TaskType = self.task_type.parse()?;
        let priority = match self.priority.as_deref() {
            Some(p) => p.parse::<Priority>()?,
            None => Priority::default(),
        };
        let mut task = Task::new(task_type, self.payload)
            .with_priority(priority)
            .with_source(self.source.unwrap_or_else(|| default_source.to_string()));
        match (self.sla_target, self.sla_deadline) {
            (target, Some(deadline)) => {
                let target = target.unwrap_or_else(|| format!("complete by {}", deadline.to_rfc3339()));
                task = task.with_sla(Sla::new(target, deadline));
            }
            (Some(_), None) => {
                return Err(ConvoyError::validation("sla_target requires sla_deadline"));
            }
            (None, None) => {}
        }
        for (key, value) in self.metadata {
            task = task.with_metadata(key, value);
        }
        if let Some(parent) = self.parent_task_id {
            task = task.with_parent(parent);
        }
        if let Some(max_retries) = self.max_retries {
            task = task.with_max_retries(max_retries);
        }
        Ok(task)
    }
}

/// Create, route and queue a task. Tasks that need human approval are
/// stored blocked with a pending approval instead of being queued.
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> ApiResult<CreateTaskResponse> {
    state.authorize(&identity, Role::Agent, "task.create")?;
    let Json(body) = body?;
    let mut task = body.into_task(&identity.subject)?;

    if let Some(parent_id) = task.parent_task_id {
        state.queue.load(parent_id).await.map_err(|e| {
            ApiError::from(e).with_hint("parent_task_id must reference an existing task")
        })?;
    }

    let agent = state.router.assign(&mut task)?;
    let approval_id = match state.hitl.approval_reason(&task) {
        Some(reason) => {
            state.queue.update(&task).await?;
            announce_created(&state, &task).await;
            task = state
                .queue
                .transition(task.task_id, TaskStatus::Blocked, None)
                .await?;
            Some(state.hitl.request_approval(&task, reason, None).await?)
        }
        None => {
            state.queue.enqueue(&task).await?;
            None
        }
    };

    if let Some(parent_id) = task.parent_task_id {
        state.queue.link_child(parent_id, task.task_id).await?;
    }

    info!(
        task_id = %task.task_id,
        task_type = %task.task_type,
        agent = %agent,
        blocked = approval_id.is_some(),
        subject = %identity.subject,
        "Task created"
    );
    Ok(ApiResponse::created(CreateTaskResponse {
        task_id: task.task_id,
        assigned_to: task.assigned_to.clone(),
        task,
        approval_id,
    }))
}

async fn announce_created(state: &AppState, task: &Task) {
    let payload = serde_json::json!({
        "task_type": task.task_type,
        "priority": task.priority,
        "assigned_to": task.assigned_to,
    });
    if let Err(e) = state
        .events
        .publish(
            EventType::TaskCreated,
            &task.source,
            payload,
            Some(task.task_id),
            Some(task.trace_id),
            None,
        )
        .await
    {
        warn!(task_id = %task.task_id, error = %e, "Task event publish failed");
    }
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<Task> {
    state.authorize(&identity, Role::User, "task.read")?;
    Ok(ApiResponse::ok(state.queue.load(id).await?))
}

/// Move a task to `?status=`. `pending` puts it back in the queue.
pub async fn update_status(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> ApiResult<Task> {
    state.authorize(&identity, Role::Agent, "task.status")?;
    let Query(query) = query?;
    let status: TaskStatus = query.status.parse()?;

    let result = match status {
        TaskStatus::Pending => state.queue.requeue(id, false, None).await,
        _ => state.queue.transition(id, status, None).await,
    };
    state.record(
        &identity,
        "task.status",
        id,
        &result,
        serde_json::json!({"status": status}),
    );
    Ok(ApiResponse::ok(result?))
}
