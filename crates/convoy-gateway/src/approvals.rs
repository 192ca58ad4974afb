use crate::error::{ApiError, ApiResponse, ApiResult};
use crate::server::AppState;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use convoy_core::{ApprovalRequest, ConvoyError, ConvoyResult, Task};
use convoy_security::{Identity, Role};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// Optional body of approve/reject.
#[derive(Debug, Default, Deserialize)]
pub struct DecisionRequest {
    /// Reviewer name. Defaults to the caller's subject.
    pub approver: Option<String>,
    /// Rejection reason.
    pub reason: Option<String>,
}

/// A resolution and the task state it produced.
#[derive(Debug, Serialize)]
pub struct Decision {
    pub approval: ApprovalRequest,
    pub task: Task,
}

pub async fn pending(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Vec<ApprovalRequest>> {
    state.authorize(&identity, Role::User, "approval.list")?;
    Ok(ApiResponse::ok(state.hitl.get_pending_approvals().await))
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<Vec<ApprovalRequest>> {
    state.authorize(&identity, Role::User, "approval.history")?;
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(ApiResponse::ok(state.hitl.history(limit).await))
}

pub async fn get_approval(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<ApprovalRequest> {
    state.authorize(&identity, Role::User, "approval.read")?;
    let approval = state
        .hitl
        .get_approval_status(id)
        .await
        .ok_or_else(|| ConvoyError::NotFound(format!("approval {id}")))?;
    Ok(ApiResponse::ok(approval))
}

/// Approve a request and release its task back into the queue.
pub async fn approve(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
    body: Result<Json<DecisionRequest>, JsonRejection>,
) -> ApiResult<Decision> {
    state.authorize(&identity, Role::Agent, "approval.approve")?;
    let body = optional_body(body)?;
    let approver = body.approver.unwrap_or_else(|| identity.subject.clone());

    let result = match state.hitl.approve(id, &approver).await {
        Ok(approval) => settle(&state, approval).await,
        Err(e) => Err(e),
    };
    state.record(
        &identity,
        "approval.approve",
        id,
        &result,
        serde_json::json!({}),
    );
    let decision = result?;

    if let Some(agent) = decision.task.assigned_to.as_deref() {
        reward(&state, agent, &decision.task).await;
    }
    Ok(ApiResponse::ok(decision))
}

/// Reject a request and cancel its task.
pub async fn reject(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
    body: Result<Json<DecisionRequest>, JsonRejection>,
) -> ApiResult<Decision> {
    state.authorize(&identity, Role::Agent, "approval.reject")?;
    let body = optional_body(body)?;
    let approver = body.approver.unwrap_or_else(|| identity.subject.clone());
    let reason = body.reason;
    let details = serde_json::json!({"reason": reason});

    let result = match state.hitl.reject(id, &approver, reason).await {
        Ok(approval) => settle(&state, approval).await,
        Err(e) => Err(e),
    };
    state.record(&identity, "approval.reject", id, &result, details);
    Ok(ApiResponse::ok(result?))
}

/// A decision body is optional; a request without a JSON content type
/// counts as empty.
fn optional_body(
    body: Result<Json<DecisionRequest>, JsonRejection>,
) -> Result<DecisionRequest, ApiError> {
    match body {
        Ok(Json(body)) => Ok(body),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(DecisionRequest::default()),
        Err(e) => Err(e.into()),
    }
}

async fn settle(state: &AppState, approval: ApprovalRequest) -> ConvoyResult<Decision> {
    let task = state.hitl.settle(&state.queue, &approval).await?;
    Ok(Decision { approval, task })
}

async fn reward(state: &AppState, agent: &str, task: &Task) {
    let trace = task.trace_id.to_string();
    let recorded = match state.reputation.get_or_create_agent(agent).await {
        Ok(agent_id) => {
            state
                .reputation
                .record_event(&agent_id, "human_approved", Some(&trace), None)
                .await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = recorded {
        warn!(agent = %agent, error = %e, "Reputation update failed");
    }
}
