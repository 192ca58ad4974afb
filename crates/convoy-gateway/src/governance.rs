use crate::error::{ApiResponse, ApiResult};
use crate::server::AppState;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use convoy_core::{BudgetPeriod, ReputationRecord};
use convoy_governance::{BudgetStatus, ReputationEvent, ReputationStatistics};
use convoy_security::{Identity, Role};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const HISTORY_LIMIT: usize = 20;
const DEFAULT_LEADERBOARD: usize = 10;

#[derive(Debug, Serialize)]
pub struct AgentReport {
    #[serde(flatten)]
    pub record: ReputationRecord,
    pub allowed_operations: Vec<String>,
    pub history: Vec<ReputationEvent>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BudgetQuery {
    pub period: Option<String>,
}

/// `POST /governance/agents/{id}/events` body.
#[derive(Debug, Deserialize)]
pub struct RecordEventRequest {
    pub event_type: String,
    pub trace_id: Option<String>,
    pub reason: Option<String>,
}

pub async fn agent(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(agent_id): Path<String>,
) -> ApiResult<AgentReport> {
    state.authorize(&identity, Role::User, "governance.agent")?;
    let record = state.reputation.get_record(&agent_id).await?;
    let allowed_operations = state.reputation.get_allowed_operations(&agent_id).await?;
    let history = state.reputation.get_history(&agent_id, HISTORY_LIMIT).await?;
    Ok(ApiResponse::ok(AgentReport {
        record,
        allowed_operations,
        history,
    }))
}

pub async fn leaderboard(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    query: Result<Query<LeaderboardQuery>, QueryRejection>,
) -> ApiResult<Vec<ReputationRecord>> {
    state.authorize(&identity, Role::User, "governance.leaderboard")?;
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_LEADERBOARD);
    Ok(ApiResponse::ok(state.reputation.get_leaderboard(limit).await?))
}

pub async fn statistics(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<ReputationStatistics> {
    state.authorize(&identity, Role::User, "governance.statistics")?;
    Ok(ApiResponse::ok(state.reputation.get_statistics().await?))
}

/// Apply a reputation event by hand. Unknown agents are created first.
pub async fn record_event(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(agent_id): Path<String>,
    body: Result<Json<RecordEventRequest>, JsonRejection>,
) -> ApiResult<ReputationRecord> {
    state.authorize(&identity, Role::Admin, "governance.record_event")?;
    let Json(body) = body?;

    let result = async {
        let agent_id = state.reputation.get_or_create_agent(&agent_id).await?;
        state
            .reputation
            .record_event(
                &agent_id,
                &body.event_type,
                body.trace_id.as_deref(),
                body.reason.as_deref(),
            )
            .await
    }
    .await;
    state.record(
        &identity,
        "governance.record_event",
        &agent_id,
        &result,
        serde_json::json!({"event_type": body.event_type, "reason": body.reason}),
    );
    Ok(ApiResponse::ok(result?))
}

/// Usage against the limits of one window; `?period=` defaults to `task`.
pub async fn budget(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(trace_id): Path<String>,
    query: Result<Query<BudgetQuery>, QueryRejection>,
) -> ApiResult<BudgetStatus> {
    state.authorize(&identity, Role::User, "governance.budget")?;
    let Query(query) = query?;
    let period = match query.period.as_deref() {
        Some(p) => p.parse::<BudgetPeriod>()?,
        None => BudgetPeriod::Task,
    };
    Ok(ApiResponse::ok(
        state.cost.get_budget_status(&trace_id, period).await,
    ))
}
