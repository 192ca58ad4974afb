use crate::error::{ApiResponse, ApiResult};
use crate::server::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use convoy_core::TaskType;
use convoy_orchestrator::QueueStats;
use convoy_security::{Identity, Role};
use convoy_store::DegradedMode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct Health {
    /// `ok`, `degraded` or `unavailable`.
    pub status: &'static str,
    pub store: StoreHealth,
    pub degraded: Vec<DegradedMode>,
    pub uptime_secs: i64,
}

#[derive(Debug, Serialize)]
pub struct StoreHealth {
    pub backend: &'static str,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Stats {
    pub queue: QueueStats,
    pub pending_approvals: usize,
    pub routing: BTreeMap<TaskType, String>,
    pub default_agent: String,
    pub event_subscriptions: usize,
    pub uptime_secs: i64,
}

/// Store reachability and every component running in degraded mode.
/// Answers 503 when the store cannot be reached.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let ping = state.store.ping().await;
    let degraded: Vec<DegradedMode> = [state.cost.degraded(), state.rate_limiter.degraded()]
        .into_iter()
        .flatten()
        .collect();
    let (status, code) = match (&ping, degraded.is_empty()) {
        (Err(_), _) => ("unavailable", StatusCode::SERVICE_UNAVAILABLE),
        (Ok(()), false) => ("degraded", StatusCode::OK),
        (Ok(()), true) => ("ok", StatusCode::OK),
    };
    let health = Health {
        status,
        store: StoreHealth {
            backend: state.store.backend(),
            reachable: ping.is_ok(),
            error: ping.err().map(|e| e.to_string()),
        },
        degraded,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    };
    (
        code,
        Json(serde_json::json!({"success": code.is_success(), "data": health})),
    )
        .into_response()
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Stats> {
    state.authorize(&identity, Role::User, "system.stats")?;
    Ok(ApiResponse::ok(Stats {
        queue: state.queue.stats().await?,
        pending_approvals: state.hitl.pending_count().await,
        routing: state.router.table(),
        default_agent: state.router.default_agent().to_string(),
        event_subscriptions: state.events.subscription_count(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    }))
}
