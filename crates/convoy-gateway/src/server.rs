use crate::middleware::{auth_middleware, rate_limit_middleware};
use crate::{approvals, events, governance, system, tasks};
use axum::{
    middleware as axum_mw,
    routing::{get, patch, post},
    Router,
};
use chrono::{DateTime, Utc};
use convoy_core::{ConvoyError, ConvoyResult};
use convoy_governance::{CostTracker, ReputationEngine};
use convoy_orchestrator::{EventBus, HitlGate, TaskQueue, TaskRouter};
use convoy_security::{require_role, AuditLog, AuditOutcome, Authenticator, Identity, RateLimiter, Role};
use convoy_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Services shared by every request.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<TaskQueue>,
    pub events: Arc<EventBus>,
    pub router: Arc<TaskRouter>,
    pub hitl: Arc<HitlGate>,
    pub cost: Arc<CostTracker>,
    pub reputation: Arc<ReputationEngine>,
    pub auth: Arc<Authenticator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub audit: Arc<AuditLog>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Check the caller's role; denials are written to the audit trail.
    pub fn authorize(&self, identity: &Identity, min: Role, action: &str) -> ConvoyResult<()> {
        require_role(identity, min).inspect_err(|e| {
            self.audit.log_action(
                &identity.subject,
                action,
                None,
                serde_json::json!({"required": min, "role": identity.role, "error": e.to_string()}),
                AuditOutcome::Denied,
            );
        })
    }

    /// Record an API action and its outcome.
    pub fn record<T>(
        &self,
        identity: &Identity,
        action: &str,
        target: impl ToString,
        result: &ConvoyResult<T>,
        details: serde_json::Value,
    ) {
        let (outcome, details) = match result {
            Ok(_) => (AuditOutcome::Success, details),
            Err(e) => {
                let outcome = if e.is_governance() || matches!(e, ConvoyError::Forbidden(_)) {
                    AuditOutcome::Denied
                } else {
                    AuditOutcome::Error
                };
                let mut details = details;
                details["error"] = serde_json::json!(e.to_string());
                (outcome, details)
            }
        };
        self.audit.log_action(
            &identity.subject,
            action,
            Some(target.to_string()),
            details,
            outcome,
        );
    }
}

/// Intervals for the gateway's maintenance loops.
#[derive(Debug, Clone, Copy)]
pub struct Maintenance {
    /// How often stale approvals are expired.
    pub approval_sweep: Duration,
    /// How often idle local rate-limit windows are dropped.
    pub rate_limit_cleanup: Duration,
    /// How often finished tasks are reaped.
    pub reap_every: Duration,
    /// Age after which finished tasks are reaped.
    pub reap_after: Duration,
    /// How often expired store keys are swept.
    pub store_purge: Duration,
}

impl Default for Maintenance {
    fn default() -> Self {
        Self {
            approval_sweep: Duration::from_secs(30),
            rate_limit_cleanup: Duration::from_secs(300),
            reap_every: Duration::from_secs(3600),
            reap_after: Duration::from_secs(7 * 24 * 3600),
            store_purge: Duration::from_secs(60),
        }
    }
}

/// The HTTP/WebSocket API.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the router with auth and rate limiting applied to every route.
    ///
    /// Rate limiting is the outermost layer so unauthenticated floods are
    /// throttled before credentials are checked.
    pub fn build(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(system::health))
            .route("/stats", get(system::stats))
            .route("/tasks", post(tasks::create_task))
            .route("/tasks/{id}", get(tasks::get_task))
            .route("/tasks/{id}/status", patch(tasks::update_status))
            .route("/events/publish", post(events::publish))
            .route("/events/stream", get(events::stream))
            .route("/approvals/pending", get(approvals::pending))
            .route("/approvals/history", get(approvals::history))
            .route("/approvals/{id}", get(approvals::get_approval))
            .route("/approvals/{id}/approve", post(approvals::approve))
            .route("/approvals/{id}/reject", post(approvals::reject))
            .route("/governance/agents/{id}", get(governance::agent))
            .route("/governance/agents/{id}/events", post(governance::record_event))
            .route("/governance/leaderboard", get(governance::leaderboard))
            .route("/governance/statistics", get(governance::statistics))
            .route("/governance/budget/{trace_id}", get(governance::budget))
            .layer(axum_mw::from_fn_with_state(state.clone(), auth_middleware))
            .layer(axum_mw::from_fn_with_state(state.clone(), rate_limit_middleware))
            .with_state(state)
    }

    /// Spawn the maintenance loops. They stop when `cancel` fires.
    pub fn spawn_maintenance(
        state: Arc<AppState>,
        maintenance: Maintenance,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let sweep_state = state.clone();
        handles.push(every(maintenance.approval_sweep, cancel.clone(), move || {
            let state = sweep_state.clone();
            async move { sweep_approvals(&state).await }
        }));

        let limiter = state.rate_limiter.clone();
        let idle = maintenance.rate_limit_cleanup;
        handles.push(every(idle, cancel.clone(), move || {
            let limiter = limiter.clone();
            async move {
                limiter.cleanup(idle);
                debug!(windows = limiter.local_windows(), "Rate limit windows pruned");
            }
        }));

        let store = state.store.clone();
        handles.push(every(maintenance.store_purge, cancel.clone(), move || {
            let store = store.clone();
            async move {
                match store.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "Expired store keys purged"),
                    Err(e) => warn!(error = %e, "Store purge failed"),
                }
            }
        }));

        let queue = state.queue.clone();
        let reap_after = chrono::Duration::from_std(maintenance.reap_after)
            .unwrap_or(chrono::Duration::MAX);
        handles.push(every(maintenance.reap_every, cancel, move || {
            let queue = queue.clone();
            async move {
                match queue.reap(reap_after).await {
                    Ok(0) => {}
                    Ok(reaped) => info!(reaped, "Finished tasks reaped"),
                    Err(e) => warn!(error = %e, "Task reaping failed"),
                }
            }
        }));

        handles
    }
}

/// Expire approvals past their timeout and cancel the tasks behind them.
pub async fn sweep_approvals(state: &AppState) {
    for request in state.hitl.expire_stale(Utc::now()).await {
        let result = state.hitl.settle(&state.queue, &request).await;
        if let Err(e) = &result {
            warn!(approval_id = %request.approval_id, task_id = %request.task_id, error = %e, "Settling expired approval failed");
        }
        state.audit.log_action(
            "system",
            "approval.timeout",
            Some(request.approval_id.to_string()),
            serde_json::json!({"task_id": request.task_id}),
            if result.is_ok() {
                AuditOutcome::Success
            } else {
                AuditOutcome::Error
            },
        );
    }
}

fn every<F, Fut>(period: Duration, cancel: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let period = period.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
    })
}
