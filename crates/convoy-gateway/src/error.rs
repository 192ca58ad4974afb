//! Response envelopes.
//!
//! Successes are `{"success": true, "data": …}`; failures are
//! `{"success": false, "error": {"code", "message", "hint"?}}` with the HTTP
//! status derived from the [`ConvoyError`] variant.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use convoy_core::ConvoyError;
use serde::Serialize;
use serde_json::json;

/// Error returned by every handler.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct ApiError {
    #[source]
    pub source: ConvoyError,
    pub hint: Option<String>,
}

impl ApiError {
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        status_for(&self.source)
    }
}

impl From<ConvoyError> for ApiError {
    fn from(source: ConvoyError) -> Self {
        Self { source, hint: None }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::from(ConvoyError::validation(rejection.body_text()))
            .with_hint("send a JSON body with Content-Type: application/json")
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::from(ConvoyError::validation(rejection.body_text()))
    }
}

/// HTTP status for each error kind.
pub fn status_for(err: &ConvoyError) -> StatusCode {
    match err {
        ConvoyError::Validation(_) => StatusCode::BAD_REQUEST,
        ConvoyError::NotFound(_) => StatusCode::NOT_FOUND,
        ConvoyError::Conflict(_) => StatusCode::CONFLICT,
        ConvoyError::PermissionDenied { .. }
        | ConvoyError::BudgetExceeded { .. }
        | ConvoyError::PolicyViolation { .. }
        | ConvoyError::Forbidden(_) => StatusCode::FORBIDDEN,
        ConvoyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        ConvoyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        ConvoyError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        ConvoyError::Config(_)
        | ConvoyError::Json(_)
        | ConvoyError::Io(_)
        | ConvoyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut error = json!({
            "code": self.source.code(),
            "message": self.source.to_string(),
        });
        if let Some(hint) = &self.hint {
            error["hint"] = json!(hint);
        }
        let mut response = (status, Json(json!({"success": false, "error": error}))).into_response();

        if let ConvoyError::RateLimited { retry_after_secs } = self.source {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

/// Successful response body.
pub struct ApiResponse<T> {
    status: StatusCode,
    data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: StatusCode::OK,
            data,
        }
    }

    pub fn created(data: T) -> Self {
        Self {
            status: StatusCode::CREATED,
            data,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"success": true, "data": self.data}))).into_response()
    }
}

pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use convoy_core::{PermissionLevel, RiskLevel};

    async fn body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_not_found_envelope() {
        let response = ApiError::from(ConvoyError::NotFound("task 1".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "not_found");
        assert!(body["error"]["message"].as_str().unwrap().contains("task 1"));
        assert!(body["error"].get("hint").is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let response = ApiError::from(ConvoyError::RateLimited { retry_after_secs: 12 })
            .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "12");
    }

    #[test]
    fn test_governance_denials_are_forbidden() {
        let denied = ConvoyError::PermissionDenied {
            agent_id: "a".into(),
            operation: "deploy".into(),
            required: PermissionLevel::ProdLowRisk,
            actual: PermissionLevel::SandboxOnly,
        };
        assert_eq!(status_for(&denied), StatusCode::FORBIDDEN);
        let policy = ConvoyError::PolicyViolation {
            category: "secrets_access".into(),
            pattern: ".env".into(),
            severity: RiskLevel::Critical,
            message: "no".into(),
        };
        assert_eq!(status_for(&policy), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(&ConvoyError::store("down")),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_success_envelope() {
        let response = ApiResponse::created(json!({"id": 7})).into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["id"], 7);
    }
}
