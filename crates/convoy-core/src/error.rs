use crate::approval::RiskLevel;
use crate::governance::{BudgetPeriod, PermissionLevel};

/// Top-level error type for Convoy.
///
/// Authorization failures (`PermissionDenied`, `BudgetExceeded`,
/// `PolicyViolation`) are first-class variants carrying the denied
/// operation, limit or pattern so callers can decide whether to escalate
/// the work to a human reviewer.
#[derive(Debug, thiserror::Error)]
pub enum ConvoyError {
    /// Malformed input: unknown enum value, bad payload, illegal transition.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A task, approval or agent could not be found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation conflicts with the current state (e.g. double resolution).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The agent's permission level does not allow the operation.
    #[error(
        "Permission denied: agent {agent_id} needs {required} for '{operation}' but has {actual}"
    )]
    PermissionDenied {
        /// Agent that attempted the operation.
        agent_id: String,
        /// Operation that was denied.
        operation: String,
        /// Lowest level that allows the operation.
        required: PermissionLevel,
        /// The agent's current level.
        actual: PermissionLevel,
    },

    /// Usage in an accounting window is above its configured limit.
    #[error(
        "Budget exceeded for {period} window of trace {trace_id}: tokens={tokens}/{max_tokens}, usd={usd:.4}/{max_usd:.4}"
    )]
    BudgetExceeded {
        /// Trace the check was made for.
        trace_id: String,
        /// Accounting window that was exceeded.
        period: BudgetPeriod,
        /// Tokens used in the window.
        tokens: u64,
        /// Token ceiling for the window.
        max_tokens: u64,
        /// USD spent in the window.
        usd: f64,
        /// USD ceiling for the window.
        max_usd: f64,
    },

    /// A policy rule or violation pattern blocked the action.
    #[error("Policy violation [{category}] {message} (pattern: {pattern})")]
    PolicyViolation {
        /// Rule category, e.g. `file_access` or `secrets_access`.
        category: String,
        /// The pattern or rule that matched.
        pattern: String,
        /// Severity attached to the rule.
        severity: RiskLevel,
        /// Human-readable description.
        message: String,
    },

    /// Missing or invalid credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated, but the role is insufficient.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The caller exceeded its request rate.
    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the window frees a slot.
        retry_after_secs: u64,
    },

    /// The backing store could not be reached or returned an error.
    #[error("Store error: {0}")]
    Store(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else that should never reach a caller.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConvoyError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ConvoyError::Validation(_) => "validation_error",
            ConvoyError::NotFound(_) => "not_found",
            ConvoyError::Conflict(_) => "conflict",
            ConvoyError::PermissionDenied { .. } => "permission_denied",
            ConvoyError::BudgetExceeded { .. } => "budget_exceeded",
            ConvoyError::PolicyViolation { .. } => "policy_violation",
            ConvoyError::Unauthorized(_) => "unauthorized",
            ConvoyError::Forbidden(_) => "forbidden",
            ConvoyError::RateLimited { .. } => "rate_limited",
            ConvoyError::Store(_) => "store_unavailable",
            ConvoyError::Config(_) => "config_error",
            ConvoyError::Json(_) => "invalid_json",
            ConvoyError::Io(_) => "io_error",
            ConvoyError::Internal(_) => "internal_error",
        }
    }

    /// True for permission, budget and policy denials: the conditions a caller
    /// may escalate to human review instead of failing outright.
    pub fn is_governance(&self) -> bool {
        matches!(
            self,
            ConvoyError::PermissionDenied { .. }
                | ConvoyError::BudgetExceeded { .. }
                | ConvoyError::PolicyViolation { .. }
        )
    }

    /// Shorthand for a [`ConvoyError::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        ConvoyError::Validation(msg.into())
    }

    /// Shorthand for a [`ConvoyError::Store`].
    pub fn store(msg: impl std::fmt::Display) -> Self {
        ConvoyError::Store(msg.to_string())
    }
}

/// A convenience `Result` alias using [`ConvoyError`].
pub type ConvoyResult<T> = Result<T, ConvoyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_message_names_limits() {
        let err = ConvoyError::BudgetExceeded {
            trace_id: "t-1".into(),
            period: BudgetPeriod::Daily,
            tokens: 2000,
            max_tokens: 1500,
            usd: 0.06,
            max_usd: 10.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("tokens=2000/1500"));
        assert!(msg.contains("daily"));
        assert_eq!(err.code(), "budget_exceeded");
        assert!(err.is_governance());
    }

    #[test]
    fn test_permission_message_names_levels() {
        let err = ConvoyError::PermissionDenied {
            agent_id: "a".into(),
            operation: "deploy_prod".into(),
            required: PermissionLevel::ProdFullAccess,
            actual: PermissionLevel::SandboxOnly,
        };
        let msg = err.to_string();
        assert!(msg.contains("prod_full_access"));
        assert!(msg.contains("sandbox_only"));
    }

    #[test]
    fn test_non_governance_errors() {
        assert!(!ConvoyError::validation("bad").is_governance());
        assert!(!ConvoyError::store("down").is_governance());
        assert_eq!(ConvoyError::store("down").code(), "store_unavailable");
    }
}
