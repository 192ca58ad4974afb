use crate::reputation::ReputationEngine;
use convoy_core::{ConvoyError, ConvoyResult, PermissionLevel};
use std::sync::Arc;
use tracing::warn;

/// Minimum level needed to touch an environment.
pub fn environment_level(environment: &str) -> ConvoyResult<PermissionLevel> {
    match environment.to_ascii_lowercase().as_str() {
        "sandbox" => Ok(PermissionLevel::SandboxOnly),
        "staging" => Ok(PermissionLevel::StagingAccess),
        "production" | "prod" => Ok(PermissionLevel::ProdLowRisk),
        other => Err(ConvoyError::validation(format!(
            "unknown environment '{other}'"
        ))),
    }
}

/// Answers "may this agent do this?" from its reputation-derived level.
pub struct PermissionChecker {
    reputation: Arc<ReputationEngine>,
}

impl PermissionChecker {
    pub fn new(reputation: Arc<ReputationEngine>) -> Self {
        Self { reputation }
    }

    /// Fail with [`ConvoyError::PermissionDenied`] unless the agent's level
    /// allows `operation`.
    ///
    /// Operations missing from every allow-list are validation errors.
    pub async fn check(&self, agent_id: &str, operation: &str) -> ConvoyResult<PermissionLevel> {
        let ops = &self.reputation.config().allowed_operations;
        let required = ops.lowest_level_for(operation).ok_or_else(|| {
            ConvoyError::validation(format!("unknown operation '{operation}'"))
        })?;
        let actual = self.reputation.get_permission_level(agent_id).await?;
        if actual >= required {
            return Ok(actual);
        }
        warn!(
            agent = %agent_id,
            operation = %operation,
            required = %required,
            actual = %actual,
            "Permission denied"
        );
        Err(ConvoyError::PermissionDenied {
            agent_id: agent_id.to_string(),
            operation: operation.to_string(),
            required,
            actual,
        })
    }

    pub async fn can_access_environment(
        &self,
        agent_id: &str,
        environment: &str,
    ) -> ConvoyResult<bool> {
        let required = environment_level(environment)?;
        let actual = self.reputation.get_permission_level(agent_id).await?;
        Ok(actual >= required)
    }

    pub async fn require_environment(&self, agent_id: &str, environment: &str) -> ConvoyResult<()> {
        let required = environment_level(environment)?;
        let actual = self.reputation.get_permission_level(agent_id).await?;
        if actual >= required {
            return Ok(());
        }
        warn!(agent = %agent_id, environment = %environment, "Environment access denied");
        Err(ConvoyError::PermissionDenied {
            agent_id: agent_id.to_string(),
            operation: format!("access_{}", environment.to_ascii_lowercase()),
            required,
            actual,
        })
    }
}
