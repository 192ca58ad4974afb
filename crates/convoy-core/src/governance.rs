//! Records owned by the governance subsystem: cost windows and reputation.

use crate::ConvoyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Accounting window for token/USD usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    /// Everything spent under one trace id.
    Task,
    /// System-wide, current UTC hour.
    Hourly,
    /// System-wide, current UTC day.
    Daily,
}

impl BudgetPeriod {
    /// All windows, narrowest first.
    pub const ALL: [BudgetPeriod; 3] = [BudgetPeriod::Task, BudgetPeriod::Hourly, BudgetPeriod::Daily];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetPeriod::Task => "task",
            BudgetPeriod::Hourly => "hourly",
            BudgetPeriod::Daily => "daily",
        }
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BudgetPeriod {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(BudgetPeriod::Task),
            "hourly" => Ok(BudgetPeriod::Hourly),
            "daily" => Ok(BudgetPeriod::Daily),
            _ => Err(ConvoyError::validation(format!("unknown budget period '{s}'"))),
        }
    }
}

/// Aggregated usage in one accounting window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostMetrics {
    /// Tokens consumed.
    pub tokens: u64,
    /// Dollars spent.
    pub usd: f64,
    /// Number of tracked calls.
    pub requests: u64,
}

/// Ordinal trust tier. Declaration order is the total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    /// Sandbox only.
    SandboxOnly,
    /// May touch staging.
    StagingAccess,
    /// May perform low-risk production operations.
    ProdLowRisk,
    /// Unrestricted production access.
    ProdFullAccess,
}

impl PermissionLevel {
    /// Every level, lowest first.
    pub const ALL: [PermissionLevel; 4] = [
        PermissionLevel::SandboxOnly,
        PermissionLevel::StagingAccess,
        PermissionLevel::ProdLowRisk,
        PermissionLevel::ProdFullAccess,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::SandboxOnly => "sandbox_only",
            PermissionLevel::StagingAccess => "staging_access",
            PermissionLevel::ProdLowRisk => "prod_low_risk",
            PermissionLevel::ProdFullAccess => "prod_full_access",
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PermissionLevel::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| ConvoyError::validation(format!("unknown permission level '{s}'")))
    }
}

/// Reputation snapshot for one agent. `permission_level` is always derived
/// from `reputation_score` when the record is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationRecord {
    /// Stable agent id.
    pub agent_id: String,
    /// Kind of agent (`code_agent`, `deploy_agent`, …).
    pub agent_type: String,
    /// Current score.
    pub reputation_score: i64,
    /// Level derived from the score.
    pub permission_level: PermissionLevel,
    /// Last score-changing activity.
    pub last_activity: DateTime<Utc>,
    /// First time the agent was seen.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_levels_are_totally_ordered() {
        let levels = PermissionLevel::ALL;
        for pair in levels.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(
            "prod_low_risk".parse::<PermissionLevel>().unwrap(),
            PermissionLevel::ProdLowRisk
        );
        assert!("root".parse::<PermissionLevel>().is_err());
    }

    #[test]
    fn test_budget_period_parse() {
        assert_eq!("hourly".parse::<BudgetPeriod>().unwrap(), BudgetPeriod::Hourly);
        assert!("weekly".parse::<BudgetPeriod>().is_err());
    }
}
