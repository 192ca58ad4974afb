//! Governance for Convoy agents.
//!
//! Decides, before any tool invocation runs, whether the agent is trusted
//! enough, whether the resources it touches are in policy, whether the
//! content it sends looks dangerous, and whether its trace still has budget.
//!
//! # Main types
//!
//! - [`CostTracker`]: Token/USD accounting per trace, hour and day.
//! - [`ReputationEngine`]: Scores agents and derives their [`PermissionLevel`](convoy_core::PermissionLevel).
//! - [`PermissionChecker`]: Operation and environment checks by level.
//! - [`PolicyGuard`]: File, network and tool policy plus file-risk scoring.
//! - [`ViolationDetector`]: Regex rules over commands and content.
//! - [`GovernanceGuard`]: Runs all of the above for one [`ToolInvocation`].

/// Cost tracking and budget enforcement.
pub mod cost;
/// Pre-execution checkpoint.
pub mod guard;
/// Permission checks by reputation level.
pub mod permission;
/// Resource policy and risk scoring.
pub mod policy;
/// Reputation scoring.
pub mod reputation;
/// Reputation persistence.
pub mod reputation_store;
/// Content violation detection.
pub mod violation;

pub use cost::{AlertLevel, BudgetCheck, BudgetConfig, BudgetLimits, BudgetStatus, CostTracker};
pub use guard::{Authorization, GovernanceGuard, ToolInvocation};
pub use permission::{environment_level, PermissionChecker};
pub use policy::{PolicyConfig, PolicyGuard, RiskAssessment, RiskMatch, ToolPolicy};
pub use reputation::{
    AllowedOperations, LevelThresholds, ReputationConfig, ReputationEngine, ReputationStatistics,
};
pub use reputation_store::{
    MemoryReputationStore, ReputationEvent, ReputationStore, SqliteReputationStore, StoredAgent,
    DEFAULT_MEMORY_HISTORY,
};
pub use violation::{
    Violation, ViolationAction, ViolationCategory, ViolationDetector, ViolationRule,
};
