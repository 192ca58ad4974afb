//! Approval records for the human-in-the-loop (HITL) gate.
//!
//! These types live in `convoy-core` so the orchestrator (which owns the gate)
//! and the gateway (which exposes it over HTTP) share one definition.

use crate::ConvoyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Risk level attached to policy rules, violations and file-risk scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            _ => Err(ConvoyError::validation(format!("unknown risk level '{s}'"))),
        }
    }
}

/// State of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalStatus {
    /// Anything but `Pending`.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// A request for a human to sign off on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: Uuid,
    pub task_id: Uuid,
    /// Why the task needs sign-off.
    pub reason: String,
    /// Reviewer the request is addressed to, if any.
    #[serde(default)]
    pub approver: Option<String>,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    /// Resolution time (approve, reject or timeout).
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    /// Reviewer who resolved the request.
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

impl ApprovalRequest {
    pub fn new(task_id: Uuid, reason: impl Into<String>, approver: Option<String>) -> Self {
        Self {
            approval_id: Uuid::new_v4(),
            task_id,
            reason: reason.into(),
            approver,
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            approved_at: None,
            approved_by: None,
            rejection_reason: None,
        }
    }

    /// Resolve the request. Returns a conflict error if it is already resolved.
    pub fn resolve(
        &mut self,
        status: ApprovalStatus,
        by: impl Into<String>,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), ConvoyError> {
        if self.status.is_resolved() {
            return Err(ConvoyError::Conflict(format!(
                "approval {} is already {:?}",
                self.approval_id, self.status
            )));
        }
        if status == ApprovalStatus::Pending {
            return Err(ConvoyError::validation("cannot resolve to pending"));
        }
        self.status = status;
        self.approved_at = Some(at);
        self.approved_by = Some(by.into());
        self.rejection_reason = reason;
        Ok(())
    }
}
