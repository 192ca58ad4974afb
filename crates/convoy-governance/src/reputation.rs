//! Reputation scoring and the permission levels derived from it.
//!
//! Agents earn and lose points through a declarative scoring table. The
//! permission level is a pure function of the score over ordered
//! thresholds, so it can never drift from the score.

use crate::reputation_store::{ReputationEvent, ReputationStore, StoredAgent};
use chrono::{DateTime, Utc};
use convoy_core::{ConvoyError, ConvoyResult, PermissionLevel, ReputationRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Minimum score for each level above `sandbox_only`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelThresholds {
    pub staging_access: i64,
    pub prod_low_risk: i64,
    pub prod_full_access: i64,
}

impl Default for LevelThresholds {
    fn default() -> Self {
        Self {
            staging_access: 100,
            prod_low_risk: 150,
            prod_full_access: 200,
        }
    }
}

impl LevelThresholds {
    pub fn level_for_score(&self, score: i64) -> PermissionLevel {
        if score >= self.prod_full_access {
            PermissionLevel::ProdFullAccess
        } else if score >= self.prod_low_risk {
            PermissionLevel::ProdLowRisk
        } else if score >= self.staging_access {
            PermissionLevel::StagingAccess
        } else {
            PermissionLevel::SandboxOnly
        }
    }
}

/// Operations each level adds on top of the levels below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowedOperations {
    pub sandbox_only: Vec<String>,
    pub staging_access: Vec<String>,
    pub prod_low_risk: Vec<String>,
    pub prod_full_access: Vec<String>,
}

fn owned(ops: &[&str]) -> Vec<String> {
    ops.iter().map(|s| s.to_string()).collect()
}

impl Default for AllowedOperations {
    fn default() -> Self {
        Self {
            sandbox_only: owned(&["read_code", "run_tests_sandbox", "create_branch", "comment_pr"]),
            staging_access: owned(&["deploy_staging", "create_pr", "run_migrations_staging"]),
            prod_low_risk: owned(&["deploy_prod_canary", "update_feature_flag", "restart_service"]),
            prod_full_access: owned(&[
                "deploy_prod",
                "rollback_prod",
                "modify_infrastructure",
                "run_migrations_prod",
            ]),
        }
    }
}

impl AllowedOperations {
    fn own(&self, level: PermissionLevel) -> &[String] {
        match level {
            PermissionLevel::SandboxOnly => &self.sandbox_only,
            PermissionLevel::StagingAccess => &self.staging_access,
            PermissionLevel::ProdLowRisk => &self.prod_low_risk,
            PermissionLevel::ProdFullAccess => &self.prod_full_access,
        }
    }

    /// Everything `level` may do, including what lower levels may do.
    pub fn for_level(&self, level: PermissionLevel) -> Vec<String> {
        PermissionLevel::ALL
            .iter()
            .filter(|l| **l <= level)
            .flat_map(|l| self.own(*l).iter().cloned())
            .collect()
    }

    /// Lowest level allowed to perform `operation`.
    pub fn lowest_level_for(&self, operation: &str) -> Option<PermissionLevel> {
        PermissionLevel::ALL
            .iter()
            .copied()
            .find(|l| self.own(*l).iter().any(|op| op == operation))
    }
}

/// Default scoring table.
pub fn default_deltas() -> BTreeMap<String, i64> {
    [
        ("task_completed", 10),
        ("test_passed", 20),
        ("pr_merged", 15),
        ("deploy_succeeded", 25),
        ("human_approved", 5),
        ("test_failed", -10),
        ("task_failed", -15),
        ("deploy_failed", -30),
        ("cost_overrun", -25),
        ("human_escalation", -10),
        ("policy_violation", -50),
        ("rollback", -40),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Reputation configuration (`[reputation]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    pub initial_score: i64,
    /// Floor no event or decay can push a score below.
    pub min_score: i64,
    pub thresholds: LevelThresholds,
    pub deltas: BTreeMap<String, i64>,
    /// Points lost per whole week of inactivity.
    pub decay_rate: i64,
    /// Inactivity before decay starts.
    pub decay_after_days: i64,
    pub allowed_operations: AllowedOperations,
    /// SQLite database; in-memory when unset.
    pub sqlite_path: Option<PathBuf>,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            initial_score: 100,
            min_score: 0,
            thresholds: LevelThresholds::default(),
            deltas: default_deltas(),
            decay_rate: 5,
            decay_after_days: 7,
            allowed_operations: AllowedOperations::default(),
            sqlite_path: None,
        }
    }
}

/// Aggregate view over every known agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReputationStatistics {
    pub total_agents: usize,
    pub average_score: f64,
    pub min_score: Option<i64>,
    pub max_score: Option<i64>,
    pub by_level: BTreeMap<String, usize>,
}

/// Applies scoring events, decay and level derivation on top of a
/// [`ReputationStore`].
pub struct ReputationEngine {
    store: Arc<dyn ReputationStore>,
    config: ReputationConfig,
}

impl ReputationEngine {
    pub fn new(store: Arc<dyn ReputationStore>, config: ReputationConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    pub fn level_for_score(&self, score: i64) -> PermissionLevel {
        self.config.thresholds.level_for_score(score)
    }

    /// Delta for `event_type`, or a validation error if it is not in the table.
    pub fn delta_for(&self, event_type: &str) -> ConvoyResult<i64> {
        self.config.deltas.get(event_type).copied().ok_or_else(|| {
            ConvoyError::validation(format!("unknown reputation event '{event_type}'"))
        })
    }

    fn materialise(&self, agent: StoredAgent) -> ReputationRecord {
        ReputationRecord {
            permission_level: self.level_for_score(agent.score),
            agent_id: agent.agent_id,
            agent_type: agent.agent_type,
            reputation_score: agent.score,
            last_activity: agent.last_activity,
            created_at: agent.created_at,
        }
    }

    async fn agent(&self, agent_id: &str) -> ConvoyResult<StoredAgent> {
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| ConvoyError::NotFound(format!("agent '{agent_id}'")))
    }

    /// Register the agent for `agent_type` if needed. The agent id is the
    /// agent type, so repeated calls return the same id.
    pub async fn get_or_create_agent(&self, agent_type: &str) -> ConvoyResult<String> {
        if agent_type.trim().is_empty() {
            return Err(ConvoyError::validation("agent type must not be empty"));
        }
        let agent = self
            .store
            .upsert_agent(agent_type, agent_type, self.config.initial_score, Utc::now())
            .await?;
        Ok(agent.agent_id)
    }

    /// Apply a scoring event and return the updated record.
    pub async fn record_event(
        &self,
        agent_id: &str,
        event_type: &str,
        trace_id: Option<&str>,
        reason: Option<&str>,
    ) -> ConvoyResult<ReputationRecord> {
        let delta = self.delta_for(event_type)?;
        let before = self.agent(agent_id).await?;
        let now = Utc::now();
        let score = self
            .store
            .increment_score(agent_id, delta, self.config.min_score, now)
            .await?;
        self.store
            .append_history(&ReputationEvent {
                agent_id: agent_id.to_string(),
                event_type: event_type.to_string(),
                delta,
                score_after: score,
                trace_id: trace_id.map(str::to_string),
                reason: reason.map(str::to_string),
                timestamp: now,
            })
            .await?;

        let old_level = self.level_for_score(before.score);
        let new_level = self.level_for_score(score);
        if old_level != new_level {
            info!(
                agent = %agent_id,
                from = %old_level,
                to = %new_level,
                score,
                "Permission level changed"
            );
        } else {
            debug!(agent = %agent_id, event = %event_type, delta, score, "Reputation updated");
        }

        self.get_record(agent_id).await
    }

    pub async fn get_record(&self, agent_id: &str) -> ConvoyResult<ReputationRecord> {
        let agent = self.agent(agent_id).await?;
        Ok(self.materialise(agent))
    }

    pub async fn get_reputation_score(&self, agent_id: &str) -> ConvoyResult<i64> {
        Ok(self.agent(agent_id).await?.score)
    }

    pub async fn get_permission_level(&self, agent_id: &str) -> ConvoyResult<PermissionLevel> {
        let score = self.get_reputation_score(agent_id).await?;
        Ok(self.level_for_score(score))
    }

    /// Cumulative allow-list for the agent's current level.
    pub async fn get_allowed_operations(&self, agent_id: &str) -> ConvoyResult<Vec<String>> {
        let level = self.get_permission_level(agent_id).await?;
        Ok(self.config.allowed_operations.for_level(level))
    }

    /// Decay an inactive agent's score. Returns the number of points removed.
    ///
    /// Nothing happens until the agent has been inactive for
    /// `decay_after_days`. After that, every whole week since the later of
    /// the last activity and the previous decay costs `decay_rate` points.
    pub async fn apply_decay(&self, agent_id: &str, now: DateTime<Utc>) -> ConvoyResult<i64> {
        let agent = self.agent(agent_id).await?;
        if (now - agent.last_activity).num_days() < self.config.decay_after_days {
            return Ok(0);
        }
        let since = agent
            .last_decay_at
            .map_or(agent.last_activity, |t| t.max(agent.last_activity));
        let weeks = (now - since).num_weeks();
        if weeks <= 0 || self.config.decay_rate <= 0 {
            return Ok(0);
        }

        let amount = self.config.decay_rate * weeks;
        let (before, score) = self
            .store
            .decay_score(agent_id, amount, self.config.min_score, now)
            .await?;
        let applied = before - score;
        self.store
            .append_history(&ReputationEvent {
                agent_id: agent_id.to_string(),
                event_type: "decay".to_string(),
                delta: -amount,
                score_after: score,
                trace_id: None,
                reason: Some(format!("inactive for {weeks} week(s)")),
                timestamp: now,
            })
            .await?;
        info!(agent = %agent_id, weeks, applied, score, "Applied reputation decay");
        Ok(applied)
    }

    /// Run [`apply_decay`](Self::apply_decay) for every agent. Returns how many
    /// agents lost points.
    pub async fn apply_decay_all(&self, now: DateTime<Utc>) -> ConvoyResult<usize> {
        let mut decayed = 0;
        for agent in self.store.list_agents().await? {
            if self.apply_decay(&agent.agent_id, now).await? > 0 {
                decayed += 1;
            }
        }
        Ok(decayed)
    }

    pub async fn get_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> ConvoyResult<Vec<ReputationEvent>> {
        self.store.history(agent_id, limit).await
    }

    /// Highest scores first; ties broken by agent id.
    pub async fn get_leaderboard(&self, limit: usize) -> ConvoyResult<Vec<ReputationRecord>> {
        let mut agents = self.store.list_agents().await?;
        agents.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.agent_id.cmp(&b.agent_id)));
        Ok(agents
            .into_iter()
            .take(limit)
            .map(|a| self.materialise(a))
            .collect())
    }

    pub async fn get_statistics(&self) -> ConvoyResult<ReputationStatistics> {
        let agents = self.store.list_agents().await?;
        let mut by_level: BTreeMap<String, usize> = PermissionLevel::ALL
            .iter()
            .map(|l| (l.as_str().to_string(), 0))
            .collect();
        for agent in &agents {
            *by_level
                .entry(self.level_for_score(agent.score).as_str().to_string())
                .or_default() += 1;
        }
        let total: i64 = agents.iter().map(|a| a.score).sum();
        Ok(ReputationStatistics {
            total_agents: agents.len(),
            average_score: if agents.is_empty() {
                0.0
            } else {
                total as f64 / agents.len() as f64
            },
            min_score: agents.iter().map(|a| a.score).min(),
            max_score: agents.iter().map(|a| a.score).max(),
            by_level,
        })
    }
}
