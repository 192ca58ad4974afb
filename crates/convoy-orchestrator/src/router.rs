use convoy_core::{ConvoyError, ConvoyResult, Task, TaskType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

/// Agent that receives task types with no rule.
pub const DEFAULT_FALLBACK_AGENT: &str = "triage_agent";

/// Routing table configuration (`[routing]`).
///
/// ```toml
/// [routing]
/// default_agent = "triage_agent"
///
/// [routing.rules]
/// deploy = "release_agent"
/// ```
///
/// Rules given here are layered over the built-in table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub default_agent: String,
    /// Task type wire name → agent.
    pub rules: BTreeMap<String, String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_agent: DEFAULT_FALLBACK_AGENT.to_string(),
            rules: BTreeMap::new(),
        }
    }
}

/// The built-in task type → agent table.
pub fn default_rules() -> HashMap<TaskType, String> {
    [
        (TaskType::Faq, "knowledge_agent"),
        (TaskType::KbUpdate, "knowledge_agent"),
        (TaskType::Bugfix, "code_agent"),
        (TaskType::Refactor, "code_agent"),
        (TaskType::Feature, "code_agent"),
        (TaskType::Deploy, "deploy_agent"),
        (TaskType::Monitor, "monitor_agent"),
        (TaskType::Alert, "monitor_agent"),
        (TaskType::Investigate, "investigation_agent"),
    ]
    .into_iter()
    .map(|(t, a)| (t, a.to_string()))
    .collect()
}

/// Maps task types to the agent that owns them.
pub struct TaskRouter {
    rules: RwLock<HashMap<TaskType, String>>,
    default_agent: String,
}

impl TaskRouter {
    /// Built-in table with the `triage_agent` fallback.
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(default_rules()),
            default_agent: DEFAULT_FALLBACK_AGENT.to_string(),
        }
    }

    /// Built-in table overlaid with the configured rules. Unknown task
    /// types are a configuration error.
    pub fn from_config(config: &RoutingConfig) -> ConvoyResult<Self> {
        let mut rules = default_rules();
        for (name, agent) in &config.rules {
            let task_type: TaskType = name
                .parse()
                .map_err(|_| ConvoyError::Config(format!("unknown task type '{name}' in [routing]")))?;
            rules.insert(task_type, agent.clone());
        }
        Ok(Self {
            rules: RwLock::new(rules),
            default_agent: config.default_agent.clone(),
        })
    }

    /// Agent for a task type.
    pub fn route_type(&self, task_type: TaskType) -> String {
        self.rules
            .read()
            .get(&task_type)
            .cloned()
            .unwrap_or_else(|| self.default_agent.clone())
    }

    /// Agent for a task.
    pub fn route(&self, task: &Task) -> String {
        self.route_type(task.task_type)
    }

    /// Route the task and record the assignment on it.
    pub fn assign(&self, task: &mut Task) -> ConvoyResult<String> {
        let agent = self.route(task);
        task.assign(agent.clone())?;
        Ok(agent)
    }

    /// Add or replace a rule. Returns the agent it replaced.
    pub fn register(&self, task_type: TaskType, agent: impl Into<String>) -> Option<String> {
        let agent = agent.into();
        info!(task_type = %task_type, agent = %agent, "Routing rule registered");
        self.rules.write().insert(task_type, agent)
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    /// Current table, ordered by task type.
    pub fn table(&self) -> BTreeMap<TaskType, String> {
        self.rules
            .read()
            .iter()
            .map(|(t, a)| (*t, a.clone()))
            .collect()
    }
}

impl Default for TaskRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use convoy_core::TaskStatus;

    #[test]
    fn test_default_table() {
        let router = TaskRouter::new();
        assert_eq!(router.route_type(TaskType::Faq), "knowledge_agent");
        assert_eq!(router.route_type(TaskType::KbUpdate), "knowledge_agent");
        assert_eq!(router.route_type(TaskType::Feature), "code_agent");
        assert_eq!(router.route_type(TaskType::Deploy), "deploy_agent");
        assert_eq!(router.route_type(TaskType::Alert), "monitor_agent");
        assert_eq!(router.route_type(TaskType::Investigate), "investigation_agent");
    }

    #[test]
    fn test_fallback_when_rule_missing() {
        let router = TaskRouter::from_config(&RoutingConfig::default()).unwrap();
        router.rules.write().remove(&TaskType::Monitor);
        assert_eq!(router.route_type(TaskType::Monitor), DEFAULT_FALLBACK_AGENT);
    }

    #[test]
    fn test_register_returns_previous() {
        let router = TaskRouter::new();
        let prev = router.register(TaskType::Deploy, "release_agent");
        assert_eq!(prev.as_deref(), Some("deploy_agent"));
        assert_eq!(router.route_type(TaskType::Deploy), "release_agent");
    }

    #[test]
    fn test_config_overrides() {
        let config: RoutingConfig = toml::from_str(
            r#"
            default_agent = "ops_agent"
            [rules]
            bugfix = "hotfix_agent"
            "#,
        )
        .unwrap();
        let router = TaskRouter::from_config(&config).unwrap();
        assert_eq!(router.route_type(TaskType::Bugfix), "hotfix_agent");
        assert_eq!(router.route_type(TaskType::Refactor), "code_agent");
        assert_eq!(router.default_agent(), "ops_agent");
    }

    #[test]
    fn test_unknown_type_in_config_is_rejected() {
        let mut config = RoutingConfig::default();
        config.rules.insert("deployment".into(), "deploy_agent".into());
        assert!(matches!(
            TaskRouter::from_config(&config),
            Err(ConvoyError::Config(_))
        ));
    }

    #[test]
    fn test_assign_sets_owner() {
        let router = TaskRouter::new();
        let mut task = Task::new(TaskType::Bugfix, serde_json::json!({}));
        assert_eq!(router.assign(&mut task).unwrap(), "code_agent");
        assert_eq!(task.status, TaskStatus::Assigned);
        router.register(TaskType::Bugfix, "other_agent");
        assert!(router.assign(&mut task).is_err());
    }
}
