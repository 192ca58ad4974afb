//! Declarative resource sandboxing: file globs, network domains, tool
//! policies, and file-based risk scoring.

use convoy_core::{ConvoyError, ConvoyResult, PermissionLevel, RiskLevel};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

const CRITICAL_WEIGHT: u32 = 10;
const HIGH_WEIGHT: u32 = 5;
const MEDIUM_WEIGHT: u32 = 2;
const OUTSIDE_WORKSPACE: &str = "<outside workspace>";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Policy for one tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPolicy {
    pub min_level: PermissionLevel,
    /// When non-empty, only these operations are allowed.
    pub allowed_operations: Vec<String>,
    /// Always refused, even when also allowed.
    pub denied_operations: Vec<String>,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            min_level: PermissionLevel::SandboxOnly,
            allowed_operations: Vec::new(),
            denied_operations: Vec::new(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn tool(min_level: PermissionLevel, allowed: &[&str], denied: &[&str]) -> ToolPolicy {
    ToolPolicy {
        min_level,
        allowed_operations: strings(allowed),
        denied_operations: strings(denied),
    }
}

/// Policy configuration (`[policy]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Globs of paths agents may touch. Empty means nothing is allowed.
    pub file_allow: Vec<String>,
    /// Globs that are always refused.
    pub file_deny: Vec<String>,
    /// Domains agents may reach: `example.com` (and its subdomains),
    /// `*.example.com` (subdomains only) or `*`.
    pub network_allow: Vec<String>,
    pub tools: HashMap<String, ToolPolicy>,
    pub risk_critical: Vec<String>,
    pub risk_high: Vec<String>,
    pub risk_medium: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let tools = [
            (
                "git",
                tool(
                    PermissionLevel::SandboxOnly,
                    &["clone", "status", "diff", "log", "commit", "push", "checkout"],
                    &["push_force", "reset_hard"],
                ),
            ),
            (
                "test_runner",
                tool(PermissionLevel::SandboxOnly, &[], &[]),
            ),
            (
                "deployer",
                tool(
                    PermissionLevel::StagingAccess,
                    &["deploy", "status", "rollback"],
                    &[],
                ),
            ),
            (
                "kubectl",
                tool(
                    PermissionLevel::ProdLowRisk,
                    &["get", "describe", "logs", "rollout"],
                    &["delete"],
                ),
            ),
            (
                "terraform",
                tool(PermissionLevel::ProdFullAccess, &["plan", "apply"], &["destroy"]),
            ),
        ]
        .into_iter()
        .map(|(name, policy)| (name.to_string(), policy))
        .collect();

        Self {
            file_allow: strings(&["src/**", "tests/**", "docs/**", "*.md", "Cargo.toml"]),
            file_deny: strings(&[
                "**/.env",
                "**/.env.*",
                "**/*.pem",
                "**/*.key",
                "**/secrets/**",
                ".git/**",
            ]),
            network_allow: strings(&[
                "github.com",
                "api.github.com",
                "crates.io",
                "pypi.org",
                "registry.npmjs.org",
            ]),
            tools,
            risk_critical: strings(&[
                "**/migrations/**",
                "**/*.sql",
                "**/terraform/**",
                "**/.github/workflows/**",
            ]),
            risk_high: strings(&[
                "**/auth/**",
                "**/security/**",
                "**/payments/**",
                "**/Dockerfile",
                "**/Cargo.lock",
            ]),
            risk_medium: strings(&["**/config/**", "**/*.yaml", "**/*.yml", "**/*.toml"]),
        }
    }
}

/// One risk pattern a file matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskMatch {
    pub path: String,
    pub pattern: String,
    pub level: RiskLevel,
}

/// Aggregate risk of a change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskAssessment {
    pub score: u32,
    pub level: RiskLevel,
    pub requires_approval: bool,
    pub matched: Vec<RiskMatch>,
}

struct RiskRule {
    level: RiskLevel,
    weight: u32,
    pattern: Pattern,
}

/// Compiled policy. Construction fails on invalid glob patterns.
pub struct PolicyGuard {
    file_allow: Vec<Pattern>,
    file_deny: Vec<Pattern>,
    network_allow: Vec<String>,
    tools: HashMap<String, ToolPolicy>,
    risk_rules: Vec<RiskRule>,
}

fn compile(patterns: &[String]) -> ConvoyResult<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| ConvoyError::Config(format!("invalid glob '{p}': {e}")))
        })
        .collect()
}

/// Resolve `.`, `..` and repeated separators lexically, relative to the
/// workspace root. `None` for absolute paths and for paths that climb above
/// the root or resolve to the root itself.
fn normalize_path(path: &str) -> Option<String> {
    let path = path.trim();
    let has_drive = path.as_bytes().get(1) == Some(&b':');
    if path.starts_with('/') || path.starts_with('\\') || has_drive {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn violation(category: &str, pattern: &str, severity: RiskLevel, message: String) -> ConvoyError {
    warn!(category, pattern, message = %message, "Policy violation");
    ConvoyError::PolicyViolation {
        category: category.to_string(),
        pattern: pattern.to_string(),
        severity,
        message,
    }
}

impl PolicyGuard {
    pub fn new(config: &PolicyConfig) -> ConvoyResult<Self> {
        let mut risk_rules = Vec::new();
        for (level, weight, patterns) in [
            (RiskLevel::Critical, CRITICAL_WEIGHT, &config.risk_critical),
            (RiskLevel::High, HIGH_WEIGHT, &config.risk_high),
            (RiskLevel::Medium, MEDIUM_WEIGHT, &config.risk_medium),
        ] {
            for pattern in compile(patterns)? {
                risk_rules.push(RiskRule {
                    level,
                    weight,
                    pattern,
                });
            }
        }

        Ok(Self {
            file_allow: compile(&config.file_allow)?,
            file_deny: compile(&config.file_deny)?,
            network_allow: config
                .network_allow
                .iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .collect(),
            tools: config.tools.clone(),
            risk_rules,
        })
    }

    /// Deny patterns win over allow patterns; no allow match means deny.
    /// Absolute paths and paths that escape the workspace are never allowed.
    pub fn is_file_allowed(&self, path: &str) -> bool {
        let Some(path) = normalize_path(path) else {
            return false;
        };
        let path = path.as_str();
        if self
            .file_deny
            .iter()
            .any(|p| p.matches_with(path, MATCH_OPTIONS))
        {
            return false;
        }
        self.file_allow
            .iter()
            .any(|p| p.matches_with(path, MATCH_OPTIONS))
    }

    pub fn check_file_access(&self, path: &str) -> ConvoyResult<()> {
        let Some(normalized) = normalize_path(path) else {
            return Err(violation(
                "file_access",
                "",
                RiskLevel::High,
                format!("'{path}' is absolute or escapes the workspace"),
            ));
        };
        if let Some(deny) = self
            .file_deny
            .iter()
            .find(|p| p.matches_with(&normalized, MATCH_OPTIONS))
        {
            return Err(violation(
                "file_access",
                deny.as_str(),
                RiskLevel::High,
                format!("access to '{path}' is denied"),
            ));
        }
        if self.is_file_allowed(path) {
            return Ok(());
        }
        Err(violation(
            "file_access",
            "",
            RiskLevel::Medium,
            format!("'{path}' is outside the allowed paths"),
        ))
    }

    pub fn is_domain_allowed(&self, domain: &str) -> bool {
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        let host = domain.split(':').next().unwrap_or_default();
        self.network_allow.iter().any(|entry| {
            if entry == "*" {
                true
            } else if let Some(suffix) = entry.strip_prefix("*.") {
                host.len() > suffix.len() && host.ends_with(&format!(".{suffix}"))
            } else {
                host == entry || host.ends_with(&format!(".{entry}"))
            }
        })
    }

    pub fn check_network_access(&self, domain: &str) -> ConvoyResult<()> {
        if self.is_domain_allowed(domain) {
            return Ok(());
        }
        Err(violation(
            "network_access",
            domain,
            RiskLevel::High,
            format!("domain '{domain}' is not in the allow-list"),
        ))
    }

    pub fn tool_policy(&self, tool: &str) -> Option<&ToolPolicy> {
        self.tools.get(tool)
    }

    /// Unknown tools and denied or unlisted operations are policy
    /// violations; an insufficient level is a permission denial.
    pub fn check_tool(
        &self,
        agent_id: &str,
        level: PermissionLevel,
        tool: &str,
        operation: &str,
    ) -> ConvoyResult<()> {
        let Some(policy) = self.tools.get(tool) else {
            return Err(violation(
                "tool_policy",
                tool,
                RiskLevel::High,
                format!("tool '{tool}' has no policy"),
            ));
        };
        if level < policy.min_level {
            warn!(agent = %agent_id, tool, required = %policy.min_level, actual = %level, "Tool level too low");
            return Err(ConvoyError::PermissionDenied {
                agent_id: agent_id.to_string(),
                operation: format!("{tool}:{operation}"),
                required: policy.min_level,
                actual: level,
            });
        }
        if policy.denied_operations.iter().any(|op| op == operation) {
            return Err(violation(
                "tool_policy",
                &format!("{tool}:{operation}"),
                RiskLevel::High,
                format!("operation '{operation}' of '{tool}' is denied"),
            ));
        }
        if !policy.allowed_operations.is_empty()
            && !policy.allowed_operations.iter().any(|op| op == operation)
        {
            return Err(violation(
                "tool_policy",
                &format!("{tool}:{operation}"),
                RiskLevel::Medium,
                format!("operation '{operation}' of '{tool}' is not allowed"),
            ));
        }
        Ok(())
    }

    /// Score a set of touched files. Each file contributes the weight of the
    /// most severe pattern it matches; a path outside the workspace counts
    /// as critical.
    pub fn assess_files<S: AsRef<str>>(&self, paths: &[S]) -> RiskAssessment {
        let mut score = 0;
        let mut matched = Vec::new();
        for raw in paths {
            let Some(path) = normalize_path(raw.as_ref()) else {
                score += CRITICAL_WEIGHT;
                matched.push(RiskMatch {
                    path: raw.as_ref().to_string(),
                    pattern: OUTSIDE_WORKSPACE.to_string(),
                    level: RiskLevel::Critical,
                });
                continue;
            };
            let path = path.as_str();
            // rules are ordered most severe first
            if let Some(rule) = self
                .risk_rules
                .iter()
                .find(|r| r.pattern.matches_with(path, MATCH_OPTIONS))
            {
                score += rule.weight;
                matched.push(RiskMatch {
                    path: path.to_string(),
                    pattern: rule.pattern.as_str().to_string(),
                    level: rule.level,
                });
            }
        }
        let level = risk_level_for_score(score);
        RiskAssessment {
            score,
            level,
            requires_approval: level >= RiskLevel::High,
            matched,
        }
    }
}

pub fn risk_level_for_score(score: u32) -> RiskLevel {
    if score >= CRITICAL_WEIGHT {
        RiskLevel::Critical
    } else if score >= HIGH_WEIGHT {
        RiskLevel::High
    } else if score >= MEDIUM_WEIGHT {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn guard() -> PolicyGuard {
        PolicyGuard::new(&PolicyConfig::default()).unwrap()
    }

    #[test]
    fn test_file_deny_wins() {
        let guard = guard();
        assert!(guard.is_file_allowed("src/main.rs"));
        assert!(guard.is_file_allowed("./src/nested/mod.rs"));
        assert!(guard.is_file_allowed("README.md"));
        assert!(!guard.is_file_allowed("src/secrets/token.txt"));
        assert!(!guard.is_file_allowed(".env"));
        assert!(!guard.is_file_allowed("/etc/passwd"));
        let err = guard.check_file_access("src/.env").unwrap_err();
        assert_eq!(err.code(), "policy_violation");
    }

    #[test]
    fn test_traversal_and_absolute_paths_denied() {
        let guard = guard();
        for path in [
            "src/../../etc/passwd",
            "src/../../../root/.ssh/id_rsa",
            "src/./../..//etc/shadow",
            "..",
            "src/..",
            "/etc/passwd",
            "/src/main.rs",
            "\\windows\\system32",
            "C:/Windows/win.ini",
        ] {
            assert!(!guard.is_file_allowed(path), "{path} should be denied");
            let err = guard.check_file_access(path).unwrap_err();
            assert_eq!(err.code(), "policy_violation", "{path}");
        }
    }

    #[test]
    fn test_paths_are_resolved_before_matching() {
        let guard = guard();
        assert!(guard.is_file_allowed("src//nested/./mod.rs"));
        assert!(guard.is_file_allowed("docs/../src/lib.rs"));
        assert!(!guard.is_file_allowed("src/../.env"));
        assert!(guard.check_file_access("src/../tests/e2e.rs").is_ok());
        assert_eq!(normalize_path("./src//a/./b/../c.rs").as_deref(), Some("src/a/c.rs"));
        assert_eq!(normalize_path("src/../.."), None);
    }

    #[test]
    fn test_escaping_path_scores_critical() {
        let guard = guard();
        let risk = guard.assess_files(&["src/../../etc/passwd"]);
        assert_eq!(risk.level, RiskLevel::Critical);
        assert!(risk.requires_approval);
        assert_eq!(risk.matched[0].pattern, OUTSIDE_WORKSPACE);
    }

    #[test]
    fn test_empty_allow_list_denies() {
        let config = PolicyConfig {
            file_allow: Vec::new(),
            ..PolicyConfig::default()
        };
        let guard = PolicyGuard::new(&config).unwrap();
        assert!(!guard.is_file_allowed("src/main.rs"));
    }

    #[test]
    fn test_invalid_glob_is_config_error() {
        let config = PolicyConfig {
            file_deny: vec!["src/[".into()],
            ..PolicyConfig::default()
        };
        assert!(matches!(
            PolicyGuard::new(&config),
            Err(ConvoyError::Config(_))
        ));
    }

    #[test]
    fn test_domain_matching() {
        let config = PolicyConfig {
            network_allow: vec!["example.com".into(), "*.internal.io".into()],
            ..PolicyConfig::default()
        };
        let guard = PolicyGuard::new(&config).unwrap();
        assert!(guard.is_domain_allowed("example.com"));
        assert!(guard.is_domain_allowed("API.example.com"));
        assert!(guard.is_domain_allowed("example.com:443"));
        assert!(!guard.is_domain_allowed("evilexample.com"));
        assert!(guard.is_domain_allowed("db.internal.io"));
        assert!(!guard.is_domain_allowed("internal.io"));

        let open = PolicyGuard::new(&PolicyConfig {
            network_allow: vec!["*".into()],
            ..PolicyConfig::default()
        })
        .unwrap();
        assert!(open.is_domain_allowed("anything.test"));
    }

    #[test]
    fn test_tool_policy() {
        let guard = guard();
        assert!(guard
            .check_tool("a", PermissionLevel::SandboxOnly, "git", "commit")
            .is_ok());
        assert!(matches!(
            guard.check_tool("a", PermissionLevel::ProdFullAccess, "git", "push_force"),
            Err(ConvoyError::PolicyViolation { .. })
        ));
        assert!(matches!(
            guard.check_tool("a", PermissionLevel::StagingAccess, "kubectl", "get"),
            Err(ConvoyError::PermissionDenied { .. })
        ));
        assert!(matches!(
            guard.check_tool("a", PermissionLevel::ProdFullAccess, "rm", "anything"),
            Err(ConvoyError::PolicyViolation { .. })
        ));
        // empty allow-list: anything not denied
        assert!(guard
            .check_tool("a", PermissionLevel::SandboxOnly, "test_runner", "cargo_test")
            .is_ok());
    }

    #[test]
    fn test_risk_scoring() {
        let guard = guard();
        let low = guard.assess_files(&["src/lib.rs"]);
        assert_eq!(low.score, 0);
        assert_eq!(low.level, RiskLevel::Low);
        assert!(!low.requires_approval);

        let medium = guard.assess_files(&["deploy/values.yaml"]);
        assert_eq!(medium.level, RiskLevel::Medium);

        let high = guard.assess_files(&["src/auth/session.rs"]);
        assert_eq!(high.score, 5);
        assert!(high.requires_approval);

        let critical = guard.assess_files(&["db/migrations/001_init.sql", "src/lib.rs"]);
        assert_eq!(critical.score, 10);
        assert_eq!(critical.level, RiskLevel::Critical);
        assert_eq!(critical.matched.len(), 1);
    }
}
