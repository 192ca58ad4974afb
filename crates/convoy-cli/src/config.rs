//! `convoy.toml` loading.
//!
//! Every section has defaults, so a missing, empty or partial file yields a
//! runnable single-node configuration.

use anyhow::Context;
use convoy_governance::{BudgetConfig, PolicyConfig, ReputationConfig};
use convoy_orchestrator::{HitlConfig, QueueConfig, RoutingConfig};
use convoy_security::{AuthConfig, RateLimitConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable overriding `auth.jwt_secret`.
pub const JWT_SECRET_ENV: &str = "CONVOY_JWT_SECRET";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConvoyConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub routing: RoutingConfig,
    pub budget: BudgetConfig,
    pub reputation: ReputationConfig,
    pub policy: PolicyConfig,
    pub hitl: HitlConfig,
    pub queue: QueueConfig,
    /// Audit log and other local state.
    pub data_dir: PathBuf,
}

impl Default for ConvoyConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            routing: RoutingConfig::default(),
            budget: BudgetConfig::default(),
            reputation: ReputationConfig::default(),
            policy: PolicyConfig::default(),
            hitl: HitlConfig::default(),
            queue: QueueConfig::default(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds between sweeps for rate-limit windows left idle.
    pub rate_limit_cleanup_secs: u64,
    /// Seconds between finished-task reaping runs.
    pub reap_interval_secs: u64,
    /// Seconds between reputation decay passes.
    pub decay_interval_secs: u64,
    /// Seconds between sweeps of expired store keys.
    pub store_purge_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            rate_limit_cleanup_secs: 300,
            reap_interval_secs: 3600,
            decay_interval_secs: 3600,
            store_purge_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; state is lost on restart and not shared.
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Connection URL for the redis backend.
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl ConvoyConfig {
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("invalid configuration")
    }

    /// Read `path`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Self::from_toml(&raw)
                .with_context(|| format!("failed to parse config file '{}'", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e)
                .with_context(|| format!("failed to read config file '{}'", path.display())),
        }
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(JWT_SECRET_ENV).filter(|s| !s.is_empty()) {
            self.auth.jwt_secret = Some(secret);
        }
    }

    /// Apply `--host` / `--port`.
    pub fn apply_cli(&mut self, host: Option<String>, port: Option<u16>) {
        if let Some(host) = host {
            self.server.host = host;
        }
        if let Some(port) = port {
            self.server.port = port;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use convoy_security::Role;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config = ConvoyConfig::from_toml("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.auth.jwt_secret.is_none());
        assert_eq!(config.rate_limit.default_limit, 100);
        assert_eq!(config.hitl.timeout_secs, 3600);
        assert_eq!(config.reputation.initial_score, 100);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
    }

    #[test]
    fn test_partial_sections() {
        let config = ConvoyConfig::from_toml(
            r#"
data_dir = "/var/lib/convoy"

[server]
port = 8088

[store]
backend = "redis"
url = "redis://cache:6379"

[auth]
jwt_secret = "s3cret"

[auth.api_keys]
"ops-key" = "admin"
"bot-key" = "agent"

[rate_limit]
default_limit = 20
trusted_proxies = ["10.0.0.1", "::1"]

[rate_limit.endpoints]
"/tasks" = 5

[routing]
default_agent = "human_triage"

[routing.rules]
bugfix = "fixer_agent"

[hitl]
timeout_secs = 60
"#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8088);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.url, "redis://cache:6379");
        assert_eq!(config.auth.api_keys["ops-key"], Role::Admin);
        assert_eq!(config.auth.api_keys["bot-key"], Role::Agent);
        assert_eq!(config.rate_limit.default_limit, 20);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.rate_limit.endpoints["/tasks"], 5);
        assert_eq!(config.rate_limit.trusted_proxies.len(), 2);
        assert_eq!(config.routing.rules["bugfix"], "fixer_agent");
        assert_eq!(config.hitl.timeout_secs, 60);
        assert_eq!(config.hitl.history_limit, 1000);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/convoy"));
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let err = ConvoyConfig::from_toml("[auth.api_keys]\nk = \"root\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("invalid configuration"));
    }

    #[test]
    fn test_env_and_cli_overrides() {
        let mut config = ConvoyConfig::from_toml("[auth]\njwt_secret = \"file\"\n").unwrap();
        config.apply_env(|key| (key == JWT_SECRET_ENV).then(|| "env".to_string()));
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("env"));

        config.apply_env(|_| Some(String::new()));
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("env"));

        config.apply_cli(Some("127.0.0.1".into()), None);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
    }

    #[tokio::test]
    async fn test_load_missing_and_present_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = ConvoyConfig::load(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(missing.server.port, 3000);

        let path = dir.path().join("convoy.toml");
        std::fs::write(&path, "[server]\nport = 9000\n").unwrap();
        let loaded = ConvoyConfig::load(&path).await.unwrap();
        assert_eq!(loaded.server.port, 9000);

        std::fs::write(&path, "[server\n").unwrap();
        assert!(ConvoyConfig::load(&path).await.is_err());
    }
}
