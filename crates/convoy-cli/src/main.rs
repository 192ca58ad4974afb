//! `convoy` server and operator commands.

mod config;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{ConvoyConfig, StoreBackend};
use convoy_gateway::{AppState, GatewayServer, Maintenance};
use convoy_governance::{
    CostTracker, GovernanceGuard, MemoryReputationStore, PolicyGuard, ReputationEngine,
    ReputationStore, SqliteReputationStore, ToolInvocation, ViolationAction, ViolationDetector,
};
use convoy_orchestrator::{EventBus, HitlGate, TaskQueue, TaskRouter};
use convoy_security::{AuditLog, Authenticator, RateLimiter, Role};
use convoy_store::{MemoryStore, RedisStore, Store};
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "convoy", about = "Convoy: governed multi-agent task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "convoy.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Sign a bearer token with the configured JWT secret
    Token {
        /// Token subject (agent id or user name)
        subject: String,
        /// user, agent or admin
        #[arg(short, long, default_value = "agent")]
        role: Role,
        /// Lifetime in seconds (defaults to auth.token_ttl_secs)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Print the task routing table
    #[command(alias = "routes")]
    Route,
    /// Scan text for policy violations
    Scan {
        /// Text to scan
        text: Option<String>,
        /// Read the text from a file instead
        #[arg(short, long, conflicts_with = "text")]
        file: Option<PathBuf>,
    },
    /// Run a tool invocation (JSON) through the governance guard
    Authorize {
        /// Invocation file; reads stdin when omitted
        file: Option<PathBuf>,
    },
    /// Check file paths and domains against the policy
    Check {
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long = "domain")]
        domains: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("failed to load .env");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = ConvoyConfig::load(&cli.config).await?;
    config.apply_env(|key| std::env::var(key).ok());

    match cli.command {
        Commands::Serve { host, port } => {
            config.apply_cli(host, port);
            serve(config).await?;
        }
        Commands::Token {
            subject,
            role,
            ttl_secs,
        } => {
            let auth = Authenticator::new(&config.auth);
            let token = auth.issue_token(&subject, role, ttl_secs.map(Duration::from_secs))?;
            println!("{token}");
        }
        Commands::Route => {
            let router = TaskRouter::from_config(&config.routing)?;
            for (task_type, agent) in router.table() {
                println!("{:<12} -> {agent}", task_type.to_string());
            }
            println!("{:<12} -> {}", "*", router.default_agent());
        }
        Commands::Scan { text, file } => {
            let content = match (text, file) {
                (Some(text), _) => text,
                (None, Some(path)) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read '{}'", path.display()))?,
                (None, None) => read_stdin()?,
            };
            let detector = ViolationDetector::with_defaults()?;
            let violations = detector.scan(&content);
            println!("{}", serde_json::to_string_pretty(&violations)?);
            if violations.iter().any(|v| v.action == ViolationAction::Block) {
                std::process::exit(2);
            }
        }
        Commands::Authorize { file } => {
            let raw = match file {
                Some(path) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read '{}'", path.display()))?,
                None => read_stdin()?,
            };
            let invocation: ToolInvocation =
                serde_json::from_str(&raw).context("invalid tool invocation")?;
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            let guard = GovernanceGuard::new(
                build_reputation(&config)?,
                PolicyGuard::new(&config.policy)?,
                ViolationDetector::with_defaults()?,
                Arc::new(CostTracker::new(store, config.budget.clone())),
            );
            match guard.authorize(&invocation).await {
                Ok(authorization) => {
                    println!("{}", serde_json::to_string_pretty(&authorization)?);
                }
                Err(e) => {
                    eprintln!("denied ({}): {e}", e.code());
                    std::process::exit(1);
                }
            }
        }
        Commands::Check { files, domains } => {
            let policy = PolicyGuard::new(&config.policy)?;
            let mut denied = false;
            for path in &files {
                let allowed = policy.is_file_allowed(path);
                denied |= !allowed;
                println!("file   {path}: {}", verdict(allowed));
            }
            for domain in &domains {
                let allowed = policy.is_domain_allowed(domain);
                denied |= !allowed;
                println!("domain {domain}: {}", verdict(allowed));
            }
            if !files.is_empty() {
                let risk = policy.assess_files(&files);
                println!(
                    "risk: {} (score {}, approval {})",
                    risk.level,
                    risk.score,
                    if risk.requires_approval { "required" } else { "not required" }
                );
            }
            if denied {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn serve(config: ConvoyConfig) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; state is not shared or persisted");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&config.store.url)
                .await
                .with_context(|| format!("failed to connect to '{}'", config.store.url))?,
        ),
    };
    info!(backend = store.backend(), "Store ready");

    let events = Arc::new(EventBus::new(store.clone()));
    let mut queue = TaskQueue::new(store.clone());
    if config.queue.publish_events {
        queue = queue.with_events(events.clone());
    }
    let hitl = HitlGate::new(config.hitl.clone()).with_events(events.clone());
    let router = TaskRouter::from_config(&config.routing)?;
    let reputation = build_reputation(&config)?;

    let state = Arc::new(AppState {
        store: store.clone(),
        queue: Arc::new(queue),
        events,
        router: Arc::new(router),
        hitl: Arc::new(hitl),
        cost: Arc::new(CostTracker::new(store.clone(), config.budget.clone())),
        reputation: reputation.clone(),
        auth: Arc::new(Authenticator::new(&config.auth)),
        rate_limiter: Arc::new(RateLimiter::new(store, config.rate_limit.clone())),
        audit: Arc::new(AuditLog::new(config.data_dir.join("audit"))),
        started_at: Utc::now(),
    });

    let cancel = CancellationToken::new();
    let maintenance = Maintenance {
        approval_sweep: Duration::from_secs(config.hitl.sweep_interval_secs.max(1)),
        rate_limit_cleanup: Duration::from_secs(config.server.rate_limit_cleanup_secs.max(1)),
        reap_every: Duration::from_secs(config.server.reap_interval_secs.max(1)),
        reap_after: Duration::from_secs(config.queue.reap_after_secs),
        store_purge: Duration::from_secs(config.server.store_purge_secs.max(1)),
    };
    let mut tasks = GatewayServer::spawn_maintenance(state.clone(), maintenance, cancel.clone());
    tasks.push(spawn_decay(
        reputation,
        Duration::from_secs(config.server.decay_interval_secs.max(1)),
        cancel.clone(),
    ));

    let app = GatewayServer::build(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Convoy gateway listening on {}", addr);

    let shutdown = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutting down");
        shutdown.cancel();
    })
    .await?;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

fn build_reputation(config: &ConvoyConfig) -> anyhow::Result<Arc<ReputationEngine>> {
    let store: Arc<dyn ReputationStore> = match &config.reputation.sqlite_path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create '{}'", parent.display()))?;
            }
            info!(path = %path.display(), "Reputation store on SQLite");
            Arc::new(SqliteReputationStore::open(path)?)
        }
        None => Arc::new(MemoryReputationStore::new()),
    };
    Ok(Arc::new(ReputationEngine::new(
        store,
        config.reputation.clone(),
    )))
}

fn spawn_decay(
    reputation: Arc<ReputationEngine>,
    period: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match reputation.apply_decay_all(Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => info!(agents = n, "Reputation decay applied"),
                    Err(e) => warn!(error = %e, "Reputation decay failed"),
                },
            }
        }
    })
}

fn read_stdin() -> anyhow::Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("failed to read stdin")?;
    Ok(buf)
}

fn verdict(allowed: bool) -> &'static str {
    if allowed {
        "allowed"
    } else {
        "denied"
    }
}
