//! Token and USD accounting with budget enforcement.
//!
//! Usage is accumulated in three windows: per trace (`task`), per UTC hour
//! and per UTC day. The hourly and daily windows are system-wide. Every
//! window is a store hash with `tokens`, `usd` and `requests` fields that are
//! only ever incremented, so concurrent trackers on different nodes never
//! lose an update.
//!
//! The tracker fails open: when the store is unreachable, usage is dropped
//! with a warning, checks report "within budget" with zero metrics, and
//! [`CostTracker::degraded`] reports the outage until the next successful
//! round trip.

use chrono::{DateTime, Utc};
use convoy_core::{BudgetPeriod, ConvoyError, ConvoyResult, CostMetrics};
use convoy_store::{DegradedFlag, DegradedMode, HashBatch, Store};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const TASK_WINDOW_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const HOURLY_WINDOW_TTL: Duration = Duration::from_secs(24 * 3600);
const DAILY_WINDOW_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Token and dollar ceiling for one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub max_tokens: u64,
    pub max_usd: f64,
}

impl BudgetLimits {
    pub fn new(max_tokens: u64, max_usd: f64) -> Self {
        Self {
            max_tokens,
            max_usd,
        }
    }
}

/// Budget configuration (`[budget]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub task: BudgetLimits,
    pub hourly: BudgetLimits,
    pub daily: BudgetLimits,
    /// Percentage at which the alert level becomes `warning`.
    pub warning_percent: f64,
    /// Percentage at which the alert level becomes `critical`.
    pub critical_percent: f64,
    /// Input rate (USD per 1M tokens) for models missing from `pricing`.
    pub default_rate: f64,
    /// Model name → input rate in USD per 1M tokens.
    pub pricing: HashMap<String, f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            task: BudgetLimits::new(100_000, 5.0),
            hourly: BudgetLimits::new(1_000_000, 50.0),
            daily: BudgetLimits::new(10_000_000, 500.0),
            warning_percent: 80.0,
            critical_percent: 95.0,
            default_rate: 10.0,
            pricing: default_pricing(),
        }
    }
}

impl BudgetConfig {
    /// Limits for one window.
    pub fn limits(&self, period: BudgetPeriod) -> BudgetLimits {
        match period {
            BudgetPeriod::Task => self.task,
            BudgetPeriod::Hourly => self.hourly,
            BudgetPeriod::Daily => self.daily,
        }
    }
}

/// Default input pricing, USD per 1M tokens.
pub fn default_pricing() -> HashMap<String, f64> {
    [
        ("gpt-4", 30.0),
        ("gpt-4-turbo", 10.0),
        ("gpt-4o", 2.5),
        ("gpt-4o-mini", 0.15),
        ("gpt-3.5-turbo", 0.5),
        ("claude-opus-4", 15.0),
        ("claude-sonnet-4", 3.0),
        ("claude-haiku-4", 0.8),
    ]
    .into_iter()
    .map(|(model, rate)| (model.to_string(), rate))
    .collect()
}

/// Result of a side-effect-free budget check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetCheck {
    pub period: BudgetPeriod,
    pub within_budget: bool,
    pub metrics: CostMetrics,
    pub limits: BudgetLimits,
}

/// Alert level derived from the higher of the token and USD percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Ok,
    Warning,
    Critical,
}

/// Budget usage report for dashboards and the API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub trace_id: String,
    pub period: BudgetPeriod,
    pub metrics: CostMetrics,
    pub limits: BudgetLimits,
    pub token_percent: f64,
    pub usd_percent: f64,
    pub alert_level: AlertLevel,
}

/// Tracks usage per trace/hour/day and enforces budgets.
pub struct CostTracker {
    store: Arc<dyn Store>,
    config: BudgetConfig,
    degraded: DegradedFlag,
}

impl CostTracker {
    pub fn new(store: Arc<dyn Store>, config: BudgetConfig) -> Self {
        Self {
            store,
            config,
            degraded: DegradedFlag::new("cost_tracker"),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Record usage for a trace in all three windows.
    ///
    /// When `usd` is `None` the cost is estimated from `model`. Store
    /// failures are logged and the usage is dropped.
    pub async fn track_usage(
        &self,
        trace_id: &str,
        tokens: u64,
        usd: Option<f64>,
        model: &str,
        operation: &str,
    ) {
        let usd = usd.unwrap_or_else(|| self.estimate_cost(tokens, model));
        let now = Utc::now();
        let tokens_delta = i64::try_from(tokens).unwrap_or(i64::MAX);
        let mut batch = HashBatch::new();
        for (period, ttl) in [
            (BudgetPeriod::Task, TASK_WINDOW_TTL),
            (BudgetPeriod::Hourly, HOURLY_WINDOW_TTL),
            (BudgetPeriod::Daily, DAILY_WINDOW_TTL),
        ] {
            let key = window_key(trace_id, period, now);
            batch = batch
                .incr(&key, "tokens", tokens_delta)
                .incr_float(&key, "usd", usd)
                .incr(&key, "requests", 1)
                .expire(&key, ttl);
        }

        // One atomic batch so the three windows never disagree.
        if let Err(e) = self.store.hincr_many(&batch).await {
            self.degraded.mark(&e);
            warn!(
                trace_id = %trace_id,
                tokens,
                usd,
                error = %e,
                "Store unavailable, usage not tracked"
            );
            return;
        }
        self.degraded.clear();
        debug!(
            trace_id = %trace_id,
            tokens,
            usd,
            model = %model,
            operation = %operation,
            "Tracked usage"
        );
    }

    /// Compare a window's usage with its limits. Never mutates.
    pub async fn check_budget(&self, trace_id: &str, period: BudgetPeriod) -> BudgetCheck {
        let limits = self.config.limits(period);
        let metrics = self.read_metrics(trace_id, period).await;
        BudgetCheck {
            period,
            within_budget: metrics.tokens <= limits.max_tokens && metrics.usd <= limits.max_usd,
            metrics,
            limits,
        }
    }

    /// Fail with [`ConvoyError::BudgetExceeded`] iff [`check_budget`](Self::check_budget)
    /// reports the window as over budget.
    pub async fn enforce_budget(&self, trace_id: &str, period: BudgetPeriod) -> ConvoyResult<()> {
        let check = self.check_budget(trace_id, period).await;
        if check.within_budget {
            return Ok(());
        }
        warn!(
            trace_id = %trace_id,
            period = %period,
            tokens = check.metrics.tokens,
            max_tokens = check.limits.max_tokens,
            usd = check.metrics.usd,
            max_usd = check.limits.max_usd,
            "Budget exceeded"
        );
        Err(ConvoyError::BudgetExceeded {
            trace_id: trace_id.to_string(),
            period,
            tokens: check.metrics.tokens,
            max_tokens: check.limits.max_tokens,
            usd: check.metrics.usd,
            max_usd: check.limits.max_usd,
        })
    }

    /// Estimated input cost of `tokens` on `model`.
    ///
    /// Exact model names win; otherwise the longest configured prefix
    /// (`gpt-4-0613` → `gpt-4`), then the default rate.
    pub fn estimate_cost(&self, tokens: u64, model: &str) -> f64 {
        let rate = self.config.pricing.get(model).copied().unwrap_or_else(|| {
            self.config
                .pricing
                .iter()
                .filter(|(name, _)| model.starts_with(name.as_str()))
                .max_by_key(|(name, _)| name.len())
                .map(|(_, rate)| *rate)
                .unwrap_or(self.config.default_rate)
        });
        tokens as f64 / 1_000_000.0 * rate
    }

    /// Usage percentages and alert level for one window.
    pub async fn get_budget_status(&self, trace_id: &str, period: BudgetPeriod) -> BudgetStatus {
        let check = self.check_budget(trace_id, period).await;
        let token_percent = percent(check.metrics.tokens as f64, check.limits.max_tokens as f64);
        let usd_percent = percent(check.metrics.usd, check.limits.max_usd);
        let peak = token_percent.max(usd_percent);
        let alert_level = if peak >= self.config.critical_percent {
            AlertLevel::Critical
        } else if peak >= self.config.warning_percent {
            AlertLevel::Warning
        } else {
            AlertLevel::Ok
        };
        BudgetStatus {
            trace_id: trace_id.to_string(),
            period,
            metrics: check.metrics,
            limits: check.limits,
            token_percent,
            usd_percent,
            alert_level,
        }
    }

    /// Administrative reset of the current window. Returns whether anything
    /// was recorded in it.
    pub async fn reset_budget(&self, trace_id: &str, period: BudgetPeriod) -> ConvoyResult<bool> {
        let key = window_key(trace_id, period, Utc::now());
        let existed = self.store.delete(&key).await?;
        warn!(trace_id = %trace_id, period = %period, "Budget window reset");
        Ok(existed)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_degraded()
    }

    pub fn degraded(&self) -> Option<DegradedMode> {
        self.degraded.current()
    }

    async fn read_metrics(&self, trace_id: &str, period: BudgetPeriod) -> CostMetrics {
        let key = window_key(trace_id, period, Utc::now());
        match self.store.hgetall(&key).await {
            Ok(fields) => {
                self.degraded.clear();
                metrics_from_fields(&fields)
            }
            Err(e) => {
                self.degraded.mark(&e);
                warn!(
                    trace_id = %trace_id,
                    period = %period,
                    error = %e,
                    "Store unavailable, budget check failing open"
                );
                CostMetrics::default()
            }
        }
    }
}

/// Store key of the window containing `now`.
fn window_key(trace_id: &str, period: BudgetPeriod, now: DateTime<Utc>) -> String {
    match period {
        BudgetPeriod::Task => format!("convoy:cost:task:{trace_id}"),
        BudgetPeriod::Hourly => format!("convoy:cost:hourly:{}", now.format("%Y%m%d%H")),
        BudgetPeriod::Daily => format!("convoy:cost:daily:{}", now.format("%Y%m%d")),
    }
}

fn metrics_from_fields(fields: &HashMap<String, String>) -> CostMetrics {
    let field = |name: &str| fields.get(name).map(String::as_str).unwrap_or("0");
    CostMetrics {
        tokens: field("tokens").parse::<i64>().unwrap_or(0).max(0) as u64,
        usd: field("usd").parse().unwrap_or(0.0),
        requests: field("requests").parse::<i64>().unwrap_or(0).max(0) as u64,
    }
}

fn percent(used: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        used / limit * 100.0
    } else if used > 0.0 {
        100.0
    } else {
        0.0
    }
}
