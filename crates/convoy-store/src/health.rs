use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// A component that is not enforcing because its backing store failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradedMode {
    /// Component name (`cost_tracker`, `rate_limiter`).
    pub component: &'static str,
    /// Last store error seen.
    pub reason: String,
    /// When the component first entered degraded mode.
    pub since: DateTime<Utc>,
}

/// Shared flag a fail-open component flips on store errors and clears on
/// the next successful round trip. Transitions are logged once each way.
#[derive(Debug)]
pub struct DegradedFlag {
    component: &'static str,
    state: Mutex<Option<DegradedMode>>,
}

impl DegradedFlag {
    /// New healthy flag for `component`.
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            state: Mutex::new(None),
        }
    }

    /// Record a store failure. Keeps the original `since` if already degraded.
    pub fn mark(&self, reason: impl std::fmt::Display) {
        let mut state = self.state.lock();
        match state.as_mut() {
            Some(mode) => mode.reason = reason.to_string(),
            None => {
                warn!(component = self.component, reason = %reason, "Entering degraded mode");
                *state = Some(DegradedMode {
                    component: self.component,
                    reason: reason.to_string(),
                    since: Utc::now(),
                });
            }
        }
    }

    /// Record a successful store round trip.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        if state.take().is_some() {
            info!(component = self.component, "Store reachable again, leaving degraded mode");
        }
    }

    /// Whether the component is currently degraded.
    pub fn is_degraded(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Snapshot of the degraded state, if any.
    pub fn current(&self) -> Option<DegradedMode> {
        self.state.lock().clone()
    }
}
