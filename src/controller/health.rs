//! Shared health state reported on `/health`

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Components currently degraded, keyed by name, with the last reason
#[derive(Clone, Debug, Default)]
pub struct HealthState {
    degraded: Arc<Mutex<BTreeMap<String, String>>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_degraded(&self, component: &str, reason: impl Into<String>) {
        if let Ok(mut degraded) = self.degraded.lock() {
            degraded.insert(component.to_string(), reason.into());
        }
    }

    pub fn mark_healthy(&self, component: &str) {
        if let Ok(mut degraded) = self.degraded.lock() {
            degraded.remove(component);
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.degraded.lock().map(|d| d.is_empty()).unwrap_or(false)
    }

    /// Snapshot of degraded components and their reasons
    pub fn degraded(&self) -> BTreeMap<String, String> {
        self.degraded
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}
