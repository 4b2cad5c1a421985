//! Per-sink background task handles
//!
//! Each handle is a child of a parent [`CancellationToken`], so cancelling the
//! parent stops every registered routine.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// Concurrency-safe map from sink id to the token of its routine
#[derive(Debug, Default)]
pub struct RoutineRegistry {
    routines: Mutex<HashMap<String, CancellationToken>>,
}

impl RoutineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a routine for `id` under `parent`.
    ///
    /// Returns the routine's token, or `None` if one is already registered.
    pub fn register(&self, id: &str, parent: &CancellationToken) -> Option<CancellationToken> {
        let mut routines = self.routines.lock().ok()?;
        if routines.contains_key(id) {
            return None;
        }
        let token = parent.child_token();
        routines.insert(id.to_string(), token.clone());
        Some(token)
    }

    /// Cancel and forget the routine for `id`. Returns whether one existed.
    pub fn cancel_and_remove(&self, id: &str) -> bool {
        let removed = self
            .routines
            .lock()
            .ok()
            .and_then(|mut routines| routines.remove(id));
        match removed {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.routines
            .lock()
            .map(|routines| routines.contains_key(id))
            .unwrap_or(false)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .routines
            .lock()
            .map(|routines| routines.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn cancel_all(&self) {
        if let Ok(mut routines) = self.routines.lock() {
            for (_, token) in routines.drain() {
                token.cancel();
            }
        }
    }
}
