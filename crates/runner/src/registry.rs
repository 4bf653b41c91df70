use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Default)]
struct RegistryState {
    next_generation: u64,
    entries: HashMap<String, Vec<(u64, CancellationToken)>>,
}

/// Maps session ids to the cancellation tokens of their running queries.
///
/// A session normally has one live entry. If a second task for the same
/// session starts before the first finished, both stay registered so a
/// cancel request still reaches the first one.
#[derive(Default)]
pub struct CancellationRegistry {
    state: Mutex<RegistryState>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Nothing panics while the lock is held, so a poisoned state is still
    // consistent.
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `token` for `session_id`. The entry lives until the returned
    /// guard is dropped or the session is cancelled.
    pub fn register(self: &Arc<Self>, session_id: &str, token: CancellationToken) -> Registration {
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        let entries = state.entries.entry(session_id.to_string()).or_default();
        if !entries.is_empty() {
            warn!(
                session_id,
                active = entries.len(),
                "session already has a running query; keeping both registrations"
            );
        }
        entries.push((generation, token.clone()));

        Registration {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
            generation,
            token,
        }
    }

    /// Cancel every query registered for `session_id` and forget them.
    /// Returns `false` when nothing was registered.
    pub fn cancel(&self, session_id: &str) -> bool {
        let removed = self.lock().entries.remove(session_id);
        match removed {
            Some(entries) => {
                for (_, token) in &entries {
                    token.cancel();
                }
                debug!(session_id, count = entries.len(), "cancelled session");
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, session_id: &str) -> bool {
        self.lock().entries.contains_key(session_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.lock().entries.len()
    }

    fn release(&self, session_id: &str, generation: u64) {
        let mut state = self.lock();
        if let Some(entries) = state.entries.get_mut(session_id) {
            entries.retain(|(g, _)| *g != generation);
            if entries.is_empty() {
                state.entries.remove(session_id);
            }
        }
    }
}

/// Live registration of one query. Dropping it cancels the query's token and
/// removes exactly this registration.
pub struct Registration {
    registry: Arc<CancellationRegistry>,
    session_id: String,
    generation: u64,
    token: CancellationToken,
}

impl Registration {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.token.cancel();
        self.registry.release(&self.session_id, self.generation);
    }
}
