use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use anyhow::{Context as _, Result};
use tokio::sync::Mutex;
use tracing::debug;
use warden_common::{now_micros, ExecutionContext};

use crate::backend::Datastore;
use crate::paths::FlowPaths;

type SharedContext = Arc<Mutex<ExecutionContext>>;

/// Loads execution contexts and hands out handles that share one in-memory
/// copy (and one lock) per session.
///
/// Locking is per session: mutations of different sessions never wait on
/// each other, while a session's mutate-then-save runs as one unit.
pub struct ContextStore {
    datastore: Arc<dyn Datastore>,
    recipient: String,
    open: StdMutex<HashMap<String, Weak<Mutex<ExecutionContext>>>>,
}

impl ContextStore {
    pub fn new(datastore: Arc<dyn Datastore>, recipient: impl Into<String>) -> Self {
        Self {
            datastore,
            recipient: recipient.into(),
            open: StdMutex::new(HashMap::new()),
        }
    }

    fn live(&self, session_id: &str) -> Option<SharedContext> {
        let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
        open.retain(|_, weak| weak.strong_count() > 0);
        open.get(session_id).and_then(Weak::upgrade)
    }

    /// The stored context of `session_id`, or a fresh running one if none
    /// was persisted yet.
    pub async fn load(&self, session_id: &str) -> Result<ContextHandle> {
        let paths = FlowPaths::new(&self.recipient, session_id);
        let path = paths.context();

        if let Some(shared) = self.live(session_id) {
            return Ok(self.handle(session_id, path, shared));
        }

        let loaded = self
            .datastore
            .get_record(&path)
            .await
            .with_context(|| format!("failed to load context for {}", session_id))?;
        let context = match loaded {
            Some(ctx) => ctx,
            None => {
                debug!(session_id, "initialising new execution context");
                ExecutionContext::new(session_id, now_micros())
            }
        };

        // Another loader may have raced us; the first one in wins.
        let shared = {
            let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
            match open.get(session_id).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let shared = Arc::new(Mutex::new(context));
                    open.insert(session_id.to_string(), Arc::downgrade(&shared));
                    shared
                }
            }
        };

        Ok(self.handle(session_id, path, shared))
    }

    fn handle(&self, session_id: &str, path: PathBuf, shared: SharedContext) -> ContextHandle {
        ContextHandle {
            session_id: session_id.to_string(),
            path,
            datastore: Arc::clone(&self.datastore),
            context: shared,
        }
    }
}

#[derive(Clone)]
pub struct ContextHandle {
    session_id: String,
    path: PathBuf,
    datastore: Arc<dyn Datastore>,
    context: SharedContext,
}

impl ContextHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Mutate the in-memory context. Call [`save`](Self::save) to persist.
    pub async fn modify<R>(&self, cb: impl FnOnce(&mut ExecutionContext) -> R) -> R {
        let mut guard = self.context.lock().await;
        cb(&mut guard)
    }

    pub async fn save(&self) -> Result<()> {
        let guard = self.context.lock().await;
        self.persist(&guard).await
    }

    /// Mutate and persist without letting another writer of this session in
    /// between.
    pub async fn update<R>(&self, cb: impl FnOnce(&mut ExecutionContext) -> R) -> Result<R> {
        let mut guard = self.context.lock().await;
        let result = cb(&mut guard);
        self.persist(&guard).await?;
        Ok(result)
    }

    pub async fn snapshot(&self) -> ExecutionContext {
        self.context.lock().await.clone()
    }

    async fn persist(&self, context: &ExecutionContext) -> Result<()> {
        self.datastore
            .put_record(&self.path, context)
            .await
            .with_context(|| format!("failed to save context for {}", self.session_id))
    }
}
