//! In-process collaborators: a memory datastore, a memory result sink and a
//! channel-based notifier. Used when the runner is embedded without durable
//! storage, and by the tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use warden_common::{ExecutionContext, Row, Task};

use crate::backend::{Datastore, Notification, Notifier, ResultSink, ResultWriter, Subscription};
use crate::paths::FlowPaths;

#[derive(Default)]
struct DatastoreState {
    queues: HashMap<String, Vec<Task>>,
    records: HashMap<PathBuf, ExecutionContext>,
    next_task_id: u64,
}

#[derive(Default)]
pub struct MemoryDatastore {
    state: Mutex<DatastoreState>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, DatastoreState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory datastore poisoned"))
    }

    /// Queue a task, assigning it a task id when it has none.
    pub fn queue_task(&self, recipient: &str, mut task: Task) -> Result<u64> {
        let mut state = self.state()?;
        if task.task_id == 0 {
            state.next_task_id += 1;
            task.task_id = state.next_task_id;
        } else {
            state.next_task_id = state.next_task_id.max(task.task_id);
        }
        let task_id = task.task_id;
        state
            .queues
            .entry(recipient.to_string())
            .or_default()
            .push(task);
        Ok(task_id)
    }

    pub fn pending(&self, recipient: &str) -> usize {
        self.state()
            .ok()
            .and_then(|state| state.queues.get(recipient).map(Vec::len))
            .unwrap_or(0)
    }

    pub fn record(&self, recipient: &str, session_id: &str) -> Option<ExecutionContext> {
        let path = FlowPaths::new(recipient, session_id).context();
        self.state().ok()?.records.get(&path).cloned()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn fetch_pending_tasks(&self, recipient: &str) -> Result<Vec<Task>> {
        Ok(self
            .state()?
            .queues
            .get(recipient)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_from_queue(&self, recipient: &str, task: &Task) -> Result<()> {
        let mut state = self.state()?;
        if let Some(queue) = state.queues.get_mut(recipient) {
            queue.retain(|queued| queued.task_id != task.task_id);
        }
        Ok(())
    }

    async fn get_record(&self, path: &Path) -> Result<Option<ExecutionContext>> {
        Ok(self.state()?.records.get(path).cloned())
    }

    async fn put_record(&self, path: &Path, context: &ExecutionContext) -> Result<()> {
        self.state()?
            .records
            .insert(path.to_path_buf(), context.clone());
        Ok(())
    }
}

type ResultSets = Arc<Mutex<HashMap<PathBuf, Vec<Row>>>>;

#[derive(Default)]
pub struct MemoryResultSink {
    sets: ResultSets,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn sets(&self) -> Result<MutexGuard<'_, HashMap<PathBuf, Vec<Row>>>> {
        self.sets
            .lock()
            .map_err(|_| anyhow!("memory result sink poisoned"))
    }

    pub fn rows(&self, path: &Path) -> Vec<Row> {
        self.sets()
            .ok()
            .and_then(|sets| sets.get(path).cloned())
            .unwrap_or_default()
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.sets()
            .map(|sets| sets.contains_key(path))
            .unwrap_or(false)
    }

    pub fn result_set(&self, recipient: &str, session_id: &str, name: &str) -> Vec<Row> {
        self.rows(&FlowPaths::new(recipient, session_id).result_set(name))
    }

    pub fn log_messages(&self, recipient: &str, session_id: &str) -> Vec<String> {
        self.rows(&FlowPaths::new(recipient, session_id).log())
            .iter()
            .filter_map(|row| row.get("message").and_then(|m| m.as_str()))
            .map(str::to_string)
            .collect()
    }
}

impl ResultSink for MemoryResultSink {
    fn open_writer(
        &self,
        recipient: &str,
        session_id: &str,
        name: &str,
        append: bool,
    ) -> Result<Box<dyn ResultWriter>> {
        let path = FlowPaths::new(recipient, session_id).result_set(name);
        {
            let mut sets = self.sets()?;
            let rows = sets.entry(path.clone()).or_default();
            if !append {
                rows.clear();
            }
        }
        Ok(Box::new(MemoryResultWriter {
            sets: Arc::clone(&self.sets),
            path,
            closed: false,
        }))
    }

    fn push_rows(&self, path: &Path, rows: Vec<Row>) -> Result<()> {
        self.sets()?
            .entry(path.to_path_buf())
            .or_default()
            .extend(rows);
        Ok(())
    }
}

struct MemoryResultWriter {
    sets: ResultSets,
    path: PathBuf,
    closed: bool,
}

impl ResultWriter for MemoryResultWriter {
    fn write(&mut self, row: Row) -> Result<()> {
        if self.closed {
            bail!("result set {} already closed", self.path.display());
        }
        self.sets
            .lock()
            .map_err(|_| anyhow!("memory result sink poisoned"))?
            .entry(self.path.clone())
            .or_default()
            .push(row);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Default)]
struct NotifierState {
    next_id: u64,
    channels: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Notification>)>>,
}

/// Notifier delivering to subscribers in this process.
#[derive(Default, Clone)]
pub struct LocalNotifier {
    state: Arc<Mutex<NotifierState>>,
}

impl LocalNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NotifierState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn send(&self, channel: &str, notification: Notification) -> usize {
        let mut state = self.state();
        let Some(subscribers) = state.channels.get_mut(channel) else {
            return 0;
        };
        subscribers.retain(|(_, tx)| tx.send(notification).is_ok());
        subscribers.len()
    }

    /// Wake every subscriber of `channel`. Returns how many were reached.
    pub fn notify(&self, channel: &str) -> usize {
        self.send(channel, Notification { quit: false })
    }

    pub fn quit(&self, channel: &str) -> usize {
        self.send(channel, Notification { quit: true })
    }

    pub fn subscribers(&self, channel: &str) -> usize {
        self.state().channels.get(channel).map(Vec::len).unwrap_or(0)
    }
}

impl Notifier for LocalNotifier {
    fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state();
            state.next_id += 1;
            let id = state.next_id;
            state
                .channels
                .entry(channel.to_string())
                .or_default()
                .push((id, tx));
            id
        };

        let shared = Arc::clone(&self.state);
        let channel = channel.to_string();
        Ok(Subscription::new(rx, move || {
            let mut state = shared.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(subscribers) = state.channels.get_mut(&channel) {
                subscribers.retain(|(sid, _)| *sid != id);
            }
            debug!(channel = %channel, id, "notifier subscription closed");
        }))
    }
}
