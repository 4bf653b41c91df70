//! Contracts for the collaborators the runner drives but does not own: the
//! durable queue and record store, the notifier, the query engine and its
//! scopes, result-set storage and string de-obfuscation.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use warden_common::{ExecutionContext, Row, Task};

use crate::acl::AclProfile;
use crate::config::RunnerConfig;
use crate::log_sink::LogSink;

#[async_trait]
pub trait Datastore: Send + Sync {
    /// Every task currently queued for `recipient`, oldest first.
    async fn fetch_pending_tasks(&self, recipient: &str) -> Result<Vec<Task>>;

    async fn remove_from_queue(&self, recipient: &str, task: &Task) -> Result<()>;

    /// `Ok(None)` when nothing was stored at `path` yet.
    async fn get_record(&self, path: &Path) -> Result<Option<ExecutionContext>>;

    async fn put_record(&self, path: &Path, context: &ExecutionContext) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub quit: bool,
}

/// A live notifier subscription. Dropping it unsubscribes.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Notification>,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<Notification>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            receiver,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// `None` once the notifier dropped its side of the channel.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(mut self) {
        if let Some(cb) = self.unsubscribe.take() {
            cb();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cb) = self.unsubscribe.take() {
            cb();
        }
    }
}

pub trait Notifier: Send + Sync {
    fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Lazily produced rows. The engine ends the stream when the query is done
/// or after it honoured cancellation.
pub type RowStream = BoxStream<'static, Value>;

pub trait QueryEngine: Send + Sync {
    fn parse(&self, text: &str) -> Result<Box<dyn CompiledQuery>, ParseError>;

    /// Convert an engine row into a result row. Non-object values are kept
    /// under a `_value` column.
    fn row_to_dict(&self, row: Value) -> Row {
        match row {
            Value::Object(map) => map,
            other => {
                let mut row = Row::new();
                row.insert("_value".into(), other);
                row
            }
        }
    }
}

pub trait CompiledQuery: Send + Sync {
    fn eval(&self, scope: Arc<dyn Scope>, cancel: CancellationToken) -> RowStream;
}

/// Execution environment shared by every query of one task. Implementations
/// use interior mutability; definitions made by one query stay visible to
/// the next.
pub trait Scope: Send + Sync {
    fn append_vars(&self, vars: Row);
    fn resolve(&self, name: &str) -> Option<Value>;
    fn log(&self, message: &str);
    fn close(&self);
}

pub struct ScopeParams {
    pub config: Arc<RunnerConfig>,
    pub uploader: Arc<dyn Uploader>,
    pub acl: AclProfile,
    pub logger: Arc<LogSink>,
}

pub trait ScopeBuilder: Send + Sync {
    fn build(&self, params: ScopeParams) -> Arc<dyn Scope>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Append,
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub path: String,
    pub size: u64,
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, name: &str, data: &[u8], mode: UploadMode) -> Result<UploadResponse>;
}

pub trait ResultWriter: Send {
    fn write(&mut self, row: Row) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

pub trait ResultSink: Send + Sync {
    /// Open the result set `name` of a session. With `append` set, rows
    /// already stored under that name are kept.
    fn open_writer(
        &self,
        recipient: &str,
        session_id: &str,
        name: &str,
        append: bool,
    ) -> Result<Box<dyn ResultWriter>>;

    /// Append rows directly to the result set at `path`.
    fn push_rows(&self, path: &Path, rows: Vec<Row>) -> Result<()>;
}

pub trait Deobfuscator: Send + Sync {
    fn deobfuscate(&self, config: &RunnerConfig, input: &str) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityDeobfuscator;

impl Deobfuscator for IdentityDeobfuscator {
    fn deobfuscate(&self, _config: &RunnerConfig, input: &str) -> String {
        input.to_string()
    }
}

/// Everything the runner needs from the outside world.
#[derive(Clone)]
pub struct RunnerDeps {
    pub datastore: Arc<dyn Datastore>,
    pub notifier: Arc<dyn Notifier>,
    pub engine: Arc<dyn QueryEngine>,
    pub scopes: Arc<dyn ScopeBuilder>,
    pub results: Arc<dyn ResultSink>,
    pub deobfuscator: Arc<dyn Deobfuscator>,
}
