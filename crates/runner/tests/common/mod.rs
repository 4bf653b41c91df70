//! Shared fixtures for runner integration tests.
//!
//! `ScriptEngine` understands a handful of one-line statements:
//!
//! - `LET name = value` binds a variable in the scope (no rows)
//! - `SELECT a, b` emits one row with the current values of the variables
//! - `ROWS n` emits `n` rows immediately
//! - `TIMED 1000,3000` emits a row at each offset (ms); after cancellation it
//!   still delivers the row in flight, then stops
//! - `STREAM ms` emits a row every `ms` until cancelled
//! - `STUBBORN ms` ignores cancellation, emits one row after `ms` and stops
//! - `LOG text` writes through the scope logger (no rows)
//! - `UPLOAD name data` stores `data` through the scope uploader
//! - `PANIC` panics during evaluation
//!
//! Anything else is a parse error.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use warden_common::{ExecutionContext, Row, Task};
use warden_runner::{
    AclProfile, CancellationRegistry, CompiledQuery, ContextStore, Datastore, IdentityDeobfuscator,
    LocalNotifier, LogSink, MemoryDatastore, MemoryResultSink, Notifier, ParseError, QueryEngine,
    QueryExecutor, ResultSink, ResultWriter, RowStream, RunnerConfig, RunnerDeps, Scope,
    ScopeBuilder, ScopeParams, ServerArtifactsRunner, Subscription, UploadMode, Uploader,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

pub struct ScriptScope {
    vars: Mutex<Row>,
    logger: Arc<LogSink>,
    pub uploader: Arc<dyn Uploader>,
    pub acl: AclProfile,
    pub config: Arc<RunnerConfig>,
    closed: AtomicBool,
    panic_on_close: bool,
}

impl ScriptScope {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Scope for ScriptScope {
    fn append_vars(&self, vars: Row) {
        let mut current = self.vars.lock().unwrap();
        for (key, value) in vars {
            current.insert(key, value);
        }
    }

    fn resolve(&self, name: &str) -> Option<Value> {
        self.vars.lock().unwrap().get(name).cloned()
    }

    fn log(&self, message: &str) {
        self.logger.log(message);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.panic_on_close {
            panic!("scope destructor failed");
        }
    }
}

#[derive(Default)]
pub struct ScriptScopes {
    pub panic_on_close: AtomicBool,
    built: AtomicUsize,
    current: Mutex<Option<Arc<ScriptScope>>>,
}

impl ScriptScopes {
    pub fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<Arc<ScriptScope>> {
        self.current.lock().unwrap().clone()
    }
}

impl ScopeBuilder for ScriptScopes {
    fn build(&self, params: ScopeParams) -> Arc<dyn Scope> {
        let scope = Arc::new(ScriptScope {
            vars: Mutex::new(Row::new()),
            logger: params.logger,
            uploader: params.uploader,
            acl: params.acl,
            config: params.config,
            closed: AtomicBool::new(false),
            panic_on_close: self.panic_on_close.load(Ordering::SeqCst),
        });
        self.built.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().unwrap() = Some(Arc::clone(&scope));
        scope
    }
}

enum Statement {
    Let(String, Value),
    Select(Vec<String>),
    Rows(usize),
    Timed(Vec<u64>),
    Stream(u64),
    Stubborn(u64),
    Log(String),
    Upload(String, String),
    Panic,
}

pub struct ScriptEngine {
    scopes: Arc<ScriptScopes>,
    pub parsed: AtomicUsize,
}

impl ScriptEngine {
    pub fn new(scopes: Arc<ScriptScopes>) -> Self {
        Self {
            scopes,
            parsed: AtomicUsize::new(0),
        }
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

impl QueryEngine for ScriptEngine {
    fn parse(&self, text: &str) -> Result<Box<dyn CompiledQuery>, ParseError> {
        let text = text.trim();
        let (verb, rest) = text.split_once(' ').unwrap_or((text, ""));
        let rest = rest.trim();
        let statement = match verb.to_uppercase().as_str() {
            "LET" => {
                let (name, value) = rest
                    .split_once('=')
                    .ok_or_else(|| ParseError::new(format!("LET without '=': {}", text)))?;
                Statement::Let(name.trim().to_string(), parse_value(value.trim()))
            }
            "SELECT" => Statement::Select(
                rest.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            "ROWS" => Statement::Rows(
                rest.parse()
                    .map_err(|_| ParseError::new(format!("bad row count: {}", rest)))?,
            ),
            "TIMED" => Statement::Timed(
                rest.split(',')
                    .map(|s| s.trim().parse::<u64>())
                    .collect::<Result<_, _>>()
                    .map_err(|_| ParseError::new(format!("bad offsets: {}", rest)))?,
            ),
            "STREAM" => Statement::Stream(
                rest.parse()
                    .map_err(|_| ParseError::new(format!("bad period: {}", rest)))?,
            ),
            "STUBBORN" => Statement::Stubborn(
                rest.parse()
                    .map_err(|_| ParseError::new(format!("bad delay: {}", rest)))?,
            ),
            "LOG" => Statement::Log(rest.to_string()),
            "UPLOAD" => {
                let (name, data) = rest.split_once(' ').unwrap_or((rest, ""));
                Statement::Upload(name.to_string(), data.to_string())
            }
            "PANIC" => Statement::Panic,
            _ => return Err(ParseError::new(format!("syntax error near '{}'", verb))),
        };
        self.parsed.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptQuery {
            statement,
            scopes: Arc::clone(&self.scopes),
        }))
    }
}

struct ScriptQuery {
    statement: Statement,
    scopes: Arc<ScriptScopes>,
}

impl CompiledQuery for ScriptQuery {
    fn eval(&self, scope: Arc<dyn Scope>, cancel: CancellationToken) -> RowStream {
        match &self.statement {
            Statement::Let(name, value) => {
                let mut vars = Row::new();
                vars.insert(name.clone(), value.clone());
                scope.append_vars(vars);
                stream::empty().boxed()
            }
            Statement::Select(names) => {
                let mut row = Row::new();
                for name in names {
                    row.insert(name.clone(), scope.resolve(name).unwrap_or(Value::Null));
                }
                stream::iter(vec![Value::Object(row)]).boxed()
            }
            Statement::Rows(n) => {
                stream::iter((0..*n).map(|i| json!({ "idx": i }))).boxed()
            }
            Statement::Timed(offsets) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let offsets = offsets.clone();
                tokio::spawn(async move {
                    let start = Instant::now();
                    for ms in offsets {
                        sleep_until(start + Duration::from_millis(ms)).await;
                        if tx.send(json!({ "at_ms": ms })).is_err() {
                            return;
                        }
                        if cancel.is_cancelled() {
                            return;
                        }
                    }
                });
                UnboundedReceiverStream::new(rx).boxed()
            }
            Statement::Stream(ms) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let period = Duration::from_millis((*ms).max(1));
                tokio::spawn(async move {
                    let mut seq = 0u64;
                    loop {
                        if tx.send(json!({ "seq": seq })).is_err() {
                            return;
                        }
                        seq += 1;
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = sleep(period) => {}
                        }
                    }
                });
                UnboundedReceiverStream::new(rx).boxed()
            }
            Statement::Stubborn(ms) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let delay = Duration::from_millis(*ms);
                tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = tx.send(json!({ "late": true }));
                });
                UnboundedReceiverStream::new(rx).boxed()
            }
            Statement::Log(message) => {
                scope.log(message);
                stream::empty().boxed()
            }
            Statement::Upload(name, data) => {
                let uploader = self
                    .scopes
                    .current()
                    .map(|scope| Arc::clone(&scope.uploader));
                let name = name.clone();
                let data = data.clone();
                stream::once(async move {
                    match uploader {
                        Some(uploader) => {
                            match uploader
                                .upload(&name, data.as_bytes(), UploadMode::Truncate)
                                .await
                            {
                                Ok(resp) => json!({ "path": resp.path, "size": resp.size }),
                                Err(err) => json!({ "error": format!("{:#}", err) }),
                            }
                        }
                        None => json!({ "error": "no uploader" }),
                    }
                })
                .boxed()
            }
            Statement::Panic => panic!("engine exploded"),
        }
    }
}

/// Memory datastore whose queue fetch can be made to fail.
#[derive(Default)]
pub struct FlakyDatastore {
    pub inner: MemoryDatastore,
    pub fail_fetch: AtomicBool,
    pub fetches: AtomicUsize,
}

#[async_trait]
impl Datastore for FlakyDatastore {
    async fn fetch_pending_tasks(&self, recipient: &str) -> Result<Vec<Task>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(anyhow!("queue unavailable"));
        }
        self.inner.fetch_pending_tasks(recipient).await
    }

    async fn remove_from_queue(&self, recipient: &str, task: &Task) -> Result<()> {
        self.inner.remove_from_queue(recipient, task).await
    }

    async fn get_record(&self, path: &std::path::Path) -> Result<Option<ExecutionContext>> {
        self.inner.get_record(path).await
    }

    async fn put_record(&self, path: &std::path::Path, context: &ExecutionContext) -> Result<()> {
        self.inner.put_record(path, context).await
    }
}

#[derive(Default)]
pub struct WriteFaults {
    writes: AtomicUsize,
    /// 1-based index of the row write that fails; 0 disables.
    pub fail_write: AtomicUsize,
    pub fail_close: AtomicBool,
}

/// Memory result sink whose row writes or closes can be made to fail.
#[derive(Default)]
pub struct FlakyResultSink {
    pub inner: MemoryResultSink,
    pub faults: Arc<WriteFaults>,
}

impl ResultSink for FlakyResultSink {
    fn open_writer(
        &self,
        recipient: &str,
        session_id: &str,
        name: &str,
        append: bool,
    ) -> Result<Box<dyn ResultWriter>> {
        Ok(Box::new(FlakyWriter {
            inner: self.inner.open_writer(recipient, session_id, name, append)?,
            faults: Arc::clone(&self.faults),
        }))
    }

    fn push_rows(&self, path: &std::path::Path, rows: Vec<Row>) -> Result<()> {
        self.inner.push_rows(path, rows)
    }
}

struct FlakyWriter {
    inner: Box<dyn ResultWriter>,
    faults: Arc<WriteFaults>,
}

impl ResultWriter for FlakyWriter {
    fn write(&mut self, row: Row) -> Result<()> {
        let n = self.faults.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.faults.fail_write.load(Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        self.inner.write(row)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()?;
        if self.faults.fail_close.load(Ordering::SeqCst) {
            return Err(anyhow!("fsync failed"));
        }
        Ok(())
    }
}

/// Notifier whose subscriptions are closed from the start.
#[derive(Default)]
pub struct ClosedNotifier {
    pub subscriptions: AtomicUsize,
}

impl Notifier for ClosedNotifier {
    fn subscribe(&self, _channel: &str) -> Result<Subscription> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let (_, rx) = mpsc::unbounded_channel();
        Ok(Subscription::new(rx, || {}))
    }
}

pub struct Harness {
    pub datastore: Arc<FlakyDatastore>,
    pub results: Arc<FlakyResultSink>,
    pub notifier: Arc<LocalNotifier>,
    pub scopes: Arc<ScriptScopes>,
    pub engine: Arc<ScriptEngine>,
    pub config: RunnerConfig,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let scopes = Arc::new(ScriptScopes::default());
        let config = RunnerConfig {
            data_root: dir.path().to_path_buf(),
            ..RunnerConfig::default()
        };
        Self {
            datastore: Arc::new(FlakyDatastore::default()),
            results: Arc::new(FlakyResultSink::default()),
            notifier: Arc::new(LocalNotifier::new()),
            engine: Arc::new(ScriptEngine::new(Arc::clone(&scopes))),
            scopes,
            config,
            dir,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.config.query_timeout_secs = secs;
        self
    }

    pub fn deps(&self) -> RunnerDeps {
        RunnerDeps {
            datastore: self.datastore.clone(),
            notifier: self.notifier.clone(),
            engine: self.engine.clone(),
            scopes: self.scopes.clone(),
            results: self.results.clone(),
            deobfuscator: Arc::new(IdentityDeobfuscator),
        }
    }

    pub fn runner(&self, tracker: &TaskTracker) -> Arc<ServerArtifactsRunner> {
        Arc::new(ServerArtifactsRunner::new(
            self.config.clone(),
            self.deps(),
            tracker.clone(),
        ))
    }

    pub fn executor(&self, registry: Arc<CancellationRegistry>) -> QueryExecutor {
        QueryExecutor::new(Arc::new(self.config.clone()), self.deps(), registry)
    }

    pub fn contexts(&self) -> ContextStore {
        ContextStore::new(self.datastore.clone(), "server")
    }

    pub fn queue(&self, task: Task) -> u64 {
        self.datastore
            .inner
            .queue_task("server", task)
            .expect("queue task")
    }

    pub fn logs(&self, session_id: &str) -> Vec<String> {
        self.results.inner.log_messages("server", session_id)
    }

    pub fn rows(&self, session_id: &str, name: &str) -> Vec<Row> {
        self.results.inner.result_set("server", session_id, name)
    }

    pub fn context(&self, session_id: &str) -> Option<ExecutionContext> {
        self.datastore.inner.record("server", session_id)
    }
}

/// Poll `check` until it holds, failing after `limit`.
pub async fn wait_for(limit: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !check() {
        assert!(Instant::now() < deadline, "condition not met within {:?}", limit);
        sleep(Duration::from_millis(10)).await;
    }
}
