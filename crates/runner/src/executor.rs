use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_common::fs::SafeFileWriter;
use warden_common::{QuerySpec, Task};

use crate::acl::AclProfile;
use crate::backend::{ResultWriter, RunnerDeps, Scope, ScopeParams};
use crate::config::RunnerConfig;
use crate::context::ContextHandle;
use crate::error::{RunnerError, RunnerResult};
use crate::log_sink::LogSink;
use crate::paths::FlowPaths;
use crate::registry::CancellationRegistry;
use crate::uploader::ServerUploader;

/// What a finished task produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub queries_run: usize,
    pub rows_written: u64,
    pub timeouts: u32,
}

/// Runs the queries of one task, in order, against a single scope.
pub struct QueryExecutor {
    config: Arc<RunnerConfig>,
    deps: RunnerDeps,
    registry: Arc<CancellationRegistry>,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(
        config: Arc<RunnerConfig>,
        deps: RunnerDeps,
        registry: Arc<CancellationRegistry>,
    ) -> Self {
        let timeout = config.query_timeout();
        Self {
            config,
            deps,
            registry,
            timeout,
        }
    }

    /// Override the per-task deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn log_sink(&self, session_id: &str) -> Arc<LogSink> {
        Arc::new(LogSink::new(
            Arc::clone(&self.config),
            Arc::clone(&self.deps.results),
            Arc::clone(&self.deps.deobfuscator),
            &FlowPaths::new(&self.config.recipient, session_id),
        ))
    }

    /// Execute `task`. Rows are streamed into the named result sets as they
    /// arrive; the deadline only requests cancellation and never drops rows.
    pub async fn run_query(
        &self,
        parent: &CancellationToken,
        task: &Task,
        context: &ContextHandle,
        log: Arc<LogSink>,
    ) -> RunnerResult<ExecutionSummary> {
        let session_id = task.session_id.as_str();
        let action = task
            .action
            .as_ref()
            .ok_or_else(|| RunnerError::MissingAction {
                session_id: session_id.to_string(),
            })?;
        let queries = action
            .queries
            .as_deref()
            .filter(|queries| !queries.is_empty())
            .ok_or_else(|| RunnerError::MissingQueries {
                session_id: session_id.to_string(),
            })?;

        let started = Instant::now();
        // Dropped on every return path: removes the entry and cancels sub_ctx.
        let registration = self.registry.register(session_id, parent.child_token());
        let sub_ctx = registration.token().clone();

        let paths = FlowPaths::new(&self.config.recipient, session_id);
        let uploader = ServerUploader::new(
            SafeFileWriter::new(&self.config.data_root).with_max_size(self.config.max_upload_bytes),
            paths,
            context.clone(),
        );
        let scope = self.deps.scopes.build(ScopeParams {
            config: Arc::clone(&self.config),
            uploader: Arc::new(uploader),
            acl: AclProfile::administrator(),
            logger: Arc::clone(&log),
        });
        scope.append_vars(action.env_row());

        context
            .update(|ctx| ctx.start_time = warden_common::now_micros())
            .await?;

        let run = AssertUnwindSafe(self.run_queries(
            queries,
            &scope,
            &sub_ctx,
            context,
            &log,
            started,
            session_id,
        ))
        .catch_unwind()
        .await;

        let closed = panic::catch_unwind(AssertUnwindSafe(|| scope.close()));

        let result = match run {
            Ok(result) => result,
            Err(payload) => Err(self.record_fault(context, &log, payload).await),
        };
        if let Err(payload) = closed {
            let fault = self.record_fault(context, &log, payload).await;
            return match result {
                Ok(_) => Err(fault),
                Err(err) => Err(err),
            };
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_queries(
        &self,
        queries: &[QuerySpec],
        scope: &Arc<dyn Scope>,
        sub_ctx: &CancellationToken,
        context: &ContextHandle,
        log: &LogSink,
        started: Instant,
        session_id: &str,
    ) -> RunnerResult<ExecutionSummary> {
        let mut summary = ExecutionSummary::default();

        // One deadline for the whole task, re-armed every time it fires.
        let deadline = sleep(self.timeout);
        tokio::pin!(deadline);

        log.log("Starting query execution.");

        for (index, query) in queries.iter().enumerate() {
            let compiled =
                self.deps
                    .engine
                    .parse(&query.text)
                    .map_err(|err| RunnerError::Parse {
                        index,
                        message: err.message,
                    })?;

            let name = query
                .result_name()
                .map(|raw| self.deps.deobfuscator.deobfuscate(&self.config, raw));

            let mut writer: Option<Box<dyn ResultWriter>> = match &name {
                Some(name) => {
                    let writer = self.deps.results.open_writer(
                        &self.config.recipient,
                        session_id,
                        name,
                        true,
                    )?;
                    context
                        .update(|ctx| ctx.add_artifact_with_results(name))
                        .await?;
                    Some(writer)
                }
                None => None,
            };

            let mut rows = compiled.eval(Arc::clone(scope), sub_ctx.clone());
            let mut row_idx: u64 = 0;

            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        log.log(&format!(
                            "Query timed out after {} seconds",
                            started.elapsed().as_secs()
                        ));
                        summary.timeouts += 1;
                        // Keep draining: the engine returns whatever it
                        // already produced before it stops.
                        sub_ctx.cancel();
                        deadline.as_mut().reset(Instant::now() + self.timeout);
                    }
                    row = rows.next() => {
                        let Some(row) = row else { break };
                        let (Some(writer), Some(name)) = (writer.as_mut(), name.as_deref()) else {
                            continue;
                        };
                        // A failed row is dropped; the rest of the stream is still stored.
                        match writer.write(self.deps.engine.row_to_dict(row)) {
                            Ok(()) => row_idx += 1,
                            Err(err) => {
                                warn!(session_id, result_set = name, "failed to write row: {:#}", err);
                                log.log(&format!("Query {}: failed to write row: {:#}", name, err));
                            }
                        }
                    }
                }
            }

            if let (Some(mut writer), Some(name)) = (writer.take(), name.as_deref()) {
                if let Err(err) = writer.close() {
                    warn!(session_id, result_set = name, "failed to close result set: {:#}", err);
                    log.log(&format!("Query {}: failed to close result set: {:#}", name, err));
                }
            }
            summary.queries_run += 1;

            if let Some(name) = &name {
                log.log(&format!("Query {}: Emitted {} rows", name, row_idx));
                summary.rows_written += row_idx;
                context
                    .modify(|ctx| ctx.total_collected_rows += row_idx)
                    .await;
            }
            debug!(session_id, index, rows = row_idx, "query finished");
        }

        info!(
            session_id,
            queries = summary.queries_run,
            rows = summary.rows_written,
            "server query completed"
        );
        Ok(summary)
    }

    async fn record_fault(
        &self,
        context: &ContextHandle,
        log: &LogSink,
        payload: Box<dyn Any + Send>,
    ) -> RunnerError {
        let message = panic_message(payload.as_ref());
        let backtrace = Backtrace::force_capture().to_string();
        error!(session_id = %context.session_id(), "panic in server query: {}", message);
        log.log(&format!("PANIC: {}\n{}", message, backtrace));
        context
            .modify(|ctx| ctx.backtrace = Some(backtrace))
            .await;
        RunnerError::Fault { message }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
