use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use warden_common::{now_micros, Task};

use crate::backend::RunnerDeps;
use crate::config::RunnerConfig;
use crate::context::ContextStore;
use crate::executor::QueryExecutor;
use crate::registry::CancellationRegistry;

/// Pause before resubscribing after the notifier closed our channel.
const CLOSED_CHANNEL_BACKOFF: Duration = Duration::from_secs(1);

/// Watches the server queue and runs what it finds.
///
/// Accepted tasks run on their own spawned future; the loop never waits for
/// a query to finish before looking at the next task.
pub struct ServerArtifactsRunner {
    config: Arc<RunnerConfig>,
    deps: RunnerDeps,
    registry: Arc<CancellationRegistry>,
    contexts: Arc<ContextStore>,
    executor: Arc<QueryExecutor>,
    tracker: TaskTracker,
}

impl ServerArtifactsRunner {
    pub fn new(config: RunnerConfig, deps: RunnerDeps, tracker: TaskTracker) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(CancellationRegistry::new());
        let contexts = Arc::new(ContextStore::new(
            Arc::clone(&deps.datastore),
            config.recipient.clone(),
        ));
        let executor = Arc::new(QueryExecutor::new(
            Arc::clone(&config),
            deps.clone(),
            Arc::clone(&registry),
        ));
        Self {
            config,
            deps,
            registry,
            contexts,
            executor,
            tracker,
        }
    }

    /// Run queries with `timeout` instead of the configured deadline.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        let executor = QueryExecutor::new(
            Arc::clone(&self.config),
            self.deps.clone(),
            Arc::clone(&self.registry),
        )
        .with_timeout(timeout);
        self.executor = Arc::new(executor);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    pub fn contexts(&self) -> &Arc<ContextStore> {
        &self.contexts
    }

    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    /// Run the dispatch loop until `shutdown` fires, a quit notification
    /// arrives, or (with `stop_on_notification_error`) a poll triggered by a
    /// notification fails.
    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let channel = self.config.notification_channel.clone();
        let mut notification = self.deps.notifier.subscribe(&channel)?;

        if let Err(err) = self.process(&shutdown).await {
            warn!("ServerArtifactsRunner: initial poll failed: {:#}", err);
        }

        loop {
            tokio::select! {
                // Poll anyway in case a notification was missed.
                _ = sleep(self.config.poll_interval()) => {
                    if let Err(err) = self.process(&shutdown).await {
                        warn!("ServerArtifactsRunner: {:#}", err);
                    }
                }

                _ = shutdown.cancelled() => {
                    debug!("ServerArtifactsRunner: shutdown");
                    return Ok(());
                }

                signal = notification.recv() => {
                    if signal.map(|n| n.quit).unwrap_or(false) {
                        info!("ServerArtifactsRunner: quit.");
                        return Ok(());
                    }
                    let channel_closed = signal.is_none();

                    if let Err(err) = self.process(&shutdown).await {
                        error!("ServerArtifactsRunner: {:#}", err);
                        if self.config.stop_on_notification_error {
                            return Err(err);
                        }
                    }

                    // A closed channel wakes us without a sender; don't spin on it.
                    if channel_closed {
                        debug!(channel = %channel, "notification channel closed; resubscribing");
                        tokio::select! {
                            _ = sleep(CLOSED_CHANNEL_BACKOFF) => {}
                            _ = shutdown.cancelled() => return Ok(()),
                        }
                    }

                    // Listen again.
                    notification.unsubscribe();
                    notification = self.deps.notifier.subscribe(&channel)?;
                }
            }
        }
    }

    /// Fetch every queued server task and dispatch each in turn. Only the
    /// queue fetch fails the poll; per-task failures are logged.
    pub async fn process(&self, shutdown: &CancellationToken) -> Result<usize> {
        let tasks = self
            .deps
            .datastore
            .fetch_pending_tasks(&self.config.recipient)
            .await?;

        let count = tasks.len();
        for task in tasks {
            if let Err(err) = self.process_task(shutdown, task).await {
                error!("ServerArtifactsRunner: {:#}", err);
            }
        }
        Ok(count)
    }

    /// Dequeue `task`, then either cancel its session or start it in the
    /// background. The task is removed from the queue before anything else
    /// happens and is never redelivered.
    pub async fn process_task(&self, shutdown: &CancellationToken, task: Task) -> Result<()> {
        let context = self.contexts.load(&task.session_id).await?;

        if let Err(err) = self
            .deps
            .datastore
            .remove_from_queue(&self.config.recipient, &task)
            .await
        {
            warn!(
                session_id = %task.session_id,
                "failed to remove task from queue: {:#}", err
            );
        }

        let log = self.executor.log_sink(&task.session_id);

        if task.is_cancel() {
            log.log("Cancelling Query");
            let cancelled = self.cancel(&task.session_id);
            debug!(session_id = %task.session_id, cancelled, "cancel request handled");
            return Ok(());
        }

        if self.tracker.is_closed() {
            return Err(anyhow!(
                "runner is shutting down; dropping task for {}",
                task.session_id
            ));
        }

        let executor = Arc::clone(&self.executor);
        let parent = shutdown.clone();
        self.tracker.spawn(async move {
            let outcome = executor.run_query(&parent, &task, &context, Arc::clone(&log)).await;

            let status = match &outcome {
                Ok(summary) => {
                    debug!(session_id = %task.session_id, ?summary, "server task finished");
                    None
                }
                Err(err) => {
                    if err.is_task_error() {
                        warn!(session_id = %task.session_id, "server task rejected: {}", err);
                    } else {
                        error!(session_id = %task.session_id, "server task failed: {}", err);
                    }
                    log.log(&format!("Error: {}", err));
                    Some(err.to_string())
                }
            };

            let now = now_micros();
            let saved = context
                .update(|ctx| {
                    ctx.terminate(now);
                    ctx.status = status;
                })
                .await;
            if let Err(err) = saved {
                error!(
                    session_id = %task.session_id,
                    "failed to save execution context: {:#}", err
                );
            }
        });

        Ok(())
    }

    /// Cancel whatever is running for `session_id`. A no-op when nothing is.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.registry.cancel(session_id)
    }
}

/// Build the runner and start its dispatch loop on `tracker`.
pub fn start_server_artifact_service(
    shutdown: CancellationToken,
    tracker: &TaskTracker,
    config: RunnerConfig,
    deps: RunnerDeps,
) -> Arc<ServerArtifactsRunner> {
    let runner = Arc::new(ServerArtifactsRunner::new(config, deps, tracker.clone()));

    info!(
        recipient = %runner.config.recipient,
        timeout_secs = runner.executor.timeout().as_secs(),
        "Starting Server Artifact Runner Service"
    );

    let service = Arc::clone(&runner);
    tracker.spawn(async move {
        if let Err(err) = service.start(shutdown).await {
            error!("ServerArtifactsRunner stopped: {:#}", err);
        }
    });

    runner
}
