use async_trait::async_trait;
use futures::FutureExt as _;
use tracing::Instrument as _;
use serde_json::{Map, Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::registry::BackendServer;
use crate::store::{Store, TaskStatus, TaskTransition, TransitionOutcome};
use crate::transport::BackendTransport;

/// One background `tools/call` to execute.
#[derive(Debug, Clone)]
pub struct ToolJob {
    pub task_id: Uuid,
    pub server: BackendServer,
    pub tool: String,
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    pub task_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("job queue is full")]
    QueueFull,
    #[error("job queue is closed")]
    Closed,
}

/// Scheduling seam between the invocation router and whatever runs the work.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn submit(&self, job: ToolJob) -> Result<JobHandle, SubmitError>;
}

/// Runs one job against its backend and records the outcome on the task.
///
/// Every write is a compare-and-set, so a job that lost its task (expired) or found it already
/// moved by someone else stops without touching it.
#[derive(Clone)]
pub struct ToolCallExecutor {
    store: Arc<dyn Store>,
    transport: Arc<dyn BackendTransport>,
    call_timeout: Duration,
}

impl ToolCallExecutor {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn BackendTransport>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            call_timeout,
        }
    }

    pub async fn run(&self, job: ToolJob) {
        let span = tracing::info_span!(
            "bridge.task",
            task_id = %job.task_id,
            server = %job.server.name,
            tool = %job.tool
        );
        self.run_job(job).instrument(span).await;
    }

    /// Like [`run`](Self::run), but a panic fails the task instead of unwinding into the caller.
    pub async fn run_guarded(&self, job: ToolJob) {
        let task_id = job.task_id;
        if AssertUnwindSafe(self.run(job)).catch_unwind().await.is_err() {
            tracing::error!(%task_id, "tool job panicked");
            self.abandon(task_id, "task execution panicked").await;
        }
    }

    /// Fail a task that will never produce a result, whether or not it had started.
    pub async fn abandon(&self, task_id: Uuid, reason: &str) {
        for expected in [TaskStatus::Running, TaskStatus::Pending] {
            let fail = TaskTransition::Fail {
                error: reason.to_string(),
            };
            match self.store.transition_task(task_id, expected, fail).await {
                Ok(TransitionOutcome::Applied(_)) => {
                    tracing::warn!(%task_id, reason, "task abandoned");
                    return;
                }
                Ok(TransitionOutcome::Rejected { current }) if current.is_terminal() => return,
                Ok(TransitionOutcome::Rejected { .. }) => {}
                Ok(TransitionOutcome::Missing) => return,
                Err(e) => {
                    tracing::warn!(%task_id, error = %e, "failed to mark abandoned task failed");
                    return;
                }
            }
        }
    }

    async fn run_job(&self, job: ToolJob) {
        let task_id = job.task_id;
        match self
            .store
            .transition_task(task_id, TaskStatus::Pending, TaskTransition::Start)
            .await
        {
            Ok(TransitionOutcome::Applied(_)) => {
                tracing::debug!(%task_id, "task running");
            }
            Ok(TransitionOutcome::Rejected { current }) => {
                tracing::warn!(%task_id, %current, "task not pending, skipping job");
                return;
            }
            Ok(TransitionOutcome::Missing) => {
                tracing::warn!(%task_id, "task expired before it started, skipping job");
                return;
            }
            Err(e) => {
                tracing::warn!(%task_id, error = %e, "failed to mark task running");
                return;
            }
        }

        let params = json!({ "name": job.tool, "arguments": job.arguments });
        let outcome = self
            .transport
            .call(&job.server, "tools/call", Some(params), self.call_timeout)
            .await;

        let transition = match outcome {
            Ok(result) => TaskTransition::Complete { result },
            Err(e) => {
                tracing::warn!(%task_id, server = %job.server.name, error = %e, "background tool call failed");
                TaskTransition::Fail {
                    error: e.to_string(),
                }
            }
        };
        let target = transition.target();

        match self
            .store
            .transition_task(task_id, TaskStatus::Running, transition)
            .await
        {
            Ok(TransitionOutcome::Applied(_)) => {
                tracing::info!(%task_id, status = %target, "task finished");
            }
            Ok(TransitionOutcome::Rejected { current }) => {
                tracing::warn!(%task_id, %current, "task changed while running, result dropped");
            }
            Ok(TransitionOutcome::Missing) => {
                tracing::warn!(%task_id, "task expired while running, result dropped");
            }
            Err(e) => {
                tracing::warn!(%task_id, error = %e, "failed to record task outcome");
            }
        }
    }
}

/// Bounded queue drained by a fixed number of workers.
///
/// Once `shutdown` fires, workers finish the job in hand and stop taking new ones. Jobs still
/// queued at that point are failed so nobody polls a task that can never finish.
pub struct WorkerPool {
    sender: mpsc::Sender<ToolJob>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    #[must_use]
    pub fn start(
        executor: ToolCallExecutor,
        workers: usize,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<ToolJob>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..workers.max(1))
            .map(|worker| {
                Self::spawn_worker(
                    worker,
                    executor.clone(),
                    receiver.clone(),
                    shutdown.clone(),
                )
            })
            .collect();
        Self { sender, workers }
    }

    fn spawn_worker(
        worker: usize,
        executor: ToolCallExecutor,
        rx: Arc<Mutex<mpsc::Receiver<ToolJob>>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    maybe = async { rx.lock().await.recv().await } => maybe,
                };
                let Some(job) = next else {
                    // All senders dropped.
                    break;
                };
                executor.run_guarded(job).await;
            }

            let mut rx = rx.lock().await;
            rx.close();
            let mut abandoned = 0usize;
            while let Ok(job) = rx.try_recv() {
                executor
                    .abandon(job.task_id, "bridge shut down before the task started")
                    .await;
                abandoned += 1;
            }
            tracing::debug!(worker, abandoned, "task worker stopped");
        })
    }

    /// Wait for every worker to exit (after the shutdown token fired).
    pub async fn join(self) {
        drop(self.sender);
        for w in self.workers {
            if let Err(e) = w.await {
                tracing::warn!(error = %e, "task worker panicked");
            }
        }
    }
}

#[async_trait]
impl JobQueue for WorkerPool {
    async fn submit(&self, job: ToolJob) -> Result<JobHandle, SubmitError> {
        let task_id = job.task_id;
        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })?;
        Ok(JobHandle { task_id })
    }
}

/// Runs each job to completion inside `submit`. Deterministic; meant for tests.
pub struct InlineQueue {
    executor: ToolCallExecutor,
}

impl InlineQueue {
    #[must_use]
    pub fn new(executor: ToolCallExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl JobQueue for InlineQueue {
    async fn submit(&self, job: ToolJob) -> Result<JobHandle, SubmitError> {
        let task_id = job.task_id;
        self.executor.run_guarded(job).await;
        Ok(JobHandle { task_id })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::transport::{HealthProbe, TransportError};
    use parking_lot::Mutex as SyncMutex;

    /// Transport double answering from a closure and recording every call.
    pub struct FnTransport<F> {
        pub respond: F,
        pub calls: SyncMutex<Vec<(String, String, Option<Value>)>>,
    }

    impl<F> FnTransport<F>
    where
        F: Fn(&BackendServer, &str, Option<&Value>) -> Result<Value, TransportError> + Send + Sync,
    {
        pub fn new(respond: F) -> Self {
            Self {
                respond,
                calls: SyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl<F> BackendTransport for FnTransport<F>
    where
        F: Fn(&BackendServer, &str, Option<&Value>) -> Result<Value, TransportError> + Send + Sync,
    {
        async fn call(
            &self,
            server: &BackendServer,
            method: &str,
            params: Option<Value>,
            _timeout: Duration,
        ) -> Result<Value, TransportError> {
            self.calls
                .lock()
                .push((server.name.clone(), method.to_string(), params.clone()));
            (self.respond)(server, method, params.as_ref())
        }

        async fn probe_health(&self, _server: &BackendServer, _timeout: Duration) -> HealthProbe {
            HealthProbe::Healthy
        }
    }
}
