use crate::balancer::{BalancingStrategy, LoadBalancer};
use crate::dag::{TaskDispatcher, TaskFailure, TaskOutput};
use crate::registry::WorkerRegistry;
use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orkestra_core::TaskId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Transport that runs a task on a specific worker (in-process call, RPC, queue).
///
/// `Err` means the worker could not run the task. A task that ran and
/// exited nonzero is an `Ok` output.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn execute(&self, worker_id: &str, task: &Task) -> Result<TaskOutput, String>;
}

/// Failover settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Per-worker attempt timeout in milliseconds (default: 30000).
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,

    /// Workers tried per dispatch before giving up (default: 3).
    #[serde(default = "default_max_failover_attempts")]
    pub max_failover_attempts: u32,

    /// How often a running attempt checks that its worker is still alive (default: 100).
    #[serde(default = "default_liveness_poll_ms")]
    pub liveness_poll_ms: u64,
}

fn default_dispatch_timeout_ms() -> u64 {
    30_000
}

fn default_max_failover_attempts() -> u32 {
    3
}

fn default_liveness_poll_ms() -> u64 {
    100
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            max_failover_attempts: default_max_failover_attempts(),
            liveness_poll_ms: default_liveness_poll_ms(),
        }
    }
}

/// Why one worker attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptError {
    #[error("DISPATCH_TIMEOUT: no result within {0} ms")]
    Timeout(u64),
    #[error("WORKER_LOST: worker died during dispatch")]
    WorkerLost,
    #[error("EXECUTOR_ERROR: {0}")]
    Executor(String),
}

/// A task moving away from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverEvent {
    pub task_id: TaskId,
    pub from_worker: String,
    /// `None` when no further worker was available.
    pub to_worker: Option<String>,
    pub reason: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// A successful distributed dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedResponse {
    pub worker_id: String,
    pub output: TaskOutput,
    pub attempts: u32,
    pub failed_over: bool,
}

/// Dispatches tasks across registered workers, failing over on timeouts,
/// executor errors and dead workers.
pub struct DistributedDispatcher {
    registry: Arc<WorkerRegistry>,
    balancer: LoadBalancer,
    executor: Arc<dyn WorkerExecutor>,
    config: DispatcherConfig,
    failovers: Mutex<Vec<FailoverEvent>>,
}

impl DistributedDispatcher {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        strategy: BalancingStrategy,
        executor: Arc<dyn WorkerExecutor>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            balancer: LoadBalancer::new(strategy),
            executor,
            config,
            failovers: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn failovers(&self) -> Vec<FailoverEvent> {
        self.failovers.lock().clone()
    }

    /// Run `task` on some capable worker. `None` once every attempt failed
    /// or no untried capable worker is left.
    pub async fn dispatch(&self, task: &Task) -> Option<DistributedResponse> {
        let mut tried: HashSet<String> = HashSet::new();
        // (worker, reason, attempt) of the last failure, awaiting its successor.
        let mut pending: Option<(String, String, u32)> = None;
        let mut attempts = 0u32;

        while attempts < self.config.max_failover_attempts {
            let candidates: Vec<_> = self
                .registry
                .capable_workers(task.task_type)
                .into_iter()
                .filter(|w| !tried.contains(&w.id))
                .collect();
            let Some(worker_id) = self
                .balancer
                .select(&candidates, task.task_type)
                .map(|w| w.id.clone())
            else {
                break;
            };
            tried.insert(worker_id.clone());
            // Lost a race for the last slot; look for another worker.
            if !self.registry.task_started(&worker_id) {
                continue;
            }
            attempts += 1;
            if let Some((from, reason, attempt)) = pending.take() {
                self.record_failover(task, from, Some(worker_id.clone()), reason, attempt);
            }

            let result = self.attempt(&worker_id, task).await;
            self.registry.task_completed(&worker_id);

            match result {
                Ok(output) => {
                    info!(
                        task_id = %task.id,
                        worker_id = %worker_id,
                        attempts,
                        "distributed dispatch succeeded"
                    );
                    return Some(DistributedResponse {
                        worker_id,
                        output,
                        attempts,
                        failed_over: attempts > 1,
                    });
                }
                Err(e) => {
                    pending = Some((worker_id, e.to_string(), attempts));
                }
            }
        }

        if let Some((from, reason, attempt)) = pending {
            self.record_failover(task, from, None, reason, attempt);
        }
        error!(task_id = %task.id, attempts, "distributed dispatch exhausted");
        None
    }

    async fn attempt(&self, worker_id: &str, task: &Task) -> Result<TaskOutput, AttemptError> {
        let timeout_ms = self.config.dispatch_timeout_ms;
        tokio::select! {
            result = self.executor.execute(worker_id, task) => result.map_err(AttemptError::Executor),
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => Err(AttemptError::Timeout(timeout_ms)),
            _ = self.worker_lost(worker_id) => Err(AttemptError::WorkerLost),
        }
    }

    /// Resolves once the worker is dead or gone.
    async fn worker_lost(&self, worker_id: &str) {
        let poll = Duration::from_millis(self.config.liveness_poll_ms.max(1));
        while self.registry.is_alive(worker_id) {
            tokio::time::sleep(poll).await;
        }
    }

    fn record_failover(
        &self,
        task: &Task,
        from_worker: String,
        to_worker: Option<String>,
        reason: String,
        attempt: u32,
    ) {
        warn!(
            task_id = %task.id,
            from = %from_worker,
            to = to_worker.as_deref().unwrap_or("none"),
            reason = %reason,
            attempt,
            "failover"
        );
        self.failovers.lock().push(FailoverEvent {
            task_id: task.id.clone(),
            from_worker,
            to_worker,
            reason,
            attempt,
            timestamp: Utc::now(),
        });
    }
}

#[async_trait]
impl TaskDispatcher for DistributedDispatcher {
    async fn dispatch(&self, task: &Task) -> Result<TaskOutput, TaskFailure> {
        match DistributedDispatcher::dispatch(self, task).await {
            Some(response) if response.output.exit_code == 0 => Ok(response.output),
            Some(response) => Err(TaskFailure::task(format!(
                "exit code {} on worker {}: {}",
                response.output.exit_code,
                response.worker_id,
                response.output.stderr.trim()
            ))
            .with_output(response.output)),
            None => Err(TaskFailure::dispatch(format!(
                "no worker could run task '{}' ({})",
                task.id, task.task_type
            ))),
        }
    }
}
