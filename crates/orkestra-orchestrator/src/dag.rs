use crate::events::{ExecutionEvent, ObserverChain};
use crate::graph::{TaskGraph, ValidationError};
use crate::retry::RetryPolicy;
use crate::task::{Payload, Task, TaskStatus};
use crate::telemetry::ExecutionSummary;
use async_trait::async_trait;
use futures_util::FutureExt;
use orkestra_core::{OrkestraResult, TaskId};
use orkestra_sandbox::SandboxMode;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Dispatch boundary
// ---------------------------------------------------------------------------

/// What an executed task produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub mode: SandboxMode,
}

impl TaskOutput {
    /// A successful contained run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            duration_ms: 0,
            mode: SandboxMode::Contained,
        }
    }
}

/// Where a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The task ran and failed (nonzero exit, bad input, sandbox error).
    Task,
    /// No executor could be reached to run the task.
    Dispatch,
}

/// A failed dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    pub output: Option<TaskOutput>,
}

impl TaskFailure {
    pub fn task(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Task,
            message: message.into(),
            output: None,
        }
    }

    pub fn dispatch(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Dispatch,
            message: message.into(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: TaskOutput) -> Self {
        self.output = Some(output);
        self
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} failure: {}", self.kind, self.message)
    }
}

/// Runs one attempt of a task. The only integration point between the
/// engine and whatever executes tasks.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, task: &Task) -> Result<TaskOutput, TaskFailure>;
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tasks running at once (default: 4).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Scheduler tick in milliseconds (default: 50).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Wall-clock budget for a whole run in milliseconds (default: 10 minutes).
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_tick_interval_ms() -> u64 {
    50
}

fn default_run_timeout_ms() -> u64 {
    600_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            tick_interval_ms: default_tick_interval_ms(),
            run_timeout_ms: default_run_timeout_ms(),
        }
    }
}

/// Messages from in-flight task units to the scheduler loop.
enum Progress {
    Retrying {
        task_id: TaskId,
        payload: Payload,
        next_attempt: u32,
        delay_ms: u64,
        error: String,
    },
    Resumed {
        task_id: TaskId,
    },
}

struct UnitOutcome {
    task_id: TaskId,
    attempts: u32,
    result: Result<TaskOutput, (TaskFailure, String)>,
}

/// Validates and executes task graphs.
pub struct DagEngine {
    config: EngineConfig,
    policy: Arc<RetryPolicy>,
    observers: ObserverChain,
}

impl DagEngine {
    pub fn new(config: EngineConfig, policy: Arc<RetryPolicy>) -> Self {
        Self {
            config,
            policy,
            observers: ObserverChain::new(),
        }
    }

    pub fn with_observers(mut self, observers: ObserverChain) -> Self {
        self.observers = observers;
        self
    }

    pub fn policy(&self) -> &Arc<RetryPolicy> {
        &self.policy
    }

    pub fn validate(&self, graph: &TaskGraph) -> Result<Vec<TaskId>, ValidationError> {
        graph.validate()
    }

    /// Run every task of `graph` to a terminal state.
    ///
    /// The graph is validated first; an invalid graph is refused before any
    /// task is dispatched. Task failures do not make this return `Err`; they
    /// are reported in the summary.
    pub async fn execute(
        &self,
        graph: &mut TaskGraph,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> OrkestraResult<ExecutionSummary> {
        if let Err(e) = graph.validate() {
            error!(error = %e, "task graph rejected");
            return Err(e.into());
        }

        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.run_timeout_ms);
        let tick = Duration::from_millis(self.config.tick_interval_ms.max(1));
        let max_concurrency = self.config.max_concurrency.max(1);

        info!(run_id = %run_id, tasks = graph.len(), max_concurrency, "DAG run started");
        self.observers
            .emit(ExecutionEvent::RunStarted {
                run_id: run_id.clone(),
                total_tasks: graph.len(),
            })
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel::<Progress>();
        let mut units: JoinSet<UnitOutcome> = JoinSet::new();
        let mut execution_order = Vec::new();
        let mut retries = 0u32;
        let mut circuit_broken = false;
        let mut timed_out = false;

        loop {
            self.readiness_pass(graph).await;

            if self.policy.is_open() {
                if !circuit_broken {
                    circuit_broken = true;
                    warn!(run_id = %run_id, "circuit breaker open, halting dispatch");
                    self.observers
                        .emit(ExecutionEvent::CircuitOpened {
                            consecutive_failures: self.policy.consecutive_failures(),
                        })
                        .await;
                }
                self.skip_waiting(graph, "circuit breaker open").await;
            } else {
                let free = max_concurrency.saturating_sub(units.len());
                let ready: Vec<TaskId> = graph
                    .tasks()
                    .iter()
                    .filter(|t| t.status == TaskStatus::Ready)
                    .take(free)
                    .map(|t| t.id.clone())
                    .collect();
                for task_id in ready {
                    let Some(task) = graph.get_mut(&task_id) else {
                        continue;
                    };
                    if let Err(e) = task.transition(TaskStatus::Running) {
                        warn!(error = %e, "dispatch refused");
                        continue;
                    }
                    let snapshot = task.clone();
                    self.observers
                        .emit(ExecutionEvent::TaskDispatched {
                            task_id: snapshot.id.clone(),
                            task_type: snapshot.task_type,
                            agent: snapshot.owner(),
                            attempt: snapshot.retry_count + 1,
                        })
                        .await;
                    debug!(task_id = %snapshot.id, "task dispatched");
                    units.spawn(guarded_unit(
                        snapshot,
                        Arc::clone(&dispatcher),
                        Arc::clone(&self.policy),
                        tx.clone(),
                    ));
                }
            }

            if units.is_empty() {
                if !graph.all_terminal() {
                    // Only reachable if a task is stuck outside the state machine.
                    warn!(run_id = %run_id, "no runnable tasks left; stopping");
                    self.force_fail(graph);
                }
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                break;
            }
            let wait = tick.min(deadline - now);

            tokio::select! {
                biased;
                Some(progress) = rx.recv() => {
                    retries += self.apply_progress(graph, progress).await;
                }
                Some(joined) = units.join_next() => {
                    while let Ok(progress) = rx.try_recv() {
                        retries += self.apply_progress(graph, progress).await;
                    }
                    match joined {
                        Ok(outcome) => {
                            self.apply_outcome(graph, outcome, &mut execution_order).await;
                        }
                        Err(e) => error!(error = %e, "task unit aborted"),
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if timed_out {
            units.abort_all();
            while units.join_next().await.is_some() {}
            let forced = self.force_fail(graph);
            let elapsed_ms = started.elapsed().as_millis() as u64;
            error!(run_id = %run_id, elapsed_ms, forced = forced.len(), "DAG run timed out");
            self.observers
                .emit(ExecutionEvent::RunTimedOut {
                    elapsed_ms,
                    forced_failed: forced,
                })
                .await;
        }

        let mut summary = ExecutionSummary::from_graph(run_id.clone(), graph);
        summary.retries = retries;
        summary.duration_ms = started.elapsed().as_millis() as u64;
        summary.circuit_broken = circuit_broken;
        summary.timed_out = timed_out;
        summary.execution_order = execution_order;

        info!(
            run_id = %run_id,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            retries = summary.retries,
            duration_ms = summary.duration_ms,
            circuit_broken,
            timed_out,
            "DAG run finished"
        );
        self.observers
            .emit(ExecutionEvent::RunFinished {
                summary: summary.clone(),
            })
            .await;
        Ok(summary)
    }

    /// Promote pending tasks whose dependencies completed, and skip tasks
    /// behind a failed or skipped dependency, until nothing changes.
    async fn readiness_pass(&self, graph: &mut TaskGraph) {
        loop {
            let mut changes: Vec<(TaskId, TaskStatus, Option<String>)> = Vec::new();
            for task in graph.tasks().iter().filter(|t| t.status == TaskStatus::Pending) {
                let mut all_completed = true;
                let mut blocked_by = None;
                for dep in &task.dependencies {
                    match graph.status_of(dep) {
                        Some(TaskStatus::Completed) => {}
                        Some(s @ (TaskStatus::Failed | TaskStatus::Skipped)) => {
                            blocked_by = Some(format!("dependency '{dep}' is {s}"));
                            break;
                        }
                        _ => all_completed = false,
                    }
                }
                if let Some(reason) = blocked_by {
                    changes.push((task.id.clone(), TaskStatus::Skipped, Some(reason)));
                } else if all_completed {
                    changes.push((task.id.clone(), TaskStatus::Ready, None));
                }
            }
            if changes.is_empty() {
                return;
            }
            for (task_id, next, reason) in changes {
                self.set_status(graph, &task_id, next);
                if let Some(reason) = reason {
                    info!(task_id = %task_id, reason = %reason, "task skipped");
                    self.observers
                        .emit(ExecutionEvent::TaskSkipped { task_id, reason })
                        .await;
                }
            }
        }
    }

    /// Skip every task that has not started.
    async fn skip_waiting(&self, graph: &mut TaskGraph, reason: &str) {
        let waiting: Vec<TaskId> = graph
            .tasks()
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
            .map(|t| t.id.clone())
            .collect();
        for task_id in waiting {
            self.set_status(graph, &task_id, TaskStatus::Skipped);
            self.observers
                .emit(ExecutionEvent::TaskSkipped {
                    task_id,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    fn force_fail(&self, graph: &mut TaskGraph) -> Vec<TaskId> {
        let open: Vec<TaskId> = graph
            .tasks()
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for task_id in &open {
            self.set_status(graph, task_id, TaskStatus::Failed);
        }
        open
    }

    fn set_status(&self, graph: &mut TaskGraph, task_id: &str, next: TaskStatus) {
        if let Some(task) = graph.get_mut(task_id) {
            if let Err(e) = task.transition(next) {
                warn!(error = %e, "status change refused");
            }
        }
    }

    /// Returns the number of retries the progress message represents.
    async fn apply_progress(&self, graph: &mut TaskGraph, progress: Progress) -> u32 {
        match progress {
            Progress::Retrying {
                task_id,
                payload,
                next_attempt,
                delay_ms,
                error,
            } => {
                let Some(task) = graph.get_mut(&task_id) else {
                    return 0;
                };
                task.payload = payload;
                task.retry_count += 1;
                let task_type = task.task_type;
                self.set_status(graph, &task_id, TaskStatus::Retrying);
                info!(task_id = %task_id, next_attempt, delay_ms, "task retrying");
                self.observers
                    .emit(ExecutionEvent::TaskRetrying {
                        task_id,
                        task_type,
                        next_attempt,
                        delay_ms,
                        error,
                    })
                    .await;
                1
            }
            Progress::Resumed { task_id } => {
                self.set_status(graph, &task_id, TaskStatus::Running);
                if let Some(task) = graph.get(&task_id) {
                    self.observers
                        .emit(ExecutionEvent::TaskDispatched {
                            task_id: task.id.clone(),
                            task_type: task.task_type,
                            agent: task.owner(),
                            attempt: task.retry_count + 1,
                        })
                        .await;
                }
                0
            }
        }
    }

    async fn apply_outcome(
        &self,
        graph: &mut TaskGraph,
        outcome: UnitOutcome,
        execution_order: &mut Vec<TaskId>,
    ) {
        let UnitOutcome {
            task_id,
            attempts,
            result,
        } = outcome;
        let Some(task_type) = graph.get(&task_id).map(|t| t.task_type) else {
            return;
        };

        match result {
            Ok(output) => {
                self.set_status(graph, &task_id, TaskStatus::Completed);
                execution_order.push(task_id.clone());
                info!(task_id = %task_id, attempts, duration_ms = output.duration_ms, "task completed");
                self.observers
                    .emit(ExecutionEvent::TaskCompleted {
                        task_id,
                        task_type,
                        attempt: attempts,
                        duration_ms: output.duration_ms,
                        mode: output.mode,
                    })
                    .await;
            }
            Err((failure, reason)) => {
                self.set_status(graph, &task_id, TaskStatus::Failed);
                match failure.kind {
                    FailureKind::Dispatch => {
                        error!(task_id = %task_id, attempts, error = %failure.message, "dispatch exhausted")
                    }
                    FailureKind::Task => {
                        warn!(task_id = %task_id, attempts, error = %failure.message, reason = %reason, "task failed")
                    }
                }
                self.observers
                    .emit(ExecutionEvent::TaskFailed {
                        task_id,
                        task_type,
                        kind: failure.kind,
                        attempts,
                        error: failure.message,
                        reason,
                    })
                    .await;
                // Dependents are skipped before anything else is dispatched.
                self.readiness_pass(graph).await;
            }
        }
    }
}

/// [`run_unit`] with panics turned into task failures.
async fn guarded_unit(
    task: Task,
    dispatcher: Arc<dyn TaskDispatcher>,
    policy: Arc<RetryPolicy>,
    progress: mpsc::UnboundedSender<Progress>,
) -> UnitOutcome {
    let task_id = task.id.clone();
    match AssertUnwindSafe(run_unit(task, dispatcher, policy, progress))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(task_id = %task_id, "task unit panicked");
            UnitOutcome {
                task_id,
                attempts: 0,
                result: Err((
                    TaskFailure::task("task unit panicked"),
                    "unit panicked".to_string(),
                )),
            }
        }
    }
}

/// One task, attempted until it succeeds or the policy stops retrying.
async fn run_unit(
    mut task: Task,
    dispatcher: Arc<dyn TaskDispatcher>,
    policy: Arc<RetryPolicy>,
    progress: mpsc::UnboundedSender<Progress>,
) -> UnitOutcome {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match dispatcher.dispatch(&task).await {
            Ok(output) => {
                policy.record_success();
                return UnitOutcome {
                    task_id: task.id,
                    attempts,
                    result: Ok(output),
                };
            }
            Err(failure) => {
                let decision = policy.evaluate(&task, &failure.message);
                let Some(payload) = decision.feedback_payload.filter(|_| decision.should_retry)
                else {
                    return UnitOutcome {
                        task_id: task.id,
                        attempts,
                        result: Err((failure, decision.reason)),
                    };
                };

                task.payload = payload.clone();
                task.retry_count += 1;
                let _ = progress.send(Progress::Retrying {
                    task_id: task.id.clone(),
                    payload,
                    next_attempt: decision.next_attempt,
                    delay_ms: decision.delay_ms,
                    error: failure.message,
                });
                tokio::time::sleep(Duration::from_millis(decision.delay_ms)).await;
                if policy.is_open() {
                    return UnitOutcome {
                        task_id: task.id,
                        attempts,
                        result: Err((
                            TaskFailure::task("retry abandoned"),
                            "circuit breaker opened during backoff".to_string(),
                        )),
                    };
                }
                let _ = progress.send(Progress::Resumed {
                    task_id: task.id.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::EventRecorder;
    use crate::retry::RetryConfig;
    use orkestra_core::{OrkestraError, TaskType};
    use parking_lot::Mutex;

    /// Fails the listed task ids; records every payload it is given.
    #[derive(Default)]
    struct ScriptedDispatcher {
        failing: Vec<&'static str>,
        calls: Mutex<Vec<(TaskId, Payload)>>,
        delay_ms: u64,
    }

    impl ScriptedDispatcher {
        fn failing(ids: &[&'static str]) -> Self {
            Self {
                failing: ids.to_vec(),
                ..Self::default()
            }
        }

        fn calls_for(&self, id: &str) -> Vec<Payload> {
            self.calls
                .lock()
                .iter()
                .filter(|(t, _)| t == id)
                .map(|(_, p)| p.clone())
                .collect()
        }

        fn dispatched(&self) -> Vec<TaskId> {
            self.calls.lock().iter().map(|(t, _)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl TaskDispatcher for ScriptedDispatcher {
        async fn dispatch(&self, task: &Task) -> Result<TaskOutput, TaskFailure> {
            self.calls.lock().push((task.id.clone(), task.payload.clone()));
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.failing.contains(&task.id.as_str()) {
                let n = self.calls_for(&task.id).len();
                Err(TaskFailure::task(format!("exit 1 on attempt {n}")))
            } else {
                Ok(TaskOutput::ok(format!("{} done", task.id)))
            }
        }
    }

    fn fast_policy() -> Arc<RetryPolicy> {
        Arc::new(RetryPolicy::new(RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_ms: 0,
            ..RetryConfig::default()
        }))
    }

    fn engine(policy: Arc<RetryPolicy>) -> DagEngine {
        DagEngine::new(
            EngineConfig {
                tick_interval_ms: 5,
                ..EngineConfig::default()
            },
            policy,
        )
    }

    fn task(id: &str, ty: TaskType, deps: &[&str]) -> Task {
        Task::new(id, ty).depends_on(deps.iter().copied())
    }

    #[tokio::test]
    async fn test_chain_completes_in_dependency_order() {
        let mut graph = TaskGraph::from_tasks([
            task("C", TaskType::Test, &["B"]),
            task("A", TaskType::Plan, &[]),
            task("B", TaskType::Code, &["A"]),
        ])
        .unwrap();
        let dispatcher = Arc::new(ScriptedDispatcher::default());

        let summary = engine(fast_policy())
            .execute(&mut graph, dispatcher.clone())
            .await
            .unwrap();

        assert_eq!(summary.completed, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.execution_order, vec!["A", "B", "C"]);
        assert_eq!(dispatcher.dispatched(), vec!["A", "B", "C"]);
        assert!(summary.succeeded());
    }

    #[tokio::test]
    async fn test_cycle_refused_before_dispatch() {
        let mut graph = TaskGraph::from_tasks([
            task("A", TaskType::Code, &["B"]),
            task("B", TaskType::Code, &["A"]),
        ])
        .unwrap();
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        let err = engine(fast_policy())
            .execute(&mut graph, dispatcher.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, OrkestraError::Validation(_)));
        assert!(err.to_string().contains("A, B"));
        assert!(dispatcher.dispatched().is_empty());
    }

    #[tokio::test]
    async fn test_preset_statuses_refused_before_dispatch() {
        let mut graph = TaskGraph::from_json(
            r#"{"tasks":[
                {"id":"A","type":"CODE"},
                {"id":"B","type":"CODE","dependencies":["A"],"status":"READY"},
                {"id":"C","type":"CODE","dependencies":["A"],"status":"COMPLETED"}
            ]}"#,
        )
        .unwrap();
        let dispatcher = Arc::new(ScriptedDispatcher {
            delay_ms: 20,
            ..ScriptedDispatcher::default()
        });

        let err = engine(fast_policy())
            .execute(&mut graph, dispatcher.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, OrkestraError::Validation(_)));
        assert!(err.to_string().contains("'B' is READY"));
        assert!(dispatcher.dispatched().is_empty());
        assert_eq!(graph.status_of("C"), Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_retries_exactly_budget_with_previous_error() {
        let mut graph =
            TaskGraph::from_tasks([Task::new("flaky", TaskType::Code).with_max_retries(2)])
                .unwrap();
        let dispatcher = Arc::new(ScriptedDispatcher::failing(&["flaky"]));

        let summary = engine(fast_policy())
            .execute(&mut graph, dispatcher.clone())
            .await
            .unwrap();

        let payloads = dispatcher.calls_for("flaky");
        assert_eq!(payloads.len(), 3);
        assert!(payloads[0].get("previous_error").is_none());
        assert_eq!(payloads[1]["previous_error"], "exit 1 on attempt 1");
        assert_eq!(payloads[2]["previous_error"], "exit 1 on attempt 2");
        assert_eq!(payloads[2]["retry_attempt"], 2);

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.retries, 2);
        let flaky = graph.get("flaky").unwrap();
        assert_eq!(flaky.status, TaskStatus::Failed);
        assert_eq!(flaky.retry_count, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_transitive_dependents() {
        let mut graph = TaskGraph::from_tasks([
            task("root", TaskType::Plan, &[]),
            task("mid", TaskType::Code, &["root"]),
            task("leaf", TaskType::Test, &["mid"]),
            task("side", TaskType::Document, &[]),
        ])
        .unwrap();
        let dispatcher = Arc::new(ScriptedDispatcher::failing(&["root"]));
        let recorder = Arc::new(EventRecorder::new());

        let summary = engine(fast_policy())
            .with_observers(ObserverChain::new().with(recorder.clone()))
            .execute(&mut graph, dispatcher.clone())
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(graph.status_of("mid"), Some(TaskStatus::Skipped));
        assert_eq!(graph.status_of("leaf"), Some(TaskStatus::Skipped));
        let dispatched = dispatcher.dispatched();
        assert!(!dispatched.contains(&"mid".to_string()));
        assert!(!dispatched.contains(&"leaf".to_string()));
        assert_eq!(recorder.names_for("leaf"), vec!["task_skipped"]);
    }

    #[tokio::test]
    async fn test_circuit_breaker_halts_run() {
        let ids = ["p1", "p2", "p3", "p4", "p5", "p6", "p7"];
        let mut graph =
            TaskGraph::from_tasks(ids.iter().map(|id| Task::new(*id, TaskType::Plan))).unwrap();
        let dispatcher = Arc::new(ScriptedDispatcher::failing(&ids));
        let policy = fast_policy();
        let recorder = Arc::new(EventRecorder::new());
        let engine = DagEngine::new(
            EngineConfig {
                max_concurrency: 1,
                tick_interval_ms: 5,
                ..EngineConfig::default()
            },
            Arc::clone(&policy),
        )
        .with_observers(ObserverChain::new().with(recorder.clone()));

        let summary = engine.execute(&mut graph, dispatcher.clone()).await.unwrap();

        assert!(summary.circuit_broken);
        assert_eq!(dispatcher.dispatched().len(), 5);
        assert_eq!(summary.failed, 5);
        assert_eq!(summary.skipped, 2);
        assert!(policy.is_open());
        assert!(recorder
            .events()
            .iter()
            .any(|e| matches!(e, ExecutionEvent::CircuitOpened { .. })));

        // Still open: a new run dispatches nothing.
        let mut again = TaskGraph::from_tasks([Task::new("next", TaskType::Code)]).unwrap();
        let fresh = Arc::new(ScriptedDispatcher::default());
        let blocked = engine.execute(&mut again, fresh.clone()).await.unwrap();
        assert!(blocked.circuit_broken);
        assert!(fresh.dispatched().is_empty());
        assert_eq!(again.status_of("next"), Some(TaskStatus::Skipped));

        policy.reset_circuit_breaker();
        let mut after = TaskGraph::from_tasks([Task::new("next", TaskType::Code)]).unwrap();
        let summary = engine.execute(&mut after, fresh.clone()).await.unwrap();
        assert_eq!(summary.completed, 1);
        assert!(!summary.circuit_broken);
    }

    #[tokio::test]
    async fn test_concurrency_limit_respected() {
        struct Gauge {
            current: Mutex<usize>,
            peak: Mutex<usize>,
        }

        #[async_trait]
        impl TaskDispatcher for Gauge {
            async fn dispatch(&self, _task: &Task) -> Result<TaskOutput, TaskFailure> {
                {
                    let mut c = self.current.lock();
                    *c += 1;
                    let mut p = self.peak.lock();
                    *p = (*p).max(*c);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                *self.current.lock() -= 1;
                Ok(TaskOutput::ok(""))
            }
        }

        let mut graph =
            TaskGraph::from_tasks((0..8).map(|i| Task::new(format!("t{i}"), TaskType::Research)))
                .unwrap();
        let gauge = Arc::new(Gauge {
            current: Mutex::new(0),
            peak: Mutex::new(0),
        });
        let engine = DagEngine::new(
            EngineConfig {
                max_concurrency: 3,
                tick_interval_ms: 5,
                ..EngineConfig::default()
            },
            fast_policy(),
        );
        let summary = engine.execute(&mut graph, gauge.clone()).await.unwrap();
        assert_eq!(summary.completed, 8);
        assert!(*gauge.peak.lock() <= 3);
    }

    #[tokio::test]
    async fn test_wall_clock_timeout_force_fails() {
        let mut graph = TaskGraph::from_tasks([
            task("slow", TaskType::Research, &[]),
            task("after", TaskType::Test, &["slow"]),
        ])
        .unwrap();
        let dispatcher = Arc::new(ScriptedDispatcher {
            delay_ms: 5_000,
            ..ScriptedDispatcher::default()
        });
        let engine = DagEngine::new(
            EngineConfig {
                run_timeout_ms: 100,
                tick_interval_ms: 10,
                ..EngineConfig::default()
            },
            fast_policy(),
        );

        let summary = engine.execute(&mut graph, dispatcher).await.unwrap();
        assert!(summary.timed_out);
        assert_eq!(summary.failed, 2);
        assert!(summary.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn test_event_order_for_retried_task() {
        let mut graph =
            TaskGraph::from_tasks([Task::new("x", TaskType::Code).with_max_retries(1)]).unwrap();
        let recorder = Arc::new(EventRecorder::new());
        let dispatcher = Arc::new(ScriptedDispatcher::failing(&["x"]));
        engine(fast_policy())
            .with_observers(ObserverChain::new().with(recorder.clone()))
            .execute(&mut graph, dispatcher)
            .await
            .unwrap();

        assert_eq!(
            recorder.names_for("x"),
            vec!["task_dispatched", "task_retrying", "task_dispatched", "task_failed"]
        );
        let events = recorder.events();
        assert!(matches!(events.first(), Some(ExecutionEvent::RunStarted { .. })));
        assert!(matches!(events.last(), Some(ExecutionEvent::RunFinished { .. })));
    }
}
