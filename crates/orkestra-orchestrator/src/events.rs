use crate::dag::FailureKind;
use crate::telemetry::ExecutionSummary;
use async_trait::async_trait;
use orkestra_core::{AgentRole, TaskId, TaskType};
use orkestra_sandbox::SandboxMode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Events emitted by the scheduler loop, in the order they happen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    RunStarted {
        run_id: String,
        total_tasks: usize,
    },
    TaskDispatched {
        task_id: TaskId,
        task_type: TaskType,
        agent: AgentRole,
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        task_type: TaskType,
        attempt: u32,
        duration_ms: u64,
        mode: SandboxMode,
    },
    TaskRetrying {
        task_id: TaskId,
        task_type: TaskType,
        /// The attempt that will run after the delay.
        next_attempt: u32,
        delay_ms: u64,
        error: String,
    },
    TaskFailed {
        task_id: TaskId,
        task_type: TaskType,
        kind: FailureKind,
        attempts: u32,
        error: String,
        reason: String,
    },
    TaskSkipped {
        task_id: TaskId,
        reason: String,
    },
    CircuitOpened {
        consecutive_failures: u32,
    },
    RunTimedOut {
        elapsed_ms: u64,
        forced_failed: Vec<TaskId>,
    },
    RunFinished {
        summary: ExecutionSummary,
    },
}

impl ExecutionEvent {
    /// Short snake_case name, used for topics and ledger action types.
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::RunStarted { .. } => "run_started",
            ExecutionEvent::TaskDispatched { .. } => "task_dispatched",
            ExecutionEvent::TaskCompleted { .. } => "task_completed",
            ExecutionEvent::TaskRetrying { .. } => "task_retrying",
            ExecutionEvent::TaskFailed { .. } => "task_failed",
            ExecutionEvent::TaskSkipped { .. } => "task_skipped",
            ExecutionEvent::CircuitOpened { .. } => "circuit_opened",
            ExecutionEvent::RunTimedOut { .. } => "run_timed_out",
            ExecutionEvent::RunFinished { .. } => "run_finished",
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::TaskDispatched { task_id, .. }
            | ExecutionEvent::TaskCompleted { task_id, .. }
            | ExecutionEvent::TaskRetrying { task_id, .. }
            | ExecutionEvent::TaskFailed { task_id, .. }
            | ExecutionEvent::TaskSkipped { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// Receives execution events. Observers must not block for long; the
/// scheduler awaits each one in turn.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    async fn on_event(&self, event: &ExecutionEvent);
}

/// Fans events out to every attached observer.
#[derive(Clone, Default)]
pub struct ObserverChain {
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl ObserverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: Arc<dyn ExecutionObserver>) {
        self.observers.push(observer);
    }

    pub fn with(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.add(observer);
        self
    }

    pub async fn emit(&self, event: ExecutionEvent) {
        for observer in &self.observers {
            observer.on_event(&event).await;
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

/// Keeps every event in memory. Handy for tests and dashboards.
#[derive(Default)]
pub struct EventRecorder {
    events: parking_lot::Mutex<Vec<ExecutionEvent>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().clone()
    }

    /// Names of recorded events concerning `task_id`.
    pub fn names_for(&self, task_id: &str) -> Vec<&'static str> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id() == Some(task_id))
            .map(ExecutionEvent::name)
            .collect()
    }
}

#[async_trait]
impl ExecutionObserver for EventRecorder {
    async fn on_event(&self, event: &ExecutionEvent) {
        self.events.lock().push(event.clone());
    }
}
