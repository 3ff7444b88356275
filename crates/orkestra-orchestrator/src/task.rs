use orkestra_core::{AgentRole, TaskId, TaskType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque task input. Only retry feedback injection rewrites it.
pub type Payload = Map<String, Value>;

/// Lifecycle of a task inside one execution run.
///
/// `PENDING -> READY -> RUNNING -> {COMPLETED | FAILED | RETRYING}`,
/// `RETRYING -> RUNNING`, and any non-terminal task may be skipped or
/// force-failed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Whether the scheduler may move a task from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Ready) | (Ready, Running) => true,
            (Running, Completed) | (Running, Failed) | (Running, Retrying) => true,
            (Retrying, Running) => true,
            // Dependency failure or circuit halt.
            (Pending, Skipped) | (Ready, Skipped) => true,
            // Wall-clock timeout.
            (Pending, Failed) | (Ready, Failed) | (Retrying, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Ready => "READY",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Retrying => "RETRYING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// A refused status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {task_id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// A unit of work in a task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Owning role. Defaults to the conventional owner of `task_type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentRole>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    /// Per-task override of the task type's retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            task_type,
            agent: None,
            dependencies: Vec::new(),
            payload: Payload::new(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_agent(mut self, agent: AgentRole) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Set one payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Shorthand for the `script` payload field run by the sandbox.
    pub fn with_script(self, script: impl Into<String>) -> Self {
        self.with_field("script", Value::String(script.into()))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn owner(&self) -> AgentRole {
        self.agent
            .unwrap_or_else(|| AgentRole::for_task_type(self.task_type))
    }

    /// Move to `next`, refusing transitions out of terminal states and
    /// any edge the state machine does not allow.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}
