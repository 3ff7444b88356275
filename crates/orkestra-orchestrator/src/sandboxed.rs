//! Adapters that execute tasks in the sandbox.

use crate::dag::{TaskDispatcher, TaskFailure, TaskOutput};
use crate::dispatcher::WorkerExecutor;
use crate::task::Task;
use async_trait::async_trait;
use orkestra_sandbox::{SandboxRequest, SandboxResult, SandboxRuntime};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Payload field holding the shell script a task runs.
pub const SCRIPT_FIELD: &str = "script";

fn request_for(task: &Task) -> Result<SandboxRequest, TaskFailure> {
    let script = task
        .payload
        .get(SCRIPT_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            TaskFailure::task(format!(
                "task '{}' has no '{SCRIPT_FIELD}' string in its payload",
                task.id
            ))
        })?;
    Ok(SandboxRequest {
        task_id: task.id.clone(),
        script: script.to_string(),
        input: Value::Object(task.payload.clone()),
    })
}

fn to_output(result: SandboxResult) -> TaskOutput {
    TaskOutput {
        exit_code: result.exit_code,
        stdout: result.stdout,
        stderr: result.stderr,
        duration_ms: result.duration_ms,
        mode: result.mode,
    }
}

/// Runs each task directly in the local sandbox.
pub struct SandboxDispatcher {
    sandbox: Arc<SandboxRuntime>,
}

impl SandboxDispatcher {
    pub fn new(sandbox: Arc<SandboxRuntime>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl TaskDispatcher for SandboxDispatcher {
    async fn dispatch(&self, task: &Task) -> Result<TaskOutput, TaskFailure> {
        let request = request_for(task)?;
        let result = self
            .sandbox
            .run(&request)
            .await
            .map_err(|e| TaskFailure::task(e.to_string()))?;

        if result.timed_out {
            return Err(TaskFailure::task(format!(
                "sandbox killed the task after {}s",
                self.sandbox.config().timeout_secs
            ))
            .with_output(to_output(result)));
        }
        if result.exit_code != 0 {
            let stderr = result.stderr.trim().to_string();
            return Err(TaskFailure::task(format!(
                "exit code {}: {stderr}",
                result.exit_code
            ))
            .with_output(to_output(result)));
        }
        Ok(to_output(result))
    }
}

/// In-process worker transport: every worker runs tasks in the local sandbox.
///
/// Nonzero exits are returned as outputs; only sandbox setup errors count
/// as a failed worker.
pub struct SandboxWorkerExecutor {
    sandbox: Arc<SandboxRuntime>,
}

impl SandboxWorkerExecutor {
    pub fn new(sandbox: Arc<SandboxRuntime>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl WorkerExecutor for SandboxWorkerExecutor {
    async fn execute(&self, worker_id: &str, task: &Task) -> Result<TaskOutput, String> {
        let request = request_for(task).map_err(|f| f.message)?;
        debug!(worker_id, task_id = %task.id, "running task on local worker");
        self.sandbox
            .run(&request)
            .await
            .map(to_output)
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use orkestra_core::TaskType;
    use orkestra_sandbox::{SandboxConfig, SandboxMode};

    fn offline_sandbox() -> Arc<SandboxRuntime> {
        Arc::new(SandboxRuntime::new(SandboxConfig {
            runtime_binary: "/nonexistent/container-runtime".into(),
            ..SandboxConfig::default()
        }))
    }

    #[tokio::test]
    async fn test_missing_script_is_task_failure() {
        let d = SandboxDispatcher::new(offline_sandbox());
        let err = d.dispatch(&Task::new("a", TaskType::Code)).await.unwrap_err();
        assert!(err.message.contains("no 'script'"));
    }

    #[tokio::test]
    async fn test_dry_run_is_visible_in_output() {
        let d = SandboxDispatcher::new(offline_sandbox());
        let task = Task::new("a", TaskType::Code).with_script("cargo test");
        let out = d.dispatch(&task).await.unwrap();
        assert_eq!(out.mode, SandboxMode::DryRun);
        assert!(out.stdout.contains("cargo test"));
    }

    #[tokio::test]
    async fn test_worker_executor_reports_setup_errors() {
        let strict = Arc::new(SandboxRuntime::new(SandboxConfig {
            runtime_binary: "/nonexistent/container-runtime".into(),
            allow_dry_run: false,
            ..SandboxConfig::default()
        }));
        let exec = SandboxWorkerExecutor::new(strict);
        let task = Task::new("a", TaskType::Code).with_script("true");
        let err = exec.execute("w1", &task).await.unwrap_err();
        assert!(err.contains("dry runs are disabled"));
    }
}
