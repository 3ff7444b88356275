use crate::dag::FailureKind;
use crate::events::{ExecutionEvent, ExecutionObserver};
use async_trait::async_trait;
use orkestra_bus::{AgentMailbox, SignalBoard};
use orkestra_sandbox::SandboxMode;
use orkestra_security::{ForensicLogger, LedgerOutcome, LedgerRecord};
use serde_json::json;
use std::sync::Arc;
use serde_json::Value;
use tracing::warn;

/// Writes every execution event to the forensic ledger.
pub struct LedgerObserver {
    ledger: Arc<ForensicLogger>,
    agent_id: String,
}

impl LedgerObserver {
    pub fn new(ledger: Arc<ForensicLogger>, agent_id: impl Into<String>) -> Self {
        Self {
            ledger,
            agent_id: agent_id.into(),
        }
    }

    fn record_for(&self, event: &ExecutionEvent) -> LedgerRecord {
        let payload = serde_json::to_value(event).unwrap_or_default();
        let kernel = self.agent_id.as_str();
        let (agent, action, outcome, reasoning): (&str, &str, LedgerOutcome, String) = match event {
            ExecutionEvent::RunStarted { total_tasks, .. } => (
                kernel,
                "run_started",
                LedgerOutcome::Info,
                format!("executing graph of {total_tasks} tasks"),
            ),
            ExecutionEvent::TaskDispatched { agent, attempt, .. } => (
                agent.as_str(),
                "task_dispatched",
                LedgerOutcome::Info,
                format!("attempt {attempt}"),
            ),
            ExecutionEvent::TaskCompleted {
                mode: SandboxMode::DryRun,
                ..
            } => (
                kernel,
                "sandbox_dry_run",
                LedgerOutcome::DryRun,
                "container runtime unavailable; script was not executed".to_string(),
            ),
            ExecutionEvent::TaskCompleted { .. } => {
                (kernel, "task_completed", LedgerOutcome::Success, String::new())
            }
            ExecutionEvent::TaskRetrying { error, .. } => {
                (kernel, "task_retrying", LedgerOutcome::Retry, error.clone())
            }
            ExecutionEvent::TaskFailed {
                kind: FailureKind::Dispatch,
                error,
                ..
            } => (
                kernel,
                "dispatch_exhausted",
                LedgerOutcome::Failure,
                error.clone(),
            ),
            ExecutionEvent::TaskFailed {
                task_type,
                error,
                reason,
                ..
            } if task_type.is_human_gated() => (
                kernel,
                "escalated_to_human",
                LedgerOutcome::Escalated,
                format!("{error} ({reason})"),
            ),
            ExecutionEvent::TaskFailed { error, reason, .. } => (
                kernel,
                "task_failed",
                LedgerOutcome::Failure,
                format!("{error} ({reason})"),
            ),
            ExecutionEvent::TaskSkipped { reason, .. } => {
                (kernel, "task_skipped", LedgerOutcome::Skipped, reason.clone())
            }
            ExecutionEvent::CircuitOpened {
                consecutive_failures,
            } => (
                kernel,
                "circuit_opened",
                LedgerOutcome::Escalated,
                format!("{consecutive_failures} consecutive failures; manual reset required"),
            ),
            ExecutionEvent::RunTimedOut { elapsed_ms, .. } => (
                kernel,
                "run_timed_out",
                LedgerOutcome::Failure,
                format!("wall-clock budget exceeded after {elapsed_ms} ms"),
            ),
            ExecutionEvent::RunFinished { .. } => {
                (kernel, "run_finished", LedgerOutcome::Info, String::new())
            }
        };
        LedgerRecord::new(agent, action, outcome)
            .with_reasoning(reasoning)
            .with_payload(payload)
    }
}

#[async_trait]
impl ExecutionObserver for LedgerObserver {
    async fn on_event(&self, event: &ExecutionEvent) {
        self.ledger.record(self.record_for(event));
    }
}

/// Longest `error` text carried on the bus; the ledger keeps the full text.
const BUS_ERROR_CHARS: usize = 2_000;

fn shorten_error(payload: &mut Value) {
    if let Some(error) = payload.get_mut("error") {
        if let Some(text) = error.as_str() {
            if text.chars().count() > BUS_ERROR_CHARS {
                let short: String = text.chars().take(BUS_ERROR_CHARS).collect();
                *error = Value::String(format!("{short}...[truncated]"));
            }
        }
    }
}

/// Publishes execution events on the bus under `task.*` and `system.*`.
pub struct BusObserver {
    mailbox: Arc<AgentMailbox>,
    signals: Arc<SignalBoard>,
}

impl BusObserver {
    pub fn new(mailbox: Arc<AgentMailbox>, signals: Arc<SignalBoard>) -> Self {
        Self { mailbox, signals }
    }

    /// Name of the signal raised when the run `run_id` finishes.
    pub fn finished_signal(run_id: &str) -> String {
        format!("run:{run_id}:finished")
    }
}

#[async_trait]
impl ExecutionObserver for BusObserver {
    async fn on_event(&self, event: &ExecutionEvent) {
        let (topic, payload) = match event {
            ExecutionEvent::RunFinished { summary } => {
                self.signals.raise(&Self::finished_signal(&summary.run_id));
                // Counts only; the per-task list can exceed the size cap.
                (
                    "system.run_finished".to_string(),
                    json!({
                        "runId": summary.run_id,
                        "totalTasks": summary.total_tasks,
                        "completed": summary.completed,
                        "failed": summary.failed,
                        "skipped": summary.skipped,
                        "retries": summary.retries,
                        "circuitBroken": summary.circuit_broken,
                        "timedOut": summary.timed_out,
                    }),
                )
            }
            other => {
                let name = other.name();
                let topic = match name.strip_prefix("task_") {
                    Some(rest) => format!("task.{rest}"),
                    None => format!("system.{name}"),
                };
                let mut payload = serde_json::to_value(other).unwrap_or_default();
                shorten_error(&mut payload);
                (topic, payload)
            }
        };
        if let Err(e) = self.mailbox.send(&topic, payload) {
            warn!(topic = %topic, error = %e, "execution event not published");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use orkestra_bus::EventBus;
    use orkestra_core::{AgentRole, TaskType};

    #[tokio::test]
    async fn test_bus_observer_topics() {
        let bus = Arc::new(EventBus::with_defaults());
        let mailbox = Arc::new(AgentMailbox::new(
            Arc::clone(&bus),
            "kernel",
            AgentRole::Orchestrator,
        ));
        let observer = BusObserver::new(mailbox, Arc::new(SignalBoard::new()));

        observer
            .on_event(&ExecutionEvent::TaskSkipped {
                task_id: "a".into(),
                reason: "dependency 'b' is FAILED".into(),
            })
            .await;
        observer
            .on_event(&ExecutionEvent::CircuitOpened {
                consecutive_failures: 5,
            })
            .await;

        let skipped = bus.get_messages(Some("task.skipped"));
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].payload["task_id"], "a");
        assert_eq!(bus.get_messages(Some("system.circuit_opened")).len(), 1);
    }

    #[tokio::test]
    async fn test_long_failure_output_still_published() {
        let bus = Arc::new(EventBus::with_defaults());
        let mailbox = Arc::new(AgentMailbox::new(
            Arc::clone(&bus),
            "kernel",
            AgentRole::Orchestrator,
        ));
        let observer = BusObserver::new(mailbox, Arc::new(SignalBoard::new()));
        let stderr = "E".repeat(64 * 1024);

        observer
            .on_event(&ExecutionEvent::TaskFailed {
                task_id: "build".into(),
                task_type: TaskType::Code,
                kind: FailureKind::Task,
                attempts: 3,
                error: stderr.clone(),
                reason: "retry budget exhausted".into(),
            })
            .await;
        observer
            .on_event(&ExecutionEvent::TaskRetrying {
                task_id: "build".into(),
                task_type: TaskType::Code,
                next_attempt: 2,
                delay_ms: 1000,
                error: stderr,
            })
            .await;

        let failed = bus.get_messages(Some("task.failed"));
        assert_eq!(failed.len(), 1);
        let error = failed[0].payload["error"].as_str().unwrap();
        assert!(error.ends_with("...[truncated]"));
        assert!(error.len() < 10 * 1024);
        assert_eq!(bus.get_messages(Some("task.retrying")).len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_actions() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(ForensicLogger::new(
            dir.path().join("ledger.jsonl"),
            uuid::Uuid::new_v4(),
        ));
        let observer = LedgerObserver::new(ledger, "kernel");

        let dry = observer.record_for(&ExecutionEvent::TaskCompleted {
            task_id: "a".into(),
            task_type: TaskType::Code,
            attempt: 1,
            duration_ms: 0,
            mode: SandboxMode::DryRun,
        });
        assert_eq!(dry.action_type, "sandbox_dry_run");
        assert_eq!(dry.outcome, LedgerOutcome::DryRun);

        let exhausted = observer.record_for(&ExecutionEvent::TaskFailed {
            task_id: "a".into(),
            task_type: TaskType::Code,
            kind: FailureKind::Dispatch,
            attempts: 1,
            error: "no worker".into(),
            reason: "budget".into(),
        });
        assert_eq!(exhausted.action_type, "dispatch_exhausted");

        let gated = observer.record_for(&ExecutionEvent::TaskFailed {
            task_id: "r".into(),
            task_type: TaskType::Review,
            kind: FailureKind::Task,
            attempts: 1,
            error: "rejected".into(),
            reason: "budget".into(),
        });
        assert_eq!(gated.action_type, "escalated_to_human");
        assert_eq!(gated.outcome, LedgerOutcome::Escalated);

        let dispatched = observer.record_for(&ExecutionEvent::TaskDispatched {
            task_id: "a".into(),
            task_type: TaskType::Test,
            agent: AgentRole::Tester,
            attempt: 1,
        });
        assert_eq!(dispatched.agent_id, "tester");
    }
}
