//! Summary shapes consumed by dashboards and the CLI.

use crate::dispatcher::FailoverEvent;
use crate::graph::TaskGraph;
use crate::registry::WorkerNode;
use crate::retry::HealingStats;
use crate::task::TaskStatus;
use orkestra_core::{TaskId, TaskType};
use serde::{Deserialize, Serialize};

/// Final state of one task after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub retry_count: u32,
}

/// Outcome of one DAG execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub run_id: String,
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub retries: u32,
    pub duration_ms: u64,
    pub circuit_broken: bool,
    pub timed_out: bool,
    /// Task ids in completion order.
    pub execution_order: Vec<TaskId>,
    pub per_task_status: Vec<TaskReport>,
}

impl ExecutionSummary {
    /// Counts and per-task states read from the graph after the run.
    pub(crate) fn from_graph(run_id: String, graph: &TaskGraph) -> Self {
        Self {
            run_id,
            total_tasks: graph.len(),
            completed: graph.count(TaskStatus::Completed),
            failed: graph.count(TaskStatus::Failed),
            skipped: graph.count(TaskStatus::Skipped),
            per_task_status: graph
                .tasks()
                .iter()
                .map(|t| TaskReport {
                    id: t.id.clone(),
                    task_type: t.task_type,
                    status: t.status,
                    retry_count: t.retry_count,
                })
                .collect(),
            ..Self::default()
        }
    }

    /// True when every task completed.
    pub fn succeeded(&self) -> bool {
        self.completed == self.total_tasks && !self.circuit_broken && !self.timed_out
    }
}

/// Barrier and signal activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointStats {
    pub barriers_created: u64,
    pub barriers_released: u64,
    pub signals_raised: u64,
}

/// Worker, failover, healing and checkpoint state of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub workers: Vec<WorkerNode>,
    pub failovers: Vec<FailoverEvent>,
    pub healing: HealingStats,
    pub checkpoints: CheckpointStats,
}
