use crate::task::{Task, TaskStatus};
use orkestra_core::{OrkestraError, OrkestraResult, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;

/// Why a graph was refused before execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("task '{task}' depends on unknown task '{missing}'")]
    MissingDependency { task: TaskId, missing: TaskId },

    #[error("dependency cycle among tasks: {}", .tasks.join(", "))]
    Cycle { tasks: Vec<TaskId> },

    #[error("duplicate task id '{0}'")]
    DuplicateTask(TaskId),

    /// Graphs must start fresh: every task PENDING with no retries spent.
    #[error("task '{task}' is {status} with retry count {retry_count}; graphs must start PENDING")]
    NotFresh {
        task: TaskId,
        status: TaskStatus,
        retry_count: u32,
    },
}

impl From<ValidationError> for OrkestraError {
    fn from(err: ValidationError) -> Self {
        OrkestraError::Validation(err.to_string())
    }
}

/// On-disk shape of a task graph: `{"tasks": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDocument {
    pub tasks: Vec<Task>,
}

/// Tasks of one run, in insertion order.
///
/// Acyclicity is not enforced when building the graph; [`TaskGraph::validate`]
/// checks it and the engine always runs it before executing.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list of tasks, refusing duplicate ids.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Result<Self, ValidationError> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add(task)?;
        }
        Ok(graph)
    }

    pub fn from_json(json: &str) -> OrkestraResult<Self> {
        let doc: GraphDocument = serde_json::from_str(json)?;
        Ok(Self::from_tasks(doc.tasks)?)
    }

    pub async fn load(path: &Path) -> OrkestraResult<Self> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            OrkestraError::Validation(format!("cannot read graph {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn add(&mut self, task: Task) -> Result<(), ValidationError> {
        if self.index.contains_key(&task.id) {
            return Err(ValidationError::DuplicateTask(task.id));
        }
        self.index.insert(task.id.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        match self.index.get(id) {
            Some(&i) => self.tasks.get_mut(i),
            None => None,
        }
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.get(id).map(|t| t.status)
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn to_document(&self) -> GraphDocument {
        GraphDocument {
            tasks: self.tasks.clone(),
        }
    }

    /// Check task state, dependencies and acyclicity. Returns a topological
    /// order (ties broken by insertion order).
    pub fn validate(&self) -> Result<Vec<TaskId>, ValidationError> {
        if let Some(task) = self
            .tasks
            .iter()
            .find(|t| t.status != TaskStatus::Pending || t.retry_count != 0)
        {
            return Err(ValidationError::NotFresh {
                task: task.id.clone(),
                status: task.status,
                retry_count: task.retry_count,
            });
        }

        for task in &self.tasks {
            if let Some(missing) = task
                .dependencies
                .iter()
                .find(|dep| !self.index.contains_key(dep.as_str()))
            {
                return Err(ValidationError::MissingDependency {
                    task: task.id.clone(),
                    missing: missing.clone(),
                });
            }
        }

        // Kahn's algorithm.
        let mut in_degree: Vec<usize> = self.tasks.iter().map(|t| t.dependencies.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.dependencies {
                if let Some(&d) = self.index.get(dep) {
                    dependents[d].push(i);
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..self.tasks.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() < self.tasks.len() {
            let tasks = self
                .tasks
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, t)| t.id.clone())
                .collect();
            return Err(ValidationError::Cycle { tasks });
        }

        Ok(order.into_iter().map(|i| self.tasks[i].id.clone()).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use orkestra_core::TaskType;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, TaskType::Code).depends_on(deps.iter().copied())
    }

    #[test]
    fn test_two_node_cycle_reports_both() {
        let graph = TaskGraph::from_tasks([task("A", &["B"]), task("B", &["A"])]).unwrap();
        match graph.validate().unwrap_err() {
            ValidationError::Cycle { tasks } => {
                assert_eq!(tasks, vec!["A".to_string(), "B".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_remainder_excludes_sortable_tasks() {
        let graph = TaskGraph::from_tasks([
            task("root", &[]),
            task("x", &["root", "z"]),
            task("y", &["x"]),
            task("z", &["y"]),
        ])
        .unwrap();
        let err = graph.validate().unwrap_err();
        assert_eq!(
            err,
            ValidationError::Cycle {
                tasks: vec!["x".into(), "y".into(), "z".into()]
            }
        );
    }

    #[test]
    fn test_missing_dependency_named() {
        let graph = TaskGraph::from_tasks([task("A", &[]), task("B", &["ghost"])]).unwrap();
        let err = graph.validate().unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingDependency {
                task: "B".into(),
                missing: "ghost".into()
            }
        );
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        // Inserted out of order on purpose.
        let graph =
            TaskGraph::from_tasks([task("C", &["B"]), task("B", &["A"]), task("A", &[])]).unwrap();
        assert_eq!(graph.validate().unwrap(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = TaskGraph::from_tasks([task("A", &[]), task("A", &[])]).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateTask("A".into()));
    }

    #[test]
    fn test_from_json_document() {
        let graph = TaskGraph::from_json(
            r#"{"tasks":[{"id":"p","type":"PLAN"},{"id":"c","type":"CODE","dependencies":["p"]}]}"#,
        )
        .unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.tasks()[1].dependencies, vec!["p".to_string()]);
        assert_eq!(graph.status_of("p"), Some(TaskStatus::Pending));
    }

    #[test]
    fn test_preset_status_refused() {
        let graph = TaskGraph::from_json(
            r#"{"tasks":[
                {"id":"A","type":"CODE"},
                {"id":"B","type":"CODE","dependencies":["A"],"status":"READY"},
                {"id":"C","type":"CODE","dependencies":["A"],"status":"COMPLETED"}
            ]}"#,
        )
        .unwrap();
        match graph.validate().unwrap_err() {
            ValidationError::NotFresh { task, status, .. } => {
                assert_eq!(task, "B");
                assert_eq!(status, TaskStatus::Ready);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_spent_retries_refused() {
        let mut task = Task::new("A", TaskType::Code);
        task.retry_count = 1;
        let graph = TaskGraph::from_tasks(vec![task]).unwrap();
        assert!(matches!(
            graph.validate(),
            Err(ValidationError::NotFresh { retry_count: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_load_demo_pipeline() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../demos/feature-pipeline.json");
        let graph = TaskGraph::load(&path).await.unwrap();
        let order = graph.validate().unwrap();
        assert_eq!(order.first().map(String::as_str), Some("plan"));
        assert_eq!(order.last().map(String::as_str), Some("review"));
        assert_eq!(graph.get("code").unwrap().max_retries, Some(2));
    }

    #[test]
    fn test_validation_error_converts_to_workspace_error() {
        let err: OrkestraError = ValidationError::DuplicateTask("A".into()).into();
        assert!(matches!(err, OrkestraError::Validation(_)));
    }
}
