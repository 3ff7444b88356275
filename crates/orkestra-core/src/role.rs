use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of work a task performs. Drives retry budgets and worker capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskType {
    /// Decompose a goal into a task graph.
    Plan,
    /// Produce or modify code.
    Code,
    /// Security / compliance audit.
    Audit,
    /// Write or run tests.
    Test,
    /// Human-gated review.
    Review,
    /// Human-gated deployment.
    Deploy,
    /// Gather information.
    Research,
    /// Write documentation.
    Document,
}

impl TaskType {
    /// Every task type, in declaration order.
    pub const ALL: [TaskType; 8] = [
        TaskType::Plan,
        TaskType::Code,
        TaskType::Audit,
        TaskType::Test,
        TaskType::Review,
        TaskType::Deploy,
        TaskType::Research,
        TaskType::Document,
    ];

    /// Task types that require a human in the loop and are never retried by default.
    pub fn is_human_gated(self) -> bool {
        matches!(self, TaskType::Review | TaskType::Deploy)
    }

    /// Lowercase name, used in topics and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Plan => "plan",
            TaskType::Code => "code",
            TaskType::Audit => "audit",
            TaskType::Test => "test",
            TaskType::Review => "review",
            TaskType::Deploy => "deploy",
            TaskType::Research => "research",
            TaskType::Document => "document",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == lower)
            .ok_or_else(|| format!("unknown task type '{s}'"))
    }
}

/// Role of an agent in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Owns the run; the only role allowed to announce task lifecycle.
    Orchestrator,
    /// Decomposes goals into plans.
    Planner,
    /// Writes code.
    Coder,
    /// Audits output for security and compliance.
    Auditor,
    /// Writes and runs tests.
    Tester,
    /// Reviews work, may escalate to humans.
    Reviewer,
    /// Ships releases.
    Deployer,
    /// Read-only consumer (dashboards, humans).
    Observer,
}

impl AgentRole {
    /// Every role, in declaration order.
    pub const ALL: [AgentRole; 8] = [
        AgentRole::Orchestrator,
        AgentRole::Planner,
        AgentRole::Coder,
        AgentRole::Auditor,
        AgentRole::Tester,
        AgentRole::Reviewer,
        AgentRole::Deployer,
        AgentRole::Observer,
    ];

    /// The role that conventionally owns tasks of the given type.
    pub fn for_task_type(task_type: TaskType) -> Self {
        match task_type {
            TaskType::Plan | TaskType::Research => AgentRole::Planner,
            TaskType::Code | TaskType::Document => AgentRole::Coder,
            TaskType::Audit => AgentRole::Auditor,
            TaskType::Test => AgentRole::Tester,
            TaskType::Review => AgentRole::Reviewer,
            TaskType::Deploy => AgentRole::Deployer,
        }
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Orchestrator => "orchestrator",
            AgentRole::Planner => "planner",
            AgentRole::Coder => "coder",
            AgentRole::Auditor => "auditor",
            AgentRole::Tester => "tester",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Deployer => "deployer",
            AgentRole::Observer => "observer",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        AgentRole::ALL
            .into_iter()
            .find(|r| r.as_str() == lower)
            .ok_or_else(|| format!("unknown agent role '{s}'"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_serializes_uppercase() {
        let json = serde_json::to_string(&TaskType::Code).unwrap();
        assert_eq!(json, "\"CODE\"");
        let parsed: TaskType = serde_json::from_str("\"DEPLOY\"").unwrap();
        assert_eq!(parsed, TaskType::Deploy);
    }

    #[test]
    fn test_task_type_from_str_case_insensitive() {
        assert_eq!("test".parse::<TaskType>().unwrap(), TaskType::Test);
        assert_eq!("AUDIT".parse::<TaskType>().unwrap(), TaskType::Audit);
        assert!("compile".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_human_gated() {
        assert!(TaskType::Review.is_human_gated());
        assert!(TaskType::Deploy.is_human_gated());
        assert!(!TaskType::Code.is_human_gated());
    }

    #[test]
    fn test_agent_role_display() {
        assert_eq!(AgentRole::Orchestrator.to_string(), "orchestrator");
        assert_eq!(AgentRole::Coder.to_string(), "coder");
        assert_eq!("Reviewer".parse::<AgentRole>().unwrap(), AgentRole::Reviewer);
    }

    #[test]
    fn test_role_for_task_type() {
        assert_eq!(AgentRole::for_task_type(TaskType::Plan), AgentRole::Planner);
        assert_eq!(AgentRole::for_task_type(TaskType::Deploy), AgentRole::Deployer);
    }
}
