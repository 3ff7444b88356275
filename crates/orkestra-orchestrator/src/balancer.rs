use crate::registry::WorkerNode;
use orkestra_core::TaskType;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How a worker is picked among candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalancingStrategy {
    /// Rotate through candidates.
    RoundRobin,
    /// Lowest `active / max`; ties go to the earliest candidate.
    #[default]
    LeastLoaded,
    /// Drop candidates lacking the capability, then least-loaded.
    CapabilityMatch,
}

impl BalancingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            BalancingStrategy::RoundRobin => "round_robin",
            BalancingStrategy::LeastLoaded => "least_loaded",
            BalancingStrategy::CapabilityMatch => "capability_match",
        }
    }
}

impl std::fmt::Display for BalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BalancingStrategy {
    type Err = String;

    /// Accepts `round_robin`, `ROUND_ROBIN`, `round-robin` and so on.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(BalancingStrategy::RoundRobin),
            "least_loaded" => Ok(BalancingStrategy::LeastLoaded),
            "capability_match" => Ok(BalancingStrategy::CapabilityMatch),
            other => Err(format!("unknown balancing strategy '{other}'")),
        }
    }
}

/// Picks a worker for a task. Only looks at the candidates it is handed.
pub struct LoadBalancer {
    strategy: BalancingStrategy,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: BalancingStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> BalancingStrategy {
        self.strategy
    }

    pub fn select<'a>(
        &self,
        candidates: &'a [WorkerNode],
        task_type: TaskType,
    ) -> Option<&'a WorkerNode> {
        if candidates.is_empty() {
            return None;
        }
        match self.strategy {
            BalancingStrategy::RoundRobin => {
                let i = self.cursor.fetch_add(1, Ordering::Relaxed);
                candidates.get(i % candidates.len())
            }
            BalancingStrategy::LeastLoaded => least_loaded(candidates.iter()),
            BalancingStrategy::CapabilityMatch => {
                least_loaded(candidates.iter().filter(|w| w.can_run(task_type)))
            }
        }
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(BalancingStrategy::default())
    }
}

fn least_loaded<'a>(workers: impl Iterator<Item = &'a WorkerNode>) -> Option<&'a WorkerNode> {
    let mut best: Option<&WorkerNode> = None;
    for w in workers {
        // Strict comparison keeps the first of equally loaded workers.
        if best.map_or(true, |b| w.load() < b.load()) {
            best = Some(w);
        }
    }
    best
}
