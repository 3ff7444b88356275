use chrono::{DateTime, Duration as ChronoDuration, Utc};
use orkestra_core::TaskType;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Liveness / load state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Idle,
    Busy,
    /// Finishing in-flight work, accepting nothing new.
    Draining,
    /// Missed too many heartbeats. A heartbeat revives it.
    Dead,
}

/// A worker as seen by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerNode {
    pub id: String,
    pub capabilities: Vec<TaskType>,
    pub max_concurrency: u32,
    pub active_tasks: u32,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerNode {
    pub fn can_run(&self, task_type: TaskType) -> bool {
        self.capabilities.contains(&task_type)
    }

    pub fn has_capacity(&self) -> bool {
        self.active_tasks < self.max_concurrency
    }

    pub fn accepts_work(&self) -> bool {
        !matches!(self.status, WorkerStatus::Dead | WorkerStatus::Draining)
    }

    /// `active / max`; a worker with no slots counts as full.
    pub fn load(&self) -> f64 {
        if self.max_concurrency == 0 {
            return 1.0;
        }
        f64::from(self.active_tasks) / f64::from(self.max_concurrency)
    }

    fn refresh_status(&mut self) {
        if matches!(self.status, WorkerStatus::Dead | WorkerStatus::Draining) {
            return;
        }
        self.status = if self.active_tasks == 0 {
            WorkerStatus::Idle
        } else {
            WorkerStatus::Busy
        };
    }
}

/// Heartbeat expectations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Expected heartbeat period in milliseconds (default: 5000).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Missed heartbeats before a worker is declared dead (default: 3).
    #[serde(default = "default_missed_threshold")]
    pub missed_threshold: u32,
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_missed_threshold() -> u32 {
    3
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            missed_threshold: default_missed_threshold(),
        }
    }
}

/// Tracks worker liveness and capacity.
///
/// All mutations take the write lock, so `task_started` / `task_completed`
/// are atomic per worker even with several dispatchers sharing the registry.
/// Workers are kept in registration order, which is the candidate order
/// load balancing sees.
pub struct WorkerRegistry {
    config: RegistryConfig,
    workers: RwLock<Vec<WorkerNode>>,
}

impl WorkerRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            workers: RwLock::new(Vec::new()),
        }
    }

    /// Register (or re-register, resetting load) a worker.
    pub fn register(
        &self,
        id: impl Into<String>,
        capabilities: impl IntoIterator<Item = TaskType>,
        max_concurrency: u32,
    ) -> WorkerNode {
        let node = WorkerNode {
            id: id.into(),
            capabilities: capabilities.into_iter().collect(),
            max_concurrency,
            active_tasks: 0,
            status: WorkerStatus::Idle,
            last_heartbeat: Utc::now(),
        };
        let mut workers = self.workers.write();
        match workers.iter().position(|w| w.id == node.id) {
            Some(i) => workers[i] = node.clone(),
            None => workers.push(node.clone()),
        }
        info!(worker_id = %node.id, max_concurrency, "worker registered");
        node
    }

    pub fn deregister(&self, id: &str) -> bool {
        let mut workers = self.workers.write();
        let before = workers.len();
        workers.retain(|w| w.id != id);
        let removed = workers.len() != before;
        if removed {
            info!(worker_id = %id, "worker deregistered");
        }
        removed
    }

    /// Refresh liveness. Revives a dead worker.
    pub fn heartbeat(&self, id: &str) -> bool {
        self.heartbeat_at(id, Utc::now())
    }

    pub fn heartbeat_at(&self, id: &str, now: DateTime<Utc>) -> bool {
        self.with_worker(id, |w| {
            w.last_heartbeat = now;
            if w.status == WorkerStatus::Dead {
                w.status = WorkerStatus::Idle;
                w.refresh_status();
                info!(worker_id = %w.id, "worker revived by heartbeat");
            }
        })
    }

    /// Mark silent workers dead. Returns ids that died in this check.
    pub fn check_heartbeats(&self) -> Vec<String> {
        self.check_heartbeats_at(Utc::now())
    }

    pub fn check_heartbeats_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let window_ms = self
            .config
            .heartbeat_interval_ms
            .saturating_mul(u64::from(self.config.missed_threshold));
        let window = ChronoDuration::milliseconds(i64::try_from(window_ms).unwrap_or(i64::MAX));

        let mut died = Vec::new();
        for w in self.workers.write().iter_mut() {
            if w.status != WorkerStatus::Dead && now - w.last_heartbeat > window {
                w.status = WorkerStatus::Dead;
                warn!(worker_id = %w.id, last_heartbeat = %w.last_heartbeat, "worker missed heartbeats, marked dead");
                died.push(w.id.clone());
            }
        }
        died
    }

    /// Declare a worker dead without waiting for missed heartbeats.
    pub fn mark_dead(&self, id: &str) -> bool {
        self.with_worker(id, |w| {
            w.status = WorkerStatus::Dead;
            warn!(worker_id = %w.id, "worker marked dead");
        })
    }

    /// Stop routing new work to a worker; in-flight tasks finish.
    pub fn drain(&self, id: &str) -> bool {
        self.with_worker(id, |w| {
            if w.status != WorkerStatus::Dead {
                w.status = WorkerStatus::Draining;
                info!(worker_id = %w.id, active_tasks = w.active_tasks, "worker draining");
            }
        })
    }

    /// Claim a slot. Refused when the worker is unknown, full, dead or draining.
    pub fn task_started(&self, id: &str) -> bool {
        let mut workers = self.workers.write();
        let Some(w) = workers.iter_mut().find(|w| w.id == id) else {
            return false;
        };
        if !w.accepts_work() || !w.has_capacity() {
            return false;
        }
        w.active_tasks += 1;
        w.refresh_status();
        true
    }

    /// Release a slot.
    pub fn task_completed(&self, id: &str) -> bool {
        self.with_worker(id, |w| {
            w.active_tasks = w.active_tasks.saturating_sub(1);
            w.refresh_status();
        })
    }

    /// Workers that can take a task of `task_type` right now, in registration order.
    pub fn capable_workers(&self, task_type: TaskType) -> Vec<WorkerNode> {
        self.workers
            .read()
            .iter()
            .filter(|w| w.can_run(task_type) && w.accepts_work() && w.has_capacity())
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<WorkerNode> {
        self.workers.read().iter().find(|w| w.id == id).cloned()
    }

    pub fn is_alive(&self, id: &str) -> bool {
        self.get(id)
            .map(|w| w.status != WorkerStatus::Dead)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<WorkerNode> {
        self.workers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    fn with_worker(&self, id: &str, f: impl FnOnce(&mut WorkerNode)) -> bool {
        match self.workers.write().iter_mut().find(|w| w.id == id) {
            Some(w) => {
                f(w);
                true
            }
            None => false,
        }
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(RegistryConfig {
            heartbeat_interval_ms: 1_000,
            missed_threshold: 3,
        })
    }

    #[test]
    fn test_status_follows_load() {
        let reg = registry();
        reg.register("w1", [TaskType::Code], 2);
        assert!(reg.task_started("w1"));
        assert_eq!(reg.get("w1").unwrap().status, WorkerStatus::Busy);
        assert!(reg.task_started("w1"));
        assert!(!reg.task_started("w1"), "capacity is a hard limit");
        assert_eq!(reg.get("w1").unwrap().active_tasks, 2);

        reg.task_completed("w1");
        reg.task_completed("w1");
        reg.task_completed("w1");
        let w = reg.get("w1").unwrap();
        assert_eq!(w.active_tasks, 0);
        assert_eq!(w.status, WorkerStatus::Idle);
    }

    #[test]
    fn test_missed_heartbeats_then_revival() {
        let reg = registry();
        let node = reg.register("w1", [TaskType::Code], 1);
        let t0 = node.last_heartbeat;

        assert!(reg.check_heartbeats_at(t0 + ChronoDuration::milliseconds(3_000)).is_empty());
        let died = reg.check_heartbeats_at(t0 + ChronoDuration::milliseconds(3_001));
        assert_eq!(died, vec!["w1".to_string()]);
        assert!(!reg.is_alive("w1"));
        assert!(reg.capable_workers(TaskType::Code).is_empty());
        assert!(!reg.task_started("w1"));

        // Already dead workers are not reported twice.
        assert!(reg.check_heartbeats_at(t0 + ChronoDuration::seconds(60)).is_empty());

        reg.heartbeat_at("w1", t0 + ChronoDuration::seconds(61));
        assert_eq!(reg.get("w1").unwrap().status, WorkerStatus::Idle);
        assert_eq!(reg.capable_workers(TaskType::Code).len(), 1);
    }

    #[test]
    fn test_revived_worker_with_load_is_busy() {
        let reg = registry();
        reg.register("w1", [TaskType::Code], 2);
        reg.task_started("w1");
        reg.mark_dead("w1");
        reg.heartbeat("w1");
        assert_eq!(reg.get("w1").unwrap().status, WorkerStatus::Busy);
    }

    #[test]
    fn test_drain_keeps_inflight_but_refuses_new() {
        let reg = registry();
        reg.register("w1", [TaskType::Test], 4);
        reg.task_started("w1");
        reg.drain("w1");
        assert!(!reg.task_started("w1"));
        assert!(reg.capable_workers(TaskType::Test).is_empty());
        reg.task_completed("w1");
        let w = reg.get("w1").unwrap();
        assert_eq!(w.status, WorkerStatus::Draining);
        assert_eq!(w.active_tasks, 0);
    }

    #[test]
    fn test_capable_workers_filters_and_keeps_order() {
        let reg = registry();
        reg.register("a", [TaskType::Code, TaskType::Test], 1);
        reg.register("b", [TaskType::Test], 1);
        reg.register("c", [TaskType::Code], 1);
        reg.task_started("c");

        let ids: Vec<String> = reg
            .capable_workers(TaskType::Code)
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(ids, vec!["a"]);
        let ids: Vec<String> = reg
            .capable_workers(TaskType::Test)
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_deregister_and_unknown_ids() {
        let reg = registry();
        reg.register("w1", [TaskType::Code], 1);
        assert!(reg.deregister("w1"));
        assert!(!reg.deregister("w1"));
        assert!(!reg.heartbeat("w1"));
        assert!(!reg.task_started("w1"));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_concurrent_claims_never_exceed_capacity() {
        let reg = std::sync::Arc::new(registry());
        reg.register("w1", [TaskType::Code], 5);
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let reg = std::sync::Arc::clone(&reg);
                std::thread::spawn(move || reg.task_started("w1"))
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 5);
        assert_eq!(reg.get("w1").unwrap().active_tasks, 5);
    }
}
