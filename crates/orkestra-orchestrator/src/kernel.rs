use crate::balancer::BalancingStrategy;
use crate::dag::{DagEngine, EngineConfig, TaskDispatcher};
use crate::dispatcher::{DispatcherConfig, DistributedDispatcher, WorkerExecutor};
use crate::events::{ExecutionObserver, ObserverChain};
use crate::graph::{TaskGraph, ValidationError};
use crate::observers::{BusObserver, LedgerObserver};
use crate::registry::{RegistryConfig, WorkerRegistry};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::sandboxed::{SandboxDispatcher, SandboxWorkerExecutor};
use crate::telemetry::{CheckpointStats, ClusterSummary, ExecutionSummary};
use orkestra_bus::{AgentMailbox, Barrier, BusConfig, EventBus, SignalBoard, TopicAcl};
use orkestra_core::{AgentRole, OrkestraError, OrkestraResult, TaskId, TaskType};
use orkestra_sandbox::{SandboxConfig, SandboxRuntime};
use orkestra_security::{
    verify_chain, ChainVerification, ForensicLogger, IntegrityAlarm, LedgerOutcome, LedgerRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Forensic ledger location and identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON-Lines ledger file (default: "orkestra-ledger.jsonl").
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,

    /// Agent id the kernel records its own actions under (default: "orchestrator").
    #[serde(default = "default_kernel_agent_id")]
    pub agent_id: String,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("orkestra-ledger.jsonl")
}

fn default_kernel_agent_id() -> String {
    "orchestrator".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            agent_id: default_kernel_agent_id(),
        }
    }
}

/// A worker declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    pub capabilities: Vec<TaskType>,
    #[serde(default = "default_worker_concurrency")]
    pub max_concurrency: u32,
}

fn default_worker_concurrency() -> u32 {
    1
}

/// Worker pool used by distributed runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,

    /// `round_robin`, `least_loaded` or `capability_match` (default: least_loaded).
    #[serde(default = "default_strategy")]
    pub strategy: String,

    #[serde(default)]
    pub failover: DispatcherConfig,

    #[serde(default)]
    pub heartbeat: RegistryConfig,
}

fn default_strategy() -> String {
    BalancingStrategy::default().as_str().to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            strategy: default_strategy(),
            failover: DispatcherConfig::default(),
            heartbeat: RegistryConfig::default(),
        }
    }
}

/// Everything the kernel needs. Every section has defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// Composition root: owns the policy, bus, ledger, sandbox and worker pool
/// of one session and wires them into every run.
///
/// Nothing here is global; several orchestrators can live side by side.
pub struct Orchestrator {
    config: OrchestratorConfig,
    session_id: Uuid,
    policy: Arc<RetryPolicy>,
    bus: Arc<EventBus>,
    mailbox: Arc<AgentMailbox>,
    barrier: Arc<Barrier>,
    signals: Arc<SignalBoard>,
    ledger: Arc<ForensicLogger>,
    sandbox: Arc<SandboxRuntime>,
    registry: Arc<WorkerRegistry>,
    distributed: Arc<DistributedDispatcher>,
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl Orchestrator {
    /// Build a session. Must be called inside a Tokio runtime (the ledger
    /// writer is spawned here).
    pub fn new(config: OrchestratorConfig) -> OrkestraResult<Self> {
        let strategy: BalancingStrategy = config
            .cluster
            .strategy
            .parse()
            .map_err(OrkestraError::Config)?;

        let session_id = Uuid::new_v4();
        let policy = Arc::new(RetryPolicy::new(config.retry.clone()));
        let bus = Arc::new(EventBus::new(config.bus.clone(), TopicAcl::default_table()));
        let mailbox = Arc::new(AgentMailbox::new(
            Arc::clone(&bus),
            config.ledger.agent_id.clone(),
            AgentRole::Orchestrator,
        ));
        let barrier = Arc::new(Barrier::new());
        let signals = Arc::new(SignalBoard::new());
        let ledger = Arc::new(ForensicLogger::new(config.ledger.path.clone(), session_id));
        let sandbox = Arc::new(SandboxRuntime::new(config.sandbox.clone()));

        let registry = Arc::new(WorkerRegistry::new(config.cluster.heartbeat.clone()));
        for spec in &config.cluster.workers {
            registry.register(
                spec.id.clone(),
                spec.capabilities.iter().copied(),
                spec.max_concurrency,
            );
        }
        let distributed = Arc::new(DistributedDispatcher::new(
            Arc::clone(&registry),
            strategy,
            Arc::new(SandboxWorkerExecutor::new(Arc::clone(&sandbox))),
            config.cluster.failover.clone(),
        ));

        let kernel = Self {
            config,
            session_id,
            policy,
            bus,
            mailbox,
            barrier,
            signals,
            ledger,
            sandbox,
            registry,
            distributed,
            observers: Vec::new(),
        };
        kernel.listen_for_checkpoints()?;

        info!(session_id = %session_id, ledger = %kernel.ledger.path().display(), "orchestrator session started");
        kernel.ledger.record(
            LedgerRecord::new(kernel.agent_id(), "session_started", LedgerOutcome::Info)
                .with_payload(json!({
                    "workers": kernel.registry.len(),
                    "strategy": strategy.as_str(),
                })),
        );
        Ok(kernel)
    }

    /// Replace the transport used by distributed runs.
    pub fn with_worker_executor(mut self, executor: Arc<dyn WorkerExecutor>) -> Self {
        let strategy = self
            .config
            .cluster
            .strategy
            .parse()
            .unwrap_or_default();
        self.distributed = Arc::new(DistributedDispatcher::new(
            Arc::clone(&self.registry),
            strategy,
            executor,
            self.config.cluster.failover.clone(),
        ));
        self
    }

    /// Attach an extra observer to every subsequent run.
    pub fn add_observer(&mut self, observer: Arc<dyn ExecutionObserver>) {
        self.observers.push(observer);
    }

    pub fn validate(&self, graph: &TaskGraph) -> Result<Vec<TaskId>, ValidationError> {
        graph.validate()
    }

    /// Run `graph` with every task executed in the local sandbox.
    pub async fn run(&self, graph: &mut TaskGraph) -> OrkestraResult<ExecutionSummary> {
        let dispatcher = Arc::new(SandboxDispatcher::new(Arc::clone(&self.sandbox)));
        self.run_with(graph, dispatcher).await
    }

    /// Run `graph` across the worker pool with failover.
    pub async fn run_distributed(&self, graph: &mut TaskGraph) -> OrkestraResult<ExecutionSummary> {
        if self.registry.is_empty() {
            return Err(OrkestraError::Orchestrator(
                "distributed run requested but no workers are registered".into(),
            ));
        }
        let dispatcher: Arc<dyn TaskDispatcher> = self.distributed.clone();
        self.run_with(graph, dispatcher).await
    }

    /// Run `graph` through a caller-supplied dispatcher.
    pub async fn run_with(
        &self,
        graph: &mut TaskGraph,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> OrkestraResult<ExecutionSummary> {
        if let Err(e) = graph.validate() {
            self.ledger.record(
                LedgerRecord::new(self.agent_id(), "graph_rejected", LedgerOutcome::Denied)
                    .with_reasoning(e.to_string()),
            );
            self.ledger.flush().await;
            return Err(e.into());
        }

        let mut chain = ObserverChain::new()
            .with(Arc::new(LedgerObserver::new(
                Arc::clone(&self.ledger),
                self.agent_id(),
            )))
            .with(Arc::new(BusObserver::new(
                Arc::clone(&self.mailbox),
                Arc::clone(&self.signals),
            )));
        for observer in &self.observers {
            chain.add(Arc::clone(observer));
        }

        let engine = DagEngine::new(self.config.engine.clone(), Arc::clone(&self.policy))
            .with_observers(chain);
        let summary = engine.execute(graph, dispatcher).await;
        self.ledger.flush().await;
        summary
    }

    /// Close the circuit breaker. Recorded in the ledger under `operator`.
    pub async fn reset_circuit_breaker(&self, operator: &str) {
        let before = self.policy.stats();
        self.policy.reset_circuit_breaker();
        self.ledger.record(
            LedgerRecord::new(operator, "circuit_reset", LedgerOutcome::Info).with_payload(json!({
                "wasOpen": before.circuit_open,
                "consecutiveFailures": before.consecutive_failures,
            })),
        );
        self.ledger.flush().await;
        let _ = self.mailbox.send("system.circuit_reset", json!({ "operator": operator }));
    }

    /// Replay the ledger. A broken chain is returned as an [`IntegrityAlarm`],
    /// separate from I/O errors.
    pub async fn verify_ledger(
        &self,
    ) -> OrkestraResult<Result<ChainVerification, IntegrityAlarm>> {
        self.ledger.flush().await;
        let verification = verify_chain(self.ledger.path()).await?;
        match verification.alarm(self.ledger.path()) {
            Some(alarm) => {
                error!(alarm = %alarm, "forensic ledger integrity alarm");
                Ok(Err(alarm))
            }
            None => Ok(Ok(verification)),
        }
    }

    /// Mark workers that stopped heartbeating as dead and record them.
    pub fn check_workers(&self) -> Vec<String> {
        let died = self.registry.check_heartbeats();
        for worker_id in &died {
            self.ledger.record(
                LedgerRecord::new(self.agent_id(), "worker_lost", LedgerOutcome::Failure)
                    .with_payload(json!({ "workerId": worker_id })),
            );
        }
        died
    }

    pub fn cluster_summary(&self) -> ClusterSummary {
        let barriers = self.barrier.stats();
        ClusterSummary {
            workers: self.registry.snapshot(),
            failovers: self.distributed.failovers(),
            healing: self.policy.stats(),
            checkpoints: CheckpointStats {
                barriers_created: barriers.created,
                barriers_released: barriers.released,
                signals_raised: self.signals.raised_count() as u64,
            },
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn policy(&self) -> &Arc<RetryPolicy> {
        &self.policy
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn barrier(&self) -> &Arc<Barrier> {
        &self.barrier
    }

    pub fn signals(&self) -> &Arc<SignalBoard> {
        &self.signals
    }

    pub fn ledger(&self) -> &Arc<ForensicLogger> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn sandbox(&self) -> &Arc<SandboxRuntime> {
        &self.sandbox
    }

    /// A mailbox on this session's bus.
    pub fn mailbox_for(&self, agent_id: impl Into<String>, role: AgentRole) -> AgentMailbox {
        AgentMailbox::new(Arc::clone(&self.bus), agent_id, role)
    }

    fn agent_id(&self) -> &str {
        &self.config.ledger.agent_id
    }

    /// Agents coordinate over the bus:
    /// `coord.barrier {"barrier", "count"}` creates a barrier and
    /// `coord.arrive {"barrier"}` records the sender, raising the signal
    /// `barrier:<id>` on release.
    fn listen_for_checkpoints(&self) -> OrkestraResult<()> {
        let barrier = Arc::clone(&self.barrier);
        self.mailbox
            .on("coord.barrier", move |msg| {
                let id = msg.payload["barrier"].as_str();
                let count = msg.payload["count"].as_u64();
                match (id, count) {
                    (Some(id), Some(count)) => {
                        if let Err(e) = barrier.create(id, count as usize) {
                            warn!(sender = %msg.sender, error = %e, "barrier not created");
                        }
                    }
                    _ => warn!(sender = %msg.sender, "malformed coord.barrier message"),
                }
            })
            .map_err(|e| OrkestraError::Bus(e.to_string()))?;

        let barrier = Arc::clone(&self.barrier);
        let signals = Arc::clone(&self.signals);
        self.mailbox
            .on("coord.arrive", move |msg| {
                let Some(id) = msg.payload["barrier"].as_str() else {
                    warn!(sender = %msg.sender, "malformed coord.arrive message");
                    return;
                };
                match barrier.arrive(id, &msg.sender) {
                    Ok(true) => {
                        info!(barrier = id, "barrier released");
                        signals.raise(&format!("barrier:{id}"));
                    }
                    Ok(false) => {}
                    Err(e) => warn!(sender = %msg.sender, error = %e, "barrier arrival rejected"),
                }
            })
            .map_err(|e| OrkestraError::Bus(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> OrchestratorConfig {
        OrchestratorConfig {
            ledger: LedgerConfig {
                path: dir.join("ledger.jsonl"),
                ..LedgerConfig::default()
            },
            ..OrchestratorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_rejects_unknown_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.cluster.strategy = "random".into();
        let err = Orchestrator::new(cfg).err().unwrap();
        assert!(matches!(err, OrkestraError::Config(_)));
    }

    #[tokio::test]
    async fn test_distributed_run_needs_workers() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Orchestrator::new(config(dir.path())).unwrap();
        let mut graph = TaskGraph::new();
        let err = kernel.run_distributed(&mut graph).await.unwrap_err();
        assert!(matches!(err, OrkestraError::Orchestrator(_)));
    }

    #[tokio::test]
    async fn test_barrier_protocol_over_bus() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Orchestrator::new(config(dir.path())).unwrap();
        let planner = kernel.mailbox_for("planner-1", AgentRole::Planner);
        let coder = kernel.mailbox_for("coder-1", AgentRole::Coder);

        planner
            .send("coord.barrier", json!({"barrier": "design", "count": 2}))
            .unwrap();
        planner.send("coord.arrive", json!({"barrier": "design"})).unwrap();
        planner.send("coord.arrive", json!({"barrier": "design"})).unwrap();
        assert_eq!(kernel.barrier().is_released("design"), Some(false));
        coder.send("coord.arrive", json!({"barrier": "design"})).unwrap();

        assert_eq!(kernel.barrier().is_released("design"), Some(true));
        assert!(kernel.signals().flag("barrier:design").is_raised());
        let checkpoints = kernel.cluster_summary().checkpoints;
        assert_eq!(checkpoints.barriers_created, 1);
        assert_eq!(checkpoints.barriers_released, 1);
        assert_eq!(checkpoints.signals_raised, 1);
    }

    #[test]
    fn test_config_sections_default() {
        let cfg: OrchestratorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.engine.max_concurrency, 4);
        assert_eq!(cfg.retry.circuit_threshold, 5);
        assert_eq!(cfg.cluster.strategy, "least_loaded");
        assert_eq!(cfg.ledger.agent_id, "orchestrator");
    }
}
