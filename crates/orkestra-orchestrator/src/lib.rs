//! DAG task orchestration for Orkestra.
//!
//! Validates a task graph, dispatches ready tasks with bounded parallelism,
//! retries failures with budgeted backoff behind a circuit breaker, and
//! records every decision in the forensic ledger.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Composition root owning the bus, ledger, sandbox and worker pool.
//! - [`DagEngine`]: The scheduling loop over a [`TaskGraph`].
//! - [`RetryPolicy`]: Per-type retry budgets, backoff and the circuit breaker.
//! - [`DistributedDispatcher`]: Worker selection with timeout and failover.
//! - [`ExecutionSummary`]: Final counts and per-task status of a run.

/// Load balancing strategies.
pub mod balancer;
/// The scheduling loop.
pub mod dag;
/// Distributed dispatch with failover.
pub mod dispatcher;
/// Execution events and observers.
pub mod events;
/// Task graph and validation.
pub mod graph;
/// Orchestrator kernel and configuration.
pub mod kernel;
/// Ledger and bus observers.
pub mod observers;
/// Worker registry and heartbeats.
pub mod registry;
/// Retry policy and circuit breaker.
pub mod retry;
/// Sandbox-backed dispatchers.
pub mod sandboxed;
/// Tasks and their lifecycle.
pub mod task;
/// Run summaries.
pub mod telemetry;

pub use balancer::{BalancingStrategy, LoadBalancer};
pub use dag::{
    DagEngine, EngineConfig, FailureKind, TaskDispatcher, TaskFailure, TaskOutput,
};
pub use dispatcher::{
    DispatcherConfig, DistributedDispatcher, DistributedResponse, FailoverEvent, WorkerExecutor,
};
pub use events::{EventRecorder, ExecutionEvent, ExecutionObserver, ObserverChain};
pub use graph::{GraphDocument, TaskGraph, ValidationError};
pub use kernel::{ClusterConfig, LedgerConfig, Orchestrator, OrchestratorConfig, WorkerSpec};
pub use observers::{BusObserver, LedgerObserver};
pub use registry::{RegistryConfig, WorkerNode, WorkerRegistry, WorkerStatus};
pub use retry::{HealingStats, RetryConfig, RetryDecision, RetryPolicy};
pub use sandboxed::{SandboxDispatcher, SandboxWorkerExecutor, SCRIPT_FIELD};
pub use task::{Payload, Task, TaskStatus, TransitionError};
pub use telemetry::{CheckpointStats, ClusterSummary, ExecutionSummary, TaskReport};
