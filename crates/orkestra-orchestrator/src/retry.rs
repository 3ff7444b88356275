use crate::task::{Payload, Task};
use orkestra_core::TaskType;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

/// Retry and circuit-breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First backoff delay in milliseconds (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Upper bound of the random jitter added to each delay (default: 250).
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// Consecutive failures, across all tasks, that open the breaker (default: 5).
    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: u32,

    /// Longest error text carried into retry feedback (default: 2000 chars).
    #[serde(default = "default_max_error_chars")]
    pub max_error_chars: usize,

    /// Per task type retry budget overrides.
    #[serde(default)]
    pub budgets: HashMap<TaskType, u32>,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    250
}

fn default_circuit_threshold() -> u32 {
    5
}

fn default_max_error_chars() -> usize {
    2_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            circuit_threshold: default_circuit_threshold(),
            max_error_chars: default_max_error_chars(),
            budgets: HashMap::new(),
        }
    }
}

/// Built-in retry budget of a task type. Human-gated types never retry.
pub fn default_budget(task_type: TaskType) -> u32 {
    match task_type {
        TaskType::Plan => 0,
        TaskType::Code => 2,
        TaskType::Audit => 1,
        TaskType::Test => 1,
        TaskType::Review => 0,
        TaskType::Deploy => 0,
        TaskType::Research => 1,
        TaskType::Document => 1,
    }
}

/// Outcome of [`RetryPolicy::evaluate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub reason: String,
    /// Backoff before the next attempt; zero when not retrying.
    pub delay_ms: u64,
    /// Attempt number the retry would be (initial run is attempt 1).
    pub next_attempt: u32,
    /// Payload for the next attempt, present only when retrying.
    pub feedback_payload: Option<Payload>,
}

/// Snapshot of breaker state, for telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingStats {
    pub consecutive_failures: u32,
    pub circuit_open: bool,
    pub total_retries: u64,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open: bool,
    total_retries: u64,
}

/// Decides whether failed tasks are retried, with a global circuit breaker.
///
/// The failure counter is shared by every task: any success resets it, and
/// reaching the threshold opens the breaker until
/// [`RetryPolicy::reset_circuit_breaker`] is called.
pub struct RetryPolicy {
    config: RetryConfig,
    state: Mutex<BreakerState>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retry budget for a task: its own override, then config, then built-in.
    pub fn budget_for(&self, task: &Task) -> u32 {
        task.max_retries.unwrap_or_else(|| {
            self.config
                .budgets
                .get(&task.task_type)
                .copied()
                .unwrap_or_else(|| default_budget(task.task_type))
        })
    }

    /// Record a failure of `task` and decide whether to retry it.
    pub fn evaluate(&self, task: &Task, error: &str) -> RetryDecision {
        let next_attempt = task.retry_count + 2;

        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if !state.open && state.consecutive_failures >= self.config.circuit_threshold {
            state.open = true;
            warn!(
                task_id = %task.id,
                consecutive_failures = state.consecutive_failures,
                threshold = self.config.circuit_threshold,
                "circuit breaker opened"
            );
        }
        if state.open {
            return RetryDecision {
                should_retry: false,
                reason: format!(
                    "circuit breaker open after {} consecutive failures; manual reset required",
                    state.consecutive_failures
                ),
                delay_ms: 0,
                next_attempt,
                feedback_payload: None,
            };
        }

        let budget = self.budget_for(task);
        if task.retry_count >= budget {
            return RetryDecision {
                should_retry: false,
                reason: format!(
                    "retry budget exhausted ({} of {budget} retries used for {})",
                    task.retry_count, task.task_type
                ),
                delay_ms: 0,
                next_attempt,
                feedback_payload: None,
            };
        }
        state.total_retries += 1;
        drop(state);

        let delay_ms = self.backoff_ms(task.retry_count + 1);
        RetryDecision {
            should_retry: true,
            reason: format!("retry {} of {budget}", task.retry_count + 1),
            delay_ms,
            next_attempt,
            feedback_payload: Some(self.feedback_payload(task, error)),
        }
    }

    /// A success anywhere resets the shared failure counter.
    pub fn record_success(&self) {
        self.state.lock().consecutive_failures = 0;
    }

    pub fn reset_circuit_breaker(&self) {
        let mut state = self.state.lock();
        state.open = false;
        state.consecutive_failures = 0;
        info!("circuit breaker reset");
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn stats(&self) -> HealingStats {
        let state = self.state.lock();
        HealingStats {
            consecutive_failures: state.consecutive_failures,
            circuit_open: state.open,
            total_retries: state.total_retries,
        }
    }

    /// `min(base * 2^(attempt-1) + jitter, max)` for the `attempt`-th retry.
    fn backoff_ms(&self, attempt: u32) -> u64 {
        let exp = self
            .config
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let jitter = if self.config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.jitter_ms)
        } else {
            0
        };
        exp.saturating_add(jitter).min(self.config.max_delay_ms)
    }

    fn feedback_payload(&self, task: &Task, error: &str) -> Payload {
        let attempt = task.retry_count + 1;
        let mut payload = task.payload.clone();
        payload.insert(
            "previous_error".to_string(),
            Value::String(truncate_chars(error, self.config.max_error_chars)),
        );
        payload.insert("retry_attempt".to_string(), Value::from(attempt));
        payload.insert(
            "retry_instruction".to_string(),
            Value::String(format!(
                "Attempt {attempt} failed with the error in previous_error. \
                 Address that error before anything else and do not repeat the same approach."
            )),
        );
        payload
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...[truncated]", &s[..cut]),
        None => s.to_string(),
    }
}
