use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Errors from barrier and signal operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinationError {
    #[error("barrier '{0}' does not exist")]
    UnknownBarrier(String),

    #[error("barrier '{0}' already exists")]
    BarrierExists(String),

    #[error("barrier '{0}' needs at least one participant")]
    InvalidCount(String),
}

struct BarrierState {
    expected: usize,
    arrived: HashSet<String>,
    released: watch::Sender<bool>,
}

/// Counters for checkpoint telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarrierStats {
    pub created: u64,
    pub released: u64,
    pub pending: usize,
}

/// N-of-N rendezvous points, keyed by id.
///
/// `arrive` returns `true` exactly once per barrier: for the Nth distinct
/// participant. Repeat arrivals by the same participant are ignored.
#[derive(Default)]
pub struct Barrier {
    barriers: Mutex<HashMap<String, BarrierState>>,
    stats: Mutex<BarrierStats>,
}

impl Barrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, id: impl Into<String>, count: usize) -> Result<(), CoordinationError> {
        let id = id.into();
        if count == 0 {
            return Err(CoordinationError::InvalidCount(id));
        }
        let mut barriers = self.barriers.lock();
        if barriers.contains_key(&id) {
            return Err(CoordinationError::BarrierExists(id));
        }
        let (released, _) = watch::channel(false);
        barriers.insert(
            id,
            BarrierState {
                expected: count,
                arrived: HashSet::new(),
                released,
            },
        );
        self.stats.lock().created += 1;
        Ok(())
    }

    /// Record `participant` at barrier `id`.
    pub fn arrive(&self, id: &str, participant: &str) -> Result<bool, CoordinationError> {
        let mut barriers = self.barriers.lock();
        let state = barriers
            .get_mut(id)
            .ok_or_else(|| CoordinationError::UnknownBarrier(id.to_string()))?;

        if *state.released.borrow() || !state.arrived.insert(participant.to_string()) {
            return Ok(false);
        }
        debug!(
            barrier = id,
            participant,
            arrived = state.arrived.len(),
            expected = state.expected,
            "barrier arrival"
        );
        if state.arrived.len() < state.expected {
            return Ok(false);
        }
        state.released.send_replace(true);
        self.stats.lock().released += 1;
        Ok(true)
    }

    /// Resolves once barrier `id` has released.
    pub async fn wait(&self, id: &str) -> Result<(), CoordinationError> {
        let mut rx = {
            let barriers = self.barriers.lock();
            barriers
                .get(id)
                .ok_or_else(|| CoordinationError::UnknownBarrier(id.to_string()))?
                .released
                .subscribe()
        };
        // The sender lives in the map; a removed barrier counts as released.
        let _ = rx.wait_for(|released| *released).await;
        Ok(())
    }

    pub fn is_released(&self, id: &str) -> Option<bool> {
        self.barriers.lock().get(id).map(|s| *s.released.borrow())
    }

    /// Drop barrier `id`, waking any waiters.
    pub fn remove(&self, id: &str) -> bool {
        self.barriers.lock().remove(id).is_some()
    }

    pub fn stats(&self) -> BarrierStats {
        let pending = self
            .barriers
            .lock()
            .values()
            .filter(|s| !*s.released.borrow())
            .count();
        BarrierStats {
            pending,
            ..*self.stats.lock()
        }
    }
}

/// One-shot notification flag.
pub struct SignalFlag {
    raised: watch::Sender<bool>,
}

impl SignalFlag {
    pub fn new() -> Self {
        let (raised, _) = watch::channel(false);
        Self { raised }
    }

    /// Raise the flag. Returns `false` if it was already raised.
    pub fn raise(&self) -> bool {
        self.raised.send_if_modified(|raised| {
            if *raised {
                false
            } else {
                *raised = true;
                true
            }
        })
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.borrow()
    }

    /// Resolves immediately if raised, otherwise when `raise` is called.
    pub async fn wait(&self) {
        let mut rx = self.raised.subscribe();
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

impl Default for SignalFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Named signal flags shared across agents.
#[derive(Default)]
pub struct SignalBoard {
    flags: Mutex<HashMap<String, Arc<SignalFlag>>>,
}

impl SignalBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// The flag called `name`, created on first use.
    pub fn flag(&self, name: &str) -> Arc<SignalFlag> {
        Arc::clone(
            self.flags
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(SignalFlag::new())),
        )
    }

    /// Raise `name`. Returns `false` if it was already raised.
    pub fn raise(&self, name: &str) -> bool {
        self.flag(name).raise()
    }

    pub fn raised_count(&self) -> usize {
        self.flags.lock().values().filter(|f| f.is_raised()).count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_barrier_releases_on_nth_distinct_arrival() {
        let barrier = Barrier::new();
        barrier.create("merge", 3).unwrap();
        assert!(!barrier.arrive("merge", "a").unwrap());
        assert!(!barrier.arrive("merge", "a").unwrap());
        assert!(!barrier.arrive("merge", "b").unwrap());
        assert!(barrier.arrive("merge", "c").unwrap());
        // Only once.
        assert!(!barrier.arrive("merge", "d").unwrap());
        assert_eq!(barrier.is_released("merge"), Some(true));
        assert_eq!(barrier.stats().released, 1);
    }

    #[test]
    fn test_barrier_errors() {
        let barrier = Barrier::new();
        assert_eq!(
            barrier.arrive("nope", "a"),
            Err(CoordinationError::UnknownBarrier("nope".into()))
        );
        assert!(matches!(
            barrier.create("zero", 0),
            Err(CoordinationError::InvalidCount(_))
        ));
        barrier.create("dup", 1).unwrap();
        assert!(matches!(
            barrier.create("dup", 2),
            Err(CoordinationError::BarrierExists(_))
        ));
    }

    #[tokio::test]
    async fn test_barrier_wait_resolves_for_all_waiters() {
        let barrier = Arc::new(Barrier::new());
        barrier.create("sync", 2).unwrap();

        let b1 = Arc::clone(&barrier);
        let w1 = tokio::spawn(async move { b1.wait("sync").await });
        let b2 = Arc::clone(&barrier);
        let w2 = tokio::spawn(async move { b2.wait("sync").await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        barrier.arrive("sync", "x").unwrap();
        barrier.arrive("sync", "y").unwrap();

        tokio::time::timeout(Duration::from_secs(1), w1)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), w2)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_flag_idempotent_raise() {
        let flag = SignalFlag::new();
        assert!(!flag.is_raised());
        assert!(flag.raise());
        assert!(!flag.raise());
        // Already raised: resolves immediately.
        tokio::time::timeout(Duration::from_millis(50), flag.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_flag_wakes_waiter() {
        let flag = Arc::new(SignalFlag::new());
        let f = Arc::clone(&flag);
        let waiter = tokio::spawn(async move { f.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(flag.raise());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_signal_board() {
        let board = SignalBoard::new();
        assert!(board.raise("build.ready"));
        assert!(!board.raise("build.ready"));
        assert!(board.flag("build.ready").is_raised());
        assert!(!board.flag("other").is_raised());
        assert_eq!(board.raised_count(), 1);
    }
}
