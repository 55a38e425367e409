//! Circuit breaker around the optional persistence backend.
//!
//! The live session path never depends on the backend; the breaker's job
//! is to stop a degraded backend from adding latency to every registry
//! write. While `Open`, calls fail fast with `BackendUnavailable` and no
//! backend call is attempted.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::events::{EventBus, SessionEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures before Closed -> Open.
    pub failure_threshold: u32,
    /// How long the circuit stays Open before admitting a probe.
    pub cooldown: Duration,
    /// Consecutive probe successes before HalfOpen -> Closed.
    pub probe_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            probe_successes: 3,
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    probe_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: BreakerConfig,
    events: EventBus,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, events: EventBus) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            config,
            events,
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Run `op` under the breaker. In `Open` state the operation is not
    /// invoked at all; in `HalfOpen` a single probe is admitted at a time.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let is_probe = {
            let mut guard = self.inner.lock().await;
            match guard.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    let cooled = guard
                        .opened_at
                        .map(|t| t.elapsed() >= self.config.cooldown)
                        .unwrap_or(true);
                    if !cooled {
                        return Err(EngineError::BackendUnavailable);
                    }
                    self.transition(&mut guard, CircuitState::HalfOpen);
                    guard.probe_in_flight = true;
                    true
                }
                CircuitState::HalfOpen => {
                    if guard.probe_in_flight {
                        return Err(EngineError::BackendUnavailable);
                    }
                    guard.probe_in_flight = true;
                    true
                }
            }
        };

        let result = op().await;

        let mut guard = self.inner.lock().await;
        if is_probe {
            guard.probe_in_flight = false;
        }
        match result {
            Ok(value) => {
                if is_probe {
                    guard.probe_successes += 1;
                    if guard.probe_successes >= self.config.probe_successes {
                        guard.consecutive_failures = 0;
                        guard.probe_successes = 0;
                        guard.opened_at = None;
                        self.transition(&mut guard, CircuitState::Closed);
                    }
                } else {
                    guard.consecutive_failures = 0;
                }
                Ok(value)
            }
            Err(e) => {
                if is_probe {
                    // Any probe failure reopens immediately.
                    guard.probe_successes = 0;
                    guard.opened_at = Some(Instant::now());
                    self.transition(&mut guard, CircuitState::Open);
                } else {
                    guard.consecutive_failures += 1;
                    if guard.consecutive_failures >= self.config.failure_threshold
                        && guard.state == CircuitState::Closed
                    {
                        guard.opened_at = Some(Instant::now());
                        self.transition(&mut guard, CircuitState::Open);
                    }
                }
                warn!("backend call failed: {}", e);
                Err(EngineError::Internal(e.to_string()))
            }
        }
    }

    fn transition(&self, guard: &mut BreakerInner, to: CircuitState) {
        if guard.state == to {
            return;
        }
        let from = guard.state;
        guard.state = to;
        info!("circuit breaker: {:?} -> {:?}", from, to);
        let _ = self
            .events
            .send(SessionEvent::CircuitTransition { from, to });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::create_event_bus;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 5,
                cooldown: Duration::from_millis(20),
                probe_successes: 3,
            },
            create_event_bus(),
        )
    }

    async fn fail(b: &CircuitBreaker, calls: &Arc<AtomicU64>) -> Result<(), EngineError> {
        let calls = calls.clone();
        b.call(|| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("backend down")
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker, calls: &Arc<AtomicU64>) -> Result<(), EngineError> {
        let calls = calls.clone();
        b.call(|| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let b = fast_breaker();
        let calls = Arc::new(AtomicU64::new(0));

        for _ in 0..5 {
            assert!(fail(&b, &calls).await.is_err());
        }
        assert_eq!(b.state().await, CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn open_fails_fast_without_calling_backend() {
        let b = fast_breaker();
        let calls = Arc::new(AtomicU64::new(0));

        for _ in 0..5 {
            let _ = fail(&b, &calls).await;
        }
        assert_eq!(b.state().await, CircuitState::Open);

        // Within the cooldown window the backend must not be touched.
        let before = calls.load(Ordering::SeqCst);
        let err = succeed(&b, &calls).await;
        assert!(matches!(err, Err(EngineError::BackendUnavailable)));
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn recovers_after_cooldown_and_probes() {
        let b = fast_breaker();
        let calls = Arc::new(AtomicU64::new(0));

        for _ in 0..5 {
            let _ = fail(&b, &calls).await;
        }
        assert_eq!(b.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Three consecutive probe successes close the circuit again.
        for _ in 0..3 {
            succeed(&b, &calls).await.unwrap();
        }
        assert_eq!(b.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn probe_failure_reopens() {
        let b = fast_breaker();
        let calls = Arc::new(AtomicU64::new(0));

        for _ in 0..5 {
            let _ = fail(&b, &calls).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state().await, CircuitState::HalfOpen);

        assert!(fail(&b, &calls).await.is_err());
        assert_eq!(b.state().await, CircuitState::Open);

        // Re-opened: fail fast again until the next cooldown.
        assert!(matches!(
            succeed(&b, &calls).await,
            Err(EngineError::BackendUnavailable)
        ));
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let b = fast_breaker();
        let calls = Arc::new(AtomicU64::new(0));

        for _ in 0..4 {
            let _ = fail(&b, &calls).await;
        }
        succeed(&b, &calls).await.unwrap();
        // Streak reset: four more failures are not enough to open.
        for _ in 0..4 {
            let _ = fail(&b, &calls).await;
        }
        assert_eq!(b.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn transitions_are_published() {
        let bus = create_event_bus();
        let mut rx = bus.subscribe();
        let b = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_millis(10),
                probe_successes: 1,
            },
            bus,
        );
        let calls = Arc::new(AtomicU64::new(0));

        let _ = fail(&b, &calls).await;
        match rx.recv().await.unwrap() {
            SessionEvent::CircuitTransition { from, to } => {
                assert_eq!(from, CircuitState::Closed);
                assert_eq!(to, CircuitState::Open);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
