use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Structured events for observability: every attempt, outcome and circuit
/// transition is published on a broadcast stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent {
    Attempt { attempt: u32 },
    Success { attempt: u32 },
    Exhausted { attempts: u32, error: String },
    CircuitOpened { consecutive_failures: u32 },
    CircuitClosed,
    /// A malformed or unexpected frame was dropped. Not a circuit failure.
    ProtocolViolation { detail: String },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(30_000),
            success_threshold: 2,
            max_attempts: 5,
        }
    }
}

/// Failure classifier and circuit breaker.
///
/// Closed counts consecutive failures; at the threshold the circuit opens
/// and rejects attempts until the reset timeout elapses, then a half-open
/// probe is allowed. Enough consecutive successes close it again; any
/// half-open failure reopens it immediately.
#[derive(Debug)]
pub struct RetryMonitor {
    policy: RetryPolicy,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    events: broadcast::Sender<RetryEvent>,
}

impl RetryMonitor {
    pub fn new(policy: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(64);
        RetryMonitor {
            policy,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            opened_at: None,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RetryEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<RetryEvent> {
        self.events.clone()
    }

    pub fn state(&mut self) -> CircuitState {
        self.refresh();
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Whether a request may be attempted right now.
    pub fn can_attempt(&mut self) -> bool {
        self.refresh();
        self.state != CircuitState::Open
    }

    fn refresh(&mut self) {
        if self.state == CircuitState::Open {
            let elapsed = self
                .opened_at
                .map(|t| t.elapsed() >= self.policy.reset_timeout)
                .unwrap_or(true);
            if elapsed {
                debug!("circuit half-open, probe permitted");
                self.state = CircuitState::HalfOpen;
                self.consecutive_successes = 0;
            }
        }
    }

    pub fn note_attempt(&mut self, attempt: u32) {
        let _ = self.events.send(RetryEvent::Attempt { attempt });
    }

    pub fn record_success(&mut self, attempt: u32) {
        self.consecutive_failures = 0;
        let _ = self.events.send(RetryEvent::Success { attempt });
        match self.state {
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.policy.success_threshold {
                    debug!("circuit closed");
                    self.state = CircuitState::Closed;
                    self.opened_at = None;
                    self.consecutive_successes = 0;
                    let _ = self.events.send(RetryEvent::CircuitClosed);
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {
                // A success can only come from a probe that raced the
                // refresh; treat it as half-open progress.
                self.state = CircuitState::HalfOpen;
                self.consecutive_successes = 1;
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.last_failure_at = Some(Instant::now());
        match self.state {
            CircuitState::HalfOpen => self.open(),
            CircuitState::Closed => {
                if self.consecutive_failures >= self.policy.failure_threshold {
                    self.open();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_exhausted(&mut self, attempts: u32, error: &str) {
        let _ = self.events.send(RetryEvent::Exhausted {
            attempts,
            error: error.to_string(),
        });
    }

    fn open(&mut self) {
        warn!(
            consecutive_failures = self.consecutive_failures,
            "circuit opened"
        );
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        let _ = self.events.send(RetryEvent::CircuitOpened {
            consecutive_failures: self.consecutive_failures,
        });
    }
}

/// Exponential back-off with jitter. `base` comes from the adaptive
/// controller; the delay doubles per attempt and is capped at the reset
/// timeout, then jittered by up to ±50%.
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(cap).max(Duration::from_millis(1));
    let half = capped.as_millis() as u64 / 2;
    let jitter = if half == 0 {
        0
    } else {
        rand::random_range(0..=half)
    };
    Duration::from_millis(half + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{self, Duration};

    fn monitor() -> RetryMonitor {
        RetryMonitor::new(RetryPolicy {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(30_000),
            success_threshold: 2,
            max_attempts: 5,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_recovers() {
        let mut m = monitor();
        let mut events = m.subscribe();

        for _ in 0..5 {
            assert!(m.can_attempt());
            m.record_failure();
        }
        // The sixth attempt is rejected without touching the transport.
        assert!(!m.can_attempt());
        assert_eq!(m.state(), CircuitState::Open);

        time::advance(Duration::from_millis(30_001)).await;

        // One probe permitted.
        assert!(m.can_attempt());
        assert_eq!(m.state(), CircuitState::HalfOpen);

        m.record_success(0);
        assert_eq!(m.state(), CircuitState::HalfOpen);
        m.record_success(0);
        assert_eq!(m.state(), CircuitState::Closed);

        let mut saw_opened = false;
        let mut saw_closed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                RetryEvent::CircuitOpened {
                    consecutive_failures,
                } => {
                    saw_opened = true;
                    assert_eq!(consecutive_failures, 5);
                }
                RetryEvent::CircuitClosed => saw_closed = true,
                _ => {}
            }
        }
        assert!(saw_opened && saw_closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let mut m = monitor();
        for _ in 0..5 {
            m.record_failure();
        }
        time::advance(Duration::from_millis(30_001)).await;
        assert!(m.can_attempt());

        m.record_failure();
        assert_eq!(m.state(), CircuitState::Open);
        assert!(!m.can_attempt());

        // Still open until another full reset timeout passes.
        time::advance(Duration::from_millis(15_000)).await;
        assert!(!m.can_attempt());
        time::advance(Duration::from_millis(15_001)).await;
        assert!(m.can_attempt());
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let mut m = monitor();
        m.record_failure();
        m.record_failure();
        m.record_success(1);
        assert_eq!(m.consecutive_failures(), 0);
        for _ in 0..4 {
            m.record_failure();
        }
        assert_eq!(m.state(), CircuitState::Closed);
        m.record_failure();
        assert_eq!(m.state(), CircuitState::Open);
    }

    #[test]
    fn backoff_grows_and_respects_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(30);
        for attempt in 0..10 {
            let d = backoff_delay(base, attempt, cap);
            let ceiling = base.saturating_mul(1 << attempt.min(16)).min(cap);
            assert!(d <= ceiling, "attempt {attempt}: {d:?} > {ceiling:?}");
            assert!(d >= ceiling / 2, "attempt {attempt}: {d:?} < half ceiling");
        }
    }
}
