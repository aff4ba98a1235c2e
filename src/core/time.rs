use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Clock abstraction so every state machine in the core receives an explicit `now`.
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> tokio::time::Sleep;
}

/// System-backed clock; replaceable in tests or deterministic replay.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
        tokio::time::sleep(duration)
    }
}

/// Hand-driven clock for tests. Can move backwards to exercise clock anomalies.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(at: Instant) -> Self {
        Self {
            now: Arc::new(Mutex::new(at)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn rewind(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = now.checked_sub(by).unwrap_or(*now);
    }

    pub fn set(&self, at: Instant) {
        *self.now.lock() = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
        tokio::time::sleep(duration)
    }
}

/// Milliseconds elapsed since `boot`, saturating at zero when `now` precedes it.
pub fn millis_since(boot: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(boot).as_millis() as u64
}
