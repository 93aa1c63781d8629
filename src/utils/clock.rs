//! Injectable time sources and retry pacing.
//!
//! Session freshness, heartbeat timing and every fixed-delay retry go through
//! these traits so tests can drive them without real time passing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Wall-clock source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Async sleep source.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately and records every requested delay.
#[derive(Debug, Default, Clone)]
pub struct RecordingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().clone()
    }

    pub fn total(&self) -> Duration {
        self.calls.lock().iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.calls.lock().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Attempt-indexed retry schedule.
///
/// `delay_for(n)` is the pause before retry `n` (0-based); `None` once the
/// policy is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    delays: Vec<Duration>,
}

impl BackoffPolicy {
    /// Same delay before each of `retries` retries.
    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            delays: vec![delay; retries as usize],
        }
    }

    /// Explicit schedule.
    pub fn from_delays(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        self.delays.get(attempt as usize).copied()
    }

    pub fn max_retries(&self) -> u32 {
        self.delays.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fixed_policy() {
        let policy = BackoffPolicy::fixed(2, Duration::from_millis(500));
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for(2), None);
        assert_eq!(policy.max_retries(), 2);
    }

    #[test]
    fn test_explicit_schedule() {
        let policy = BackoffPolicy::from_delays(vec![
            Duration::from_millis(100),
            Duration::from_secs(1),
        ]);
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(BackoffPolicy::none().delay_for(0), None);
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 12, 5, 14, 30, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now(), start + chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_recording_sleeper() {
        let sleeper = RecordingSleeper::new();
        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.sleep(Duration::from_millis(250)).await;
        assert_eq!(sleeper.calls().len(), 2);
        assert_eq!(sleeper.total(), Duration::from_millis(350));
    }
}
