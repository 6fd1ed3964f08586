//! Bounded polling.
//!
//! Every blocking wait in the agent goes through [`run_until`] or drives a
//! [`PollState`] directly, so no wait can exceed its timeout by more than one
//! polling interval. Time comes from `tokio::time`, which lets tests run
//! with a paused clock.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Progress of one polling loop.
#[derive(Debug)]
pub struct PollState {
    config: PollConfig,
    started: Instant,
    attempts: u32,
}

impl PollState {
    pub fn start(config: PollConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            attempts: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.config.timeout.saturating_sub(self.elapsed())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Number of sleeps taken so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sleep until the next attempt. Returns `false` without sleeping once
    /// the timeout is exhausted.
    pub async fn wait(&mut self) -> bool {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return false;
        }
        tokio::time::sleep(self.config.interval.min(remaining)).await;
        self.attempts += 1;
        true
    }
}

/// Call `predicate(remaining)` until it yields `Some`, sleeping one interval
/// between calls. Returns `None` once the timeout is exhausted.
pub async fn run_until<T, F, Fut>(config: PollConfig, mut predicate: F) -> Option<T>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let mut state = PollState::start(config);
    loop {
        if let Some(value) = predicate(state.remaining()).await {
            return Some(value);
        }
        if !state.wait().await {
            tracing::debug!(
                attempts = state.attempts(),
                timeout_secs = config.timeout.as_secs(),
                "polling timed out"
            );
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(interval: u64, timeout: u64) -> PollConfig {
        PollConfig::new(Duration::from_secs(interval), Duration::from_secs(timeout))
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_truthy_result() {
        let mut calls = 0;
        let result = run_until(config(10, 100), |_| {
            calls += 1;
            let n = calls;
            async move { (n == 3).then_some(n) }
        })
        .await;
        assert_eq!(result, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_sentinel_within_timeout_plus_one_interval() {
        let start = Instant::now();
        let result: Option<()> = run_until(config(7, 30), |_| async { None }).await;
        assert_eq!(result, None);
        assert!(start.elapsed() <= Duration::from_secs(30 + 7));
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_sees_remaining_time_shrink() {
        let mut seen = Vec::new();
        let _: Option<()> = run_until(config(10, 25), |remaining| {
            seen.push(remaining.as_secs());
            async { None }
        })
        .await;
        assert_eq!(seen, vec![25, 15, 5, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_calls_predicate_once() {
        let mut calls = 0;
        let _: Option<()> = run_until(config(10, 0), |_| {
            calls += 1;
            async { None }
        })
        .await;
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_state_tracks_attempts() {
        let mut state = PollState::start(config(5, 12));
        assert!(state.wait().await);
        assert!(state.wait().await);
        assert!(state.wait().await);
        assert!(state.is_exhausted());
        assert!(!state.wait().await);
        assert_eq!(state.attempts(), 3);
    }
}
