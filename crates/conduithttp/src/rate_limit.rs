//! Sliding-window request limiter.
//!
//! Requests over the limit are delayed, never dropped.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Slack added after the oldest request leaves the window.
const EXIT_BUFFER: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    limit: u32,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Wait for a slot in the window and claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut timestamps = self.timestamps.lock();
                let now = Instant::now();
                self.prune(&mut timestamps, now);

                match timestamps.front() {
                    Some(&oldest) if timestamps.len() as u32 >= self.limit => {
                        (oldest + self.window + EXIT_BUFFER).saturating_duration_since(now)
                    }
                    _ => {
                        timestamps.push_back(now);
                        return;
                    }
                }
            };

            tracing::debug!(
                "Rate limit of {} per {}s reached, waiting {}ms",
                self.limit,
                self.window.as_secs(),
                wait.as_millis()
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Slots still free in the current window.
    pub fn remaining(&self) -> u32 {
        let mut timestamps = self.timestamps.lock();
        self.prune(&mut timestamps, Instant::now());
        self.limit.saturating_sub(timestamps.len() as u32)
    }

    fn prune(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = timestamps.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_requests_under_limit_pass_immediately() {
        let limiter = SlidingWindowLimiter::per_minute(3);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excess_request_waits_for_window() {
        let limiter = SlidingWindowLimiter::per_minute(2);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(60), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(61), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_limit_in_any_window() {
        let limiter = Arc::new(SlidingWindowLimiter::per_minute(5));
        let origin = Instant::now();

        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.acquire().await;
                    Instant::now()
                })
            })
            .collect();

        let mut times = Vec::new();
        for task in tasks {
            times.push(task.await.unwrap());
        }
        times.sort();

        // All 12 got through, none dropped
        assert_eq!(times.len(), 12);
        for (i, start) in times.iter().enumerate() {
            let in_window = times[i..]
                .iter()
                .take_while(|t| t.saturating_duration_since(*start) < Duration::from_secs(60))
                .count();
            assert!(in_window <= 5, "window starting at {:?} held {}", *start - origin, in_window);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_recovers_after_window() {
        let limiter = SlidingWindowLimiter::per_minute(2);
        limiter.acquire().await;
        assert_eq!(limiter.remaining(), 1);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.remaining(), 2);
    }
}
