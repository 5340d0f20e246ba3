//! Named-interval timers for schedule-triggered workflows.
//!
//! Only `@hourly`, `@daily` and `@weekly` are understood. Anything else
//! is never scheduled.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub fn interval_for(expression: &str) -> Option<Duration> {
    match expression.trim() {
        "@hourly" => Some(Duration::from_secs(3_600)),
        "@daily" => Some(Duration::from_secs(86_400)),
        "@weekly" => Some(Duration::from_secs(604_800)),
        _ => None,
    }
}

/// One recurring timer per key, cancellable at any time.
#[derive(Default)]
pub struct Scheduler {
    timers: Mutex<HashMap<String, CancellationToken>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `tick` every `period`, starting one period from now. Replaces
    /// any timer already armed under `key`.
    pub fn arm<F, Fut>(&self, key: impl Into<String>, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let label = key.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        tracing::debug!("Schedule tick for '{}'", label);
                        tick().await;
                    }
                }
            }
            tracing::debug!("Timer for '{}' stopped", label);
        });

        if let Some(previous) = self.timers.lock().insert(key, token) {
            previous.cancel();
        }
    }

    pub fn disarm(&self, key: &str) -> bool {
        match self.timers.lock().remove(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn disarm_all(&self) {
        for (_, token) in self.timers.lock().drain() {
            token.cancel();
        }
    }

    pub fn is_armed(&self, key: &str) -> bool {
        self.timers.lock().contains_key(key)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.disarm_all();
    }
}
