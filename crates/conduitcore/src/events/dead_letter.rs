use super::IntegrationEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// An event whose handler failed after exhausting its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub event: IntegrationEvent,
    /// Last error reported by the failing handler
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Bounded FIFO; the oldest entry is evicted once capacity is exceeded.
#[derive(Debug)]
pub struct DeadLetterQueue {
    capacity: usize,
    entries: VecDeque<DeadLetter>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, entry: DeadLetter) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                tracing::warn!(
                    "Dead-letter queue full, evicting event {} ({})",
                    evicted.event.id,
                    evicted.event.event_type
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries.iter().cloned().collect()
    }

    pub fn drain(&mut self) -> Vec<DeadLetter> {
        self.entries.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
