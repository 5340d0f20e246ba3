use super::dead_letter::{DeadLetter, DeadLetterQueue};
use crate::error::HandlerError;
use crate::reliability::{RetryExecutor, RetryOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;

pub type EventId = Uuid;

/// Subscribing to this type receives every event.
pub const WILDCARD: &str = "*";

/// A domain event raised by a connector or by the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEvent {
    pub id: EventId,
    pub integration_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub processed: bool,
    pub retry_count: u32,
}

impl IntegrationEvent {
    pub fn new(
        integration_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            integration_id: integration_id.into(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
            processed: false,
            retry_count: 0,
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: IntegrationEvent) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(IntegrationEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: IntegrationEvent) -> Result<(), HandlerError> {
        (self.0)(event).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventBusConfig {
    /// Retries per handler after the first attempt
    pub max_retries: u32,
    /// Delay before retry k is `retry_delay_ms * 2^(k-1)`
    pub retry_delay_ms: u64,
    pub max_dead_letters: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            max_dead_letters: 1000,
        }
    }
}

struct Registered {
    id: u64,
    handler: Arc<dyn EventHandler>,
}

struct BusInner {
    config: EventBusConfig,
    retry: RetryExecutor,
    handlers: RwLock<HashMap<String, Vec<Registered>>>,
    processing: Mutex<HashSet<EventId>>,
    dead_letters: Mutex<DeadLetterQueue>,
    next_id: AtomicU64,
}

/// Publish/subscribe dispatcher with per-handler retry and dead-lettering.
///
/// Cloning is cheap; clones share the same registry and queue.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    bus: Weak<BusInner>,
    event_type: String,
    id: u64,
}

impl Subscription {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Remove the handler. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut handlers = bus.handlers.write();
        let Some(list) = handlers.get_mut(&self.event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != self.id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&self.event_type);
        }
        removed
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let retry = RetryExecutor::new(
            RetryOptions::new()
                .with_max_retries(config.max_retries)
                .with_initial_backoff(Duration::from_millis(config.retry_delay_ms))
                .with_multiplier(2.0)
                .with_max_backoff(Duration::MAX)
                .retry_all_statuses(),
        );
        let dead_letters = Mutex::new(DeadLetterQueue::new(config.max_dead_letters));

        Self {
            inner: Arc::new(BusInner {
                config,
                retry,
                handlers: RwLock::new(HashMap::new()),
                processing: Mutex::new(HashSet::new()),
                dead_letters,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    pub fn subscribe<F, Fut>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(IntegrationEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe_handler(event_type, Arc::new(FnHandler(handler)))
    }

    pub fn subscribe_all<F, Fut>(&self, handler: F) -> Subscription
    where
        F: Fn(IntegrationEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe(WILDCARD, handler)
    }

    pub fn subscribe_handler(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Subscription {
        let event_type = event_type.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Subscribing handler {} to '{}'", id, event_type);

        self.inner
            .handlers
            .write()
            .entry(event_type.clone())
            .or_default()
            .push(Registered { id, handler });

        Subscription {
            bus: Arc::downgrade(&self.inner),
            event_type,
            id,
        }
    }

    /// Number of handlers registered for exactly this type.
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.inner
            .handlers
            .read()
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Build an event and fan it out to every matching handler.
    ///
    /// Resolves once all handlers have settled. Never fails: handler
    /// errors end up in the dead-letter queue.
    pub async fn publish(
        &self,
        integration_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> IntegrationEvent {
        let event = IntegrationEvent::new(integration_id, event_type, payload);
        self.dispatch(event).await
    }

    /// Dispatch an already-built event. A second dispatch of an event id
    /// that is still in flight is ignored.
    pub async fn dispatch(&self, mut event: IntegrationEvent) -> IntegrationEvent {
        let Some(_guard) = ProcessingGuard::acquire(&self.inner, event.id) else {
            tracing::debug!("Event {} already dispatching, skipping", event.id);
            return event;
        };

        let handlers = self.matching_handlers(&event.event_type);
        if handlers.is_empty() {
            tracing::debug!("No handlers for '{}'", event.event_type);
            event.processed = true;
            return event;
        }

        let results = join_all(
            handlers
                .into_iter()
                .map(|handler| self.execute_with_retry(handler, event.clone())),
        )
        .await;

        event.processed = results.iter().all(Result::is_ok);
        event
    }

    fn matching_handlers(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let handlers = self.inner.handlers.read();
        let mut matched: Vec<Arc<dyn EventHandler>> = handlers
            .get(event_type)
            .into_iter()
            .flatten()
            .map(|r| r.handler.clone())
            .collect();
        if event_type != WILDCARD {
            matched.extend(
                handlers
                    .get(WILDCARD)
                    .into_iter()
                    .flatten()
                    .map(|r| r.handler.clone()),
            );
        }
        matched
    }

    async fn execute_with_retry(
        &self,
        handler: Arc<dyn EventHandler>,
        event: IntegrationEvent,
    ) -> Result<(), HandlerError> {
        let attempts = AtomicU32::new(0);
        let result = self
            .inner
            .retry
            .execute(|| {
                let mut attempt_event = event.clone();
                attempt_event.retry_count = attempts.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                async move { handler.handle(attempt_event).await }
            })
            .await;

        if let Err(err) = &result {
            let mut failed = event;
            failed.retry_count = attempts.load(Ordering::SeqCst).saturating_sub(1);
            tracing::warn!(
                "Handler for '{}' failed after {} retries, dead-lettering event {}: {}",
                failed.event_type,
                failed.retry_count,
                failed.id,
                err
            );
            self.inner.dead_letters.lock().push(DeadLetter {
                event: failed,
                error: err.to_string(),
                failed_at: Utc::now(),
            });
        }
        result
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().snapshot()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.inner.dead_letters.lock().len()
    }

    pub fn clear_dead_letters(&self) {
        self.inner.dead_letters.lock().clear();
    }

    /// Drain the dead-letter queue and re-dispatch every event, back to back.
    /// Returns how many events were redriven.
    pub async fn replay_dead_letter_events(&self) -> usize {
        let drained = self.inner.dead_letters.lock().drain();
        let count = drained.len();
        tracing::info!("Replaying {} dead-lettered events", count);

        for letter in drained {
            let mut event = letter.event;
            event.processed = false;
            event.retry_count = 0;
            self.dispatch(event).await;
        }
        count
    }

    /// Drop every handler and dead letter.
    pub fn clear(&self) {
        self.inner.handlers.write().clear();
        self.inner.dead_letters.lock().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

/// Marks an event id as in flight for the lifetime of one dispatch.
struct ProcessingGuard<'a> {
    inner: &'a BusInner,
    id: EventId,
}

impl<'a> ProcessingGuard<'a> {
    fn acquire(inner: &'a BusInner, id: EventId) -> Option<Self> {
        if inner.processing.lock().insert(id) {
            Some(Self { inner, id })
        } else {
            None
        }
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.inner.processing.lock().remove(&self.id);
    }
}
