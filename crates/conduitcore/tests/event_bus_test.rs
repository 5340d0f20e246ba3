// crates/conduitcore/tests/event_bus_test.rs

use conduitcore::{EventBus, EventBusConfig, HandlerError, IntegrationEvent};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

fn bus(max_retries: u32, max_dead_letters: usize) -> EventBus {
    EventBus::new(EventBusConfig {
        max_retries,
        retry_delay_ms: 100,
        max_dead_letters,
    })
}

fn counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

#[tokio::test(start_paused = true)]
async fn test_failing_handler_is_isolated_and_dead_lettered() {
    init_tracing();
    let bus = bus(3, 10);
    let good = counter();
    let bad = counter();

    let g = good.clone();
    bus.subscribe("canvas.enrollment.created", move |_event| {
        let g = g.clone();
        async move {
            g.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let b = bad.clone();
    bus.subscribe("canvas.enrollment.created", move |_event| {
        let b = b.clone();
        async move {
            b.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::from("downstream unavailable"))
        }
    });

    let event = bus
        .publish("canvas", "canvas.enrollment.created", json!({ "userId": "42" }))
        .await;

    assert_eq!(good.load(Ordering::SeqCst), 1);
    assert_eq!(bad.load(Ordering::SeqCst), 4);
    assert!(!event.processed);

    let letters = bus.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].event.id, event.id);
    assert_eq!(letters[0].event.retry_count, 3);
    assert_eq!(letters[0].error, "downstream unavailable");
}

#[tokio::test(start_paused = true)]
async fn test_handler_retry_backoff_doubles() {
    let bus = bus(3, 10);
    bus.subscribe("x", |_event| async { Err(HandlerError::from("nope")) });

    let start = Instant::now();
    bus.publish("test", "x", json!({})).await;
    // 100 + 200 + 400
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(750), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_retry_count_visible_to_handler() {
    let bus = bus(2, 10);
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let s = seen.clone();
    bus.subscribe("x", move |event: IntegrationEvent| {
        let s = s.clone();
        async move {
            s.lock().push(event.retry_count);
            if event.retry_count < 2 {
                Err(HandlerError::from("flaky"))
            } else {
                Ok(())
            }
        }
    });

    let event = bus.publish("test", "x", json!({})).await;
    assert!(event.processed);
    assert_eq!(*seen.lock(), vec![0, 1, 2]);
    assert_eq!(bus.dead_letter_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dead_letter_queue_is_bounded_fifo() {
    let bus = bus(0, 3);
    bus.subscribe("x", |_event| async { Err(HandlerError::from("always")) });

    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(bus.publish("test", "x", json!({ "n": n })).await.id);
    }

    let letters = bus.dead_letters();
    assert_eq!(letters.len(), 3);
    let kept: Vec<_> = letters.iter().map(|l| l.event.id).collect();
    assert_eq!(kept, ids[2..].to_vec());
}

#[tokio::test]
async fn test_wildcard_receives_every_type() {
    let bus = bus(0, 10);
    let all = counter();
    let a = all.clone();
    bus.subscribe_all(move |_event| {
        let a = a.clone();
        async move {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    bus.publish("zoom", "zoom.meeting.started", json!({})).await;
    bus.publish("teams", "teams.channel.created", json!({})).await;
    assert_eq!(all.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unsubscribe_removes_only_that_handler() {
    let bus = bus(0, 10);
    let first = counter();
    let second = counter();

    let f = first.clone();
    let sub = bus.subscribe("x", move |_event| {
        let f = f.clone();
        async move {
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let s = second.clone();
    bus.subscribe("x", move |_event| {
        let s = s.clone();
        async move {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    assert_eq!(bus.handler_count("x"), 2);
    assert!(sub.unsubscribe());
    assert_eq!(bus.handler_count("x"), 1);

    bus.publish("test", "x", json!({})).await;
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_publish_without_handlers_is_processed() {
    let bus = bus(0, 10);
    let event = bus.publish("test", "nobody.listens", json!({ "a": 1 })).await;
    assert!(event.processed);
    assert_eq!(event.integration_id, "test");
    assert_eq!(event.payload, json!({ "a": 1 }));
}

#[tokio::test]
async fn test_replay_redrives_dead_letters() {
    let bus = bus(0, 10);
    let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let delivered = counter();

    let h = healthy.clone();
    let d = delivered.clone();
    bus.subscribe("x", move |_event| {
        let h = h.clone();
        let d = d.clone();
        async move {
            if h.load(Ordering::SeqCst) {
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            } else {
                Err(HandlerError::from("offline"))
            }
        }
    });

    bus.publish("test", "x", json!({})).await;
    bus.publish("test", "x", json!({})).await;
    assert_eq!(bus.dead_letter_count(), 2);

    healthy.store(true, Ordering::SeqCst);
    assert_eq!(bus.replay_dead_letter_events().await, 2);
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert_eq!(bus.dead_letter_count(), 0);
}

#[tokio::test]
async fn test_clear_drops_handlers_and_letters() {
    let bus = bus(0, 10);
    bus.subscribe("x", |_event| async { Err(HandlerError::from("boom")) });
    bus.publish("test", "x", json!({})).await;

    bus.clear();
    assert_eq!(bus.handler_count("x"), 0);
    assert_eq!(bus.dead_letter_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_dispatch_of_same_event_runs_once() {
    let bus = bus(0, 10);
    let calls = counter();

    let c = calls.clone();
    bus.subscribe("zoom.meeting.ended", move |_event| {
        let c = c.clone();
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        }
    });

    let event = IntegrationEvent::new("zoom", "zoom.meeting.ended", json!({ "meetingId": 9 }));
    let (first, second) = tokio::join!(bus.dispatch(event.clone()), bus.dispatch(event.clone()));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(first.processed);
    assert!(!second.processed);

    // Once the first dispatch settles the id is free again
    let again = bus.dispatch(event).await;
    assert!(again.processed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
