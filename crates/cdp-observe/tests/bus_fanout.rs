use std::time::{Duration, Instant};

use cdp_observe::{EventBus, ReadOutcome, Subscriber, TraceEvent, SUBSCRIBER_QUEUE_CAPACITY};
use serde_json::json;
use tokio::sync::watch;

fn numbered_event(n: u64) -> TraceEvent {
    TraceEvent::public("Network.dataReceived", json!({ "dataLength": n }))
}

async fn read_event(
    subscriber: &mut Subscriber,
    cancel: &mut watch::Receiver<bool>,
) -> TraceEvent {
    match tokio::time::timeout(Duration::from_secs(2), subscriber.read(cancel)).await {
        Ok(ReadOutcome::Event(event)) => event,
        Ok(other) => panic!("expected an event, got {other:?}"),
        Err(_) => panic!("timed out waiting for an event"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_subscriber_receives_every_event_in_order() {
    let bus = EventBus::new();
    let mut first = bus.subscribe();
    let mut second = bus.subscribe();
    let (_cancel_tx, mut cancel_rx) = watch::channel(false);

    for n in 0..10_u64 {
        bus.emit(numbered_event(n)).await;
    }

    for n in 0..10_u64 {
        assert_eq!(read_event(&mut first, &mut cancel_rx).await, numbered_event(n));
    }
    for n in 0..10_u64 {
        assert_eq!(
            read_event(&mut second, &mut cancel_rx).await,
            numbered_event(n)
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_subscribers_miss_earlier_events() {
    let bus = EventBus::new();
    bus.emit(numbered_event(0)).await;

    let mut late = bus.subscribe();
    bus.emit(numbered_event(1)).await;

    let (_cancel_tx, mut cancel_rx) = watch::channel(false);
    assert_eq!(read_event(&mut late, &mut cancel_rx).await, numbered_event(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_subscriber_is_evicted_without_stalling_peers() {
    const SENTINEL: u64 = 9999;

    let bus = EventBus::new();
    let stuck = bus.subscribe();
    let mut healthy = bus.subscribe();
    assert_eq!(bus.subscriber_count(), 2);

    // The healthy subscriber drains continuously while the stuck one never
    // reads at all.
    let healthy_reader = tokio::spawn(async move {
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);
        let mut received = Vec::new();
        loop {
            let event = read_event(&mut healthy, &mut cancel_rx).await;
            let is_sentinel = event.params().and_then(|p| p["dataLength"].as_u64())
                == Some(SENTINEL);
            received.push(event);
            if is_sentinel {
                return received;
            }
        }
    });

    // Fill the stuck subscriber's queue, then push one more event. That
    // enqueue must give up within the bounded wait and evict the stuck
    // subscriber rather than blocking the emitter forever.
    for n in 0..SUBSCRIBER_QUEUE_CAPACITY as u64 {
        bus.emit(numbered_event(n)).await;
    }
    let eviction_started = Instant::now();
    bus.emit(numbered_event(SUBSCRIBER_QUEUE_CAPACITY as u64)).await;
    let eviction_took = eviction_started.elapsed();

    assert_eq!(bus.subscriber_count(), 1);
    assert!(
        eviction_took >= Duration::from_millis(400),
        "eviction happened before the bounded wait: {eviction_took:?}"
    );
    assert!(
        eviction_took < Duration::from_secs(2),
        "eviction exceeded the bounded wait: {eviction_took:?}"
    );

    bus.emit(numbered_event(SENTINEL)).await;
    let received = healthy_reader.await.expect("healthy reader join");
    let expected: Vec<_> = (0..=SUBSCRIBER_QUEUE_CAPACITY as u64)
        .chain([SENTINEL])
        .map(numbered_event)
        .collect();
    assert_eq!(received, expected);

    drop(stuck);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn evicted_subscriber_reads_closed_after_draining() {
    let bus = EventBus::new();
    let mut stuck = bus.subscribe();
    let (_cancel_tx, mut cancel_rx) = watch::channel(false);

    for n in 0..=SUBSCRIBER_QUEUE_CAPACITY as u64 {
        bus.emit(numbered_event(n)).await;
    }
    assert_eq!(bus.subscriber_count(), 0);

    // Queued events drain, then the eviction surfaces as Closed.
    let mut drained = 0_usize;
    loop {
        match stuck.read(&mut cancel_rx).await {
            ReadOutcome::Event(_) => drained += 1,
            ReadOutcome::Closed => break,
            ReadOutcome::Cancelled => panic!("unexpected cancellation"),
        }
    }
    assert_eq!(drained, SUBSCRIBER_QUEUE_CAPACITY);
}
