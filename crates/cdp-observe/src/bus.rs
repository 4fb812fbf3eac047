use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::TraceEvent;

pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 100;
const SUBSCRIBER_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Fan-out bus between the tracer and any number of CDP sessions. Every
/// subscriber owns a bounded queue; an enqueue that cannot complete within
/// the timeout evicts that subscriber so one stuck DevTools window cannot
/// stall the proxy or its peers.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    registry: Arc<BusRegistry>,
}

#[derive(Debug, Default)]
struct BusRegistry {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<TraceEvent>>>,
    next_subscriber_id: AtomicU64,
}

impl BusRegistry {
    fn remove(&self, subscriber_id: u64) {
        self.subscribers
            .write()
            .expect("subscriber registry lock poisoned")
            .remove(&subscriber_id);
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscriber {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let subscriber_id = self
            .registry
            .next_subscriber_id
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        self.registry
            .subscribers
            .write()
            .expect("subscriber registry lock poisoned")
            .insert(subscriber_id, sender);
        Subscriber {
            subscriber_id,
            receiver,
            registry: Arc::clone(&self.registry),
            closed: false,
        }
    }

    pub async fn emit(&self, event: TraceEvent) {
        let targets: Vec<(u64, mpsc::Sender<TraceEvent>)> = {
            let subscribers = self
                .registry
                .subscribers
                .read()
                .expect("subscriber registry lock poisoned");
            subscribers
                .iter()
                .map(|(id, sender)| (*id, sender.clone()))
                .collect()
        };

        for (subscriber_id, sender) in targets {
            match tokio::time::timeout(SUBSCRIBER_ENQUEUE_TIMEOUT, sender.send(event.clone()))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    // receiver already gone
                    self.registry.remove(subscriber_id);
                }
                Err(_) => {
                    tracing::warn!(subscriber_id, "evicting slow event subscriber");
                    self.registry.remove(subscriber_id);
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .subscribers
            .read()
            .expect("subscriber registry lock poisoned")
            .len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Event(TraceEvent),
    Cancelled,
    Closed,
}

/// One session's private ordered view of the bus. Deregistration happens by
/// handle, so the bus and its subscribers never hold strong references to
/// each other's owning structures.
#[derive(Debug)]
pub struct Subscriber {
    subscriber_id: u64,
    receiver: mpsc::Receiver<TraceEvent>,
    registry: Arc<BusRegistry>,
    closed: bool,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.subscriber_id
    }

    pub async fn read(&mut self, cancel: &mut watch::Receiver<bool>) -> ReadOutcome {
        if self.closed {
            return ReadOutcome::Closed;
        }
        if *cancel.borrow() {
            return ReadOutcome::Cancelled;
        }

        tokio::select! {
            _ = cancel.changed() => ReadOutcome::Cancelled,
            received = self.receiver.recv() => match received {
                Some(event) => ReadOutcome::Event(event),
                None => ReadOutcome::Closed,
            },
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.registry.remove(self.subscriber_id);
        self.receiver.close();
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.registry.remove(self.subscriber_id);
    }
}
