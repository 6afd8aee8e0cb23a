//! Channel Bridge
//!
//! Carries [`ViewEvent`]s from a session's engine task to the consumer over a
//! bounded `tokio::sync::mpsc` channel.
//!
//! - Order is preserved: one producer task, FIFO channel.
//! - A full channel applies backpressure to the engine task.
//! - A dropped receiver turns delivery into a counted no-op; the session
//!   keeps running.
//!
//! Events are `serde`-serializable, so a consumer in another process can be
//! fed by writing [`ViewEvent::to_json`] lines from the receiving side.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::application::ports::EventSink;
use crate::domain::view::ViewEvent;

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Producer side of the bridge.
#[derive(Debug, Clone)]
pub struct BridgeSender {
    tx: mpsc::Sender<ViewEvent>,
    counters: Arc<Counters>,
}

impl BridgeSender {
    /// Events handed to the consumer.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    /// Events dropped because the consumer was gone.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Whether the consumer has dropped its receiver.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl EventSink for BridgeSender {
    async fn deliver(&self, event: ViewEvent) -> bool {
        if self.tx.send(event).await.is_ok() {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

/// Consumer side of the bridge.
#[derive(Debug)]
pub struct BridgeReceiver {
    rx: mpsc::Receiver<ViewEvent>,
}

impl BridgeReceiver {
    /// Wait for the next event. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<ViewEvent> {
        self.rx.recv().await
    }

    /// Take an event if one is ready.
    pub fn try_recv(&mut self) -> Option<ViewEvent> {
        self.rx.try_recv().ok()
    }

    /// Consume as a `Stream`.
    #[must_use]
    pub fn into_stream(self) -> ReceiverStream<ViewEvent> {
        ReceiverStream::new(self.rx)
    }
}

/// Create a bridge holding at most `capacity` undelivered events.
#[must_use]
pub fn channel(capacity: usize) -> (BridgeSender, BridgeReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        BridgeSender {
            tx,
            counters: Arc::new(Counters::default()),
        },
        BridgeReceiver { rx },
    )
}
