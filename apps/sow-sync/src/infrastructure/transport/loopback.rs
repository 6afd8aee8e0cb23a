//! In-Memory Loopback Transport
//!
//! A [`FeedTransport`] that never leaves the process. Tests and demos
//! publish envelopes by topic or by subscription id and can script refusals
//! and slow unsubscribes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::application::ports::{
    ConnectionState, FeedTransport, SubscribeCommand, SubscriptionId, TransportError,
};
use crate::domain::message::Envelope;

/// One command seen by the loopback feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackCall {
    /// Accepted subscribe.
    Subscribe(SubscriptionId, SubscribeCommand),
    /// Unsubscribe, recorded when it completes.
    Unsubscribe(SubscriptionId),
}

#[derive(Debug)]
struct Route {
    topic: String,
    inbound: mpsc::Sender<Envelope>,
}

/// In-process feed.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    routes: Mutex<HashMap<SubscriptionId, Route>>,
    calls: Mutex<Vec<LoopbackCall>>,
    rejections: AtomicU32,
    unsubscribe_delay: Mutex<Option<Duration>>,
    disconnected: Mutex<bool>,
}

impl LoopbackTransport {
    /// Create an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next subscribe.
    pub fn reject_next_subscribe(&self) {
        self.rejections.fetch_add(1, Ordering::SeqCst);
    }

    /// Make every unsubscribe take this long.
    pub fn set_unsubscribe_delay(&self, delay: Duration) {
        *self.unsubscribe_delay.lock() = Some(delay);
    }

    /// Send an envelope to every subscription on `topic`.
    ///
    /// Returns how many subscriptions received it.
    pub async fn publish(&self, topic: &str, envelope: Envelope) -> usize {
        let targets: Vec<_> = self
            .routes
            .lock()
            .values()
            .filter(|route| route.topic == topic)
            .map(|route| route.inbound.clone())
            .collect();

        let mut delivered = 0;
        for target in targets {
            if target.send(envelope.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send an envelope to one subscription. Returns `false` if it is not routed.
    pub async fn publish_to(&self, id: &SubscriptionId, envelope: Envelope) -> bool {
        let target = self.routes.lock().get(id).map(|route| route.inbound.clone());
        match target {
            Some(target) => target.send(envelope).await.is_ok(),
            None => false,
        }
    }

    /// Drop every route, as a lost connection would.
    pub fn disconnect(&self) {
        self.routes.lock().clear();
        *self.disconnected.lock() = true;
    }

    /// Commands seen so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<LoopbackCall> {
        self.calls.lock().clone()
    }

    /// Ids currently routed.
    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self.routes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl FeedTransport for LoopbackTransport {
    async fn subscribe(
        &self,
        command: SubscribeCommand,
        inbound: mpsc::Sender<Envelope>,
    ) -> Result<SubscriptionId, TransportError> {
        let refused = self
            .rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Rejected {
                command: "subscribe",
                reason: format!("topic {} refused", command.topic),
            });
        }

        *self.disconnected.lock() = false;
        let id = SubscriptionId::generate();
        self.routes.lock().insert(
            id.clone(),
            Route {
                topic: command.topic.clone(),
                inbound,
            },
        );
        self.calls
            .lock()
            .push(LoopbackCall::Subscribe(id.clone(), command));
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), TransportError> {
        self.routes.lock().remove(id);

        let delay = *self.unsubscribe_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.calls.lock().push(LoopbackCall::Unsubscribe(id.clone()));
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        if *self.disconnected.lock() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::spec::SubscriptionSpec;

    fn command(topic: &str) -> SubscribeCommand {
        SubscribeCommand::from(&SubscriptionSpec::new(topic))
    }

    #[tokio::test]
    async fn publish_reaches_only_matching_topic() {
        let feed = LoopbackTransport::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        feed.subscribe(command("a"), tx_a).await.unwrap();
        feed.subscribe(command("b"), tx_b).await.unwrap();

        assert_eq!(feed.publish("a", Envelope::begin()).await, 1);

        assert_eq!(rx_a.try_recv().unwrap(), Envelope::begin());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_routing() {
        let feed = LoopbackTransport::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = feed.subscribe(command("a"), tx).await.unwrap();

        feed.unsubscribe(&id).await.unwrap();

        assert!(!feed.publish_to(&id, Envelope::begin()).await);
        assert!(feed.active_subscriptions().is_empty());
        assert_eq!(feed.calls().len(), 2);
    }

    #[tokio::test]
    async fn scripted_rejection_applies_once() {
        let feed = LoopbackTransport::new();
        feed.reject_next_subscribe();

        let (tx, _rx) = mpsc::channel(4);
        assert!(matches!(
            feed.subscribe(command("a"), tx.clone()).await,
            Err(TransportError::Rejected { .. })
        ));
        assert!(feed.subscribe(command("a"), tx).await.is_ok());
    }

    #[tokio::test]
    async fn disconnect_closes_inbound_channels() {
        let feed = LoopbackTransport::new();
        let (tx, mut rx) = mpsc::channel(4);
        feed.subscribe(command("a"), tx).await.unwrap();

        feed.disconnect();

        assert_eq!(rx.recv().await, None);
        assert_eq!(feed.connection_state(), ConnectionState::Disconnected);
    }
}
