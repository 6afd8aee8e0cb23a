//! Feed WebSocket Transport
//!
//! One WebSocket connection carries every subscription. The connection is
//! opened lazily by the first `subscribe` and owned by a single task that
//! both writes outbound commands and reads inbound frames:
//!
//! ```text
//!   subscribe/unsubscribe ──mpsc──► connection task ──► WebSocket
//!                                        │
//!          acks ◄──oneshot───────────────┤
//!          envelopes ◄──route by sub_id──┘
//! ```
//!
//! There is no automatic reconnection. When the socket goes away every route
//! is dropped, which closes each session's inbound channel, and the next
//! `subscribe` connects again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::codec::{AckFrame, AckKind, AckStatus, InboundFrame, JsonCodec, OutboundCommand};
use crate::application::ports::{
    ConnectionState, FeedTransport, SubscribeCommand, SubscriptionId, TransportError,
};
use crate::domain::message::Envelope;
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// Feed URL (`ws://` or `wss://`).
    pub url: String,
    /// Limit on establishing the connection.
    pub connect_timeout: Duration,
    /// Limit on waiting for a command acknowledgement.
    pub ack_timeout: Duration,
    /// Queue of outbound frames.
    pub outbound_capacity: usize,
    /// How long a full session may hold up the connection before its
    /// subscription is dropped.
    pub overflow_grace: Duration,
}

impl WsTransportConfig {
    /// Create a configuration with default timeouts.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            outbound_capacity: 64,
            overflow_grace: Duration::from_millis(250),
        }
    }
}

// =============================================================================
// Shared Routing State
// =============================================================================

type AckKey = (AckKind, SubscriptionId);

/// Routing table of one connection.
#[derive(Debug)]
struct Routing {
    routes: Mutex<HashMap<SubscriptionId, mpsc::Sender<Envelope>>>,
    /// Subscriptions still open on the feed whose route was dropped on overflow.
    overflowed: Mutex<HashSet<SubscriptionId>>,
    acks: Mutex<HashMap<AckKey, oneshot::Sender<AckFrame>>>,
    live: AtomicBool,
    overflow_grace: Duration,
}

impl Routing {
    fn new(overflow_grace: Duration) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            overflowed: Mutex::new(HashSet::new()),
            acks: Mutex::new(HashMap::new()),
            live: AtomicBool::new(true),
            overflow_grace,
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Route decoded frames. A session whose channel stays full for the
    /// overflow grace loses its route, which closes it.
    async fn dispatch(&self, codec: &JsonCodec, text: &str) {
        let frames = match codec.decode(text) {
            Ok(frames) => frames,
            Err(e) => {
                metrics::record_undecodable_frame();
                tracing::warn!(error = %e, "Dropping undecodable frame");
                return;
            }
        };

        for frame in frames {
            match frame {
                InboundFrame::Ack(ack) => {
                    let waiter = self.acks.lock().remove(&(ack.ack, ack.sub_id.clone()));
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(ack);
                        }
                        None => {
                            tracing::debug!(sub_id = %ack.sub_id, ack = ack.ack.as_str(), "Unsolicited acknowledgement");
                        }
                    }
                }
                InboundFrame::Envelope { sub_id, envelope } => {
                    let route = self.routes.lock().get(&sub_id).cloned();
                    let Some(route) = route else {
                        tracing::trace!(sub_id = %sub_id, "No route for envelope");
                        continue;
                    };
                    match route.send_timeout(envelope, self.overflow_grace).await {
                        Ok(()) => {}
                        Err(SendTimeoutError::Timeout(_)) => {
                            self.routes.lock().remove(&sub_id);
                            self.overflowed.lock().insert(sub_id.clone());
                            metrics::record_route_overflow();
                            tracing::warn!(
                                sub_id = %sub_id,
                                "Session fell behind the feed, route closed"
                            );
                        }
                        Err(SendTimeoutError::Closed(_)) => {
                            self.routes.lock().remove(&sub_id);
                            tracing::debug!(sub_id = %sub_id, "Session gone, route removed");
                        }
                    }
                }
            }
        }
    }

    fn teardown(&self) {
        self.live.store(false, Ordering::Release);
        let routes = std::mem::take(&mut *self.routes.lock());
        self.overflowed.lock().clear();
        let acks = std::mem::take(&mut *self.acks.lock());
        if !routes.is_empty() || !acks.is_empty() {
            tracing::warn!(
                routes = routes.len(),
                pending_acks = acks.len(),
                "Feed connection lost, closing routed subscriptions"
            );
        }
        metrics::set_websocket_connected(false);
    }
}

// =============================================================================
// Connection
// =============================================================================

#[derive(Debug)]
struct Connection {
    outbound: mpsc::Sender<Message>,
    routing: Arc<Routing>,
    closed: CancellationToken,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && self.routing.is_live()
    }
}

async fn run_connection(
    routing: Arc<Routing>,
    codec: JsonCodec,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::Receiver<Message>,
    closed: CancellationToken,
) {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            () = closed.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                tracing::info!("Feed connection closed locally");
                break;
            }
            out = outbound.recv() => {
                let Some(frame) = out else {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = write.send(frame).await {
                    metrics::record_websocket_error("send");
                    tracing::warn!(error = %e, "Feed send failed");
                    break;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        routing.dispatch(&codec, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            metrics::record_websocket_error("send");
                            tracing::warn!(error = %e, "Feed pong failed");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("Feed sent close frame");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary and pong frames carry nothing for us.
                    }
                    Some(Err(e)) => {
                        metrics::record_websocket_error("receive");
                        tracing::warn!(error = %e, "Feed receive failed");
                        break;
                    }
                    None => {
                        tracing::info!("Feed stream ended");
                        break;
                    }
                }
            }
        }
    }

    routing.teardown();
    closed.cancel();
}

// =============================================================================
// Transport
// =============================================================================

/// [`FeedTransport`] over a single multiplexed WebSocket.
#[derive(Debug)]
pub struct WsTransport {
    config: WsTransportConfig,
    codec: JsonCodec,
    connection: tokio::sync::Mutex<Option<Connection>>,
    current: RwLock<Option<Arc<Routing>>>,
    status: RwLock<ConnectionState>,
    cancel: CancellationToken,
}

impl WsTransport {
    /// Create a transport. Nothing connects until the first subscribe.
    #[must_use]
    pub fn new(config: WsTransportConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            codec: JsonCodec::new(),
            connection: tokio::sync::Mutex::new(None),
            current: RwLock::new(None),
            status: RwLock::new(ConnectionState::Disconnected),
            cancel,
        }
    }

    /// Close the current connection, if any.
    ///
    /// Every routed subscription's inbound channel closes.
    pub async fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.closed.cancel();
        }
    }

    /// Number of subscriptions currently routed.
    #[must_use]
    pub fn active_routes(&self) -> usize {
        self.current
            .read()
            .as_ref()
            .map_or(0, |routing| routing.routes.lock().len())
    }

    fn set_status(&self, state: ConnectionState) {
        *self.status.write() = state;
    }

    async fn ensure_connected(
        &self,
    ) -> Result<(mpsc::Sender<Message>, Arc<Routing>), TransportError> {
        let mut connection = self.connection.lock().await;
        if let Some(existing) = connection.as_ref()
            && existing.is_open()
        {
            return Ok((existing.outbound.clone(), Arc::clone(&existing.routing)));
        }

        if self.cancel.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        tracing::info!(url = %self.config.url, "Connecting to feed");
        self.set_status(ConnectionState::Connecting);

        let connect = tokio_tungstenite::connect_async(self.config.url.as_str());
        let ws = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                self.set_status(ConnectionState::Failed);
                metrics::record_websocket_error("connect");
                return Err(TransportError::ConnectionFailed(e.to_string()));
            }
            Err(_) => {
                self.set_status(ConnectionState::Failed);
                metrics::record_websocket_error("connect_timeout");
                return Err(TransportError::ConnectionFailed(format!(
                    "no connection within {:?}",
                    self.config.connect_timeout
                )));
            }
        };

        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let routing = Arc::new(Routing::new(self.config.overflow_grace));
        let closed = self.cancel.child_token();
        tokio::spawn(run_connection(
            Arc::clone(&routing),
            self.codec.clone(),
            ws,
            rx,
            closed.clone(),
        ));

        *self.current.write() = Some(Arc::clone(&routing));
        self.set_status(ConnectionState::Disconnected);
        metrics::set_websocket_connected(true);
        tracing::info!(url = %self.config.url, "Feed connected");

        *connection = Some(Connection {
            outbound: tx.clone(),
            routing: Arc::clone(&routing),
            closed,
        });
        Ok((tx, routing))
    }

    async fn live_connection(&self) -> Option<(mpsc::Sender<Message>, Arc<Routing>)> {
        self.connection
            .lock()
            .await
            .as_ref()
            .filter(|c| c.is_open())
            .map(|c| (c.outbound.clone(), Arc::clone(&c.routing)))
    }

    async fn request(
        &self,
        outbound: &mpsc::Sender<Message>,
        routing: &Routing,
        kind: AckKind,
        id: &SubscriptionId,
        text: String,
    ) -> Result<(), TransportError> {
        let key = (kind, id.clone());
        let (tx, rx) = oneshot::channel();
        routing.acks.lock().insert(key.clone(), tx);

        if !routing.is_live() || outbound.send(Message::Text(text.into())).await.is_err() {
            routing.acks.lock().remove(&key);
            return Err(TransportError::ConnectionClosed);
        }

        match tokio::time::timeout(self.config.ack_timeout, rx).await {
            Ok(Ok(ack)) => match ack.status {
                AckStatus::Ok => Ok(()),
                AckStatus::Error => Err(TransportError::Rejected {
                    command: kind.as_str(),
                    reason: ack.reason.unwrap_or_default(),
                }),
            },
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                routing.acks.lock().remove(&key);
                Err(TransportError::AckTimeout(kind.as_str()))
            }
        }
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn subscribe(
        &self,
        command: SubscribeCommand,
        inbound: mpsc::Sender<Envelope>,
    ) -> Result<SubscriptionId, TransportError> {
        let (outbound, routing) = self.ensure_connected().await?;
        let id = SubscriptionId::generate();
        let text = self
            .codec
            .encode(&OutboundCommand::Subscribe {
                sub_id: &id,
                spec: &command,
            })
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        // Route first: the snapshot may start right behind the ack.
        routing.routes.lock().insert(id.clone(), inbound);

        match self
            .request(&outbound, &routing, AckKind::Subscribe, &id, text)
            .await
        {
            Ok(()) if routing.is_live() => {
                tracing::debug!(sub_id = %id, topic = %command.topic, "Subscribed");
                Ok(id)
            }
            Ok(()) => Err(TransportError::ConnectionClosed),
            Err(e) => {
                routing.routes.lock().remove(&id);
                Err(e)
            }
        }
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), TransportError> {
        let Some((outbound, routing)) = self.live_connection().await else {
            return Ok(());
        };
        let routed = routing.routes.lock().remove(id).is_some();
        let overflowed = routing.overflowed.lock().remove(id);
        if !routed && !overflowed {
            tracing::debug!(sub_id = %id, "Unsubscribe for unrouted subscription");
            return Ok(());
        }

        let text = self
            .codec
            .encode(&OutboundCommand::Unsubscribe { sub_id: id })
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        match self
            .request(&outbound, &routing, AckKind::Unsubscribe, id, text)
            .await
        {
            // The feed forgot the subscription along with the socket.
            Err(TransportError::ConnectionClosed) => Ok(()),
            other => other,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        if self.current.read().as_ref().is_some_and(|r| r.is_live()) {
            return ConnectionState::Connected;
        }
        *self.status.read()
    }
}
