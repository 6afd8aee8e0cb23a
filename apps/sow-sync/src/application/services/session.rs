//! Subscription Session
//!
//! A session is one subscription on the feed plus the task that reconciles
//! it. Opening subscribes through the [`FeedTransport`] and spawns the engine
//! task; closing unsubscribes, stops the task and waits for it to finish.
//!
//! ```text
//!   transport ──mpsc (bounded)──► engine task ──EventSink──► consumer
//! ```

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::engine::{EnginePhase, ReconciliationEngine};
use crate::application::ports::{
    ConnectionState, EventSink, FeedTransport, SubscribeCommand, SubscriptionId, TransportError,
};
use crate::domain::message::{Envelope, classify};
use crate::domain::spec::{SpecError, SubscriptionSpec};
use crate::domain::view::ViewEvent;
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// Session open/close failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The spec failed validation.
    #[error("invalid subscription spec: {0}")]
    Spec(#[from] SpecError),

    /// The transport refused or failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The engine task panicked.
    #[error("session worker panicked")]
    WorkerPanicked,
}

// =============================================================================
// Settings
// =============================================================================

/// Session tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Capacity of the transport → engine channel.
    pub inbound_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            inbound_capacity: 1024,
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Live counters of one session, shared between the engine task and readers.
#[derive(Debug, Default)]
pub struct SessionStats {
    phase: AtomicU8,
    messages_received: AtomicU64,
    malformed: AtomicU64,
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
    view_rows: AtomicUsize,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatsSnapshot {
    /// Engine phase name.
    pub phase: &'static str,
    /// Envelopes received from the transport.
    pub messages_received: u64,
    /// Envelopes dropped by the classifier.
    pub malformed: u64,
    /// View events accepted by the consumer.
    pub events_delivered: u64,
    /// View events dropped because the consumer was gone.
    pub events_dropped: u64,
    /// Rows in the engine's view.
    pub view_rows: usize,
}

impl SessionStats {
    /// Current engine phase.
    #[must_use]
    pub fn phase(&self) -> EnginePhase {
        EnginePhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    /// Copy all counters.
    #[must_use]
    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            phase: self.phase().as_str(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            view_rows: self.view_rows.load(Ordering::Relaxed),
        }
    }

    fn set_phase(&self, phase: EnginePhase) {
        self.phase.store(phase.to_u8(), Ordering::Relaxed);
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Owner's handle on an open session.
///
/// Dropping a handle without [`SubscriptionService::close`] stops the engine
/// task but leaves the feed subscription to be reaped by the transport.
#[derive(Debug)]
pub struct SessionHandle {
    id: SubscriptionId,
    spec: SubscriptionSpec,
    stats: Arc<SessionStats>,
    stop: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Transport subscription id.
    #[must_use]
    pub const fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Spec the session was opened with.
    #[must_use]
    pub const fn spec(&self) -> &SubscriptionSpec {
        &self.spec
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    /// Whether the engine task has exited on its own (feed closed).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

// =============================================================================
// Service
// =============================================================================

/// Opens and closes subscription sessions over a shared transport.
#[derive(Clone)]
pub struct SubscriptionService {
    transport: Arc<dyn FeedTransport>,
    settings: SessionSettings,
}

impl std::fmt::Debug for SubscriptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionService")
            .field("settings", &self.settings)
            .field("connection", &self.transport.connection_state())
            .finish_non_exhaustive()
    }
}

impl SubscriptionService {
    /// Create a service.
    #[must_use]
    pub fn new(transport: Arc<dyn FeedTransport>, settings: SessionSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Connection state of the underlying transport.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.transport.connection_state()
    }

    /// Open a session.
    ///
    /// Resolves once the feed acknowledged the subscription. The consumer
    /// sees nothing until the first snapshot has been promoted.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Spec` for an invalid spec and
    /// `SessionError::Transport` if connecting or subscribing fails. Nothing
    /// is spawned in either case.
    pub async fn open(
        &self,
        spec: SubscriptionSpec,
        sink: Arc<dyn EventSink>,
    ) -> Result<SessionHandle, SessionError> {
        spec.validate()?;

        let (tx, rx) = mpsc::channel(self.settings.inbound_capacity.max(1));
        let id = self
            .transport
            .subscribe(SubscribeCommand::from(&spec), tx)
            .await
            .inspect_err(|e| {
                tracing::warn!(topic = %spec.topic, error = %e, "Subscribe failed");
            })?;

        let stats = Arc::new(SessionStats::default());
        let stop = CancellationToken::new();
        let worker = Worker {
            id: id.clone(),
            engine: ReconciliationEngine::new(spec.clone()),
            sink,
            stats: Arc::clone(&stats),
        };
        let handle = tokio::spawn(worker.run(rx, stop.clone()));

        metrics::session_opened();
        tracing::info!(sub_id = %id, topic = %spec.topic, "Session opened");

        Ok(SessionHandle {
            id,
            spec,
            stats,
            stop,
            worker: Some(handle),
        })
    }

    /// Close a session.
    ///
    /// Unsubscribes, then stops the engine task and waits for it. Once this
    /// resolves, no further event from the session reaches the consumer.
    /// The task is stopped even if the unsubscribe fails.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Transport` if the feed did not confirm the
    /// unsubscribe and `SessionError::WorkerPanicked` if the task panicked.
    pub async fn close(&self, mut handle: SessionHandle) -> Result<(), SessionError> {
        let unsubscribed = self.transport.unsubscribe(&handle.id).await;
        if let Err(e) = &unsubscribed {
            tracing::warn!(sub_id = %handle.id, error = %e, "Unsubscribe not confirmed");
        }

        handle.stop.cancel();
        let joined = match handle.worker.take() {
            Some(worker) => worker.await,
            None => Ok(()),
        };

        metrics::session_closed();
        tracing::info!(sub_id = %handle.id, topic = %handle.spec.topic, "Session closed");

        if joined.is_err() {
            return Err(SessionError::WorkerPanicked);
        }
        unsubscribed.map_err(SessionError::from)
    }

    /// Replace a session with one for a new spec.
    ///
    /// The old session is fully closed before the new one is opened. A
    /// failed close is logged and does not prevent the open.
    ///
    /// # Errors
    ///
    /// Returns the error of opening the new session.
    pub async fn update(
        &self,
        handle: SessionHandle,
        spec: SubscriptionSpec,
        sink: Arc<dyn EventSink>,
    ) -> Result<SessionHandle, SessionError> {
        let old_id = handle.id.clone();
        if let Err(e) = self.close(handle).await {
            tracing::warn!(sub_id = %old_id, error = %e, "Closing previous session failed");
        }
        self.open(spec, sink).await
    }
}

// =============================================================================
// Engine Task
// =============================================================================

struct Worker {
    id: SubscriptionId,
    engine: ReconciliationEngine,
    sink: Arc<dyn EventSink>,
    stats: Arc<SessionStats>,
}

impl Worker {
    async fn run(mut self, mut inbound: mpsc::Receiver<Envelope>, stop: CancellationToken) {
        self.engine.open(Instant::now());
        self.stats.set_phase(self.engine.phase());

        loop {
            let deadline = self.engine.next_flush();
            tokio::select! {
                biased;

                () = stop.cancelled() => break,

                envelope = inbound.recv() => {
                    let Some(envelope) = envelope else {
                        tracing::warn!(
                            sub_id = %self.id,
                            topic = %self.engine.spec().topic,
                            "Feed closed, view no longer updated"
                        );
                        break;
                    };
                    if self.handle(envelope, &stop).await.is_break() {
                        break;
                    }
                }

                () = flush_timer(deadline) => {
                    let events = self.engine.flush_conflated(Instant::now());
                    if self.deliver(events, &stop).await.is_break() {
                        break;
                    }
                }
            }
        }

        self.engine.close();
        self.stats.set_phase(self.engine.phase());
        self.stats.view_rows.store(0, Ordering::Relaxed);
        metrics::set_view_rows(&self.engine.spec().topic, 0);
    }

    async fn handle(&mut self, envelope: Envelope, stop: &CancellationToken) -> ControlFlow<()> {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        let topic = self.engine.spec().topic.clone();

        let message = match classify(envelope, &self.engine.spec().key_fields) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                metrics::record_malformed(&topic, &e);
                tracing::warn!(sub_id = %self.id, topic = %topic, error = %e, "Dropping malformed message");
                return ControlFlow::Continue(());
            }
        };

        metrics::record_message(&topic, message.phase());
        let events = self.engine.apply(message, Instant::now());

        let rows = self.engine.view().len();
        self.stats.set_phase(self.engine.phase());
        self.stats.view_rows.store(rows, Ordering::Relaxed);
        metrics::set_view_rows(&topic, rows);

        self.deliver(events, stop).await
    }

    /// Hand events to the sink in order. A full sink suspends the task, so
    /// each delivery also waits on `stop`; breaks once it fires.
    async fn deliver(&self, events: Vec<ViewEvent>, stop: &CancellationToken) -> ControlFlow<()> {
        let topic = &self.engine.spec().topic;
        for event in events {
            let kind = event.kind();
            let delivered = tokio::select! {
                biased;

                () = stop.cancelled() => return ControlFlow::Break(()),
                delivered = self.sink.deliver(event) => delivered,
            };
            if delivered {
                self.stats.events_delivered.fetch_add(1, Ordering::Relaxed);
                metrics::record_event_delivered(topic, kind);
            } else {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_event_dropped(topic, kind);
                tracing::debug!(sub_id = %self.id, kind, "Consumer gone, event dropped");
            }
        }
        ControlFlow::Continue(())
    }
}

async fn flush_timer(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
