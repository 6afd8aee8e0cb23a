//! Resubscription Controller
//!
//! Owns the single active session for a consumer and swaps it when the
//! subscription parameters change. The old session is always fully closed
//! before the new one is opened, so the consumer never sees events from two
//! specs interleaved.
//!
//! Concurrent requests are serialized. Each request takes a generation
//! number; while one close is in flight, newer requests overwrite the pending
//! spec. When the close finishes only the newest pending spec is opened and
//! every older caller gets [`ControllerError::Superseded`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use super::session::{SessionError, SessionHandle, SessionStatsSnapshot, SubscriptionService};
use crate::application::ports::{EventSink, SubscriptionId};
use crate::domain::spec::SubscriptionSpec;

/// Controller failures.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// A newer request replaced this one before it was applied.
    #[error("request {requested} superseded by request {applied}")]
    Superseded {
        /// Generation of the superseded request.
        requested: u64,
        /// Generation that was applied instead.
        applied: u64,
    },

    /// Opening the new session failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The request was applied but no session is open (the open failed).
    #[error("no active session")]
    NoActiveSession,
}

#[derive(Debug, Default)]
struct ControllerState {
    current: Option<SessionHandle>,
    applied: u64,
}

/// Serializes spec changes for one consumer.
pub struct ResubscriptionController {
    service: SubscriptionService,
    sink: Arc<dyn EventSink>,
    state: Mutex<ControllerState>,
    pending: parking_lot::Mutex<Option<(u64, SubscriptionSpec)>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for ResubscriptionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResubscriptionController")
            .field("service", &self.service)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ResubscriptionController {
    /// Create a controller with no active session.
    #[must_use]
    pub fn new(service: SubscriptionService, sink: Arc<dyn EventSink>) -> Self {
        Self {
            service,
            sink,
            state: Mutex::new(ControllerState::default()),
            pending: parking_lot::Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Close the current session (if any) and open one for `spec`.
    ///
    /// # Errors
    ///
    /// - `ControllerError::Superseded` if a newer request arrived before this
    ///   one was applied
    /// - `ControllerError::Session` if opening the new session failed
    /// - `ControllerError::NoActiveSession` if this request was applied by a
    ///   concurrent caller whose open failed
    pub async fn reparametrize(
        &self,
        spec: SubscriptionSpec,
    ) -> Result<SubscriptionId, ControllerError> {
        let requested = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut pending = self.pending.lock();
            if pending.as_ref().is_none_or(|(generation, _)| *generation < requested) {
                *pending = Some((requested, spec));
            }
        }

        let mut state = self.state.lock().await;

        if state.applied >= requested {
            // A later caller already applied a spec on our behalf.
            if state.applied > requested {
                return Err(ControllerError::Superseded {
                    requested,
                    applied: state.applied,
                });
            }
            return state
                .current
                .as_ref()
                .map(|handle| handle.id().clone())
                .ok_or(ControllerError::NoActiveSession);
        }

        if let Some(old) = state.current.take() {
            let old_id = old.id().clone();
            if let Err(e) = self.service.close(old).await {
                tracing::warn!(sub_id = %old_id, error = %e, "Previous session did not close cleanly");
            }
        }

        let Some((applied, spec)) = self.pending.lock().take() else {
            // Another holder of the lock drained the slot; nothing newer exists.
            return Err(ControllerError::NoActiveSession);
        };
        state.applied = applied;

        tracing::info!(
            generation = applied,
            topic = %spec.topic,
            superseded = applied != requested,
            "Applying subscription spec"
        );

        let opened = self.service.open(spec, Arc::clone(&self.sink)).await;

        if applied != requested {
            if let Err(e) = &opened {
                tracing::warn!(generation = applied, error = %e, "Opening superseding spec failed");
            }
            state.current = opened.ok();
            return Err(ControllerError::Superseded { requested, applied });
        }

        let handle = opened?;
        let id = handle.id().clone();
        state.current = Some(handle);
        Ok(id)
    }

    /// Close the active session, if any.
    ///
    /// # Errors
    ///
    /// Returns the close error of the active session.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        self.pending.lock().take();
        state.applied = self.generation.load(Ordering::SeqCst);
        match state.current.take() {
            Some(handle) => self.service.close(handle).await.map_err(ControllerError::from),
            None => Ok(()),
        }
    }

    /// Id of the active session.
    pub async fn current(&self) -> Option<SubscriptionId> {
        self.state
            .lock()
            .await
            .current
            .as_ref()
            .map(|handle| handle.id().clone())
    }

    /// Counters of the active session.
    pub async fn current_stats(&self) -> Option<SessionStatsSnapshot> {
        self.state
            .lock()
            .await
            .current
            .as_ref()
            .map(|handle| handle.stats().snapshot())
    }

    /// The service sessions are opened through.
    #[must_use]
    pub const fn service(&self) -> &SubscriptionService {
        &self.service
    }
}
