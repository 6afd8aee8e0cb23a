//! Application Services
//!
//! Services that orchestrate the engine and coordinate between ports.
//!
//! - `SubscriptionService`: opens and closes subscription sessions
//! - `ResubscriptionController`: swaps the active session when the spec changes

mod controller;
mod session;

pub use controller::{ControllerError, ResubscriptionController};
pub use session::{
    SessionError, SessionHandle, SessionSettings, SessionStats, SessionStatsSnapshot,
    SubscriptionService,
};
