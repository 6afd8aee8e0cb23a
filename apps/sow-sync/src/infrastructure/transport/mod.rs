//! Feed Transports
//!
//! [`WsTransport`] talks to a real feed over WebSocket; [`LoopbackTransport`]
//! is an in-process stand-in with the same contract.

pub mod codec;
pub mod loopback;
pub mod websocket;

pub use codec::{CodecError, JsonCodec};
pub use loopback::{LoopbackCall, LoopbackTransport};
pub use websocket::{WsTransport, WsTransportConfig};
