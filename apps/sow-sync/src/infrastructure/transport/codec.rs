//! Feed Wire Codec
//!
//! JSON text frames in both directions.
//!
//! # Outbound
//!
//! ```json
//! {"command":"subscribe","sub_id":"…","topic":"orders","filter":"/side = 'B'",
//!  "order_by":{"field":"bid","direction":"desc"},
//!  "options":{"conflation_ms":250,"top_n":50,"report_evictions":true}}
//! {"command":"unsubscribe","sub_id":"…"}
//! ```
//!
//! # Inbound
//!
//! A frame is a single object or an array of objects. Each object is either
//! an acknowledgement (has `ack`) or an envelope routed by `sub_id`.
//!
//! ```json
//! {"ack":"subscribe","sub_id":"…","status":"ok"}
//! [{"sub_id":"…","phase":"row","key":"AAPL","fields":{"bid":100}}]
//! ```

use serde::{Deserialize, Serialize};

use crate::application::ports::{SubscribeCommand, SubscriptionId};
use crate::domain::message::Envelope;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is neither an acknowledgement nor an envelope.
    #[error("invalid frame: {0}")]
    InvalidFormat(String),
}

// =============================================================================
// Outbound
// =============================================================================

/// Command sent to the feed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum OutboundCommand<'a> {
    /// Open a subscription.
    Subscribe {
        /// Client-chosen subscription id.
        sub_id: &'a SubscriptionId,
        /// Topic, filter, ordering and options.
        #[serde(flatten)]
        spec: &'a SubscribeCommand,
    },
    /// Close a subscription.
    Unsubscribe {
        /// Subscription id.
        sub_id: &'a SubscriptionId,
    },
}

impl OutboundCommand<'_> {
    /// Command name, as used in acknowledgements.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Which command an acknowledgement answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckKind {
    /// Subscribe.
    Subscribe,
    /// Unsubscribe.
    Unsubscribe,
}

impl AckKind {
    /// Command name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Acknowledgement outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Accepted.
    Ok,
    /// Refused.
    Error,
}

/// Feed acknowledgement of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFrame {
    /// Command acknowledged.
    pub ack: AckKind,
    /// Subscription id.
    pub sub_id: SubscriptionId,
    /// Outcome.
    pub status: AckStatus,
    /// Refusal reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RoutedEnvelope {
    sub_id: SubscriptionId,
    #[serde(flatten)]
    envelope: Envelope,
}

/// One decoded inbound object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Command acknowledgement.
    Ack(AckFrame),
    /// Data for one subscription.
    Envelope {
        /// Target subscription.
        sub_id: SubscriptionId,
        /// Payload.
        envelope: Envelope,
    },
}

// =============================================================================
// Codec
// =============================================================================

/// JSON codec for the feed protocol.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON or an object is neither an
    /// acknowledgement nor an envelope.
    pub fn decode(&self, text: &str) -> Result<Vec<InboundFrame>, CodecError> {
        let trimmed = text.trim();

        if trimmed.starts_with('[') {
            let raw: Vec<serde_json::Value> = serde_json::from_str(trimmed)?;
            raw.into_iter().map(|value| self.decode_value(value)).collect()
        } else if trimmed.starts_with('{') {
            let value: serde_json::Value = serde_json::from_str(trimmed)?;
            Ok(vec![self.decode_value(value)?])
        } else {
            Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {}...",
                trimmed.chars().take(50).collect::<String>()
            )))
        }
    }

    fn decode_value(&self, value: serde_json::Value) -> Result<InboundFrame, CodecError> {
        if value.get("ack").is_some() {
            return Ok(InboundFrame::Ack(serde_json::from_value(value)?));
        }
        if value.get("sub_id").is_none() {
            return Err(CodecError::InvalidFormat(
                "object has neither `ack` nor `sub_id`".to_string(),
            ));
        }
        let routed: RoutedEnvelope = serde_json::from_value(value)?;
        Ok(InboundFrame::Envelope {
            sub_id: routed.sub_id,
            envelope: routed.envelope,
        })
    }

    /// Encode a command.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self, command: &OutboundCommand<'_>) -> Result<String, CodecError> {
        Ok(serde_json::to_string(command)?)
    }
}
