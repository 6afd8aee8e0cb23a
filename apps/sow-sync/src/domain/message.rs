//! Feed Messages and Phase Classifier
//!
//! The feed sends loosely typed envelopes tagged with a phase string. The
//! classifier turns each one into a closed [`FeedMessage`] so the engine can
//! match on it exhaustively.
//!
//! # Phases
//!
//! | phase    | payload           | meaning                                  |
//! |----------|-------------------|------------------------------------------|
//! | `begin`  | none              | snapshot starts                          |
//! | `row`    | key + fields      | one snapshot record                      |
//! | `end`    | none              | snapshot complete                        |
//! | `update` | key + fields      | insert or merge after the snapshot       |
//! | `evict`  | key               | record no longer matches the subscription |

use serde::{Deserialize, Serialize};

use super::record::{Fields, Record, RecordKey};

// =============================================================================
// Raw Envelope
// =============================================================================

/// Envelope as received from the feed, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Phase tag.
    pub phase: String,
    /// Record key, if the feed assigned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<RecordKey>,
    /// Record fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Fields>,
}

impl Envelope {
    /// Snapshot start.
    #[must_use]
    pub fn begin() -> Self {
        Self::bare(Phase::Begin)
    }

    /// Snapshot end.
    #[must_use]
    pub fn end() -> Self {
        Self::bare(Phase::End)
    }

    /// Snapshot row.
    #[must_use]
    pub fn row(key: impl Into<RecordKey>, fields: Fields) -> Self {
        Self::keyed(Phase::Row, key, Some(fields))
    }

    /// Incremental update.
    #[must_use]
    pub fn update(key: impl Into<RecordKey>, fields: Fields) -> Self {
        Self::keyed(Phase::Update, key, Some(fields))
    }

    /// Eviction.
    #[must_use]
    pub fn evict(key: impl Into<RecordKey>) -> Self {
        Self::keyed(Phase::Evict, key, None)
    }

    fn bare(phase: Phase) -> Self {
        Self {
            phase: phase.as_str().to_string(),
            key: None,
            fields: None,
        }
    }

    fn keyed(phase: Phase, key: impl Into<RecordKey>, fields: Option<Fields>) -> Self {
        Self {
            phase: phase.as_str().to_string(),
            key: Some(key.into()),
            fields,
        }
    }
}

// =============================================================================
// Phase
// =============================================================================

/// Known message phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Snapshot start.
    Begin,
    /// Snapshot row.
    Row,
    /// Snapshot end.
    End,
    /// Incremental update.
    Update,
    /// Eviction.
    Evict,
}

impl Phase {
    /// Parse a wire phase tag. Returns `None` for unknown tags.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "begin" => Some(Self::Begin),
            "row" => Some(Self::Row),
            "end" => Some(Self::End),
            "update" => Some(Self::Update),
            "evict" => Some(Self::Evict),
            _ => None,
        }
    }

    /// Wire tag.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Row => "row",
            Self::End => "end",
            Self::Update => "update",
            Self::Evict => "evict",
        }
    }
}

// =============================================================================
// Classified Message
// =============================================================================

/// A classified feed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// Snapshot start.
    Begin,
    /// Snapshot row.
    Row(Record),
    /// Snapshot end.
    End,
    /// Insert or merge.
    Update(Record),
    /// Remove a key.
    Evict(RecordKey),
}

impl FeedMessage {
    /// Phase of this message.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        match self {
            Self::Begin => Phase::Begin,
            Self::Row(_) => Phase::Row,
            Self::End => Phase::End,
            Self::Update(_) => Phase::Update,
            Self::Evict(_) => Phase::Evict,
        }
    }
}

/// Classification failure. Always local to one message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    /// Phase tag is not one of the known phases.
    #[error("unknown phase: {0}")]
    UnknownPhase(String),
    /// Row, update or evict without a usable key.
    #[error("{} message has no key", .0.as_str())]
    MissingKey(Phase),
}

/// Classify an envelope.
///
/// `key_fields` is used to derive a key when the envelope carries none.
///
/// # Errors
///
/// Returns `ClassifyError::UnknownPhase` for unrecognized tags and
/// `ClassifyError::MissingKey` when a keyed phase has no key.
pub fn classify(envelope: Envelope, key_fields: &[String]) -> Result<FeedMessage, ClassifyError> {
    let Some(phase) = Phase::parse(&envelope.phase) else {
        return Err(ClassifyError::UnknownPhase(envelope.phase));
    };

    match phase {
        Phase::Begin => Ok(FeedMessage::Begin),
        Phase::End => Ok(FeedMessage::End),
        Phase::Row | Phase::Update => {
            let fields = envelope.fields.unwrap_or_default();
            let key = resolve_key(envelope.key, &fields, key_fields)
                .ok_or(ClassifyError::MissingKey(phase))?;
            let record = Record::new(key, fields);
            if phase == Phase::Row {
                Ok(FeedMessage::Row(record))
            } else {
                Ok(FeedMessage::Update(record))
            }
        }
        Phase::Evict => {
            let fields = envelope.fields.unwrap_or_default();
            resolve_key(envelope.key, &fields, key_fields)
                .map(FeedMessage::Evict)
                .ok_or(ClassifyError::MissingKey(phase))
        }
    }
}

fn resolve_key(key: Option<RecordKey>, fields: &Fields, key_fields: &[String]) -> Option<RecordKey> {
    key.filter(|k| !k.is_empty())
        .or_else(|| Record::derive_key(fields, key_fields))
}
