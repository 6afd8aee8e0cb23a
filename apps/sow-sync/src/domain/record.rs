//! Record Types
//!
//! A record is one row of the remote state of the world: an identity key
//! plus a flat map of field name to JSON value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity key of a record. Unique within one view.
pub type RecordKey = String;

/// Field name to value mapping carried by rows and updates.
pub type Fields = serde_json::Map<String, Value>;

/// Separator used when a key is derived from several fields.
const DERIVED_KEY_SEPARATOR: char = '|';

/// A keyed row of the materialized view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Identity key.
    pub key: RecordKey,
    /// Field values.
    #[serde(default)]
    pub fields: Fields,
}

impl Record {
    /// Create a record.
    #[must_use]
    pub fn new(key: impl Into<RecordKey>, fields: Fields) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }

    /// Get a field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Shallow merge: every incoming field overwrites the stored one,
    /// fields absent from `incoming` are kept.
    pub fn merge(&mut self, incoming: &Fields) {
        for (name, value) in incoming {
            self.fields.insert(name.clone(), value.clone());
        }
    }

    /// Derive an identity key from one or more fields.
    ///
    /// Returns `None` if `key_fields` is empty or any of them is missing or null.
    #[must_use]
    pub fn derive_key(fields: &Fields, key_fields: &[String]) -> Option<RecordKey> {
        if key_fields.is_empty() {
            return None;
        }

        let mut parts = Vec::with_capacity(key_fields.len());
        for name in key_fields {
            match fields.get(name)? {
                Value::Null => return None,
                Value::String(s) => parts.push(s.clone()),
                other => parts.push(other.to_string()),
            }
        }

        Some(parts.join(&DERIVED_KEY_SEPARATOR.to_string()))
    }
}
