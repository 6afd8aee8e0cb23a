//! Subscription Specification
//!
//! Parameters a consumer supplies when it asks to mirror a topic: the topic
//! itself, an optional filter expression evaluated by the feed, optional
//! ordering, an optional top-N/skip-N bound and an optional conflation
//! interval.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// =============================================================================
// Ordering
// =============================================================================

/// Sort direction for the ordering field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Smallest value first.
    #[default]
    Asc,
    /// Largest value first.
    Desc,
}

impl Direction {
    /// Parse direction from string. Anything but `desc` is ascending.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "desc" | "descending" => Self::Desc,
            _ => Self::Asc,
        }
    }

    /// Get the direction name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// Ordering key and direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Field to order by.
    pub field: String,
    /// Sort direction.
    #[serde(default)]
    pub direction: Direction,
}

impl OrderBy {
    /// Create an ordering.
    #[must_use]
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    /// Parse `field` or `field:asc|desc`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (field, direction) = match s.split_once(':') {
            Some((field, dir)) => (field.trim(), Direction::from_str_case_insensitive(dir)),
            None => (s.trim(), Direction::Asc),
        };

        if field.is_empty() {
            None
        } else {
            Some(Self::new(field, direction))
        }
    }
}

// =============================================================================
// Bound
// =============================================================================

/// Row cap of a view: keep at most `top_n` rows after skipping `skip_n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bound {
    /// Maximum number of rows retained (`None` = unbounded).
    pub top_n: Option<usize>,
    /// Number of leading ranked rows skipped.
    #[serde(default)]
    pub skip_n: usize,
}

impl Bound {
    /// Unbounded view.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            top_n: None,
            skip_n: 0,
        }
    }

    /// Keep the first `n` ranked rows.
    #[must_use]
    pub const fn top(n: usize) -> Self {
        Self {
            top_n: Some(n),
            skip_n: 0,
        }
    }

    /// Check whether the bound caps nothing.
    #[must_use]
    pub const fn is_unbounded(&self) -> bool {
        self.top_n.is_none() && self.skip_n == 0
    }
}

// =============================================================================
// Subscription Spec
// =============================================================================

/// Everything needed to open one subscription.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use sow_sync::domain::spec::{Direction, SubscriptionSpec};
///
/// let spec = SubscriptionSpec::new("ticker")
///     .with_filter("/venue = 'XNAS'")
///     .order_by("bid", Direction::Desc)
///     .top_n(50)
///     .conflate(Duration::from_millis(250));
///
/// assert!(spec.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    /// Topic to mirror.
    pub topic: String,
    /// Filter expression, evaluated by the feed.
    pub filter: Option<String>,
    /// Ordering of the view.
    pub order_by: Option<OrderBy>,
    /// Row cap.
    #[serde(default)]
    pub bound: Bound,
    /// Minimum time between delivered updates for one key.
    #[serde(default, with = "duration_millis")]
    pub conflation: Option<Duration>,
    /// Ask the feed to report records leaving the filter.
    #[serde(default = "default_report_evictions")]
    pub report_evictions: bool,
    /// Fields a key is derived from when an envelope carries none.
    #[serde(default)]
    pub key_fields: Vec<String>,
}

const fn default_report_evictions() -> bool {
    true
}

impl SubscriptionSpec {
    /// Create a spec for a topic with no filter, ordering, bound or conflation.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            filter: None,
            order_by: None,
            bound: Bound::unbounded(),
            conflation: None,
            report_evictions: default_report_evictions(),
            key_fields: Vec::new(),
        }
    }

    /// Set the filter expression.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set the ordering.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy::new(field, direction));
        self
    }

    /// Keep at most `n` rows.
    #[must_use]
    pub const fn top_n(mut self, n: usize) -> Self {
        self.bound.top_n = Some(n);
        self
    }

    /// Skip the first `n` ranked rows.
    #[must_use]
    pub const fn skip_n(mut self, n: usize) -> Self {
        self.bound.skip_n = n;
        self
    }

    /// Coalesce updates for one key arriving within `interval`.
    #[must_use]
    pub const fn conflate(mut self, interval: Duration) -> Self {
        self.conflation = Some(interval);
        self
    }

    /// Derive record keys from these fields when the feed sends none.
    #[must_use]
    pub fn key_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Set whether the feed should report evictions.
    #[must_use]
    pub const fn report_evictions(mut self, report: bool) -> Self {
        self.report_evictions = report;
        self
    }

    /// Check the spec is usable.
    ///
    /// # Errors
    ///
    /// Returns `SpecError` if the topic is blank, `top_n` is zero or the
    /// conflation interval is zero.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.topic.trim().is_empty() {
            return Err(SpecError::EmptyTopic);
        }
        if self.bound.top_n == Some(0) {
            return Err(SpecError::ZeroTopN);
        }
        if self.conflation.is_some_and(|d| d.is_zero()) {
            return Err(SpecError::ZeroConflation);
        }
        if let Some(order_by) = &self.order_by
            && order_by.field.trim().is_empty()
        {
            return Err(SpecError::EmptyOrderField);
        }
        Ok(())
    }
}

/// Invalid subscription spec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    /// Topic is empty.
    #[error("subscription topic cannot be empty")]
    EmptyTopic,
    /// `top_n` of zero would keep nothing.
    #[error("top_n must be greater than zero")]
    ZeroTopN,
    /// Conflation interval of zero.
    #[error("conflation interval must be greater than zero")]
    ZeroConflation,
    /// Ordering field is empty.
    #[error("order_by field cannot be empty")]
    EmptyOrderField,
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
