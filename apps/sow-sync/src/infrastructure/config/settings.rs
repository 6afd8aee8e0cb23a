//! Sync Configuration Settings
//!
//! Configuration types for the sync service, loaded from environment variables.

use std::time::Duration;

use crate::application::services::SessionSettings;
use crate::domain::spec::{Bound, OrderBy, SubscriptionSpec};
use crate::infrastructure::transport::WsTransportConfig;

/// Feed connection settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// WebSocket endpoint.
    pub url: String,
    /// Limit on establishing the connection.
    pub connect_timeout: Duration,
    /// Limit on waiting for a subscribe/unsubscribe acknowledgement.
    pub ack_timeout: Duration,
}

impl FeedSettings {
    /// Default connect timeout.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default acknowledgement timeout.
    pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
}

impl From<&FeedSettings> for WsTransportConfig {
    fn from(settings: &FeedSettings) -> Self {
        let mut config = Self::new(settings.url.clone());
        config.connect_timeout = settings.connect_timeout;
        config.ack_timeout = settings.ack_timeout;
        config
    }
}

/// Channel capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Transport → engine channel.
    pub inbound_capacity: usize,
    /// Engine → consumer bridge.
    pub bridge_capacity: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            inbound_capacity: 1024,
            bridge_capacity: 1024,
        }
    }
}

impl From<ChannelSettings> for SessionSettings {
    fn from(settings: ChannelSettings) -> Self {
        Self {
            inbound_capacity: settings.inbound_capacity,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check and metrics HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Feed connection settings.
    pub feed: FeedSettings,
    /// Channel capacities.
    pub channels: ChannelSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Subscription to open, if `SOW_TOPIC` is set.
    pub subscription: Option<SubscriptionSpec>,
}

impl SyncConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from any key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `SOW_FEED_URL` is missing or empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("SOW_FEED_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("SOW_FEED_URL".to_string()))?;

        if url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("SOW_FEED_URL".to_string()));
        }

        let feed = FeedSettings {
            url,
            connect_timeout: parse_duration_millis(
                &lookup,
                "SOW_CONNECT_TIMEOUT_MS",
                FeedSettings::DEFAULT_CONNECT_TIMEOUT,
            ),
            ack_timeout: parse_duration_millis(
                &lookup,
                "SOW_ACK_TIMEOUT_MS",
                FeedSettings::DEFAULT_ACK_TIMEOUT,
            ),
        };

        let channels = ChannelSettings {
            inbound_capacity: parse_or(
                &lookup,
                "SOW_INBOUND_CAPACITY",
                ChannelSettings::default().inbound_capacity,
            ),
            bridge_capacity: parse_or(
                &lookup,
                "SOW_BRIDGE_CAPACITY",
                ChannelSettings::default().bridge_capacity,
            ),
        };

        let server = ServerSettings {
            health_port: parse_or(
                &lookup,
                "SOW_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let subscription = non_empty(&lookup, "SOW_TOPIC").map(|topic| {
            let mut spec = SubscriptionSpec::new(topic);
            spec.filter = non_empty(&lookup, "SOW_FILTER");
            spec.order_by = lookup("SOW_ORDER_BY").and_then(|s| OrderBy::parse(&s));
            spec.bound = Bound {
                top_n: lookup("SOW_TOP_N")
                    .and_then(|v| v.trim().parse().ok())
                    .filter(|n| *n > 0),
                skip_n: parse_or(&lookup, "SOW_SKIP_N", 0),
            };
            spec.conflation = lookup("SOW_CONFLATION_MS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis);
            spec.report_evictions = parse_bool(&lookup, "SOW_REPORT_EVICTIONS", true);
            spec.key_fields = lookup("SOW_KEY_FIELDS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|f| !f.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            spec
        });

        Ok(Self {
            feed,
            channels,
            server,
            subscription,
        })
    }

    /// The configured subscription.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `SOW_TOPIC` was not set.
    pub fn require_subscription(&self) -> Result<&SubscriptionSpec, ConfigError> {
        self.subscription
            .as_ref()
            .ok_or_else(|| ConfigError::MissingEnvVar("SOW_TOPIC".to_string()))
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_lowercase()).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn parse_duration_millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::domain::spec::Direction;

    fn config(vars: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        SyncConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn feed_url_is_required() {
        assert!(matches!(config(&[]), Err(ConfigError::MissingEnvVar(v)) if v == "SOW_FEED_URL"));
        assert!(matches!(
            config(&[("SOW_FEED_URL", " ")]),
            Err(ConfigError::EmptyValue(_))
        ));
    }

    #[test]
    fn defaults() {
        let config = config(&[("SOW_FEED_URL", "ws://localhost:9000")]).unwrap();

        assert_eq!(config.feed.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.feed.ack_timeout, Duration::from_secs(5));
        assert_eq!(config.channels, ChannelSettings::default());
        assert_eq!(config.server.health_port, 8083);
        assert!(config.subscription.is_none());
        assert!(matches!(
            config.require_subscription(),
            Err(ConfigError::MissingEnvVar(v)) if v == "SOW_TOPIC"
        ));
    }

    #[test]
    fn full_subscription() {
        let config = config(&[
            ("SOW_FEED_URL", "ws://localhost:9000"),
            ("SOW_TOPIC", "orders"),
            ("SOW_FILTER", "/side = 'B'"),
            ("SOW_ORDER_BY", "bid:desc"),
            ("SOW_KEY_FIELDS", "venue, symbol"),
            ("SOW_TOP_N", "50"),
            ("SOW_SKIP_N", "5"),
            ("SOW_CONFLATION_MS", "250"),
            ("SOW_REPORT_EVICTIONS", "false"),
            ("SOW_INBOUND_CAPACITY", "16"),
            ("SOW_HEALTH_PORT", "0"),
        ])
        .unwrap();

        let spec = config.require_subscription().unwrap();
        assert_eq!(spec.topic, "orders");
        assert_eq!(spec.filter.as_deref(), Some("/side = 'B'"));
        assert_eq!(spec.order_by, Some(OrderBy::new("bid", Direction::Desc)));
        assert_eq!(spec.key_fields, vec!["venue", "symbol"]);
        assert_eq!(
            spec.bound,
            Bound {
                top_n: Some(50),
                skip_n: 5
            }
        );
        assert_eq!(spec.conflation, Some(Duration::from_millis(250)));
        assert!(!spec.report_evictions);
        assert_eq!(config.channels.inbound_capacity, 16);
        assert_eq!(config.server.health_port, 0);
    }

    #[test]
    fn unparsable_values_fall_back() {
        let config = config(&[
            ("SOW_FEED_URL", "ws://localhost:9000"),
            ("SOW_TOPIC", "orders"),
            ("SOW_TOP_N", "many"),
            ("SOW_CONFLATION_MS", "0"),
            ("SOW_REPORT_EVICTIONS", "maybe"),
            ("SOW_ACK_TIMEOUT_MS", "-1"),
        ])
        .unwrap();

        let spec = config.require_subscription().unwrap();
        assert_eq!(spec.bound, Bound::unbounded());
        assert_eq!(spec.conflation, None);
        assert!(spec.report_evictions);
        assert_eq!(config.feed.ack_timeout, Duration::from_secs(5));
    }

    #[test]
    fn transport_config_from_feed_settings() {
        let config = config(&[
            ("SOW_FEED_URL", "wss://feed.example/ws"),
            ("SOW_CONNECT_TIMEOUT_MS", "1500"),
        ])
        .unwrap();

        let transport = WsTransportConfig::from(&config.feed);
        assert_eq!(transport.url, "wss://feed.example/ws");
        assert_eq!(transport.connect_timeout, Duration::from_millis(1500));
    }
}
