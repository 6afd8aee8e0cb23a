//! Configuration Module
//!
//! Configuration loading for the sync service.

mod settings;

pub use settings::{ChannelSettings, ConfigError, FeedSettings, ServerSettings, SyncConfig};
