//! Subscription configuration and registry
//!
//! A `SubscriptionConfig` carries everything a delivery task needs to know about
//! its subscription. The registry keeps one `watch` channel per subscription key,
//! so a running task sees a consistent, versioned snapshot whenever the
//! configuration is edited.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::SubscriptionDefaults;
use crate::utils::error::{PubSubError, PubSubResult};

/// Retry limit used when a subscription sets none (or zero).
pub const DEFAULT_DELIVERY_MAX_RETRY: u32 = 123_456_789;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMethod {
    /// The engine pushes messages to the subscriber.
    #[default]
    Notify,
    /// The subscriber pulls messages on demand.
    Pull,
    /// Push over a WebSocket connection owned by the subscriber.
    WebSocket,
}

impl DeliveryMethod {
    pub fn is_push(self) -> bool {
        matches!(self, Self::Notify | Self::WebSocket)
    }
}

impl std::fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Notify => "notify",
            Self::Pull => "pull",
            Self::WebSocket => "web-socket",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionConfig {
    pub sub_key: String,
    pub topic_name: String,
    pub endpoint_name: String,
    pub delivery_method: DeliveryMethod,
    pub delivery_batch_size: usize,
    pub delivery_max_retry: u32,
    pub task_delivery_interval: Duration,
    pub wait_sock_err: Duration,
    pub wait_non_sock_err: Duration,
    pub wrap_one_msg_in_list: bool,
}

impl SubscriptionConfig {
    pub fn new(sub_key: impl Into<String>, topic_name: impl Into<String>) -> Self {
        Self::with_defaults(sub_key, topic_name, &SubscriptionDefaults::default())
    }

    pub fn with_defaults(
        sub_key: impl Into<String>,
        topic_name: impl Into<String>,
        defaults: &SubscriptionDefaults,
    ) -> Self {
        let fallback = SubscriptionDefaults::default();
        Self {
            sub_key: sub_key.into(),
            topic_name: topic_name.into(),
            endpoint_name: String::new(),
            delivery_method: DeliveryMethod::Notify,
            delivery_batch_size: defaults.delivery_batch_size,
            delivery_max_retry: defaults.delivery_max_retry,
            task_delivery_interval: Duration::from_millis(defaults.task_delivery_interval_ms),
            wait_sock_err: secs_or(defaults.wait_sock_err_secs, fallback.wait_sock_err_secs),
            wait_non_sock_err: secs_or(defaults.wait_non_sock_err_secs, fallback.wait_non_sock_err_secs),
            wrap_one_msg_in_list: defaults.wrap_one_msg_in_list,
        }
    }

    /// With a batch size above one a list is always sent; with exactly one,
    /// only if the subscription asks for single messages to be wrapped.
    pub fn wrap_in_list(&self) -> bool {
        self.delivery_batch_size != 1 || self.wrap_one_msg_in_list
    }

    pub fn batch_size(&self) -> usize {
        self.delivery_batch_size.max(1)
    }

    /// Zero means the subscription never set a limit.
    pub fn max_retry(&self) -> u32 {
        match self.delivery_max_retry {
            0 => DEFAULT_DELIVERY_MAX_RETRY,
            n => n,
        }
    }
}

/// Negative, NaN or infinite waits fall back to `fallback` seconds.
fn secs_or(secs: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| {
        warn!(secs, fallback, "Invalid wait time, using the default");
        Duration::from_secs_f64(fallback)
    })
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, watch::Sender<SubscriptionConfig>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription and returns a receiver for its configuration.
    /// Registering a known key keeps the current configuration.
    pub fn register(&self, config: SubscriptionConfig) -> watch::Receiver<SubscriptionConfig> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(config.sub_key.clone())
            .or_insert_with(|| watch::channel(config).0)
            .subscribe()
    }

    /// Replaces the configuration of a known subscription.
    pub fn update(&self, config: SubscriptionConfig) -> PubSubResult<()> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let sender = entries
            .get(&config.sub_key)
            .ok_or_else(|| PubSubError::unknown_subscription(&config.sub_key))?;

        info!(sub_key = %config.sub_key, method = %config.delivery_method, "Updating subscription config");
        sender.send_replace(config);
        Ok(())
    }

    pub fn remove(&self, sub_key: &str) -> Option<SubscriptionConfig> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(sub_key).map(|sender| sender.borrow().clone())
    }

    pub fn contains(&self, sub_key: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(sub_key)
    }
}
