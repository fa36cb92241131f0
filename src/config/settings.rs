use std::time::Duration;

use serde::Deserialize;

use crate::broker::subscription::{DEFAULT_DELIVERY_MAX_RETRY, DeliveryMethod, SubscriptionConfig};

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub engine: EngineSettings,
    pub subscription: SubscriptionDefaults,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
    /// Subscriptions started by the `serve` command.
    pub subscriptions: Vec<SubscriptionEntry>,
}

/// Identity of this process, stamped on every transient message it produces.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub name: String,
}

/// Timings and sizes shared by every delivery task.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    /// How many durable messages are fetched per query when a task recovers its backlog.
    pub recovery_group_size: usize,
    /// Sleep between wake checks when there is nothing to deliver.
    pub idle_sleep_ms: u64,
    /// Sleep between loop iterations of a pull-mode task.
    pub pull_idle_secs: u64,
    /// How far behind "now" a durable watermark is stored after a fetch.
    pub watermark_delta_secs: i64,
}

impl EngineSettings {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn pull_idle(&self) -> Duration {
        Duration::from_secs(self.pull_idle_secs)
    }

    pub fn watermark_delta_ms(&self) -> i64 {
        self.watermark_delta_secs.saturating_mul(1000)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            recovery_group_size: 20,
            idle_sleep_ms: 100,
            pull_idle_secs: 5,
            watermark_delta_secs: 60,
        }
    }
}

/// Per-subscription values used when a subscription does not set its own.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SubscriptionDefaults {
    pub delivery_batch_size: usize,
    /// Zero selects the built-in limit.
    pub delivery_max_retry: u32,
    pub task_delivery_interval_ms: u64,
    pub wait_sock_err_secs: f64,
    pub wait_non_sock_err_secs: f64,
    pub wrap_one_msg_in_list: bool,
}

impl Default for SubscriptionDefaults {
    fn default() -> Self {
        Self {
            delivery_batch_size: 1,
            delivery_max_retry: DEFAULT_DELIVERY_MAX_RETRY,
            task_delivery_interval_ms: 2000,
            wait_sock_err_secs: 10.0,
            wait_non_sock_err_secs: 30.0,
            wrap_one_msg_in_list: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StoreSettings {
    pub path: String,
    pub ttl_secs: Option<i64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// A subscription declared in configuration.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SubscriptionEntry {
    pub sub_key: String,
    pub topic_name: String,
    #[serde(default)]
    pub endpoint_name: String,
    #[serde(default)]
    pub delivery_method: DeliveryMethod,
    pub delivery_batch_size: Option<usize>,
    pub delivery_max_retry: Option<u32>,
    pub wrap_one_msg_in_list: Option<bool>,
}

impl SubscriptionEntry {
    pub fn to_config(&self, defaults: &SubscriptionDefaults) -> SubscriptionConfig {
        let mut config = SubscriptionConfig::with_defaults(&self.sub_key, &self.topic_name, defaults);
        config.endpoint_name = self.endpoint_name.clone();
        config.delivery_method = self.delivery_method;
        if let Some(size) = self.delivery_batch_size {
            config.delivery_batch_size = size;
        }
        if let Some(max_retry) = self.delivery_max_retry {
            config.delivery_max_retry = max_retry;
        }
        if let Some(wrap) = self.wrap_one_msg_in_list {
            config.wrap_one_msg_in_list = wrap;
        }
        config
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled in from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub engine: Option<PartialEngineSettings>,
    pub subscription: Option<PartialSubscriptionDefaults>,
    pub store: Option<PartialStoreSettings>,
    pub logging: Option<PartialLoggingSettings>,
    pub subscriptions: Option<Vec<SubscriptionEntry>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialEngineSettings {
    pub recovery_group_size: Option<usize>,
    pub idle_sleep_ms: Option<u64>,
    pub pull_idle_secs: Option<u64>,
    pub watermark_delta_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialSubscriptionDefaults {
    pub delivery_batch_size: Option<usize>,
    pub delivery_max_retry: Option<u32>,
    pub task_delivery_interval_ms: Option<u64>,
    pub wait_sock_err_secs: Option<f64>,
    pub wait_non_sock_err_secs: Option<f64>,
    pub wrap_one_msg_in_list: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStoreSettings {
    pub path: Option<String>,
    pub ttl_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                name: "subqueue-1".to_string(),
            },
            engine: EngineSettings::default(),
            subscription: SubscriptionDefaults::default(),
            store: StoreSettings {
                path: "data/subqueue".to_string(),
                ttl_secs: None,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            subscriptions: Vec::new(),
        }
    }
}
