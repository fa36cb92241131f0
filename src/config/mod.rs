mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    EngineSettings, LoggingSettings, ServerSettings, Settings, StoreSettings, SubscriptionDefaults,
    SubscriptionEntry,
};

/// Loads the configuration from `config/default` and `SUBQUEUE_*` environment variables.
///
/// Nested keys are separated by a double underscore, e.g.
/// `SUBQUEUE_ENGINE__RECOVERY_GROUP_SIZE=50`. Anything left unset falls back
/// to `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("SUBQUEUE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    let settings = merge(partial, Settings::default());
    validate(&settings)?;
    Ok(settings)
}

/// Rejects wait times that cannot be turned into a sleep.
fn validate(settings: &Settings) -> Result<(), ConfigError> {
    let sub = &settings.subscription;
    for (key, secs) in [
        ("subscription.wait_sock_err_secs", sub.wait_sock_err_secs),
        ("subscription.wait_non_sock_err_secs", sub.wait_non_sock_err_secs),
    ] {
        if !secs.is_finite() || secs < 0.0 {
            return Err(ConfigError::Message(format!(
                "{key} must be a non-negative number of seconds, got {secs}"
            )));
        }
    }
    Ok(())
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let server = partial.server;
    let engine = partial.engine;
    let sub = partial.subscription;
    let store = partial.store;
    let logging = partial.logging;

    Settings {
        server: ServerSettings {
            name: server
                .and_then(|s| s.name)
                .unwrap_or(default.server.name),
        },
        engine: EngineSettings {
            recovery_group_size: engine
                .as_ref()
                .and_then(|e| e.recovery_group_size)
                .unwrap_or(default.engine.recovery_group_size),
            idle_sleep_ms: engine
                .as_ref()
                .and_then(|e| e.idle_sleep_ms)
                .unwrap_or(default.engine.idle_sleep_ms),
            pull_idle_secs: engine
                .as_ref()
                .and_then(|e| e.pull_idle_secs)
                .unwrap_or(default.engine.pull_idle_secs),
            watermark_delta_secs: engine
                .as_ref()
                .and_then(|e| e.watermark_delta_secs)
                .unwrap_or(default.engine.watermark_delta_secs),
        },
        subscription: SubscriptionDefaults {
            delivery_batch_size: sub
                .as_ref()
                .and_then(|s| s.delivery_batch_size)
                .unwrap_or(default.subscription.delivery_batch_size),
            delivery_max_retry: sub
                .as_ref()
                .and_then(|s| s.delivery_max_retry)
                .unwrap_or(default.subscription.delivery_max_retry),
            task_delivery_interval_ms: sub
                .as_ref()
                .and_then(|s| s.task_delivery_interval_ms)
                .unwrap_or(default.subscription.task_delivery_interval_ms),
            wait_sock_err_secs: sub
                .as_ref()
                .and_then(|s| s.wait_sock_err_secs)
                .unwrap_or(default.subscription.wait_sock_err_secs),
            wait_non_sock_err_secs: sub
                .as_ref()
                .and_then(|s| s.wait_non_sock_err_secs)
                .unwrap_or(default.subscription.wait_non_sock_err_secs),
            wrap_one_msg_in_list: sub
                .as_ref()
                .and_then(|s| s.wrap_one_msg_in_list)
                .unwrap_or(default.subscription.wrap_one_msg_in_list),
        },
        store: StoreSettings {
            path: store
                .as_ref()
                .and_then(|s| s.path.clone())
                .unwrap_or(default.store.path),
            ttl_secs: store.as_ref().and_then(|s| s.ttl_secs).or(default.store.ttl_secs),
        },
        logging: LoggingSettings {
            level: logging
                .and_then(|l| l.level)
                .unwrap_or(default.logging.level),
        },
        subscriptions: partial.subscriptions.unwrap_or(default.subscriptions),
    }
}

#[cfg(test)]
mod tests;
