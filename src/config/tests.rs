use super::load_config;
use super::settings::{Settings, SubscriptionDefaults, SubscriptionEntry};
use crate::broker::subscription::{DEFAULT_DELIVERY_MAX_RETRY, DeliveryMethod, SubscriptionConfig};

use serial_test::serial;
use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.name, "subqueue-1");
    assert_eq!(settings.engine.recovery_group_size, 20);
    assert_eq!(settings.engine.idle_sleep(), Duration::from_millis(100));
    assert_eq!(settings.engine.pull_idle(), Duration::from_secs(5));
    assert_eq!(settings.engine.watermark_delta_ms(), 60_000);
    assert_eq!(settings.subscription.delivery_batch_size, 1);
    assert_eq!(settings.subscription.delivery_max_retry, 123_456_789);
    assert_eq!(settings.subscription.task_delivery_interval_ms, 2000);
    assert_eq!(settings.subscription.wait_sock_err_secs, 10.0);
    assert_eq!(settings.subscription.wait_non_sock_err_secs, 30.0);
    assert!(!settings.subscription.wrap_one_msg_in_list);
    assert_eq!(settings.store.ttl_secs, None);
    assert_eq!(settings.logging.level, "info");
    assert!(settings.subscriptions.is_empty());
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [server]
        name = "server-b"

        [engine]
        recovery_group_size = 50

        [subscription]
        delivery_batch_size = 10
        wait_sock_err_secs = 2.5

        [store]
        path = "/var/lib/subqueue"
        ttl_secs = 3600

        [[subscriptions]]
        sub_key = "sk.orders.1"
        topic_name = "/orders"
        delivery_method = "pull"
        wrap_one_msg_in_list = true
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();
    env::set_current_dir(orig).expect("restore cwd");
    let cfg = cfg.expect("load_config failed");

    assert_eq!(cfg.server.name, "server-b");
    assert_eq!(cfg.engine.recovery_group_size, 50);
    assert_eq!(cfg.engine.idle_sleep_ms, 100);
    assert_eq!(cfg.subscription.delivery_batch_size, 10);
    assert_eq!(cfg.subscription.wait_sock_err_secs, 2.5);
    assert_eq!(cfg.subscription.wait_non_sock_err_secs, 30.0);
    assert_eq!(cfg.store.path, "/var/lib/subqueue");
    assert_eq!(cfg.store.ttl_secs, Some(3600));

    assert_eq!(cfg.subscriptions.len(), 1);
    let sub = cfg.subscriptions[0].to_config(&cfg.subscription);
    assert_eq!(sub.sub_key, "sk.orders.1");
    assert_eq!(sub.delivery_method, DeliveryMethod::Pull);
    assert_eq!(sub.delivery_batch_size, 10);
    assert!(sub.wrap_one_msg_in_list);
    assert_eq!(sub.wait_sock_err, Duration::from_millis(2500));
}

#[test]
#[serial]
fn test_environment_overrides_defaults() {
    temp_env::with_vars(
        [
            ("SUBQUEUE_SERVER__NAME", Some("server-env")),
            ("SUBQUEUE_ENGINE__WATERMARK_DELTA_SECS", Some("5")),
            ("SUBQUEUE_SUBSCRIPTION__DELIVERY_MAX_RETRY", Some("3")),
            ("SUBQUEUE_LOGGING__LEVEL", Some("debug")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.server.name, "server-env");
            assert_eq!(cfg.engine.watermark_delta_secs, 5);
            assert_eq!(cfg.subscription.delivery_max_retry, 3);
            assert_eq!(cfg.logging.level, "debug");
            assert_eq!(cfg.engine.recovery_group_size, 20);
        },
    );
}

#[test]
#[serial]
fn test_negative_wait_time_is_rejected() {
    temp_env::with_vars([("SUBQUEUE_SUBSCRIPTION__WAIT_SOCK_ERR_SECS", Some("-1"))], || {
        let err = load_config().expect_err("negative wait accepted");
        assert!(err.to_string().contains("wait_sock_err_secs"));
    });
}

#[test]
fn test_invalid_wait_times_fall_back_to_defaults() {
    let defaults = SubscriptionDefaults {
        wait_sock_err_secs: -1.0,
        wait_non_sock_err_secs: f64::NAN,
        ..SubscriptionDefaults::default()
    };
    let config = SubscriptionConfig::with_defaults("sk.1", "/orders", &defaults);
    assert_eq!(config.wait_sock_err, Duration::from_secs(10));
    assert_eq!(config.wait_non_sock_err, Duration::from_secs(30));
}

#[test]
fn test_zero_max_retry_means_default_limit() {
    let entry = SubscriptionEntry {
        sub_key: "sk.1".into(),
        topic_name: "/orders".into(),
        endpoint_name: String::new(),
        delivery_method: DeliveryMethod::Notify,
        delivery_batch_size: None,
        delivery_max_retry: Some(0),
        wrap_one_msg_in_list: None,
    };
    let config = entry.to_config(&SubscriptionDefaults::default());
    assert_eq!(config.max_retry(), DEFAULT_DELIVERY_MAX_RETRY);

    let mut config = SubscriptionConfig::new("sk.2", "/orders");
    config.delivery_max_retry = 4;
    assert_eq!(config.max_retry(), 4);
}
