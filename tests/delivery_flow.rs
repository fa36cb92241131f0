use std::sync::Arc;
use std::time::Duration;

use subqueue::broker::{Coordinator, DeliveryMethod, PublishedMessage, ServerIdentity, SubscriptionConfig};
use subqueue::client::{Client, Delivery, DeliveryPayload};
use subqueue::config::EngineSettings;
use subqueue::persistence::SledStore;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn published(id: &str, priority: u8, pub_time: i64) -> PublishedMessage {
    PublishedMessage::new(id, "/invoices", format!("{{\"id\":\"{id}\"}}"))
        .with_priority(priority)
        .with_pub_time(pub_time)
}

async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("no delivery in time")
        .expect("channel closed")
}

#[tokio::test(start_paused = true)]
async fn backlog_and_transient_messages_reach_the_client() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SledStore::open(dir.path().to_str().unwrap(), None).unwrap());
    let now = subqueue::broker::message::now_ms();
    store
        .store_message("sk-inv", None, published("old-low", 3, now - 5_000))
        .unwrap();
    store
        .store_message("sk-inv", None, published("old-high", 8, now - 4_000))
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(
        store.clone(),
        Arc::new(Client::new(tx)),
        EngineSettings::default(),
        ServerIdentity::new("server-it"),
    );

    let mut config = SubscriptionConfig::new("sk-inv", "/invoices");
    config.delivery_batch_size = 2;
    coordinator.add_subscription(config).await;

    let first = next_delivery(&mut rx).await;
    assert_eq!(first.sub_key, "sk-inv");
    let ids: Vec<String> = first.payload.into_messages().into_iter().map(|m| m.msg_id).collect();
    assert_eq!(ids, vec!["old-high", "old-low"]);
    assert!(store.load_messages("sk-inv").unwrap().is_empty());

    coordinator
        .route_transient_messages(&["sk-inv".to_string()], &[published("fresh", 5, now)])
        .await;
    let second = next_delivery(&mut rx).await;
    match second.payload {
        DeliveryPayload::Batch(messages) => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].msg_id, "fresh");
            assert!(!messages[0].is_durable());
        }
        other => panic!("expected a list, got {other:?}"),
    }

    let stats = coordinator.task_stats("sk-inv").await.unwrap();
    assert_eq!(stats.len_delivered, 3);
    assert_eq!(stats.len_batches, 2);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pull_subscription_drains_durable_notifications() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SledStore::open(dir.path().to_str().unwrap(), None).unwrap());
    let (tx, _rx) = mpsc::unbounded_channel();
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        Arc::new(Client::new(tx)),
        EngineSettings::default(),
        ServerIdentity::new("server-it"),
    ));

    let mut config = SubscriptionConfig::new("sk-pull", "/invoices");
    config.delivery_method = DeliveryMethod::Pull;
    config.delivery_batch_size = 10;
    coordinator.add_subscription(config).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let now = subqueue::broker::message::now_ms();
    store
        .store_message("sk-pull", Some("publisher-9".into()), published("gd-1", 5, now - 10))
        .unwrap();
    store
        .store_message("sk-pull", Some("publisher-9".into()), published("gd-2", 5, now - 5))
        .unwrap();

    coordinator
        .route_durable_notification(vec!["sk-pull".to_string()], now)
        .await
        .unwrap();
    assert_eq!(coordinator.queue_depth("sk-pull").await.unwrap(), (2, 0));

    let pulled = coordinator.pull_messages("sk-pull").await.unwrap();
    let ids: Vec<&str> = pulled.iter().map(|m| m.msg_id.as_str()).collect();
    assert_eq!(ids, vec!["gd-1", "gd-2"]);
    assert!(store.load_messages("sk-pull").unwrap().is_empty());
    assert_eq!(coordinator.queue_depth("sk-pull").await.unwrap(), (0, 0));

    coordinator.shutdown().await;
}
