use super::pubsub_client::{Client, Delivery};
use super::{DeliveryCallback, DeliveryPayload};
use crate::broker::message::{Message, PublishedMessage, ServerIdentity};
use tokio::sync::mpsc;

fn message(id: &str) -> Message {
    let published = PublishedMessage::new(id, "/orders", "payload").with_pub_time(1);
    Message::transient("sk-1", &ServerIdentity::new("server1"), &published).unwrap()
}

#[test]
fn test_client_new() {
    let (tx, _) = mpsc::unbounded_channel::<Delivery>();
    let client = Client::new(tx);
    assert!(client.id.starts_with("client-"));
}

#[test]
fn test_payload_len_and_messages() {
    let single = DeliveryPayload::Single(message("a"));
    assert_eq!(single.len(), 1);

    let batch = DeliveryPayload::Batch(vec![message("a"), message("b")]);
    assert_eq!(batch.len(), 2);
    let ids: Vec<_> = batch.into_messages().into_iter().map(|m| m.msg_id).collect();
    assert_eq!(ids, vec!["a", "b"]);

    assert!(DeliveryPayload::Batch(vec![]).is_empty());
}

#[test]
fn test_single_payload_serializes_as_object() {
    let single = serde_json::to_value(DeliveryPayload::Single(message("a"))).unwrap();
    assert_eq!(single["msg_id"], "a");

    let batch = serde_json::to_value(DeliveryPayload::Batch(vec![message("a")])).unwrap();
    assert!(batch.is_array());
}

#[tokio::test]
async fn test_client_delivers_into_channel() {
    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
    let client = Client::new(tx);

    client
        .deliver("sk-1", DeliveryPayload::Single(message("a")))
        .await
        .unwrap();

    let delivery = rx.recv().await.unwrap();
    assert_eq!(delivery.sub_key, "sk-1");
    assert_eq!(delivery.payload, DeliveryPayload::Single(message("a")));
}

#[tokio::test]
async fn test_closed_channel_is_connectivity_failure() {
    let (tx, rx) = mpsc::unbounded_channel::<Delivery>();
    let client = Client::new(tx);
    drop(rx);

    let err = client
        .deliver("sk-1", DeliveryPayload::Single(message("a")))
        .await
        .unwrap_err();
    assert!(err.is_connectivity());
}
