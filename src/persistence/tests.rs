use super::{DurableStore, PendingQuery, SledStore, StoredMessage};
use crate::broker::message::{PublishedMessage, now_ms};

use tempfile::{TempDir, tempdir};

fn create_test_store(ttl: Option<i64>) -> (SledStore, TempDir) {
    let dir = tempdir().unwrap();
    let store = SledStore::open(dir.path().to_str().unwrap(), ttl).unwrap();
    (store, dir)
}

fn published(id: &str, pub_time: i64) -> PublishedMessage {
    PublishedMessage::new(id, "/orders", format!("body of {id}")).with_pub_time(pub_time)
}

#[test]
fn test_store_and_load_message() {
    let (store, _dir) = create_test_store(None);
    let now = now_ms();

    let row_id = store
        .store_message("sk-1", Some("endpoint-7".into()), published("m1", now))
        .unwrap();
    let rows = store.load_messages("sk-1").unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row_id, row_id);
    assert_eq!(rows[0].msg_id(), "m1");
    assert_eq!(rows[0].published_by_id.as_deref(), Some("endpoint-7"));
    assert_eq!(rows[0].delivery_count, 0);
}

#[test]
fn test_subscriptions_are_isolated() {
    let (store, _dir) = create_test_store(None);
    let now = now_ms();

    store.store_message("sk-1", None, published("m1", now)).unwrap();
    store.store_message("sk-2", None, published("m2", now)).unwrap();

    assert_eq!(store.load_messages("sk-1").unwrap().len(), 1);
    assert_eq!(store.load_messages("sk-2").unwrap()[0].msg_id(), "m2");
    assert!(store.load_messages("sk-3").unwrap().is_empty());
}

#[test]
fn test_ttl_removes_old_messages() {
    let (store, _dir) = create_test_store(Some(1));
    let long_ago = now_ms() - 10_000;

    store.store_message("sk-1", None, published("old", long_ago)).unwrap();
    store.store_message("sk-1", None, published("new", now_ms())).unwrap();

    let rows = store.load_messages("sk-1").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].msg_id(), "new");
}

#[test]
fn test_expired_messages_are_removed() {
    let (store, _dir) = create_test_store(None);
    let mut expired = published("expired", now_ms() - 5_000);
    expired.expiration = Some(1_000);

    store.store_message("sk-1", None, expired).unwrap();
    assert!(store.load_messages("sk-1").unwrap().is_empty());
}

#[tokio::test]
async fn test_fetch_pending_filters_window_and_exclusions() {
    let (store, _dir) = create_test_store(None);
    let base = now_ms();

    let r1 = store.store_message("sk-1", None, published("m1", base - 300)).unwrap();
    let r2 = store.store_message("sk-1", None, published("m2", base - 200)).unwrap();
    store.store_message("sk-2", None, published("m3", base - 100)).unwrap();
    store.store_message("sk-2", None, published("m4", base + 60_000)).unwrap();

    let query = PendingQuery {
        sub_keys: vec!["sk-1".into(), "sk-2".into()],
        since: base - 250,
        until: base,
        exclude_row_ids: [r1].into_iter().collect(),
        limit: None,
    };
    let rows = store.fetch_pending(&query).await.unwrap();
    let ids: Vec<_> = rows.iter().map(StoredMessage::msg_id).collect();
    assert_eq!(ids, vec!["m2", "m3"]);
    assert_eq!(rows[0].row_id, r2);

    let limited = PendingQuery {
        since: 0,
        exclude_row_ids: Default::default(),
        limit: Some(1),
        ..query
    };
    let rows = store.fetch_pending(&limited).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].msg_id(), "m1");
}

#[tokio::test]
async fn test_pending_ids_and_fetch_by_ids() {
    let (store, _dir) = create_test_store(None);
    let base = now_ms();

    store.store_message("sk-1", None, published("m1", base - 20)).unwrap();
    store.store_message("sk-1", None, published("m2", base - 10)).unwrap();
    store.store_message("sk-1", None, published("late", base + 60_000)).unwrap();

    let ids = store.pending_msg_ids("sk-1", base).await.unwrap();
    assert_eq!(ids, vec!["m1", "m2"]);

    let wanted = vec!["m2".to_string(), "unknown".to_string()];
    let rows = store.fetch_by_ids("sk-1", &wanted).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].msg_id(), "m2");
}

#[tokio::test]
async fn test_confirm_and_delete_remove_rows() {
    let (store, _dir) = create_test_store(None);
    let now = now_ms();

    for id in ["m1", "m2", "m3"] {
        store.store_message("sk-1", None, published(id, now)).unwrap();
    }

    store
        .confirm_delivered("sk-1", &["m1".to_string(), "missing".to_string()])
        .await
        .unwrap();
    store.mark_deleted("sk-1", &["m3".to_string()]).await.unwrap();

    let rows = store.load_messages("sk-1").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].msg_id(), "m2");
    assert!(store.fetch_by_ids("sk-1", &["m1".to_string()]).await.unwrap().is_empty());
}

#[test]
fn test_rows_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();

    {
        let store = SledStore::open(&path, None).unwrap();
        store.store_message("sk-1", None, published("m1", now_ms())).unwrap();
    }

    let reopened = SledStore::open(&path, None).unwrap();
    assert_eq!(reopened.load_messages("sk-1").unwrap()[0].msg_id(), "m1");
}

#[test]
fn test_serialization_roundtrip() {
    let row = StoredMessage {
        row_id: 42,
        sub_key: "sk-1".into(),
        published_by_id: None,
        delivery_count: 3,
        message: published("m1", 1_725_000_000_000),
    };

    let data = serde_json::to_vec(&row).unwrap();
    let parsed: StoredMessage = serde_json::from_slice(&data).unwrap();
    assert_eq!(row, parsed);
}
