//! The `persistence` module defines the durable side of the engine.
//!
//! Durable messages are rows queued per subscription in a store that survives
//! restarts. Delivery tasks read them back on startup and after every durable
//! publish notification, then confirm or delete them once handled.
//!
//! `SledStore` is the bundled implementation, backed by `sled`.

pub mod sled_store;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::message::PublishedMessage;
use crate::utils::error::StoreResult;

pub use sled_store::SledStore;

/// A durable message queued for one subscription.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub row_id: u64,
    pub sub_key: String,
    pub published_by_id: Option<String>,
    #[serde(default)]
    pub delivery_count: u32,
    pub message: PublishedMessage,
}

impl StoredMessage {
    pub fn msg_id(&self) -> &str {
        self.message.msg_id.as_deref().unwrap_or_default()
    }

    pub fn pub_time(&self) -> i64 {
        self.message.pub_time.unwrap_or_default()
    }
}

/// Selects rows still waiting for delivery.
#[derive(Debug, Clone, Default)]
pub struct PendingQuery {
    pub sub_keys: Vec<String>,
    /// Lower bound on `pub_time`, inclusive.
    pub since: i64,
    /// Upper bound on `pub_time`, inclusive.
    pub until: i64,
    /// Rows the caller already holds.
    pub exclude_row_ids: HashSet<u64>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Rows pending for any of `query.sub_keys`, oldest first.
    async fn fetch_pending(&self, query: &PendingQuery) -> StoreResult<Vec<StoredMessage>>;

    /// Ids of every message pending for `sub_key` published no later than `pub_time_max`.
    async fn pending_msg_ids(&self, sub_key: &str, pub_time_max: i64) -> StoreResult<Vec<String>>;

    async fn fetch_by_ids(&self, sub_key: &str, msg_ids: &[String]) -> StoreResult<Vec<StoredMessage>>;

    /// Records that `msg_ids` were delivered to `sub_key`. Unknown ids are ignored.
    async fn confirm_delivered(&self, sub_key: &str, msg_ids: &[String]) -> StoreResult<()>;

    /// Records that `msg_ids` were dropped for `sub_key` without delivery.
    async fn mark_deleted(&self, sub_key: &str, msg_ids: &[String]) -> StoreResult<()>;
}

#[cfg(test)]
mod tests;
