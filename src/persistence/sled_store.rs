//! Durable store backed by `sled`
//!
//! Every subscription gets two trees:
//! - `queue/<sub_key>`: rows keyed by big-endian row id, so iteration yields
//!   messages in the order they were stored
//! - `index/<sub_key>`: `msg_id` -> row id, used by confirmations and deletions
//!
//! Configuration options supported:
//! - `ttl_seconds`: optional time-to-live; older rows are removed on load, as are
//!   rows whose own expiration time has passed.

use async_trait::async_trait;
use sled::{Db, Tree};
use tracing::{debug, info, warn};

use crate::broker::message::{DEFAULT_EXPIRATION_MS, PublishedMessage, now_ms};
use crate::persistence::{DurableStore, PendingQuery, StoredMessage};
use crate::utils::error::{StoreError, StoreResult};

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    ttl_seconds: Option<i64>,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str, ttl_seconds: Option<i64>) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db, ttl_seconds })
    }

    /// A database removed from disk when dropped.
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            db,
            ttl_seconds: None,
        })
    }

    fn queue_tree(&self, sub_key: &str) -> StoreResult<Tree> {
        Ok(self.db.open_tree(format!("queue/{sub_key}"))?)
    }

    fn index_tree(&self, sub_key: &str) -> StoreResult<Tree> {
        Ok(self.db.open_tree(format!("index/{sub_key}"))?)
    }

    /// Queue a durable message for `sub_key` and return its row id.
    pub fn store_message(
        &self,
        sub_key: &str,
        published_by_id: Option<String>,
        message: PublishedMessage,
    ) -> StoreResult<u64> {
        let msg_id = message.msg_id.clone().unwrap_or_default();
        let row_id = self.db.generate_id()?;
        let row = StoredMessage {
            row_id,
            sub_key: sub_key.to_string(),
            published_by_id,
            delivery_count: 0,
            message,
        };

        let serialized = serde_json::to_vec(&row)?;
        self.queue_tree(sub_key)?
            .insert(row_id.to_be_bytes(), serialized)?;
        self.index_tree(sub_key)?
            .insert(msg_id.as_bytes(), row_id.to_be_bytes().to_vec())?;

        debug!(sub_key, row_id, msg_id = %msg_id, "Stored durable message");
        Ok(row_id)
    }

    /// Load every row queued for `sub_key`, honoring TTL and expiration.
    pub fn load_messages(&self, sub_key: &str) -> StoreResult<Vec<StoredMessage>> {
        self.cleanup_old_messages(sub_key)?;
        let tree_name = format!("queue/{sub_key}");
        self.queue_tree(sub_key)?
            .iter()
            .map(|entry| {
                let (_, value) = entry?;
                serde_json::from_slice::<StoredMessage>(&value).map_err(|e| StoreError::Corrupted {
                    tree: tree_name.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Remove rows past the TTL or past their own expiration time.
    fn cleanup_old_messages(&self, sub_key: &str) -> StoreResult<()> {
        let now = now_ms();
        let ttl_cutoff = self.ttl_seconds.map(|ttl| now - ttl * 1000);

        let queue = self.queue_tree(sub_key)?;
        let mut expired = Vec::new();

        for entry in queue.iter() {
            let (key, value) = entry?;
            let Ok(row) = serde_json::from_slice::<StoredMessage>(&value) else {
                continue;
            };
            let pub_time = row.pub_time();
            let expiration_time = row.message.expiration_time.unwrap_or_else(|| {
                pub_time.saturating_add(row.message.expiration.unwrap_or(DEFAULT_EXPIRATION_MS))
            });
            let too_old = ttl_cutoff.is_some_and(|cutoff| pub_time < cutoff);
            if too_old || expiration_time <= now {
                expired.push((key, row.msg_id().to_string()));
            }
        }

        if expired.is_empty() {
            return Ok(());
        }

        let index = self.index_tree(sub_key)?;
        for (key, msg_id) in &expired {
            queue.remove(key)?;
            index.remove(msg_id.as_bytes())?;
        }
        info!(sub_key, count = expired.len(), "Removed expired durable messages");
        Ok(())
    }

    /// Removes the rows of `msg_ids`, returning how many existed.
    fn remove_rows(&self, sub_key: &str, msg_ids: &[String]) -> StoreResult<usize> {
        let queue = self.queue_tree(sub_key)?;
        let index = self.index_tree(sub_key)?;
        let mut removed = 0;

        for msg_id in msg_ids {
            match index.remove(msg_id.as_bytes())? {
                Some(row_key) => {
                    queue.remove(row_key)?;
                    removed += 1;
                }
                None => debug!(sub_key, msg_id = %msg_id, "No durable row for message"),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl DurableStore for SledStore {
    async fn fetch_pending(&self, query: &PendingQuery) -> StoreResult<Vec<StoredMessage>> {
        let mut out = Vec::new();
        for sub_key in &query.sub_keys {
            out.extend(self.load_messages(sub_key)?.into_iter().filter(|row| {
                let pub_time = row.pub_time();
                pub_time >= query.since
                    && pub_time <= query.until
                    && !query.exclude_row_ids.contains(&row.row_id)
            }));
        }

        out.sort_by_key(|row| (row.pub_time(), row.row_id));
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn pending_msg_ids(&self, sub_key: &str, pub_time_max: i64) -> StoreResult<Vec<String>> {
        Ok(self
            .load_messages(sub_key)?
            .into_iter()
            .filter(|row| row.pub_time() <= pub_time_max)
            .map(|row| row.msg_id().to_string())
            .collect())
    }

    async fn fetch_by_ids(&self, sub_key: &str, msg_ids: &[String]) -> StoreResult<Vec<StoredMessage>> {
        let queue = self.queue_tree(sub_key)?;
        let index = self.index_tree(sub_key)?;
        let mut out = Vec::with_capacity(msg_ids.len());

        for msg_id in msg_ids {
            let Some(row_key) = index.get(msg_id.as_bytes())? else {
                continue;
            };
            match queue.get(&row_key)? {
                Some(value) => out.push(serde_json::from_slice(&value)?),
                None => warn!(sub_key, msg_id = %msg_id, "Index points at a missing row"),
            }
        }
        Ok(out)
    }

    async fn confirm_delivered(&self, sub_key: &str, msg_ids: &[String]) -> StoreResult<()> {
        let removed = self.remove_rows(sub_key, msg_ids)?;
        if removed > 0 {
            self.db.flush()?;
        }
        debug!(sub_key, removed, "Confirmed delivered durable messages");
        Ok(())
    }

    async fn mark_deleted(&self, sub_key: &str, msg_ids: &[String]) -> StoreResult<()> {
        let removed = self.remove_rows(sub_key, msg_ids)?;
        if removed > 0 {
            self.db.flush()?;
        }
        info!(sub_key, removed, "Deleted durable messages");
        Ok(())
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

