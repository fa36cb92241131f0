//! Per-subscription delivery queue
//!
//! Messages are kept in a `Vec` sorted by `Message::compare`. Insertion finds
//! its slot with a binary search and lands after messages that rank equal, so
//! ties keep arrival order. The element shift makes insertion O(n) overall.
//! An index from `msg_id` to the ordering attributes lets `remove_by_id` jump
//! to the range of equally ranked messages and scan only that range for the
//! id.
//!
//! The comparator is not transitive when some messages carry `ext_pub_time`
//! and others don't, so it cannot key an ordered map. A sorted vector with a
//! fallback full scan stays correct in that case.
//!
//! Callers synchronize access through the subscription lock.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::broker::message::{Message, SortKey};
use crate::utils::error::{PubSubError, PubSubResult};

#[derive(Debug, Default)]
pub struct DeliveryQueue {
    messages: Vec<Message>,
    /// msg_id -> (ordering attributes, number of queued copies)
    index: HashMap<String, (SortKey, usize)>,
    durable: usize,
    transient: usize,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message in delivery order. Duplicate ids are accepted.
    ///
    /// Finding the slot is O(log n); shifting the tail of the vector makes
    /// the insert itself O(n).
    pub fn insert(&mut self, msg: Message) {
        let pos = self
            .messages
            .partition_point(|queued| queued.compare(&msg) != Ordering::Greater);

        self.index
            .entry(msg.msg_id.clone())
            .and_modify(|(_, copies)| *copies += 1)
            .or_insert((msg.sort_key(), 1));

        if msg.is_durable() {
            self.durable += 1;
        } else {
            self.transient += 1;
        }

        self.messages.insert(pos, msg);
    }

    /// Up to `n` messages from the front of the queue, without removing them.
    pub fn peek_batch(&self, n: usize) -> Vec<Message> {
        self.messages.iter().take(n).cloned().collect()
    }

    pub fn remove_by_id(&mut self, msg_id: &str) -> PubSubResult<Message> {
        let key = match self.index.get(msg_id) {
            Some((key, _)) => *key,
            None => return Err(PubSubError::not_found(msg_id)),
        };

        let start = self
            .messages
            .partition_point(|queued| queued.sort_key().compare(&key) == Ordering::Less);
        let end = start
            + self.messages[start..]
                .partition_point(|queued| queued.sort_key().compare(&key) != Ordering::Greater);

        let found = self.messages[start..end]
            .iter()
            .position(|queued| queued.msg_id == msg_id)
            .map(|offset| start + offset)
            .or_else(|| {
                warn!(msg_id, "message not in its ordering bucket, scanning whole queue");
                self.messages.iter().position(|queued| queued.msg_id == msg_id)
            });

        let pos = found.ok_or_else(|| PubSubError::not_found(msg_id))?;
        let msg = self.messages.remove(pos);
        self.forget(&msg);
        Ok(msg)
    }

    fn forget(&mut self, msg: &Message) {
        if let Some((_, copies)) = self.index.get_mut(&msg.msg_id) {
            *copies -= 1;
            if *copies == 0 {
                self.index.remove(&msg.msg_id);
            }
        }
        if msg.is_durable() {
            self.durable -= 1;
        } else {
            self.transient -= 1;
        }
    }

    pub fn get(&self, msg_id: &str) -> Option<&Message> {
        if !self.contains(msg_id) {
            return None;
        }
        self.messages.iter().find(|m| m.msg_id == msg_id)
    }

    pub fn contains(&self, msg_id: &str) -> bool {
        self.index.contains_key(msg_id)
    }

    /// Row ids of every durable message currently queued.
    pub fn durable_row_ids(&self) -> HashSet<u64> {
        self.messages.iter().filter_map(Message::row_id).collect()
    }

    /// Drops every message without delivering it.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.index.clear();
        self.durable = 0;
        self.transient = 0;
    }

    /// Number of (durable, transient) messages queued.
    pub fn depth(&self) -> (usize, usize) {
        (self.durable, self.transient)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }
}
