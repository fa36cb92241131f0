//! Message definitions for the delivery engine
//!
//! `Message` is the unit a delivery task hands to a subscriber. It comes in two
//! flavours sharing one ordering contract:
//! - durable messages, built from rows of a `DurableStore`, which survive restarts
//! - transient messages, built from an in-memory publish payload
//!
//! Ordering: priority descending, then `ext_pub_time` ascending when both
//! messages carry one, else `pub_time` ascending. All times are milliseconds
//! since the UNIX epoch. Identity is always `msg_id`, never the comparator.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::persistence::StoredMessage;
use crate::utils::error::{PubSubError, PubSubResult};

pub const PRIORITY_MIN: u8 = 1;
pub const PRIORITY_MAX: u8 = 9;
pub const PRIORITY_DEFAULT: u8 = 5;

pub const DEFAULT_MIME_TYPE: &str = "text/plain";

/// Around 70 years, used when a publisher does not set an expiration.
pub const DEFAULT_EXPIRATION_MS: i64 = 2_147_483_647 * 1000;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A message as handed over by the publish path, before it is bound to a subscription.
///
/// Every field is optional on the wire; `Message::durable` and `Message::transient`
/// reject payloads without a `msg_id` or a `pub_time`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishedMessage {
    #[serde(default)]
    pub msg_id: Option<String>,
    #[serde(default)]
    pub topic_name: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub pub_time: Option<i64>,
    #[serde(default)]
    pub ext_pub_time: Option<i64>,
    #[serde(default)]
    pub expiration: Option<i64>,
    #[serde(default)]
    pub expiration_time: Option<i64>,
    #[serde(default)]
    pub correl_id: Option<String>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub ext_client_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub position_in_group: i64,
    #[serde(default)]
    pub user_ctx: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    /// Subscription keys this message is restricted to, if any.
    #[serde(default)]
    pub deliver_to: Option<Vec<String>>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl PublishedMessage {
    pub fn new(msg_id: impl Into<String>, topic_name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            msg_id: Some(msg_id.into()),
            topic_name: topic_name.into(),
            data: data.into(),
            pub_time: Some(now_ms()),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_pub_time(mut self, pub_time: i64) -> Self {
        self.pub_time = Some(pub_time);
        self
    }

    pub fn with_ext_pub_time(mut self, ext_pub_time: i64) -> Self {
        self.ext_pub_time = Some(ext_pub_time);
        self
    }

    pub fn with_deliver_to(mut self, sub_keys: Vec<String>) -> Self {
        self.deliver_to = Some(sub_keys);
        self
    }
}

/// Identity of the process that produced a transient message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub server_name: String,
    pub server_pid: u32,
}

impl ServerIdentity {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            server_pid: std::process::id(),
        }
    }
}

/// Variant-specific attributes of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageOrigin {
    Durable {
        row_id: u64,
        published_by_id: Option<String>,
    },
    Transient {
        server_name: String,
        server_pid: u32,
        deliver_to: Option<Vec<String>>,
        reply_to: Option<String>,
    },
}

/// The attributes the delivery order is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub priority: u8,
    pub pub_time: i64,
    pub ext_pub_time: Option<i64>,
}

impl SortKey {
    /// `Less` means `self` is delivered before `other`.
    pub fn compare(&self, other: &SortKey) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| match (self.ext_pub_time, other.ext_pub_time) {
                (Some(ours), Some(theirs)) => ours.cmp(&theirs),
                _ => self.pub_time.cmp(&other.pub_time),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub msg_id: String,
    pub sub_key: String,
    pub topic_name: String,
    pub data: String,
    pub mime_type: String,
    pub priority: u8,
    pub pub_time: i64,
    pub ext_pub_time: Option<i64>,
    pub delivery_count: u32,
    pub expiration: i64,
    pub expiration_time: i64,
    pub correl_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub ext_client_id: Option<String>,
    pub group_id: Option<String>,
    pub position_in_group: i64,
    pub user_ctx: HashMap<String, serde_json::Value>,
    pub context: HashMap<String, serde_json::Value>,
    pub origin: MessageOrigin,
}

impl Message {
    /// Builds a durable message out of a row read from the durable store.
    pub fn durable(row: &StoredMessage) -> PubSubResult<Self> {
        let origin = MessageOrigin::Durable {
            row_id: row.row_id,
            published_by_id: row.published_by_id.clone(),
        };
        let mut msg = Self::build(&row.sub_key, &row.message, origin)?;
        msg.delivery_count = row.delivery_count;
        Ok(msg)
    }

    /// Builds a transient message for `sub_key` out of a publish payload.
    pub fn transient(
        sub_key: &str,
        origin: &ServerIdentity,
        published: &PublishedMessage,
    ) -> PubSubResult<Self> {
        let origin = MessageOrigin::Transient {
            server_name: origin.server_name.clone(),
            server_pid: origin.server_pid,
            deliver_to: published.deliver_to.clone(),
            reply_to: published.reply_to.clone(),
        };
        Self::build(sub_key, published, origin)
    }

    fn build(sub_key: &str, published: &PublishedMessage, origin: MessageOrigin) -> PubSubResult<Self> {
        let msg_id = match published.msg_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(PubSubError::invalid_message("missing msg_id")),
        };

        let pub_time = published.pub_time.ok_or_else(|| {
            PubSubError::invalid_message(format!("missing pub_time for message `{msg_id}`"))
        })?;

        let priority = published.priority.unwrap_or(PRIORITY_DEFAULT);
        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&priority) {
            return Err(PubSubError::invalid_message(format!(
                "priority {priority} of message `{msg_id}` is outside {PRIORITY_MIN}..={PRIORITY_MAX}"
            )));
        }

        let expiration = published.expiration.unwrap_or(DEFAULT_EXPIRATION_MS);
        let expiration_time = published
            .expiration_time
            .unwrap_or_else(|| pub_time.saturating_add(expiration));

        Ok(Self {
            msg_id,
            sub_key: sub_key.to_string(),
            topic_name: published.topic_name.clone(),
            data: published.data.clone(),
            mime_type: published
                .mime_type
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            priority,
            pub_time,
            ext_pub_time: published.ext_pub_time,
            delivery_count: 0,
            expiration,
            expiration_time,
            correl_id: published.correl_id.clone(),
            in_reply_to: published.in_reply_to.clone(),
            ext_client_id: published.ext_client_id.clone(),
            group_id: published.group_id.clone(),
            position_in_group: published.position_in_group,
            user_ctx: published.user_ctx.clone(),
            context: published.context.clone(),
            origin,
        })
    }

    pub fn sort_key(&self) -> SortKey {
        SortKey {
            priority: self.priority,
            pub_time: self.pub_time,
            ext_pub_time: self.ext_pub_time,
        }
    }

    /// Delivery order of two messages. Never use this to test identity.
    pub fn compare(&self, other: &Message) -> Ordering {
        self.sort_key().compare(&other.sort_key())
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.origin, MessageOrigin::Durable { .. })
    }

    pub fn row_id(&self) -> Option<u64> {
        match self.origin {
            MessageOrigin::Durable { row_id, .. } => Some(row_id),
            MessageOrigin::Transient { .. } => None,
        }
    }

    /// Whether this message may be queued for `sub_key`. Only transient messages
    /// can carry an explicit restriction list.
    pub fn is_deliverable_to(&self, sub_key: &str) -> bool {
        match &self.origin {
            MessageOrigin::Transient {
                deliver_to: Some(keys),
                ..
            } if !keys.is_empty() => keys.iter().any(|k| k == sub_key),
            _ => true,
        }
    }

    pub fn has_expired(&self, now: i64) -> bool {
        self.expiration_time <= now
    }
}
