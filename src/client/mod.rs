//! The `client` module defines how messages leave the engine.
//!
//! `DeliveryCallback` is the seam between a delivery task and whatever transport
//! pushes messages to a subscriber. `Client` is the in-process implementation:
//! one connected consumer reached through an unbounded channel.

pub mod pubsub_client;

use async_trait::async_trait;
use serde::Serialize;

use crate::broker::message::Message;
use crate::utils::error::PubSubResult;

pub use pubsub_client::{Client, Delivery};

/// What a callback receives: one message, or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DeliveryPayload {
    Single(Message),
    Batch(Vec<Message>),
}

impl DeliveryPayload {
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Batch(messages) => messages.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Self::Single(msg) => vec![msg],
            Self::Batch(messages) => messages,
        }
    }
}

/// Pushes a payload to the subscriber behind `sub_key`.
///
/// May be invoked again with the same messages after a failure, so
/// implementations must tolerate redelivery. Transport-level failures should be
/// reported as `PubSubError::Connectivity`.
#[async_trait]
pub trait DeliveryCallback: Send + Sync {
    async fn deliver(&self, sub_key: &str, payload: DeliveryPayload) -> PubSubResult<()>;
}

#[cfg(test)]
mod tests;
