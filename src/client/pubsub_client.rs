use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::client::{DeliveryCallback, DeliveryPayload};
use crate::utils::error::{PubSubError, PubSubResult};

/// One payload handed to a connected consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub sub_key: String,
    pub payload: DeliveryPayload,
}

/// Represents a connected consumer of the delivery engine.
///
/// Each client is uniquely identified by an `id` and receives deliveries for
/// all of its subscriptions through `sender`.
#[derive(Debug, Clone)]
pub struct Client {
    /// Unique identifier for the client.
    pub id: String,

    /// Channel deliveries are pushed into.
    pub sender: UnboundedSender<Delivery>,
}

impl Client {
    pub fn new(sender: UnboundedSender<Delivery>) -> Self {
        Self {
            id: format!("client-{}", Uuid::new_v4()),
            sender,
        }
    }
}

#[async_trait]
impl DeliveryCallback for Client {
    async fn deliver(&self, sub_key: &str, payload: DeliveryPayload) -> PubSubResult<()> {
        let delivery = Delivery {
            sub_key: sub_key.to_string(),
            payload,
        };
        // A dropped receiver means the consumer went away
        self.sender.send(delivery).map_err(|_| {
            PubSubError::Connectivity(format!("client {} is no longer connected", self.id))
        })
    }
}
