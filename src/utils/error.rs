//! The `error` module defines the error types used across `subqueue`.
//!
//! `StoreError` covers failures of a durable store, `PubSubError` everything the
//! delivery engine reports. The engine distinguishes connectivity failures from
//! any other failure because the two are retried with different backoff windows.

/// Errors reported by a `DurableStore` implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupted record in `{tree}`: {reason}")]
    Corrupted { tree: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors reported by the delivery engine.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("connectivity failure: {0}")]
    Connectivity(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("delivery hook failed: {0}")]
    Hook(String),

    #[error("could not confirm delivery: {0}")]
    Confirmation(#[source] StoreError),

    #[error("message not found: {msg_id}")]
    NotFound { msg_id: String },

    #[error("unknown subscription: {sub_key}")]
    UnknownSubscription { sub_key: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PubSubError {
    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
        }
    }

    pub fn not_found(msg_id: impl Into<String>) -> Self {
        Self::NotFound {
            msg_id: msg_id.into(),
        }
    }

    pub fn unknown_subscription(sub_key: impl Into<String>) -> Self {
        Self::UnknownSubscription {
            sub_key: sub_key.into(),
        }
    }

    /// True if the failure is attributable to the transport, e.g. a closed socket.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

impl From<std::io::Error> for PubSubError {
    fn from(e: std::io::Error) -> Self {
        Self::Connectivity(e.to_string())
    }
}

pub type PubSubResult<T> = Result<T, PubSubError>;

pub type StoreResult<T> = Result<T, StoreError>;
