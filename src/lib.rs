//! # subqueue
//!
//! `subqueue` is the delivery side of a publish/subscribe service. Messages
//! already accepted for a topic are driven to every subscriber in priority
//! order, with retries, backoff and at-least-once semantics. Durable messages
//! survive restarts and are recovered from storage when a subscription starts.
//!
//! ## Core Modules
//!
//! - `broker`: messages, per-subscription queues, delivery tasks and the
//!   `Coordinator` that owns them.
//! - `client`: the `DeliveryCallback` seam and an in-process `Client` sink.
//! - `config`: loads settings from `config/default` and the environment.
//! - `persistence`: the `DurableStore` contract and its `sled` implementation.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod utils;
