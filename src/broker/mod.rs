pub mod engine;
pub mod message;
pub mod queue;
pub mod subscription;
pub mod task;
pub mod topic;

pub use engine::Coordinator;
pub use message::{Message, PublishedMessage, ServerIdentity};
pub use queue::DeliveryQueue;
pub use subscription::{DeliveryMethod, SubscriptionConfig, SubscriptionRegistry};
pub use task::{DeliveryTask, TaskState, TaskStats};
pub use topic::{DeliveryHook, Disposition, HookAction};
