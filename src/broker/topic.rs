//! Topic-scoped delivery hooks
//!
//! A hook registered for a topic sees every batch about to be delivered for any
//! subscription of that topic and decides, per message, whether to deliver it
//! now, skip it for this round or delete it without delivery. Hooks are looked
//! up before every delivery attempt so they can be swapped at runtime.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::broker::message::Message;
use crate::utils::error::PubSubResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Deliver,
    Skip,
    Delete,
}

/// Messages of one batch split by what should happen to them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Disposition {
    pub deliver: Vec<Message>,
    pub skip: Vec<Message>,
    pub delete: Vec<Message>,
}

impl Disposition {
    pub fn push(&mut self, action: HookAction, msg: Message) {
        match action {
            HookAction::Deliver => self.deliver.push(msg),
            HookAction::Skip => self.skip.push(msg),
            HookAction::Delete => self.delete.push(msg),
        }
    }
}

#[async_trait]
pub trait DeliveryHook: Send + Sync {
    /// Classify `batch`. `marked_for_deletion` lists messages the engine is
    /// going to delete anyway (requested deletions, exhausted retries).
    async fn classify(
        &self,
        sub_key: &str,
        batch: &[Message],
        marked_for_deletion: &[Message],
    ) -> PubSubResult<Disposition>;
}

#[async_trait]
impl<F> DeliveryHook for F
where
    F: Fn(&Message) -> HookAction + Send + Sync,
{
    async fn classify(
        &self,
        _sub_key: &str,
        batch: &[Message],
        marked_for_deletion: &[Message],
    ) -> PubSubResult<Disposition> {
        let mut out = Disposition::default();
        for msg in batch {
            if marked_for_deletion.iter().any(|m| m.msg_id == msg.msg_id) {
                continue;
            }
            out.push(self(msg), msg.clone());
        }
        Ok(out)
    }
}

/// Hooks by topic name.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<String, Arc<dyn DeliveryHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, topic_name: &str, hook: Arc<dyn DeliveryHook>) {
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        hooks.insert(topic_name.to_string(), hook);
    }

    pub fn remove(&self, topic_name: &str) -> bool {
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        hooks.remove(topic_name).is_some()
    }

    pub fn get(&self, topic_name: &str) -> Option<Arc<dyn DeliveryHook>> {
        let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner());
        hooks.get(topic_name).cloned()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("HookRegistry")
            .field("topics", &hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}
