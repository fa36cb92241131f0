//! Delivery coordinator
//!
//! The coordinator owns the delivery tasks of one logical consumer and is the
//! entry point the publish path talks to:
//! - transient messages are routed synchronously into every matching queue
//! - durable notifications spawn a background fetch from the durable store,
//!   shared by all keys of the notification
//! - subscriptions are added, updated and removed at runtime
//!
//! Locking: `inner` is the coarse lock guarding the task map and the durable
//! watermarks. Each task's queue mutex is the per-subscription lock, held for
//! a whole delivery attempt. The coarse lock is released before any
//! subscription lock is awaited.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::message::{Message, PublishedMessage, ServerIdentity, now_ms};
use crate::broker::subscription::{SubscriptionConfig, SubscriptionRegistry};
use crate::broker::task::{DeliveryTask, TaskContext, TaskStats};
use crate::broker::topic::{DeliveryHook, HookRegistry};
use crate::client::DeliveryCallback;
use crate::config::EngineSettings;
use crate::persistence::{DurableStore, PendingQuery, StoredMessage};
use crate::utils::error::{PubSubError, PubSubResult};

struct TaskHandle {
    task: Arc<DeliveryTask>,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, TaskHandle>,
    /// sub_key -> pub_time up to which durable messages were already fetched
    last_durable_run: HashMap<String, i64>,
}

pub struct Coordinator {
    inner: Mutex<Inner>,
    registry: Arc<SubscriptionRegistry>,
    ctx: TaskContext,
    identity: ServerIdentity,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn DurableStore>,
        callback: Arc<dyn DeliveryCallback>,
        settings: EngineSettings,
        identity: ServerIdentity,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            registry: Arc::new(SubscriptionRegistry::new()),
            ctx: TaskContext {
                store,
                callback,
                hooks: Arc::new(HookRegistry::new()),
                settings,
            },
            identity,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Starts delivering for a subscription. Returns `false` if it was already known.
    pub async fn add_subscription(&self, config: SubscriptionConfig) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.tasks.contains_key(&config.sub_key) {
            debug!(sub_key = %config.sub_key, "Subscription already handled");
            return false;
        }

        let sub_key = config.sub_key.clone();
        info!(
            sub_key = %sub_key,
            topic = %config.topic_name,
            method = %config.delivery_method,
            "Adding subscription"
        );

        let task = DeliveryTask::new(self.registry.register(config), self.ctx.clone());
        let join = task.start();
        inner.tasks.insert(sub_key, TaskHandle { task, join });
        true
    }

    /// Stops the subscription's task and discards its queue.
    pub async fn remove_subscription(&self, sub_key: &str) -> PubSubResult<()> {
        let handle = {
            let mut inner = self.inner.lock().await;
            inner.last_durable_run.remove(sub_key);
            inner
                .tasks
                .remove(sub_key)
                .ok_or_else(|| PubSubError::unknown_subscription(sub_key))?
        };

        self.registry.remove(sub_key);
        handle.task.stop();
        handle.task.clear().await;
        info!(sub_key, "Removed subscription");
        Ok(())
    }

    /// Publishes a new configuration; the task picks it up on its next iteration.
    pub fn update_subscription(&self, config: SubscriptionConfig) -> PubSubResult<()> {
        self.registry.update(config)
    }

    pub async fn remove_all_subscriptions(&self) {
        for sub_key in self.sub_keys().await {
            if let Err(e) = self.remove_subscription(&sub_key).await {
                debug!(sub_key = %sub_key, error = %e, "Subscription already gone");
            }
        }
    }

    pub async fn sub_keys(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<String> = inner.tasks.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn has_sub_key(&self, sub_key: &str) -> bool {
        self.inner.lock().await.tasks.contains_key(sub_key)
    }

    pub async fn get_task(&self, sub_key: &str) -> PubSubResult<Arc<DeliveryTask>> {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .get(sub_key)
            .map(|handle| Arc::clone(&handle.task))
            .ok_or_else(|| PubSubError::unknown_subscription(sub_key))
    }

    /// Routes transient messages to every subscription in `sub_keys` handled here.
    /// Returns how many messages were queued in total.
    pub async fn route_transient_messages(&self, sub_keys: &[String], messages: &[PublishedMessage]) -> usize {
        let tasks: Vec<Arc<DeliveryTask>> = {
            let inner = self.inner.lock().await;
            sub_keys
                .iter()
                .filter_map(|sub_key| match inner.tasks.get(sub_key) {
                    Some(handle) => Some(Arc::clone(&handle.task)),
                    None => {
                        warn!(sub_key = %sub_key, "No delivery task for transient messages");
                        None
                    }
                })
                .collect()
        };

        let mut total = 0;
        for task in tasks {
            total += task.enqueue_transient(&self.identity, messages).await;
        }
        total
    }

    /// Fetches durable messages for `sub_keys` in the background.
    pub fn route_durable_notification(self: &Arc<Self>, sub_keys: Vec<String>, pub_time_max: i64) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            match coordinator
                .handle_durable_notification(&sub_keys, pub_time_max)
                .await
            {
                Ok(count) => debug!(?sub_keys, count, "Handled durable notification"),
                Err(e) => warn!(?sub_keys, error = %e, "Could not handle durable notification"),
            }
        })
    }

    /// One store query for all `sub_keys`, starting at the lowest of their
    /// watermarks. Keys without a watermark start from the beginning.
    ///
    /// The coarse lock is only held to pick the targets and to advance the
    /// watermarks. It is never held while a subscription lock is awaited, so
    /// a task stuck in a slow delivery does not stall the other subscriptions.
    pub async fn handle_durable_notification(&self, sub_keys: &[String], pub_time_max: i64) -> PubSubResult<usize> {
        let (targets, since) = {
            let inner = self.inner.lock().await;
            let targets: Vec<(String, Arc<DeliveryTask>)> = sub_keys
                .iter()
                .filter_map(|sub_key| {
                    inner
                        .tasks
                        .get(sub_key)
                        .map(|handle| (sub_key.clone(), Arc::clone(&handle.task)))
                })
                .collect();
            let since = targets
                .iter()
                .map(|(sub_key, _)| inner.last_durable_run.get(sub_key).copied().unwrap_or(0))
                .min()
                .unwrap_or(0);
            (targets, since)
        };
        if targets.is_empty() {
            return Ok(0);
        }

        let mut exclude_row_ids = HashSet::new();
        for (_, task) in &targets {
            exclude_row_ids.extend(task.durable_row_ids().await);
        }

        info!(?sub_keys, since, pub_time_max, ignored = exclude_row_ids.len(), "Fetching durable messages");

        let query = PendingQuery {
            sub_keys: targets.iter().map(|(sub_key, _)| sub_key.clone()).collect(),
            since,
            until: pub_time_max,
            exclude_row_ids,
            limit: None,
        };
        let rows = self.ctx.store.fetch_pending(&query).await?;

        let mut by_key: HashMap<String, Vec<StoredMessage>> = HashMap::new();
        for row in rows {
            by_key.entry(row.sub_key.clone()).or_default().push(row);
        }

        let watermark = now_ms() - self.ctx.settings.watermark_delta_ms();
        let mut total = 0;
        let mut fetched = Vec::new();
        for (sub_key, task) in &targets {
            let Some(rows) = by_key.remove(sub_key) else {
                continue;
            };
            // enqueue_rows skips row ids queued since the snapshot above
            total += task.enqueue_durable(rows).await;
            fetched.push(sub_key);
        }

        let mut inner = self.inner.lock().await;
        for sub_key in fetched {
            // removed while we were fetching
            if !inner.tasks.contains_key(sub_key) {
                continue;
            }
            inner.last_durable_run.insert(sub_key.clone(), watermark);
            debug!(sub_key = %sub_key, watermark, "Stored durable watermark");
        }

        Ok(total)
    }

    /// Watermark of `sub_key`, if durable messages were ever fetched for it.
    pub async fn durable_watermark(&self, sub_key: &str) -> Option<i64> {
        self.inner.lock().await.last_durable_run.get(sub_key).copied()
    }

    pub fn set_delivery_hook(&self, topic_name: &str, hook: impl DeliveryHook + 'static) {
        info!(topic = topic_name, "Setting delivery hook");
        self.ctx.hooks.set(topic_name, Arc::new(hook));
    }

    pub fn remove_delivery_hook(&self, topic_name: &str) -> bool {
        self.ctx.hooks.remove(topic_name)
    }

    pub async fn clear_task(&self, sub_key: &str) -> PubSubResult<()> {
        self.get_task(sub_key).await?.clear().await;
        Ok(())
    }

    pub async fn delete_messages(&self, sub_key: &str, msg_ids: &[String]) -> PubSubResult<()> {
        self.get_task(sub_key).await?.delete_messages(msg_ids).await;
        Ok(())
    }

    pub async fn get_messages(&self, sub_key: &str, has_durability: Option<bool>) -> PubSubResult<Vec<Message>> {
        Ok(self.get_task(sub_key).await?.get_messages(has_durability).await)
    }

    pub async fn get_message(&self, sub_key: &str, msg_id: &str) -> PubSubResult<Message> {
        self.get_task(sub_key).await?.get_message(msg_id).await
    }

    pub async fn pull_messages(&self, sub_key: &str) -> PubSubResult<Vec<Message>> {
        self.get_task(sub_key).await?.pull_messages().await
    }

    /// Number of (durable, transient) messages queued for `sub_key`.
    pub async fn queue_depth(&self, sub_key: &str) -> PubSubResult<(usize, usize)> {
        Ok(self.get_task(sub_key).await?.queue_depth().await)
    }

    pub async fn task_stats(&self, sub_key: &str) -> PubSubResult<TaskStats> {
        Ok(self.get_task(sub_key).await?.stats().await)
    }

    /// Stops every task and waits for their loops to exit.
    pub async fn shutdown(&self) {
        let handles: Vec<TaskHandle> = {
            let mut inner = self.inner.lock().await;
            inner.last_durable_run.clear();
            inner.tasks.drain().map(|(_, handle)| handle).collect()
        };

        info!(count = handles.len(), "Stopping delivery tasks");
        for handle in &handles {
            self.registry.remove(handle.task.sub_key());
            handle.task.stop();
        }

        let results = join_all(handles.into_iter().map(|handle| handle.join)).await;
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "Delivery task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("identity", &self.identity)
            .field("hooks", &self.ctx.hooks)
            .finish()
    }
}
