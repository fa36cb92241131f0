//! Delivery task
//!
//! One task runs per subscription. It owns the subscription's queue and drives
//! the deliver / confirm / retry loop:
//! - on start it recovers durable messages left over from a previous run
//! - while the subscription is in a push mode it wakes up whenever the queue
//!   is non-empty and the delivery interval has elapsed, runs one delivery
//!   attempt and sleeps according to the outcome
//! - pull-mode subscriptions are drained on demand through `pull_messages`
//!
//! The queue mutex is the subscription lock. It is held for the whole delivery
//! attempt, callback included. Deletion requests go through a separate side
//! list so they never wait behind a slow subscriber.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::message::{Message, PublishedMessage, ServerIdentity, now_ms};
use crate::broker::queue::DeliveryQueue;
use crate::broker::subscription::SubscriptionConfig;
use crate::broker::topic::{Disposition, HookRegistry};
use crate::client::{DeliveryCallback, DeliveryPayload};
use crate::config::EngineSettings;
use crate::persistence::{DurableStore, StoredMessage};
use crate::utils::error::{PubSubError, PubSubResult};

/// Collaborators shared by every task of a coordinator.
#[derive(Clone)]
pub struct TaskContext {
    pub store: Arc<dyn DurableStore>,
    pub callback: Arc<dyn DeliveryCallback>,
    pub hooks: Arc<HookRegistry>,
    pub settings: EngineSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Created,
    Running,
    Stopped,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Counters of one task, as exposed to administrators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStats {
    pub sub_key: String,
    pub topic_name: String,
    pub state: TaskState,
    pub delivery_iter: u64,
    pub len_batches: u64,
    pub len_delivered: u64,
    pub durable_depth: usize,
    pub transient_depth: usize,
}

/// Result of one delivery attempt.
#[derive(Debug)]
pub(crate) enum Outcome {
    Delivered { count: usize, remaining: usize },
    Failed(PubSubError),
}

pub struct DeliveryTask {
    sub_key: String,
    topic_name: String,
    queue: Mutex<DeliveryQueue>,
    delete_requested: StdMutex<Vec<String>>,
    keep_running: AtomicBool,
    state: AtomicU8,
    wake: Notify,
    config: watch::Receiver<SubscriptionConfig>,
    ctx: TaskContext,
    delivery_iter: AtomicU64,
    len_batches: AtomicU64,
    len_delivered: AtomicU64,
}

impl DeliveryTask {
    pub fn new(config: watch::Receiver<SubscriptionConfig>, ctx: TaskContext) -> Arc<Self> {
        let (sub_key, topic_name) = {
            let current = config.borrow();
            (current.sub_key.clone(), current.topic_name.clone())
        };

        Arc::new(Self {
            sub_key,
            topic_name,
            queue: Mutex::new(DeliveryQueue::new()),
            delete_requested: StdMutex::new(Vec::new()),
            keep_running: AtomicBool::new(true),
            state: AtomicU8::new(TaskState::Created as u8),
            wake: Notify::new(),
            config,
            ctx,
            delivery_iter: AtomicU64::new(0),
            len_batches: AtomicU64::new(0),
            len_delivered: AtomicU64::new(0),
        })
    }

    /// Spawns the task's loop. Recovery runs first, inside the spawned task.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let task = Arc::clone(self);
        tokio::spawn(task.run())
    }

    pub fn sub_key(&self) -> &str {
        &self.sub_key
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.keep_running.load(Ordering::Acquire)
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> SubscriptionConfig {
        self.config.borrow().clone()
    }

    async fn run(self: Arc<Self>) {
        if !self.is_running() {
            self.set_state(TaskState::Stopped);
            return;
        }
        self.set_state(TaskState::Running);

        let mut previous_method = self.config().delivery_method;
        info!(
            sub_key = %self.sub_key,
            topic = %self.topic_name,
            method = %previous_method,
            "Starting delivery task"
        );

        if let Err(e) = self.recover().await {
            warn!(sub_key = %self.sub_key, error = %e, "Could not enqueue initial messages");
        }

        let settings = self.ctx.settings;
        let mut last_run = Instant::now();
        let mut draining = false;

        while self.is_running() {
            let config = self.config();

            if config.delivery_method != previous_method {
                info!(
                    sub_key = %self.sub_key,
                    endpoint = %config.endpoint_name,
                    from = %previous_method,
                    to = %config.delivery_method,
                    "Changed delivery method"
                );
                previous_method = config.delivery_method;
            }

            // Pull subscribers come to us
            if !config.delivery_method.is_push() {
                draining = false;
                self.sleep_or_stop(settings.pull_idle()).await;
                continue;
            }

            if !self.should_wake(&config, last_run, draining).await {
                self.sleep_or_stop(settings.idle_sleep()).await;
                continue;
            }

            last_run = Instant::now();
            let outcome = self
                .run_delivery(&config, self.ctx.callback.as_ref())
                .await;

            if !self.is_running() {
                info!(sub_key = %self.sub_key, ?outcome, "Skipping delivery loop after stop");
                break;
            }

            match outcome {
                Outcome::Delivered { count, remaining } if count > 0 && remaining > 0 => {
                    draining = true;
                }
                Outcome::Delivered { .. } => {
                    draining = false;
                    self.sleep_or_stop(settings.idle_sleep()).await;
                }
                Outcome::Failed(e) => {
                    draining = false;
                    let wait = if e.is_connectivity() {
                        config.wait_sock_err
                    } else {
                        config.wait_non_sock_err
                    };
                    warn!(
                        sub_key = %self.sub_key,
                        topic = %self.topic_name,
                        iter = self.delivery_iter.load(Ordering::Relaxed),
                        error = %e,
                        "Delivery failed, sleeping for {:?}",
                        wait
                    );
                    self.sleep_or_stop(wait).await;
                }
            }
        }

        self.set_state(TaskState::Stopped);
        info!(sub_key = %self.sub_key, "Delivery task stopped");
    }

    /// Wakes once the queue holds messages and either the delivery interval
    /// has passed or the previous attempt left more work behind.
    async fn should_wake(&self, config: &SubscriptionConfig, last_run: Instant, draining: bool) -> bool {
        let queue = self.queue.lock().await;
        if queue.is_empty() {
            return false;
        }
        draining || last_run.elapsed() >= config.task_delivery_interval
    }

    async fn sleep_or_stop(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
    }

    /// Enqueues durable messages already waiting in the store, fetching them
    /// in groups of `recovery_group_size`.
    pub async fn recover(&self) -> PubSubResult<usize> {
        let mut queue = self.queue.lock().await;

        let pub_time_max = now_ms();
        let msg_ids = self
            .ctx
            .store
            .pending_msg_ids(&self.sub_key, pub_time_max)
            .await?;
        if msg_ids.is_empty() {
            return Ok(0);
        }

        let group_size = self.ctx.settings.recovery_group_size.max(1);
        info!(
            sub_key = %self.sub_key,
            topic = %self.topic_name,
            count = msg_ids.len(),
            groups = msg_ids.len().div_ceil(group_size),
            group_size,
            "Found initial messages to enqueue"
        );

        let mut added = 0;
        for group in msg_ids.chunks(group_size) {
            let rows = self.ctx.store.fetch_by_ids(&self.sub_key, group).await?;
            added += enqueue_rows(&mut queue, &self.sub_key, rows);
        }
        Ok(added)
    }

    /// Inserts durable rows whose row id is not queued yet.
    pub async fn enqueue_durable(&self, rows: Vec<StoredMessage>) -> usize {
        let mut queue = self.queue.lock().await;
        enqueue_rows(&mut queue, &self.sub_key, rows)
    }

    /// Builds transient messages for this subscription, skipping the ones
    /// restricted to other subscriptions.
    pub async fn enqueue_transient(&self, origin: &ServerIdentity, published: &[PublishedMessage]) -> usize {
        let mut queue = self.queue.lock().await;
        let mut added = 0;

        for payload in published {
            let msg = match Message::transient(&self.sub_key, origin, payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(sub_key = %self.sub_key, error = %e, "Rejecting transient message");
                    continue;
                }
            };
            if !msg.is_deliverable_to(&self.sub_key) {
                continue;
            }
            queue.insert(msg);
            added += 1;
        }

        debug!(sub_key = %self.sub_key, added, "Enqueued transient messages");
        added
    }

    /// Inserts ready-made messages.
    pub async fn enqueue(&self, messages: impl IntoIterator<Item = Message>) {
        let mut queue = self.queue.lock().await;
        for msg in messages {
            queue.insert(msg);
        }
    }

    pub async fn durable_row_ids(&self) -> HashSet<u64> {
        self.queue.lock().await.durable_row_ids()
    }

    /// Runs one delivery attempt through `callback`.
    pub(crate) async fn run_delivery(&self, config: &SubscriptionConfig, callback: &dyn DeliveryCallback) -> Outcome {
        let iter = self.delivery_iter.fetch_add(1, Ordering::Relaxed) + 1;
        let mut queue = self.queue.lock().await;

        let requested = self.take_delete_requested();
        let batch = queue.peek_batch(config.batch_size());

        let mut forced: Vec<Message> = Vec::new();
        for msg_id in &requested {
            match queue.get(msg_id) {
                Some(msg) => forced.push(msg.clone()),
                None => debug!(sub_key = %self.sub_key, msg_id = %msg_id, "Requested deletion of unknown message"),
            }
        }
        for msg in &batch {
            if msg.delivery_count >= config.max_retry() && !forced.iter().any(|m| m.msg_id == msg.msg_id) {
                info!(
                    sub_key = %self.sub_key,
                    msg_id = %msg.msg_id,
                    delivery_count = msg.delivery_count,
                    "Message reached max delivery retries"
                );
                forced.push(msg.clone());
            }
        }

        let mut hook_error = None;
        let disposition = match self.ctx.hooks.get(&self.topic_name) {
            Some(hook) => match hook.classify(&self.sub_key, &batch, &forced).await {
                Ok(disposition) => disposition,
                Err(e) => {
                    hook_error = Some(e);
                    Disposition::default()
                }
            },
            None => Disposition {
                deliver: batch
                    .iter()
                    .filter(|msg| !forced.iter().any(|m| m.msg_id == msg.msg_id))
                    .cloned()
                    .collect(),
                ..Default::default()
            },
        };

        let mut to_delete: Vec<String> = forced.into_iter().map(|m| m.msg_id).collect();
        for msg in &disposition.delete {
            if !to_delete.contains(&msg.msg_id) {
                to_delete.push(msg.msg_id.clone());
            }
        }
        if !to_delete.is_empty() {
            self.delete_locked(&mut queue, &to_delete).await;
        }

        if let Some(e) = hook_error {
            let e = match e {
                PubSubError::Hook(_) => e,
                other => PubSubError::Hook(other.to_string()),
            };
            return Outcome::Failed(e);
        }

        if !disposition.skip.is_empty() {
            let skipped: Vec<&str> = disposition.skip.iter().map(|m| m.msg_id.as_str()).collect();
            info!(sub_key = %self.sub_key, ?skipped, "Skipping messages");
        }

        let mut to_deliver: Vec<Message> = disposition
            .deliver
            .into_iter()
            .filter(|msg| queue.contains(&msg.msg_id))
            .collect();
        if to_deliver.is_empty() {
            return Outcome::Delivered {
                count: 0,
                remaining: queue.len(),
            };
        }

        let payload = if config.wrap_in_list() {
            DeliveryPayload::Batch(to_deliver.clone())
        } else {
            to_deliver.truncate(1);
            DeliveryPayload::Single(to_deliver[0].clone())
        };

        if let Err(e) = callback.deliver(&self.sub_key, payload).await {
            return Outcome::Failed(e);
        }

        let delivered_ids: Vec<String> = to_deliver.iter().map(|m| m.msg_id.clone()).collect();
        if let Err(e) = self
            .ctx
            .store
            .confirm_delivered(&self.sub_key, &delivered_ids)
            .await
        {
            return Outcome::Failed(PubSubError::Confirmation(e));
        }

        let mut count = 0;
        for msg_id in &delivered_ids {
            match queue.remove_by_id(msg_id) {
                Ok(_) => count += 1,
                Err(e) => warn!(sub_key = %self.sub_key, error = %e, "Could not remove delivered message"),
            }
        }

        self.len_batches.fetch_add(1, Ordering::Relaxed);
        let total = self.len_delivered.fetch_add(count as u64, Ordering::Relaxed) + count as u64;
        info!(
            sub_key = %self.sub_key,
            topic = %self.topic_name,
            endpoint = %config.endpoint_name,
            iter,
            ?delivered_ids,
            total,
            "Delivered {} message(s)",
            count
        );

        Outcome::Delivered {
            count,
            remaining: queue.len(),
        }
    }

    fn take_delete_requested(&self) -> Vec<String> {
        let mut requested = self
            .delete_requested
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *requested)
    }

    /// Removes `msg_ids` from the queue and marks the durable ones as deleted.
    /// Must be called with the queue lock held.
    async fn delete_locked(&self, queue: &mut DeliveryQueue, msg_ids: &[String]) {
        let mut durable = Vec::new();
        for msg_id in msg_ids {
            match queue.remove_by_id(msg_id) {
                Ok(msg) if msg.is_durable() => durable.push(msg.msg_id),
                Ok(_) => {}
                Err(e) => debug!(sub_key = %self.sub_key, error = %e, "Nothing to delete"),
            }
        }

        info!(sub_key = %self.sub_key, topic = %self.topic_name, ?msg_ids, "Deleting messages");

        if durable.is_empty() {
            return;
        }
        if let Err(e) = self.ctx.store.mark_deleted(&self.sub_key, &durable).await {
            warn!(sub_key = %self.sub_key, error = %e, "Could not mark messages as deleted");
        }
    }

    /// Deletes messages by id. Unknown ids are ignored.
    ///
    /// Push-mode tasks apply the request at the start of their next delivery
    /// attempt; pull-mode tasks apply it immediately.
    pub async fn delete_messages(&self, msg_ids: &[String]) {
        if self.config().delivery_method.is_push() {
            let mut requested = self
                .delete_requested
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            requested.extend(msg_ids.iter().cloned());
            info!(sub_key = %self.sub_key, ?msg_ids, "Marking messages to be deleted");
            return;
        }

        let mut queue = self.queue.lock().await;
        self.delete_locked(&mut queue, msg_ids).await;
    }

    /// Queued messages, optionally only the durable or only the transient ones.
    pub async fn get_messages(&self, has_durability: Option<bool>) -> Vec<Message> {
        let queue = self.queue.lock().await;
        let out: Vec<Message> = queue
            .iter()
            .filter(|msg| has_durability.is_none_or(|durable| msg.is_durable() == durable))
            .cloned()
            .collect();

        debug!(sub_key = %self.sub_key, count = out.len(), ?has_durability, "Returning messages");
        out
    }

    pub async fn get_message(&self, msg_id: &str) -> PubSubResult<Message> {
        let queue = self.queue.lock().await;
        queue
            .get(msg_id)
            .cloned()
            .ok_or_else(|| PubSubError::not_found(msg_id))
    }

    /// Runs one delivery attempt on behalf of a pulling subscriber and returns
    /// what it would have been sent. Returned messages are confirmed and
    /// removed from the queue.
    pub async fn pull_messages(&self) -> PubSubResult<Vec<Message>> {
        let collector = Collector::default();
        let config = self.config();

        match self.run_delivery(&config, &collector).await {
            Outcome::Delivered { .. } => Ok(collector.into_messages()),
            Outcome::Failed(e) => Err(e),
        }
    }

    /// Number of (durable, transient) messages queued.
    pub async fn queue_depth(&self) -> (usize, usize) {
        self.queue.lock().await.depth()
    }

    pub async fn stats(&self) -> TaskStats {
        let (durable_depth, transient_depth) = self.queue_depth().await;
        TaskStats {
            sub_key: self.sub_key.clone(),
            topic_name: self.topic_name.clone(),
            state: self.state(),
            delivery_iter: self.delivery_iter.load(Ordering::Relaxed),
            len_batches: self.len_batches.load(Ordering::Relaxed),
            len_delivered: self.len_delivered.load(Ordering::Relaxed),
            durable_depth,
            transient_depth,
        }
    }

    /// Asks the loop to exit. A delivery already in flight is not interrupted.
    pub fn stop(&self) {
        if self.keep_running.swap(false, Ordering::AcqRel) {
            info!(sub_key = %self.sub_key, "Stopping delivery task");
            self.wake.notify_one();
        }
    }

    /// Drops every queued message without delivering it.
    pub async fn clear(&self) {
        let mut queue = self.queue.lock().await;
        let (durable, transient) = queue.depth();
        queue.clear();
        info!(sub_key = %self.sub_key, durable, transient, "Cleared task messages");
    }
}

impl std::fmt::Debug for DeliveryTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTask")
            .field("sub_key", &self.sub_key)
            .field("topic_name", &self.topic_name)
            .field("state", &self.state())
            .finish()
    }
}

fn enqueue_rows(queue: &mut DeliveryQueue, sub_key: &str, rows: Vec<StoredMessage>) -> usize {
    let mut known = queue.durable_row_ids();
    let mut added = 0;

    for row in rows {
        if !known.insert(row.row_id) {
            continue;
        }
        match Message::durable(&row) {
            Ok(msg) => {
                queue.insert(msg);
                added += 1;
            }
            Err(e) => warn!(sub_key, row_id = row.row_id, error = %e, "Rejecting durable message"),
        }
    }

    debug!(sub_key, added, "Enqueued durable messages");
    added
}

/// Callback that keeps whatever it is handed, used by `pull_messages`.
#[derive(Default)]
struct Collector {
    messages: StdMutex<Vec<Message>>,
}

impl Collector {
    fn into_messages(self) -> Vec<Message> {
        self.messages.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DeliveryCallback for Collector {
    async fn deliver(&self, _sub_key: &str, payload: DeliveryPayload) -> PubSubResult<()> {
        let mut messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        messages.extend(payload.into_messages());
        Ok(())
    }
}
