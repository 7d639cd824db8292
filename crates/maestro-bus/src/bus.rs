use crate::message::{AgentMessage, MessageType};
use crate::queue::MessageQueue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum messages held by each queue, broadcast queue included.
    pub queue_capacity: usize,
    /// Dead letters kept before the oldest is dropped.
    pub dead_letter_capacity: usize,
    /// A pending message older than this since its last attempt is retried.
    #[serde(with = "maestro_core::duration_ms")]
    pub retry_after: Duration,
    /// A pending message older than this since first send is dead-lettered.
    #[serde(with = "maestro_core::duration_ms")]
    pub max_message_age: Duration,
    /// Period of the retry and dead-letter sweep.
    #[serde(with = "maestro_core::duration_ms")]
    pub reliability_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            dead_letter_capacity: 1_000,
            retry_after: Duration::from_secs(5),
            max_message_age: Duration::from_secs(300),
            reliability_interval: Duration::from_secs(1),
        }
    }
}

/// Predicate deciding whether a message is accepted by [`MessageBus::send`].
pub type MessageFilter = Arc<dyn Fn(&AgentMessage) -> bool + Send + Sync>;

/// Returns a replacement receiver for messages it wants to redirect.
pub type RoutingRule = Arc<dyn Fn(&AgentMessage) -> Option<String> + Send + Sync>;

/// Reacts to delivered messages; a returned message is sent back through the bus.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivered message; `Some` is sent back through the bus.
    async fn handle(&self, message: &AgentMessage) -> MaestroResult<Option<AgentMessage>>;
}

/// Why a message ended in the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// TTL ended before delivery.
    Expired,
    /// No retries left.
    RetriesExhausted,
    /// Pending longer than `max_message_age`.
    MaxAgeExceeded,
    /// No queue for the receiver.
    Undeliverable,
    /// Receiver queue at capacity.
    QueueFull,
}

/// A message that will never be delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The message as last queued.
    pub message: AgentMessage,
    /// Why it was dead-lettered.
    pub reason: DeadLetterReason,
    /// When it was dead-lettered.
    pub at: DateTime<Utc>,
}

/// Delivery counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusMetrics {
    /// Messages accepted by `send`.
    pub sent: u64,
    /// Messages handed to a receiver.
    pub delivered: u64,
    /// Messages refused by `send`.
    pub rejected: u64,
    /// Retry attempts.
    pub retried: u64,
    /// Messages dropped for an expired TTL.
    pub expired: u64,
    /// Messages moved to the dead-letter queue.
    pub dead_lettered: u64,
    /// Messages sent but not yet delivered.
    pub pending: usize,
    /// Messages currently queued, duplicates included.
    pub queued: usize,
}

/// Outcome of one [`MessageBus::process_retries`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySweep {
    /// Messages re-enqueued.
    pub retried: usize,
    /// Messages given up on.
    pub dead_lettered: usize,
}

struct PendingEntry {
    message: AgentMessage,
    /// Arrival sequence in the receiver's queue, reused on retry.
    seq: u64,
    first_sent: Instant,
    last_attempt: Instant,
}

struct BusState {
    queues: HashMap<String, MessageQueue>,
    broadcast: MessageQueue,
    pending: HashMap<Uuid, PendingEntry>,
    dead_letters: VecDeque<DeadLetter>,
    metrics: BusMetrics,
}

impl BusState {
    fn dead_letter(&mut self, capacity: usize, message: AgentMessage, reason: DeadLetterReason) {
        warn!(message_id = %message.id, reason = ?reason, "Message dead-lettered");
        if reason == DeadLetterReason::Expired {
            self.metrics.expired += 1;
        }
        self.metrics.dead_lettered += 1;
        if capacity == 0 {
            return;
        }
        while self.dead_letters.len() >= capacity {
            self.dead_letters.pop_front();
        }
        self.dead_letters.push_back(DeadLetter {
            message,
            reason,
            at: Utc::now(),
        });
    }

    fn queue_for(&mut self, receiver: Option<&str>) -> Option<&mut MessageQueue> {
        match receiver {
            Some(id) => self.queues.get_mut(id),
            None => Some(&mut self.broadcast),
        }
    }

    fn queued(&self) -> usize {
        self.broadcast.len() + self.queues.values().map(MessageQueue::len).sum::<usize>()
    }
}

/// Priority-ordered, retrying message channel between the orchestrator and agents.
///
/// Every registered agent owns a queue; messages without a receiver go to a
/// shared broadcast queue that any receiver may consume once its own queue is
/// empty. A message stays *pending* from `send` until it is delivered or
/// dead-lettered.
pub struct MessageBus {
    config: BusConfig,
    state: Mutex<BusState>,
    notify: Notify,
    filters: RwLock<Vec<MessageFilter>>,
    routes: RwLock<Vec<RoutingRule>>,
    handlers: RwLock<HashMap<MessageType, Vec<Arc<dyn MessageHandler>>>>,
}

impl MessageBus {
    /// Bus with only the broadcast queue.
    pub fn new(config: BusConfig) -> Self {
        let broadcast = MessageQueue::new(config.queue_capacity);
        Self {
            config,
            state: Mutex::new(BusState {
                queues: HashMap::new(),
                broadcast,
                pending: HashMap::new(),
                dead_letters: VecDeque::new(),
                metrics: BusMetrics::default(),
            }),
            notify: Notify::new(),
            filters: RwLock::new(Vec::new()),
            routes: RwLock::new(Vec::new()),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Create a dedicated queue for `agent_id`. Registering twice is a no-op.
    pub fn register_agent(&self, agent_id: impl Into<String>) {
        let agent_id = agent_id.into();
        let mut state = self.state.lock();
        if !state.queues.contains_key(&agent_id) {
            debug!(agent_id = %agent_id, "Bus queue created");
            state
                .queues
                .insert(agent_id, MessageQueue::new(self.config.queue_capacity));
        }
    }

    /// Drop an agent's queue; its undelivered messages are dead-lettered.
    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(mut queue) = state.queues.remove(agent_id) else {
            return false;
        };
        for message in queue.drain_where(|_| true) {
            if state.pending.remove(&message.id).is_some() {
                state.dead_letter(
                    self.config.dead_letter_capacity,
                    message,
                    DeadLetterReason::Undeliverable,
                );
            }
        }
        true
    }

    /// Whether `agent_id` has a queue.
    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.state.lock().queues.contains_key(agent_id)
    }

    /// Messages failing any filter are rejected by `send`.
    pub fn add_filter<F>(&self, filter: F)
    where
        F: Fn(&AgentMessage) -> bool + Send + Sync + 'static,
    {
        self.filters.write().push(Arc::new(filter));
    }

    /// The first rule returning a receiver redirects the message there.
    pub fn add_routing_rule<F>(&self, rule: F)
    where
        F: Fn(&AgentMessage) -> Option<String> + Send + Sync + 'static,
    {
        self.routes.write().push(Arc::new(rule));
    }

    /// Run `handler` on every delivered message of `message_type`.
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().entry(message_type).or_default().push(handler);
    }

    /// Accept a message for delivery. Returns `false` if it was rejected.
    pub fn send(&self, message: AgentMessage) -> bool {
        self.try_send(message).is_ok()
    }

    /// Like [`MessageBus::send`], reporting why a message was refused.
    pub fn try_send(&self, mut message: AgentMessage) -> MaestroResult<Uuid> {
        let id = message.id;

        if message.is_expired() {
            let mut state = self.state.lock();
            state.metrics.rejected += 1;
            state.dead_letter(self.config.dead_letter_capacity, message, DeadLetterReason::Expired);
            return Err(MaestroError::MessageExpired(id));
        }

        if !self.filters.read().iter().all(|accept| accept(&message)) {
            self.state.lock().metrics.rejected += 1;
            debug!(message_id = %id, "Message rejected by filter");
            return Err(MaestroError::MessageUndeliverable(format!(
                "message {id} rejected by filter"
            )));
        }

        let redirect = self.routes.read().iter().find_map(|rule| rule(&message));
        if let Some(receiver) = redirect {
            debug!(message_id = %id, receiver = %receiver, "Message rerouted");
            message.receiver = Some(receiver);
        }

        let mut state = self.state.lock();
        let receiver = message.receiver.clone();
        let pushed = match state.queue_for(receiver.as_deref()) {
            None => Err((message, DeadLetterReason::Undeliverable)),
            Some(queue) => queue
                .push(message.clone())
                .map(|seq| (seq, message))
                .map_err(|m| (m, DeadLetterReason::QueueFull)),
        };

        match pushed {
            Ok((seq, message)) => {
                let now = Instant::now();
                state.pending.insert(
                    id,
                    PendingEntry {
                        message,
                        seq,
                        first_sent: now,
                        last_attempt: now,
                    },
                );
                state.metrics.sent += 1;
                drop(state);
                self.notify.notify_waiters();
                Ok(id)
            }
            Err((message, reason)) => {
                state.metrics.rejected += 1;
                state.dead_letter(self.config.dead_letter_capacity, message, reason);
                Err(MaestroError::MessageUndeliverable(format!(
                    "message {id} for {}: {reason:?}",
                    receiver.as_deref().unwrap_or("broadcast")
                )))
            }
        }
    }

    /// Wait up to `timeout` for the next message for `receiver`.
    pub async fn receive(&self, receiver: &str, timeout: Duration) -> Option<AgentMessage> {
        self.receive_matching(receiver, |_| true, timeout).await
    }

    /// Wait up to `timeout` for the best message satisfying `predicate`.
    ///
    /// Non-matching messages stay queued in their original order.
    pub async fn receive_matching<F>(
        &self,
        receiver: &str,
        mut predicate: F,
        timeout: Duration,
    ) -> Option<AgentMessage>
    where
        F: FnMut(&AgentMessage) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.take(receiver, &mut predicate) {
                self.run_handlers(&message).await;
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn take<F>(&self, receiver: &str, predicate: &mut F) -> Option<AgentMessage>
    where
        F: FnMut(&AgentMessage) -> bool,
    {
        let mut state = self.state.lock();
        let now = Utc::now();
        loop {
            let BusState {
                queues, broadcast, ..
            } = &mut *state;
            let candidate = queues
                .get_mut(receiver)
                .and_then(|q| q.pop_matching(&mut *predicate))
                .or_else(|| broadcast.pop_matching(&mut *predicate));
            let message = candidate?;

            // Copies whose original was already delivered or dead-lettered.
            if state.pending.remove(&message.id).is_none() {
                continue;
            }
            if message.is_expired_at(now) {
                state.dead_letter(self.config.dead_letter_capacity, message, DeadLetterReason::Expired);
                continue;
            }
            state.metrics.delivered += 1;
            debug!(message_id = %message.id, receiver = %receiver, "Message delivered");
            return Some(message);
        }
    }

    async fn run_handlers(&self, message: &AgentMessage) {
        let handlers = self
            .handlers
            .read()
            .get(&message.message_type)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            match handler.handle(message).await {
                Ok(Some(response)) => {
                    if let Err(e) = self.try_send(response) {
                        warn!(message_id = %message.id, error = %e, "Handler response not sent");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(message_id = %message.id, error = %e, "Message handler failed"),
            }
        }
    }

    /// Retry stale pending messages and dead-letter the hopeless ones.
    pub fn process_retries(&self) -> RetrySweep {
        let mut sweep = RetrySweep::default();
        let mut state = self.state.lock();
        let now = Instant::now();
        let wall = Utc::now();

        let mut ids: Vec<(u64, Uuid)> = state.pending.iter().map(|(id, e)| (e.seq, *id)).collect();
        ids.sort_unstable();
        for (_, id) in ids {
            let Some(entry) = state.pending.get(&id) else {
                continue;
            };
            let verdict = if entry.message.is_expired_at(wall) {
                Some(DeadLetterReason::Expired)
            } else if now.duration_since(entry.first_sent) >= self.config.max_message_age {
                Some(DeadLetterReason::MaxAgeExceeded)
            } else if now.duration_since(entry.last_attempt) < self.config.retry_after {
                continue;
            } else if entry.message.retry_count >= entry.message.max_retries {
                Some(DeadLetterReason::RetriesExhausted)
            } else {
                None
            };
            let receiver = entry.message.receiver.clone();

            // Pull the queued copy; a retry re-enqueues it at its original place.
            if let Some(queue) = state.queue_for(receiver.as_deref()) {
                queue.drain_where(|m| m.id == id);
            }

            match verdict {
                Some(reason) => {
                    if let Some(entry) = state.pending.remove(&id) {
                        state.dead_letter(self.config.dead_letter_capacity, entry.message, reason);
                        sweep.dead_lettered += 1;
                    }
                }
                None => {
                    let Some(entry) = state.pending.get_mut(&id) else {
                        continue;
                    };
                    entry.message.retry_count += 1;
                    entry.last_attempt = now;
                    let copy = entry.message.clone();
                    let seq = entry.seq;
                    let attempt = copy.retry_count;
                    let requeued = state
                        .queue_for(receiver.as_deref())
                        .is_some_and(|q| q.push_with_seq(seq, copy).is_ok());
                    if requeued {
                        state.metrics.retried += 1;
                        sweep.retried += 1;
                        debug!(message_id = %id, attempt, "Message retried");
                    } else if let Some(entry) = state.pending.remove(&id) {
                        state.dead_letter(
                            self.config.dead_letter_capacity,
                            entry.message,
                            DeadLetterReason::Undeliverable,
                        );
                        sweep.dead_lettered += 1;
                    }
                }
            }
        }
        drop(state);
        if sweep.retried > 0 {
            self.notify.notify_waiters();
        }
        sweep
    }

    /// Run [`MessageBus::process_retries`] on the reliability interval until aborted.
    pub fn spawn_reliability_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.reliability_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let sweep = self.process_retries();
                if sweep.dead_lettered > 0 {
                    info!(
                        retried = sweep.retried,
                        dead_lettered = sweep.dead_lettered,
                        "Bus reliability sweep"
                    );
                }
            }
        })
    }

    /// Snapshot of the dead-letter queue, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.iter().cloned().collect()
    }

    /// Messages queued for one receiver.
    pub fn queue_len(&self, receiver: &str) -> usize {
        self.state.lock().queues.get(receiver).map_or(0, MessageQueue::len)
    }

    /// Messages in the broadcast queue.
    pub fn broadcast_len(&self) -> usize {
        self.state.lock().broadcast.len()
    }

    /// Delivery counters plus current pending and queued counts.
    pub fn metrics(&self) -> BusMetrics {
        let state = self.state.lock();
        BusMetrics {
            pending: state.pending.len(),
            queued: state.queued(),
            ..state.metrics.clone()
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}
