//! In-memory topic broker for testing.
//!
//! Implements [`BrokerConnection`] and [`BrokerChannel`] with the semantics
//! the transport relies on:
//!
//! - topic, direct and fanout exchanges (`*` matches one word, `#` zero or more)
//! - durable and auto-delete queues, idempotent declarations
//! - per-channel delivery tags and prefetch limits
//! - transactional channels buffering publishes, acks and nacks until commit
//! - unacknowledged deliveries returning to their queue when a channel closes
//!
//! Channels and connections can be closed from the broker side to exercise
//! recovery paths, and the broker exposes counters and queue inspection for
//! assertions.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    BasicProperties, BrokerChannel, BrokerConnection, ConnectionManager, Consumer, Delivery,
    ExchangeKind, QueueDeclaration,
};
use crate::error::{BrokerError, BrokerResult, TransportError};

/// Counters of operations the broker has applied.
///
/// Transactional operations are counted when committed, not when issued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Messages routed by an exchange.
    pub published: u64,
    /// Deliveries positively acknowledged.
    pub acks: u64,
    /// Deliveries negatively acknowledged.
    pub nacks: u64,
    /// Negative acknowledgments that returned the message to its queue.
    pub requeued: u64,
    /// Successful transaction commits.
    pub commits: u64,
    /// Transaction rollbacks.
    pub rollbacks: u64,
    /// Channels opened over the broker's lifetime.
    pub channels_opened: u64,
}

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Broker properties.
    pub properties: BasicProperties,
    /// Payload.
    pub body: Vec<u8>,
    /// Whether it was delivered before.
    pub redelivered: bool,
}

impl QueuedMessage {
    fn to_delivery(&self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            properties: self.properties.clone(),
            body: self.body.clone(),
        }
    }
}

struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct ConsumerSlot {
    channel_id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    declaration: QueueDeclaration,
    ready: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerSlot>,
    had_consumers: bool,
    cursor: usize,
}

struct Unacked {
    queue: String,
    message: QueuedMessage,
}

enum PendingOp {
    Publish {
        exchange: String,
        routing_key: String,
        properties: BasicProperties,
        body: Vec<u8>,
    },
    Ack(u64),
    Nack { delivery_tag: u64, requeue: bool },
}

struct ChannelState {
    connection_id: u64,
    open: bool,
    transactional: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    pending: Vec<PendingOp>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, ChannelState>,
    connections: HashMap<u64, bool>,
    next_channel_id: u64,
    next_connection_id: u64,
    next_consumer_id: u64,
    stats: BrokerStats,
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether an AMQP-style topic pattern matches a routing key.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && matches_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && matches_words(rest, &key[1..]),
    }
}

impl BrokerState {
    fn connection_open(&self, connection_id: u64) -> bool {
        self.connections
            .get(&connection_id)
            .copied()
            .unwrap_or(false)
    }

    fn ensure_open(&self, channel_id: u64) -> BrokerResult<()> {
        match self.channels.get(&channel_id) {
            Some(channel) if channel.open => Ok(()),
            Some(channel) if !self.connection_open(channel.connection_id) => {
                Err(BrokerError::ConnectionClosed)
            }
            _ => Err(BrokerError::ChannelClosed),
        }
    }

    fn channel_mut(&mut self, channel_id: u64) -> BrokerResult<&mut ChannelState> {
        self.ensure_open(channel_id)?;
        self.channels
            .get_mut(&channel_id)
            .ok_or(BrokerError::ChannelClosed)
    }

    fn check_exchange(&self, exchange: &str) -> BrokerResult<()> {
        if exchange.is_empty() || self.exchanges.contains_key(exchange) {
            Ok(())
        } else {
            Err(BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })
        }
    }

    fn check_queue(&self, queue: &str) -> BrokerResult<()> {
        if self.queues.contains_key(queue) {
            Ok(())
        } else {
            Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            })
        }
    }

    fn route(
        &mut self,
        exchange: String,
        routing_key: String,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> BrokerResult<()> {
        let targets: BTreeSet<String> = if exchange.is_empty() {
            self.queues
                .contains_key(&routing_key)
                .then(|| routing_key.clone())
                .into_iter()
                .collect()
        } else {
            let kind = *self
                .exchanges
                .get(&exchange)
                .ok_or_else(|| BrokerError::NotFound {
                    kind: "exchange",
                    name: exchange.clone(),
                })?;
            self.bindings
                .iter()
                .filter(|binding| binding.exchange == exchange)
                .filter(|binding| match kind {
                    ExchangeKind::Direct => binding.routing_key == routing_key,
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(&binding.routing_key, &routing_key),
                })
                .map(|binding| binding.queue.clone())
                .collect()
        };

        self.stats.published += 1;
        let message = QueuedMessage {
            exchange,
            routing_key,
            properties,
            body,
            redelivered: false,
        };
        for queue in targets {
            if let Some(queue) = self.queues.get_mut(&queue) {
                queue.ready.push_back(message.clone());
            }
        }
        self.dispatch();
        Ok(())
    }

    fn ack(&mut self, channel_id: u64, delivery_tag: u64) -> BrokerResult<()> {
        let channel = self.channel_mut(channel_id)?;
        channel
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| unknown_tag(delivery_tag))?;
        self.stats.acks += 1;
        self.dispatch();
        Ok(())
    }

    fn nack(&mut self, channel_id: u64, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let channel = self.channel_mut(channel_id)?;
        let unacked = channel
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| unknown_tag(delivery_tag))?;
        self.stats.nacks += 1;
        if requeue {
            self.stats.requeued += 1;
            self.requeue(unacked);
        }
        self.dispatch();
        Ok(())
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }

    fn apply(&mut self, channel_id: u64, op: PendingOp) -> BrokerResult<()> {
        match op {
            PendingOp::Publish {
                exchange,
                routing_key,
                properties,
                body,
            } => self.route(exchange, routing_key, properties, body),
            PendingOp::Ack(delivery_tag) => self.ack(channel_id, delivery_tag),
            PendingOp::Nack {
                delivery_tag,
                requeue,
            } => self.nack(channel_id, delivery_tag, requeue),
        }
    }

    fn commit(&mut self, channel_id: u64) -> BrokerResult<()> {
        let channel = self.channel_mut(channel_id)?;
        if !channel.transactional {
            return Err(BrokerError::PreconditionFailed(
                "channel is not transactional".to_string(),
            ));
        }
        let pending = std::mem::take(&mut channel.pending);
        for op in pending {
            self.apply(channel_id, op)?;
        }
        self.stats.commits += 1;
        Ok(())
    }

    fn rollback(&mut self, channel_id: u64) -> BrokerResult<()> {
        let channel = self.channel_mut(channel_id)?;
        if !channel.transactional {
            return Err(BrokerError::PreconditionFailed(
                "channel is not transactional".to_string(),
            ));
        }
        channel.pending.clear();
        self.stats.rollbacks += 1;
        Ok(())
    }

    fn close_channel(&mut self, channel_id: u64) {
        let unacked = match self.channels.get_mut(&channel_id) {
            Some(channel) if channel.open => {
                channel.open = false;
                channel.pending.clear();
                std::mem::take(&mut channel.unacked)
            }
            _ => return,
        };

        for queue in self.queues.values_mut() {
            queue
                .consumers
                .retain(|consumer| consumer.channel_id != channel_id);
        }
        for (_, entry) in unacked.into_iter().rev() {
            self.requeue(entry);
        }

        let abandoned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| {
                queue.declaration.auto_delete && queue.had_consumers && queue.consumers.is_empty()
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in abandoned {
            tracing::debug!("auto-deleting queue {} after its last consumer left", name);
            self.queues.remove(&name);
            self.bindings.retain(|binding| binding.queue != name);
        }

        self.dispatch();
    }

    fn close_connection(&mut self, connection_id: u64) {
        self.connections.insert(connection_id, false);
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channels {
            self.close_channel(channel_id);
        }
    }

    /// Push ready messages to consumers, round-robin, within prefetch limits.
    fn dispatch(&mut self) {
        let BrokerState {
            queues, channels, ..
        } = self;

        for (name, queue) in queues.iter_mut() {
            loop {
                if queue.ready.is_empty() || queue.consumers.is_empty() {
                    break;
                }

                let mut progressed = false;
                for _ in 0..queue.consumers.len() {
                    let index = queue.cursor % queue.consumers.len();
                    queue.cursor = queue.cursor.wrapping_add(1);

                    let Some(channel) = channels.get_mut(&queue.consumers[index].channel_id)
                    else {
                        continue;
                    };
                    if !channel.open
                        || (channel.prefetch > 0
                            && channel.unacked.len() >= usize::from(channel.prefetch))
                    {
                        continue;
                    }
                    let Some(message) = queue.ready.pop_front() else {
                        break;
                    };

                    channel.next_tag += 1;
                    let delivery_tag = channel.next_tag;
                    if queue.consumers[index]
                        .sender
                        .send(message.to_delivery(delivery_tag))
                        .is_err()
                    {
                        queue.ready.push_front(message);
                        queue.consumers.remove(index);
                    } else {
                        channel.unacked.insert(
                            delivery_tag,
                            Unacked {
                                queue: name.clone(),
                                message,
                            },
                        );
                    }
                    progressed = true;
                    break;
                }

                if !progressed {
                    break;
                }
            }
        }
    }
}

fn unknown_tag(delivery_tag: u64) -> BrokerError {
    BrokerError::PreconditionFailed(format!("unknown delivery tag {}", delivery_tag))
}

/// An in-process broker shared by any number of connections.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to this broker.
    pub fn connect(&self) -> Arc<InMemoryConnection> {
        let mut state = lock(&self.state);
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.insert(id, true);
        Arc::new(InMemoryConnection {
            id,
            state: self.state.clone(),
        })
    }

    /// Close a channel from the broker side.
    pub fn close_channel(&self, channel_id: u64) {
        lock(&self.state).close_channel(channel_id);
    }

    /// Close every open channel from the broker side.
    pub fn close_all_channels(&self) {
        let mut state = lock(&self.state);
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> BrokerStats {
        lock(&self.state).stats.clone()
    }

    /// Whether a queue with this name exists.
    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }

    /// Declaration a queue was created with.
    pub fn queue_declaration(&self, queue: &str) -> Option<QueueDeclaration> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|queue| queue.declaration.clone())
    }

    /// Kind of a declared exchange.
    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        lock(&self.state).exchanges.get(exchange).copied()
    }

    /// Number of messages waiting in a queue.
    pub fn ready_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |queue| queue.ready.len())
    }

    /// Messages waiting in a queue, front first.
    pub fn ready_messages(&self, queue: &str) -> Vec<QueuedMessage> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|queue| queue.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of deliveries from a queue awaiting acknowledgment.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|entry| entry.queue == queue)
            .count()
    }

    /// Number of active consumers on a queue.
    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    /// Whether `queue` is bound to `exchange` under `routing_key`.
    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        lock(&self.state).bindings.iter().any(|binding| {
            binding.queue == queue
                && binding.exchange == exchange
                && binding.routing_key == routing_key
        })
    }

    /// Routing keys bound to a queue, sorted.
    pub fn binding_keys(&self, queue: &str) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.state)
            .bindings
            .iter()
            .filter(|binding| binding.queue == queue)
            .map(|binding| binding.routing_key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of channels currently open.
    pub fn open_channel_count(&self) -> usize {
        lock(&self.state)
            .channels
            .values()
            .filter(|channel| channel.open)
            .count()
    }
}

/// A connection to an [`InMemoryBroker`].
pub struct InMemoryConnection {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryConnection {
    /// Broker-assigned connection number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drop the connection, closing all of its channels.
    pub fn close(&self) {
        lock(&self.state).close_connection(self.id);
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let mut state = lock(&self.state);
        if !state.connection_open(self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                open: true,
                transactional: false,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                pending: Vec::new(),
            },
        );
        state.stats.channels_opened += 1;
        Ok(Arc::new(InMemoryChannel {
            id,
            state: self.state.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        lock(&self.state).connection_open(self.id)
    }
}

/// A channel on an [`InMemoryConnection`].
pub struct InMemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        lock(&self.state).ensure_open(self.id).is_ok()
    }

    async fn tx_select(&self) -> BrokerResult<()> {
        lock(&self.state).channel_mut(self.id)?.transactional = true;
        Ok(())
    }

    async fn tx_commit(&self) -> BrokerResult<()> {
        lock(&self.state).commit(self.id)
    }

    async fn tx_rollback(&self) -> BrokerResult<()> {
        lock(&self.state).rollback(self.id)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        state.channel_mut(self.id)?.prefetch = prefetch_count;
        state.dispatch();
        Ok(())
    }

    async fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::PreconditionFailed(format!(
                "exchange {} already declared as {:?}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, declaration: &QueueDeclaration) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;
        match state.queues.get(&declaration.name) {
            Some(existing)
                if existing.declaration.durable != declaration.durable
                    || existing.declaration.auto_delete != declaration.auto_delete =>
            {
                Err(BrokerError::PreconditionFailed(format!(
                    "queue {} already declared with different flags",
                    declaration.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    declaration.name.clone(),
                    QueueState {
                        declaration: declaration.clone(),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        had_consumers: false,
                        cursor: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;
        state.check_queue(queue)?;
        if exchange.is_empty() {
            return Err(BrokerError::PreconditionFailed(
                "cannot bind to the default exchange".to_string(),
            ));
        }
        state.check_exchange(exchange)?;

        let exists = state.bindings.iter().any(|binding| {
            binding.queue == queue
                && binding.exchange == exchange
                && binding.routing_key == routing_key
        });
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;
        state.bindings.retain(|binding| {
            !(binding.queue == queue
                && binding.exchange == exchange
                && binding.routing_key == routing_key)
        });
        Ok(())
    }

    async fn queue_purge(&self, queue: &str) -> BrokerResult<u32> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;
        state.check_queue(queue)?;
        let purged = state
            .queues
            .get_mut(queue)
            .map_or(0, |queue| std::mem::take(&mut queue.ready).len());
        Ok(u32::try_from(purged).unwrap_or(u32::MAX))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        state.check_exchange(exchange)?;
        let channel = state.channel_mut(self.id)?;
        if channel.transactional {
            channel.pending.push(PendingOp::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties,
                body,
            });
            Ok(())
        } else {
            state.route(
                exchange.to_string(),
                routing_key.to_string(),
                properties,
                body,
            )
        }
    }

    async fn basic_consume(&self, queue: &str) -> BrokerResult<Consumer> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;
        state.check_queue(queue)?;

        state.next_consumer_id += 1;
        let tag = format!("ctag-{}", state.next_consumer_id);
        let (sender, deliveries) = mpsc::unbounded_channel();
        if let Some(queue) = state.queues.get_mut(queue) {
            queue.consumers.push(ConsumerSlot {
                channel_id: self.id,
                sender,
            });
            queue.had_consumers = true;
        }
        state.dispatch();
        Ok(Consumer { tag, deliveries })
    }

    async fn basic_get(&self, queue: &str, auto_ack: bool) -> BrokerResult<Option<Delivery>> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;
        state.check_queue(queue)?;

        let Some(message) = state
            .queues
            .get_mut(queue)
            .and_then(|queue| queue.ready.pop_front())
        else {
            return Ok(None);
        };

        let channel = state.channel_mut(self.id)?;
        channel.next_tag += 1;
        let delivery = message.to_delivery(channel.next_tag);
        if auto_ack {
            state.stats.acks += 1;
        } else {
            channel.unacked.insert(
                delivery.delivery_tag,
                Unacked {
                    queue: queue.to_string(),
                    message,
                },
            );
        }
        Ok(Some(delivery))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        let channel = state.channel_mut(self.id)?;
        if !channel.transactional {
            return state.ack(self.id, delivery_tag);
        }
        if !channel.unacked.contains_key(&delivery_tag) {
            return Err(unknown_tag(delivery_tag));
        }
        channel.pending.push(PendingOp::Ack(delivery_tag));
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        let channel = state.channel_mut(self.id)?;
        if !channel.transactional {
            return state.nack(self.id, delivery_tag, requeue);
        }
        if !channel.unacked.contains_key(&delivery_tag) {
            return Err(unknown_tag(delivery_tag));
        }
        channel.pending.push(PendingOp::Nack {
            delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        lock(&self.state).close_channel(self.id);
        Ok(())
    }
}

/// Connection manager handing out connections to an [`InMemoryBroker`].
///
/// Reuses the current connection while it is open and connects again once it
/// has been closed. Every reported error is recorded for inspection.
pub struct InMemoryConnectionManager {
    broker: InMemoryBroker,
    current: Mutex<Option<Arc<InMemoryConnection>>>,
    reported: Mutex<Vec<TransportError>>,
}

impl InMemoryConnectionManager {
    /// Create a manager for `broker`.
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            current: Mutex::new(None),
            reported: Mutex::new(Vec::new()),
        }
    }

    /// The connection currently handed out, if any.
    pub fn current(&self) -> Option<Arc<InMemoryConnection>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Errors reported so far, oldest first.
    pub fn reported_errors(&self) -> Vec<TransportError> {
        self.reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ConnectionManager for InMemoryConnectionManager {
    async fn get_connection(&self) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let connection = match current.as_ref() {
            Some(connection) if connection.is_open() => connection.clone(),
            _ => {
                let connection = self.broker.connect();
                tracing::debug!("opened in-memory connection {}", connection.id());
                *current = Some(connection.clone());
                connection
            }
        };
        Ok(connection)
    }

    fn report_error(&self, error: &TransportError) {
        if error.is_connection_level() {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().is_some_and(|connection| !connection.is_open()) {
                *current = None;
            }
        }
        self.reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error.clone());
    }
}
