//! Transactional send/receive over a topic broker.
//!
//! [`BrokerTransport`] ties the pieces together: it asks the
//! [`ConnectionManager`] for connections, keeps one [`ChannelSession`] per
//! worker in a [`SessionPool`], couples acknowledgments and publishes to the
//! caller's [`TransactionContext`], and manages topic subscriptions.
//!
//! # Unit of Work
//!
//! ```text
//!   receive(tx) ──► session_for(tx) ──► next_delivery ──► IncomingMessage
//!                        │                    │
//!                        │ enlists session:   │ registers per delivery:
//!                        │  committed   ─ tx_commit      commit      ─ basic_ack
//!                        │  rolled_back ─ tx_rollback    rolled_back ─ nack + tx_commit
//!                        ▼
//!   send(topic, msg, tx) ──► publish on the same session
//!
//!   tx.commit():   basic_ack ──► tx_commit        (ack and publishes land together)
//!   tx.rollback(): tx_rollback ──► nack(requeue) ──► tx_commit
//! ```
//!
//! Connection failures are reported to the connection manager and returned
//! to the caller. The transport never reconnects on its own; it only replaces
//! sessions whose channel went away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::broker::{BrokerChannel, ConnectionManager};
use crate::config::TransportConfig;
use crate::error::{BrokerError, TransportError, TransportResult};
use crate::headers;
use crate::message::{IncomingMessage, OutgoingMessage};
use crate::session::channel::SessionSetup;
use crate::session::{ChannelSession, NextDelivery, SessionPool, WorkerId};
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::topic::{MessageType, TopicNames};
use crate::topology::Topology;
use crate::transaction::TransactionContext;

/// Item slot key under which a unit of work caches its session.
pub const SESSION_ITEM_KEY: &str = "moonpool-broker.session";

/// Point-to-point and publish/subscribe transport over a topic broker.
pub struct BrokerTransport {
    connections: Arc<dyn ConnectionManager>,
    input_queue: String,
    config: TransportConfig,
    topology: Topology,
    topics: TopicNames,
    subscriptions: SubscriptionRegistry,
    sessions: SessionPool,
    disposed: AtomicBool,
}

impl BrokerTransport {
    /// Create a transport receiving from `input_queue`.
    ///
    /// Nothing is declared until [`initialize`](Self::initialize) or the
    /// first session is opened.
    pub fn new(
        connections: Arc<dyn ConnectionManager>,
        input_queue: impl Into<String>,
        config: TransportConfig,
    ) -> Self {
        let topology = Topology::from_config(&config);
        Self {
            connections,
            input_queue: input_queue.into(),
            config,
            topology,
            topics: TopicNames::new(),
            subscriptions: SubscriptionRegistry::new(),
            sessions: SessionPool::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Replace the topic resolver chain.
    pub fn with_topic_names(mut self, topics: TopicNames) -> Self {
        self.topics = topics;
        self
    }

    /// Input queue this transport receives from.
    pub fn address(&self) -> &str {
        &self.input_queue
    }

    /// Configuration the transport was built with.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Self-managed subscriptions.
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// Pooled worker sessions.
    pub fn sessions(&self) -> &SessionPool {
        &self.sessions
    }

    /// Routing topic for a message type.
    pub fn topic_for(&self, message_type: &MessageType) -> String {
        self.topics.resolve(message_type)
    }

    /// Whether bindings are tracked locally and replayed onto new sessions.
    pub fn is_self_managed(&self) -> bool {
        self.config.auto_delete_input_queue
    }

    /// Whether [`dispose`](Self::dispose) was called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Queue administration
    // =========================================================================

    /// Declare the exchange and the input queue.
    pub async fn initialize(&self) -> TransportResult<()> {
        let input = self.input_queue.clone();
        self.create_queue(&input).await
    }

    /// Declare a queue, the exchange and the queue's default binding.
    ///
    /// Only the input queue is ever auto-delete.
    pub async fn create_queue(&self, name: &str) -> TransportResult<()> {
        self.ensure_active()?;
        let auto_delete = self.auto_delete_for(name);
        let channel = self.open_throwaway().await?;
        let result = self
            .topology
            .declare_queue(channel.as_ref(), name, auto_delete)
            .await;
        self.close_throwaway(channel.as_ref()).await;
        result.map_err(|err| self.fail(err.into()))
    }

    /// Drop every ready message from the input queue. Returns how many were dropped.
    ///
    /// A queue that does not exist yet has nothing to purge.
    pub async fn purge(&self) -> TransportResult<u32> {
        self.ensure_active()?;
        let channel = self.open_throwaway().await?;
        let result = channel.queue_purge(&self.input_queue).await;
        self.close_throwaway(channel.as_ref()).await;
        match result {
            Ok(purged) => {
                tracing::debug!("purged {} messages from {}", purged, self.input_queue);
                Ok(purged)
            }
            Err(BrokerError::NotFound { .. }) => Ok(0),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// The worker's session, opening a new one if it has none or it closed.
    ///
    /// Two calls without an intervening close return the same instance.
    pub async fn acquire_for_receive(
        &self,
        worker: &WorkerId,
    ) -> TransportResult<Arc<ChannelSession>> {
        self.ensure_active()?;
        if let Some(session) = self.sessions.get(worker) {
            return Ok(session);
        }

        let session = self
            .open_session(worker)
            .await
            .map_err(|err| self.fail(err))?;
        let session = Arc::new(session);
        self.sessions.insert(session.clone()).await;
        Ok(session)
    }

    async fn open_session(&self, worker: &WorkerId) -> TransportResult<ChannelSession> {
        let connection = self.connections.get_connection().await?;
        let channel = connection.create_channel().await?;
        let session = ChannelSession::open(
            worker.clone(),
            channel,
            SessionSetup {
                input_queue: &self.input_queue,
                auto_delete: self.config.auto_delete_input_queue,
                prefetch_count: self.config.prefetch_count,
                topology: &self.topology,
                subscriptions: &self.subscriptions,
            },
        )
        .await?;
        Ok(session)
    }

    /// Session of the unit of work, enlisting the worker's session on first use.
    ///
    /// A cached session that was discarded is replaced as long as nothing ran
    /// on it yet. Once it carried deliveries, publishes or acks the unit of
    /// work cannot move to another channel and fails with `ChannelClosed`.
    async fn session_for(&self, tx: &TransactionContext) -> TransportResult<Arc<ChannelSession>> {
        if let Some(session) = tx.item::<ChannelSession>(SESSION_ITEM_KEY) {
            if !session.is_discarded() {
                return Ok(session);
            }
            if session.has_uncommitted_work() {
                tracing::warn!(
                    "unit of work for worker {} lost channel {} with uncommitted work",
                    session.worker(),
                    session.channel_id()
                );
                return Err(BrokerError::ChannelClosed.into());
            }
            tracing::debug!(
                "replacing discarded channel {} in unit of work for worker {}",
                session.channel_id(),
                session.worker()
            );
        }
        let session = self.acquire_for_receive(tx.worker()).await?;
        session.enlist(tx, SESSION_ITEM_KEY);
        Ok(session)
    }

    // =========================================================================
    // Receive
    // =========================================================================

    /// Wait up to the receive backoff for a message on the input queue.
    ///
    /// The delivery is acknowledged when `tx` commits. When `tx` rolls back
    /// it is returned to the queue, and that return is committed right away.
    /// Returns `None` when nothing arrived or the consumer stream ended; in
    /// the latter case the next call opens a new session.
    pub async fn receive(
        &self,
        tx: &TransactionContext,
    ) -> TransportResult<Option<IncomingMessage>> {
        self.ensure_active()?;
        let session = self.session_for(tx).await?;

        let outcome = session
            .next_delivery(&self.input_queue, self.config.receive_backoff)
            .await;
        let delivery = match outcome {
            Ok(NextDelivery::Delivery(delivery)) => delivery,
            Ok(NextDelivery::Empty) => return Ok(None),
            Ok(NextDelivery::EndOfStream) => {
                tracing::warn!(
                    "consumer on channel {} for worker {} ended, discarding session",
                    session.channel_id(),
                    session.worker()
                );
                self.sessions.discard(&session);
                return Ok(None);
            }
            Err(err) => {
                if err.is_connection_level() {
                    self.sessions.discard(&session);
                }
                return Err(self.fail(err.into()));
            }
        };

        let delivery_tag = delivery.delivery_tag;
        tracing::debug!(
            "received delivery {} on channel {} for worker {}",
            delivery_tag,
            session.channel_id(),
            session.worker()
        );

        let acking = session.clone();
        tx.on_commit(move || async move {
            acking
                .ack(delivery_tag)
                .await
                .map_err(TransportError::from)
        });

        let requeueing = session.clone();
        let connections = self.connections.clone();
        tx.on_rolled_back(move || async move {
            requeueing
                .nack_and_commit(delivery_tag)
                .await
                .map_err(|err| {
                    let err = TransportError::from(err);
                    tracing::error!("failed to requeue delivery {}: {}", delivery_tag, err);
                    connections.report_error(&err);
                    err
                })
        });

        Ok(Some(IncomingMessage::from_delivery(delivery)))
    }

    /// Fetch one message without a transaction, acknowledging it immediately.
    ///
    /// Sleeps the receive backoff when the queue is empty. Meant for
    /// diagnostics and tests; no session or worker affinity is involved.
    pub async fn receive_untransacted(&self) -> TransportResult<Option<IncomingMessage>> {
        self.ensure_active()?;
        let channel = self.open_throwaway().await?;
        let result = channel.basic_get(&self.input_queue, true).await;
        self.close_throwaway(channel.as_ref()).await;

        match result.map_err(|err| self.fail(err.into()))? {
            Some(delivery) => Ok(Some(IncomingMessage::from_delivery(delivery))),
            None => {
                tokio::time::sleep(self.config.receive_backoff).await;
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Send
    // =========================================================================

    /// Publish `message` to `destination` through the exchange.
    ///
    /// With a unit of work the publish lands when it commits, together with
    /// the acknowledgment of whatever it received. Without one the message
    /// goes out on a throwaway channel immediately. Header errors are raised
    /// before anything is published.
    pub async fn send(
        &self,
        destination: &str,
        message: OutgoingMessage,
        tx: Option<&TransactionContext>,
    ) -> TransportResult<()> {
        self.ensure_active()?;
        let properties = headers::derive_properties(&message.headers)?;
        let exchange = self.topology.exchange();

        match tx {
            Some(tx) => {
                let session = self.session_for(tx).await?;
                session
                    .publish(exchange, destination, properties, message.body)
                    .await
                    .map_err(|err| self.fail(err.into()))?;
                tracing::debug!(
                    "queued publish to {} on channel {}",
                    destination,
                    session.channel_id()
                );
            }
            None => {
                let channel = self.open_throwaway().await?;
                let result = channel
                    .basic_publish(exchange, destination, properties, message.body)
                    .await;
                self.close_throwaway(channel.as_ref()).await;
                result.map_err(|err| self.fail(err.into()))?;
                tracing::debug!("published to {} without a transaction", destination);
            }
        }
        Ok(())
    }

    /// Multicast `message` under the topic of `message_type`.
    pub async fn publish(
        &self,
        message_type: &MessageType,
        message: OutgoingMessage,
        tx: Option<&TransactionContext>,
    ) -> TransportResult<()> {
        let topic = self.topic_for(message_type);
        self.send(&topic, message, tx).await
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Route messages of `message_type` to `queue`.
    ///
    /// Broker-managed mode binds once on a throwaway channel. Self-managed
    /// mode also tracks the binding and replays it onto live sessions, or
    /// declares and binds on a throwaway channel when there are none yet.
    pub async fn subscribe(&self, message_type: &MessageType, queue: &str) -> TransportResult<()> {
        self.ensure_active()?;
        let topic = self.topic_for(message_type);

        if !self.is_self_managed() {
            let channel = self.open_throwaway().await?;
            let result = self.bind_durable(channel.as_ref(), queue, &topic).await;
            self.close_throwaway(channel.as_ref()).await;
            result.map_err(|err| self.fail(err.into()))?;
            tracing::debug!("bound {} -> {}", topic, queue);
            return Ok(());
        }

        let added = self.subscriptions.add(Subscription {
            message_type: message_type.clone(),
            topic: topic.clone(),
            queue: queue.to_string(),
        });
        if !added {
            tracing::debug!("{} already subscribed", message_type);
        }

        let live = self.sessions.live_sessions();
        if live.is_empty() {
            let channel = self.open_throwaway().await?;
            let result = async {
                self.topology
                    .declare_queue(channel.as_ref(), queue, self.auto_delete_for(queue))
                    .await?;
                channel
                    .queue_bind(queue, self.topology.exchange(), &topic)
                    .await
            }
            .await;
            self.close_throwaway(channel.as_ref()).await;
            result.map_err(|err| self.fail(err.into()))?;
            tracing::debug!("bound {} -> {} before any session exists", topic, queue);
            return Ok(());
        }

        for session in live {
            let replayed = self
                .subscriptions
                .replay(session.channel().as_ref(), self.topology.exchange())
                .await;
            if let Err(err) = replayed {
                if err.is_connection_level() {
                    self.sessions.discard(&session);
                }
                return Err(self.fail(err.into()));
            }
        }
        Ok(())
    }

    async fn bind_durable(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
        topic: &str,
    ) -> Result<(), BrokerError> {
        self.topology.declare_exchange(channel).await?;
        channel
            .queue_bind(queue, self.topology.exchange(), topic)
            .await
    }

    /// Stop routing messages of `message_type` to `queue`.
    ///
    /// Unsubscribing a type that is not subscribed does nothing.
    pub async fn unsubscribe(
        &self,
        message_type: &MessageType,
        queue: &str,
    ) -> TransportResult<()> {
        self.ensure_active()?;

        if !self.is_self_managed() {
            let topic = self.topic_for(message_type);
            let channel = self.open_throwaway().await?;
            let result = channel
                .queue_unbind(queue, self.topology.exchange(), &topic)
                .await;
            self.close_throwaway(channel.as_ref()).await;
            result.map_err(|err| self.fail(err.into()))?;
            tracing::debug!("unbound {} -> {}", topic, queue);
            return Ok(());
        }

        let Some(subscription) = self.subscriptions.remove(message_type) else {
            return Ok(());
        };

        let result = match self.sessions.live_sessions().into_iter().next() {
            Some(session) => {
                let unbound = session
                    .channel()
                    .queue_unbind(
                        &subscription.queue,
                        self.topology.exchange(),
                        &subscription.topic,
                    )
                    .await;
                if matches!(&unbound, Err(err) if err.is_connection_level()) {
                    self.sessions.discard(&session);
                }
                unbound
            }
            None => {
                let channel = self.open_throwaway().await?;
                let unbound = channel
                    .queue_unbind(
                        &subscription.queue,
                        self.topology.exchange(),
                        &subscription.topic,
                    )
                    .await;
                self.close_throwaway(channel.as_ref()).await;
                unbound
            }
        };
        result.map_err(|err| self.fail(err.into()))?;
        tracing::debug!("unbound {} -> {}", subscription.topic, subscription.queue);
        Ok(())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Close every pooled session.
    ///
    /// The transport counts as disposed even when closing fails; the first
    /// failure is logged and returned. Later calls do nothing.
    pub async fn dispose(&self) -> TransportResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_error = None;
        for session in self.sessions.drain() {
            if let Err(err) = session.close().await {
                tracing::error!(
                    "closing channel {} for worker {} failed: {}",
                    session.channel_id(),
                    session.worker(),
                    err
                );
                first_error.get_or_insert(err);
            }
        }

        tracing::debug!("transport for {} disposed", self.input_queue);
        first_error.map_or(Ok(()), |err| Err(err.into()))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn ensure_active(&self) -> TransportResult<()> {
        if self.is_disposed() {
            return Err(TransportError::Disposed);
        }
        Ok(())
    }

    fn auto_delete_for(&self, queue: &str) -> bool {
        self.config.auto_delete_input_queue && queue == self.input_queue
    }

    async fn open_throwaway(&self) -> TransportResult<Arc<dyn BrokerChannel>> {
        let opened = async {
            let connection = self.connections.get_connection().await?;
            connection.create_channel().await
        }
        .await;
        opened.map_err(|err| self.fail(err.into()))
    }

    async fn close_throwaway(&self, channel: &dyn BrokerChannel) {
        if let Err(err) = channel.close().await {
            tracing::debug!("closing throwaway channel {} failed: {}", channel.id(), err);
        }
    }

    /// Log a broker failure and hand it to the connection manager.
    fn fail(&self, err: TransportError) -> TransportError {
        tracing::error!("broker operation on {} failed: {}", self.input_queue, err);
        self.connections.report_error(&err);
        err
    }
}
