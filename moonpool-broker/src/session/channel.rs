//! Channel session with transactional commit/rollback hooks.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::pool::WorkerId;
use crate::broker::{BasicProperties, BrokerChannel, Consumer, Delivery};
use crate::error::{BrokerError, BrokerResult, TransportError};
use crate::subscription::SubscriptionRegistry;
use crate::topology::Topology;
use crate::transaction::TransactionContext;

/// Outcome of polling a session's consumer.
#[derive(Debug)]
pub enum NextDelivery {
    /// A message arrived.
    Delivery(Delivery),
    /// Nothing arrived within the wait.
    Empty,
    /// The broker ended the consumer stream; the session is unusable.
    EndOfStream,
}

/// Parameters for opening a session.
pub(crate) struct SessionSetup<'a> {
    pub(crate) input_queue: &'a str,
    pub(crate) auto_delete: bool,
    pub(crate) prefetch_count: u16,
    pub(crate) topology: &'a Topology,
    pub(crate) subscriptions: &'a SubscriptionRegistry,
}

/// A transactional channel owned by one worker.
///
/// Publishes and acknowledgments issued through the session stay pending on
/// the broker until [`commit`](Self::commit).
pub struct ChannelSession {
    worker: WorkerId,
    channel: Arc<dyn BrokerChannel>,
    consumer: Mutex<Option<Consumer>>,
    discarded: AtomicBool,
    /// Deliveries, publishes or acks since the last commit/rollback.
    dirty: AtomicBool,
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("worker", &self.worker)
            .field("channel_id", &self.channel.id())
            .field("discarded", &self.is_discarded())
            .field("dirty", &self.has_uncommitted_work())
            .finish()
    }
}

impl ChannelSession {
    /// Wrap an already configured channel.
    pub fn new(worker: WorkerId, channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            worker,
            channel,
            consumer: Mutex::new(None),
            discarded: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    /// Configure a fresh channel and wrap it.
    ///
    /// In order: transactional mode, prefetch limit, queue/exchange
    /// declarations, then replay of every tracked subscription. The channel
    /// is closed if any step fails.
    pub(crate) async fn open(
        worker: WorkerId,
        channel: Arc<dyn BrokerChannel>,
        setup: SessionSetup<'_>,
    ) -> BrokerResult<Self> {
        if let Err(err) = Self::configure(channel.as_ref(), &setup).await {
            if let Err(close_err) = channel.close().await {
                tracing::debug!(
                    "closing half-configured channel {} failed: {}",
                    channel.id(),
                    close_err
                );
            }
            return Err(err);
        }

        tracing::debug!(
            "opened session on channel {} for worker {}",
            channel.id(),
            worker
        );
        Ok(Self::new(worker, channel))
    }

    async fn configure(
        channel: &dyn BrokerChannel,
        setup: &SessionSetup<'_>,
    ) -> BrokerResult<()> {
        channel.tx_select().await?;
        channel.basic_qos(setup.prefetch_count).await?;
        setup
            .topology
            .declare_queue(channel, setup.input_queue, setup.auto_delete)
            .await?;
        let replayed = setup
            .subscriptions
            .replay(channel, setup.topology.exchange())
            .await?;
        if replayed > 0 {
            tracing::debug!(
                "replayed {} subscriptions onto channel {}",
                replayed,
                channel.id()
            );
        }
        Ok(())
    }

    /// Owning worker.
    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// Underlying broker channel.
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// Broker channel number.
    pub fn channel_id(&self) -> u64 {
        self.channel.id()
    }

    /// Whether the session can still be used.
    pub fn is_open(&self) -> bool {
        !self.discarded.load(Ordering::Acquire) && self.channel.is_open()
    }

    /// Whether the session was discarded.
    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    /// Mark the session unusable. It will never be handed out again.
    pub fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
    }

    /// Whether deliveries, publishes or acks happened since the last
    /// commit or rollback.
    pub fn has_uncommitted_work(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Wait up to `wait` for the next delivery from `queue`.
    ///
    /// Subscribes a consumer on first use.
    pub async fn next_delivery(&self, queue: &str, wait: Duration) -> BrokerResult<NextDelivery> {
        if self.is_discarded() {
            return Err(BrokerError::ChannelClosed);
        }

        let mut consumer = self.consumer.lock().await;
        if consumer.is_none() {
            let subscribed = self.channel.basic_consume(queue).await?;
            tracing::debug!(
                "consumer {} subscribed to {} on channel {}",
                subscribed.tag,
                queue,
                self.channel.id()
            );
            *consumer = Some(subscribed);
        }
        let Some(active) = consumer.as_mut() else {
            return Err(BrokerError::ChannelClosed);
        };

        match tokio::time::timeout(wait, active.deliveries.recv()).await {
            Err(_) => Ok(NextDelivery::Empty),
            Ok(None) => {
                *consumer = None;
                Ok(NextDelivery::EndOfStream)
            }
            Ok(Some(delivery)) => {
                self.dirty.store(true, Ordering::Release);
                Ok(NextDelivery::Delivery(delivery))
            }
        }
    }

    /// Publish within the session's transaction.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> BrokerResult<()> {
        self.dirty.store(true, Ordering::Release);
        self.channel
            .basic_publish(exchange, routing_key, properties, body)
            .await
    }

    /// Acknowledge a delivery within the session's transaction.
    pub async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.dirty.store(true, Ordering::Release);
        self.channel.basic_ack(delivery_tag).await
    }

    /// Requeue a delivery and commit immediately, independent of any unit of work.
    ///
    /// Work still pending on the channel is rolled back first so the commit
    /// carries the requeue alone.
    pub async fn nack_and_commit(&self, delivery_tag: u64) -> BrokerResult<()> {
        if self.has_uncommitted_work() {
            self.channel.tx_rollback().await?;
            self.dirty.store(false, Ordering::Release);
        }
        self.channel.basic_nack(delivery_tag, true).await?;
        self.channel.tx_commit().await
    }

    /// Commit pending publishes and acknowledgments.
    ///
    /// On a session that is no longer open, fails with
    /// [`BrokerError::ChannelClosed`] if work was pending (the broker dropped
    /// it with the channel) and succeeds otherwise.
    pub async fn commit(&self) -> BrokerResult<()> {
        let pending = self.dirty.swap(false, Ordering::AcqRel);
        if !self.is_open() {
            if pending {
                return Err(BrokerError::ChannelClosed);
            }
            tracing::warn!(
                "skipping commit on closed channel {} for worker {}: nothing pending",
                self.channel.id(),
                self.worker
            );
            return Ok(());
        }
        self.channel.tx_commit().await
    }

    /// Discard pending publishes and acknowledgments.
    ///
    /// A closed channel already lost its pending work, so this is a no-op there.
    pub async fn rollback(&self) -> BrokerResult<()> {
        if !self.is_open() {
            self.dirty.store(false, Ordering::Release);
            return Ok(());
        }
        self.channel.tx_rollback().await?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Discard the session and close its channel.
    pub async fn close(&self) -> BrokerResult<()> {
        self.discard();
        self.consumer.lock().await.take();
        self.channel.close().await
    }

    /// Install commit/rollback hooks on `tx` and cache this session in it.
    pub(crate) fn enlist(self: &Arc<Self>, tx: &TransactionContext, item_key: &str) {
        let session = self.clone();
        tx.on_committed(move || async move {
            session.commit().await.map_err(TransportError::from)
        });

        let session = self.clone();
        tx.on_rolled_back(move || async move {
            session.rollback().await.map_err(TransportError::from)
        });

        tx.set_item(item_key, self.clone());
    }
}
