//! Call-recording wrappers around the in-memory broker.
//!
//! Every channel handed out by [`RecordingConnectionManager`] logs the
//! operations it forwards, and can be told to refuse `close`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::memory::{InMemoryBroker, InMemoryConnectionManager};
use super::{
    BasicProperties, BrokerChannel, BrokerConnection, ConnectionManager, Consumer, Delivery,
    ExchangeKind, QueueDeclaration,
};
use crate::error::{BrokerError, BrokerResult, TransportError};

/// Shared state of every channel created through one manager.
#[derive(Default)]
pub(crate) struct Recorder {
    channels: Mutex<Vec<Arc<RecordingChannel>>>,
    fail_close: AtomicBool,
}

impl Recorder {
    pub(crate) fn channels(&self) -> Vec<Arc<RecordingChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }
}

pub(crate) struct RecordingChannel {
    inner: Arc<dyn BrokerChannel>,
    calls: Mutex<Vec<String>>,
    recorder: Arc<Recorder>,
}

impl RecordingChannel {
    pub(crate) fn wrap(inner: Arc<dyn BrokerChannel>, recorder: Arc<Recorder>) -> Arc<Self> {
        let channel = Arc::new(Self {
            inner,
            calls: Mutex::new(Vec::new()),
            recorder: recorder.clone(),
        });
        recorder
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(channel.clone());
        channel
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }
}

#[async_trait]
impl BrokerChannel for RecordingChannel {
    fn id(&self) -> u64 {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn tx_select(&self) -> BrokerResult<()> {
        self.record("tx_select".to_string());
        self.inner.tx_select().await
    }

    async fn tx_commit(&self) -> BrokerResult<()> {
        self.record("tx_commit".to_string());
        self.inner.tx_commit().await
    }

    async fn tx_rollback(&self) -> BrokerResult<()> {
        self.record("tx_rollback".to_string());
        self.inner.tx_rollback().await
    }

    async fn basic_qos(&self, prefetch_count: u16) -> BrokerResult<()> {
        self.record(format!("basic_qos {}", prefetch_count));
        self.inner.basic_qos(prefetch_count).await
    }

    async fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()> {
        self.record(format!("exchange_declare {}", name));
        self.inner.exchange_declare(name, kind).await
    }

    async fn queue_declare(&self, declaration: &QueueDeclaration) -> BrokerResult<()> {
        self.record(format!("queue_declare {}", declaration.name));
        self.inner.queue_declare(declaration).await
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        self.record(format!("queue_bind {} {} {}", queue, exchange, routing_key));
        self.inner.queue_bind(queue, exchange, routing_key).await
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        self.record(format!("queue_unbind {} {} {}", queue, exchange, routing_key));
        self.inner.queue_unbind(queue, exchange, routing_key).await
    }

    async fn queue_purge(&self, queue: &str) -> BrokerResult<u32> {
        self.record(format!("queue_purge {}", queue));
        self.inner.queue_purge(queue).await
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> BrokerResult<()> {
        self.record(format!("basic_publish {} {}", exchange, routing_key));
        self.inner
            .basic_publish(exchange, routing_key, properties, body)
            .await
    }

    async fn basic_consume(&self, queue: &str) -> BrokerResult<Consumer> {
        self.record(format!("basic_consume {}", queue));
        self.inner.basic_consume(queue).await
    }

    async fn basic_get(&self, queue: &str, auto_ack: bool) -> BrokerResult<Option<Delivery>> {
        self.record(format!("basic_get {}", queue));
        self.inner.basic_get(queue, auto_ack).await
    }

    async fn basic_ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.record(format!("basic_ack {}", delivery_tag));
        self.inner.basic_ack(delivery_tag).await
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.record(format!("basic_nack {} {}", delivery_tag, requeue));
        self.inner.basic_nack(delivery_tag, requeue).await
    }

    async fn close(&self) -> BrokerResult<()> {
        self.record("close".to_string());
        if self.recorder.fail_close.load(Ordering::SeqCst) {
            return Err(BrokerError::Protocol("close refused".to_string()));
        }
        self.inner.close().await
    }
}

struct RecordingConnection {
    inner: Arc<dyn BrokerConnection>,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl BrokerConnection for RecordingConnection {
    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let inner = self.inner.create_channel().await?;
        Ok(RecordingChannel::wrap(inner, self.recorder.clone()))
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

/// [`InMemoryConnectionManager`] whose connections hand out recording channels.
pub(crate) struct RecordingConnectionManager {
    inner: InMemoryConnectionManager,
    recorder: Arc<Recorder>,
}

impl RecordingConnectionManager {
    pub(crate) fn new(broker: InMemoryBroker) -> Self {
        Self {
            inner: InMemoryConnectionManager::new(broker),
            recorder: Arc::new(Recorder::default()),
        }
    }

    pub(crate) fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub(crate) fn reported_errors(&self) -> Vec<TransportError> {
        self.inner.reported_errors()
    }
}

#[async_trait]
impl ConnectionManager for RecordingConnectionManager {
    async fn get_connection(&self) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let inner = self.inner.get_connection().await?;
        Ok(Arc::new(RecordingConnection {
            inner,
            recorder: self.recorder.clone(),
        }))
    }

    fn report_error(&self, error: &TransportError) {
        self.inner.report_error(error);
    }
}
