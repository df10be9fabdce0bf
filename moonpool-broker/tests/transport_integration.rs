//! End-to-end transport behavior against the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use moonpool_broker::headers::{MESSAGE_ID, RETURN_ADDRESS, TIME_TO_BE_RECEIVED};
use moonpool_broker::{
    BrokerError, BrokerTransport, DEFAULT_EXCHANGE_NAME, InMemoryBroker,
    InMemoryConnectionManager, MessageType, OutgoingMessage, TopicNames, TransactionContext,
    TransportConfig, TransportError, WorkerId,
};

struct Fixture {
    broker: InMemoryBroker,
    manager: Arc<InMemoryConnectionManager>,
    transport: BrokerTransport,
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fixture(config: TransportConfig) -> Fixture {
    init_logging();
    let broker = InMemoryBroker::new();
    let manager = Arc::new(InMemoryConnectionManager::new(broker.clone()));
    let transport = BrokerTransport::new(
        manager.clone(),
        "input",
        config.with_receive_backoff(Duration::from_millis(20)),
    );
    Fixture {
        broker,
        manager,
        transport,
    }
}

async fn initialized(config: TransportConfig) -> Fixture {
    let fixture = fixture(config);
    fixture.transport.initialize().await.unwrap();
    fixture
}

fn order_placed() -> MessageType {
    MessageType::new("shop.orders", "OrderPlaced")
}

#[tokio::test]
async fn test_commit_acknowledges_exactly_once() {
    let f = initialized(TransportConfig::default()).await;
    f.transport
        .send("input", OutgoingMessage::new("order-1"), None)
        .await
        .unwrap();

    let tx = TransactionContext::new(WorkerId::new("w1"));
    let message = f.transport.receive(&tx).await.unwrap().unwrap();
    assert_eq!(message.body, b"order-1");
    assert_eq!(f.broker.unacked_count("input"), 1);

    tx.commit().await.unwrap();

    let stats = f.broker.stats();
    assert_eq!(stats.acks, 1);
    assert_eq!(stats.nacks, 0);
    assert_eq!(f.broker.unacked_count("input"), 0);
    assert_eq!(f.broker.ready_count("input"), 0);
}

#[tokio::test]
async fn test_rollback_requeues_and_commits_immediately() {
    let f = initialized(TransportConfig::default()).await;
    f.transport
        .send("input", OutgoingMessage::new("order-1"), None)
        .await
        .unwrap();

    let tx = TransactionContext::new(WorkerId::new("w1"));
    let first = f.transport.receive(&tx).await.unwrap().unwrap();
    assert!(!first.redelivered);

    tx.rollback().await.unwrap();

    let stats = f.broker.stats();
    assert_eq!(stats.acks, 0);
    assert_eq!(stats.nacks, 1);
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.commits, 1);

    let retry = TransactionContext::new(WorkerId::new("w1"));
    let second = f.transport.receive(&retry).await.unwrap().unwrap();
    assert!(second.redelivered);
    assert_eq!(second.message_id, first.message_id);

    retry.commit().await.unwrap();
    assert_eq!(f.broker.stats().acks, 1);
}

#[tokio::test]
async fn test_send_and_ack_commit_together() {
    let f = initialized(TransportConfig::default()).await;
    f.transport.create_queue("audit").await.unwrap();
    f.transport
        .send("input", OutgoingMessage::new("order-1"), None)
        .await
        .unwrap();

    let tx = TransactionContext::new(WorkerId::new("w1"));
    let message = f.transport.receive(&tx).await.unwrap().unwrap();
    f.transport
        .send("audit", OutgoingMessage::new(message.body), Some(&tx))
        .await
        .unwrap();
    assert_eq!(f.broker.ready_count("audit"), 0);

    tx.commit().await.unwrap();

    assert_eq!(f.broker.ready_count("audit"), 1);
    assert_eq!(f.broker.unacked_count("input"), 0);
    assert_eq!(f.broker.stats().acks, 1);
}

#[tokio::test]
async fn test_rollback_discards_transactional_sends() {
    let f = initialized(TransportConfig::default()).await;
    f.transport.create_queue("audit").await.unwrap();
    f.transport
        .send("input", OutgoingMessage::new("order-1"), None)
        .await
        .unwrap();

    let tx = TransactionContext::new(WorkerId::new("w1"));
    f.transport.receive(&tx).await.unwrap().unwrap();
    f.transport
        .send("audit", OutgoingMessage::new("copy"), Some(&tx))
        .await
        .unwrap();

    tx.rollback().await.unwrap();

    assert_eq!(f.broker.ready_count("audit"), 0);
    assert_eq!(f.broker.stats().requeued, 1);
}

#[tokio::test]
async fn test_receive_without_messages_returns_none() {
    let f = initialized(TransportConfig::default()).await;
    let tx = TransactionContext::new(WorkerId::new("w1"));

    assert!(f.transport.receive(&tx).await.unwrap().is_none());
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_acquire_returns_same_session() {
    let f = initialized(TransportConfig::default()).await;
    let worker = WorkerId::new("w1");

    let first = f.transport.acquire_for_receive(&worker).await.unwrap();
    let second = f.transport.acquire_for_receive(&worker).await.unwrap();
    let other = f
        .transport
        .acquire_for_receive(&WorkerId::new("w2"))
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(f.transport.sessions().len(), 2);
}

#[tokio::test]
async fn test_unit_of_work_keeps_one_session() {
    let f = initialized(TransportConfig::default()).await;
    f.transport.create_queue("audit").await.unwrap();
    let tx = TransactionContext::new(WorkerId::new("w1"));

    f.transport
        .send("audit", OutgoingMessage::new("a"), Some(&tx))
        .await
        .unwrap();
    let before = f.broker.stats().channels_opened;
    f.transport
        .send("audit", OutgoingMessage::new("b"), Some(&tx))
        .await
        .unwrap();
    f.transport.receive(&tx).await.unwrap();

    assert_eq!(f.broker.stats().channels_opened, before);
    tx.commit().await.unwrap();
    assert_eq!(f.broker.ready_count("audit"), 2);
}

#[tokio::test]
async fn test_end_of_stream_discards_session_and_recovers() {
    let f = initialized(TransportConfig::default()).await;
    let tx = TransactionContext::new(WorkerId::new("w1"));
    assert!(f.transport.receive(&tx).await.unwrap().is_none());
    let stale = f
        .transport
        .acquire_for_receive(&WorkerId::new("w1"))
        .await
        .unwrap();

    f.broker.close_channel(stale.channel_id());

    assert!(f.transport.receive(&tx).await.unwrap().is_none());
    assert!(stale.is_discarded());
    assert!(f.transport.sessions().is_empty());
    tx.dispose().await.unwrap();

    f.transport
        .send("input", OutgoingMessage::new("after"), None)
        .await
        .unwrap();
    let next = TransactionContext::new(WorkerId::new("w1"));
    let message = f.transport.receive(&next).await.unwrap().unwrap();
    assert_eq!(message.body, b"after");
    next.commit().await.unwrap();

    let fresh = f
        .transport
        .acquire_for_receive(&WorkerId::new("w1"))
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&stale, &fresh));
    assert!(f.manager.reported_errors().is_empty());
}

#[tokio::test]
async fn test_unit_of_work_moves_to_new_session_after_end_of_stream() {
    let f = initialized(TransportConfig::default()).await;
    let tx = TransactionContext::new(WorkerId::new("w1"));
    assert!(f.transport.receive(&tx).await.unwrap().is_none());
    let stale = f
        .transport
        .acquire_for_receive(&WorkerId::new("w1"))
        .await
        .unwrap();

    f.broker.close_channel(stale.channel_id());
    assert!(f.transport.receive(&tx).await.unwrap().is_none());
    assert!(stale.is_discarded());

    f.transport
        .send("input", OutgoingMessage::new("x"), None)
        .await
        .unwrap();
    let message = f.transport.receive(&tx).await.unwrap().unwrap();
    assert_eq!(message.body, b"x");
    tx.commit().await.unwrap();

    assert_eq!(f.broker.stats().acks, 1);
    assert_eq!(f.broker.ready_count("input"), 0);
    assert!(f.manager.reported_errors().is_empty());
}

#[tokio::test]
async fn test_unit_of_work_with_pending_work_cannot_switch_sessions() {
    let f = initialized(TransportConfig::default()).await;
    f.transport
        .send("input", OutgoingMessage::new("order-1"), None)
        .await
        .unwrap();

    let tx = TransactionContext::new(WorkerId::new("w1"));
    f.transport.receive(&tx).await.unwrap().unwrap();
    let stale = f
        .transport
        .acquire_for_receive(&WorkerId::new("w1"))
        .await
        .unwrap();
    f.broker.close_channel(stale.channel_id());
    assert!(f.transport.receive(&tx).await.unwrap().is_none());

    let err = f.transport.receive(&tx).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::Broker(BrokerError::ChannelClosed)
    ));
    let err = f
        .transport
        .send("input", OutgoingMessage::new("reply"), Some(&tx))
        .await
        .unwrap_err();
    assert!(err.is_connection_level());
    assert!(f.manager.reported_errors().is_empty());
    assert_eq!(f.broker.ready_count("input"), 1);
}

#[tokio::test]
async fn test_rollback_after_channel_loss_reports_failed_requeue() {
    let f = initialized(TransportConfig::default()).await;
    f.transport
        .send("input", OutgoingMessage::new("order-1"), None)
        .await
        .unwrap();

    let tx = TransactionContext::new(WorkerId::new("w1"));
    f.transport.receive(&tx).await.unwrap().unwrap();
    let session = f
        .transport
        .acquire_for_receive(&WorkerId::new("w1"))
        .await
        .unwrap();
    f.broker.close_channel(session.channel_id());

    let err = tx.rollback().await.unwrap_err();

    assert!(matches!(
        err,
        TransportError::Broker(BrokerError::ChannelClosed)
    ));
    assert_eq!(f.manager.reported_errors().len(), 1);
    // The broker requeued it when the channel closed.
    assert_eq!(f.broker.ready_count("input"), 1);
    assert!(f.broker.ready_messages("input")[0].redelivered);
}

#[tokio::test]
async fn test_closed_channel_requeues_in_flight_delivery() {
    let f = initialized(TransportConfig::default()).await;
    f.transport
        .send("input", OutgoingMessage::new("order-1"), None)
        .await
        .unwrap();

    let tx = TransactionContext::new(WorkerId::new("w1"));
    f.transport.receive(&tx).await.unwrap().unwrap();
    f.broker.close_all_channels();

    assert_eq!(f.broker.ready_count("input"), 1);
    assert!(f.broker.ready_messages("input")[0].redelivered);

    // The ack has no channel to go to any more.
    let err = tx.commit().await.unwrap_err();
    assert!(err.is_connection_level());
}

#[tokio::test]
async fn test_connection_loss_is_reported_and_replaced() {
    let f = initialized(TransportConfig::default()).await;
    let tx = TransactionContext::new(WorkerId::new("w1"));
    f.transport.receive(&tx).await.unwrap();

    f.manager.current().unwrap().close();
    let err = f
        .transport
        .send("input", OutgoingMessage::new("lost"), Some(&tx))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TransportError::Broker(BrokerError::ConnectionClosed)
    ));
    assert_eq!(f.manager.reported_errors().len(), 1);
    tx.dispose().await.unwrap();

    let retry = TransactionContext::new(WorkerId::new("w1"));
    f.transport
        .send("input", OutgoingMessage::new("again"), Some(&retry))
        .await
        .unwrap();
    retry.commit().await.unwrap();
    assert_eq!(f.broker.ready_count("input"), 1);
}

#[tokio::test]
async fn test_ttl_validation_happens_before_publish() {
    let f = initialized(TransportConfig::default()).await;

    for ttl in ["00:00:00", "-00:00:05"] {
        let message = OutgoingMessage::new("x").with_header(TIME_TO_BE_RECEIVED, ttl);
        let err = f.transport.send("input", message, None).await.unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)), "{}", ttl);
    }
    let message = OutgoingMessage::new("x").with_header(TIME_TO_BE_RECEIVED, "soon");
    let err = f.transport.send("input", message, None).await.unwrap_err();
    assert!(matches!(err, TransportError::Format { .. }));
    assert_eq!(f.broker.stats().published, 0);

    let message = OutgoingMessage::new("x").with_header(TIME_TO_BE_RECEIVED, "00:00:05");
    f.transport.send("input", message, None).await.unwrap();
    let queued = f.broker.ready_messages("input");
    assert_eq!(queued[0].properties.expiration_ms, Some(5000));
    assert!(f.manager.reported_errors().is_empty());
}

#[tokio::test]
async fn test_headers_survive_the_broker() {
    let f = initialized(TransportConfig::default()).await;
    let message = OutgoingMessage::new("x")
        .with_header(MESSAGE_ID, "order-42")
        .with_header(RETURN_ADDRESS, "replies")
        .with_header("tenant", "acme");
    f.transport.send("input", message, None).await.unwrap();

    let queued = f.broker.ready_messages("input");
    assert_eq!(queued[0].properties.message_id.as_deref(), Some("order-42"));
    assert_eq!(queued[0].properties.reply_to.as_deref(), Some("replies"));

    let tx = TransactionContext::new(WorkerId::new("w1"));
    let received = f.transport.receive(&tx).await.unwrap().unwrap();
    assert_eq!(received.message_id, "order-42");
    assert_eq!(received.headers["tenant"], "acme");
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_untransacted_receive_acks_immediately() {
    let f = initialized(TransportConfig::default()).await;
    assert!(f.transport.receive_untransacted().await.unwrap().is_none());

    f.transport
        .send("input", OutgoingMessage::new("ping"), None)
        .await
        .unwrap();
    let message = f.transport.receive_untransacted().await.unwrap().unwrap();

    assert_eq!(message.body, b"ping");
    assert_eq!(f.broker.stats().acks, 1);
    assert_eq!(f.broker.ready_count("input"), 0);
    assert_eq!(f.broker.open_channel_count(), 0);
}

#[tokio::test]
async fn test_purge_drops_ready_messages() {
    let f = initialized(TransportConfig::default()).await;
    for body in ["a", "b", "c"] {
        f.transport
            .send("input", OutgoingMessage::new(body), None)
            .await
            .unwrap();
    }

    assert_eq!(f.transport.purge().await.unwrap(), 3);
    assert_eq!(f.broker.ready_count("input"), 0);
}

#[tokio::test]
async fn test_broker_managed_subscription_round_trip() {
    let f = initialized(TransportConfig::default()).await;
    let topic = f.transport.topic_for(&order_placed());

    f.transport.subscribe(&order_placed(), "input").await.unwrap();
    assert!(f.broker.has_binding("input", DEFAULT_EXCHANGE_NAME, &topic));
    assert!(f.transport.subscriptions().is_empty());

    f.transport
        .publish(&order_placed(), OutgoingMessage::new("placed"), None)
        .await
        .unwrap();
    assert_eq!(f.broker.ready_count("input"), 1);

    f.transport
        .unsubscribe(&order_placed(), "input")
        .await
        .unwrap();
    assert!(!f.broker.has_binding("input", DEFAULT_EXCHANGE_NAME, &topic));
}

#[tokio::test]
async fn test_unsubscribe_unknown_type_is_noop() {
    for config in [TransportConfig::default(), TransportConfig::ephemeral()] {
        let f = initialized(config).await;

        f.transport
            .unsubscribe(&order_placed(), "input")
            .await
            .unwrap();

        assert!(f.manager.reported_errors().is_empty());
        assert_eq!(f.broker.binding_keys("input"), vec!["input".to_string()]);
    }
}

#[tokio::test]
async fn test_self_managed_subscription_is_replayed_onto_new_sessions() {
    let f = fixture(TransportConfig::ephemeral());
    let topic = f.transport.topic_for(&order_placed());

    f.transport.subscribe(&order_placed(), "input").await.unwrap();
    assert!(f.transport.subscriptions().contains(&order_placed()));
    assert!(f.broker.has_binding("input", DEFAULT_EXCHANGE_NAME, &topic));

    let tx = TransactionContext::new(WorkerId::new("w1"));
    assert!(f.transport.receive(&tx).await.unwrap().is_none());

    // Last consumer gone: the auto-delete queue and its bindings vanish.
    f.broker.close_all_channels();
    assert!(!f.broker.queue_exists("input"));
    assert!(f.transport.receive(&tx).await.unwrap().is_none());
    tx.dispose().await.unwrap();

    let next = TransactionContext::new(WorkerId::new("w1"));
    assert!(f.transport.receive(&next).await.unwrap().is_none());
    assert!(f.broker.has_binding("input", DEFAULT_EXCHANGE_NAME, &topic));

    f.transport
        .publish(&order_placed(), OutgoingMessage::new("placed"), None)
        .await
        .unwrap();
    let message = f.transport.receive(&next).await.unwrap().unwrap();
    assert_eq!(message.body, b"placed");
    next.commit().await.unwrap();
}

#[tokio::test]
async fn test_self_managed_subscribe_replays_onto_live_session() {
    let f = initialized(TransportConfig::ephemeral()).await;
    let session = f
        .transport
        .acquire_for_receive(&WorkerId::new("w1"))
        .await
        .unwrap();
    let topic = f.transport.topic_for(&order_placed());

    f.transport.subscribe(&order_placed(), "input").await.unwrap();
    assert!(f.broker.has_binding("input", DEFAULT_EXCHANGE_NAME, &topic));

    f.transport
        .unsubscribe(&order_placed(), "input")
        .await
        .unwrap();
    assert!(!f.broker.has_binding("input", DEFAULT_EXCHANGE_NAME, &topic));
    assert!(f.transport.subscriptions().is_empty());
    assert!(session.is_open());
}

#[tokio::test]
async fn test_custom_topic_resolvers() {
    let topics = TopicNames::new().with_resolver(|ty: &MessageType| {
        (ty.namespace() == "shop.orders").then(|| format!("orders.{}", ty.name()))
    });
    let f = fixture(TransportConfig::default());
    let transport = BrokerTransport::new(f.manager.clone(), "input", TransportConfig::default())
        .with_topic_names(topics);

    assert_eq!(transport.topic_for(&order_placed()), "orders.OrderPlaced");
    assert_eq!(
        transport.topic_for(&MessageType::new("billing", "Invoice")),
        "billing.Invoice"
    );
}

#[tokio::test]
async fn test_dispose_is_idempotent() {
    let f = initialized(TransportConfig::default()).await;
    f.transport
        .acquire_for_receive(&WorkerId::new("w1"))
        .await
        .unwrap();
    f.transport
        .acquire_for_receive(&WorkerId::new("w2"))
        .await
        .unwrap();
    assert_eq!(f.broker.open_channel_count(), 2);

    f.transport.dispose().await.unwrap();
    f.transport.dispose().await.unwrap();

    assert!(f.transport.is_disposed());
    assert_eq!(f.broker.open_channel_count(), 0);
    assert!(matches!(
        f.transport
            .send("input", OutgoingMessage::new("late"), None)
            .await,
        Err(TransportError::Disposed)
    ));
}
