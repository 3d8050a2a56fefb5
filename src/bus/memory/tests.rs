use super::*;
use futures::future::BoxFuture;

fn pull_spec(topic: &str) -> SubscriptionSpec {
    SubscriptionSpec {
        topic: topic.to_string(),
        ack_deadline: Duration::from_secs(10),
        push_endpoint: None,
    }
}

/// Handler that records payloads and answers with a fixed decision.
struct RecordingHandler {
    decision: AckDecision,
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MessageHandler for RecordingHandler {
    fn handle(&self, message: InboundMessage) -> BoxFuture<'static, AckDecision> {
        let seen = self.seen.clone();
        let decision = self.decision;
        Box::pin(async move {
            seen.lock().await.push(message.data);
            decision
        })
    }
}

#[tokio::test]
async fn test_create_topic_reports_already_exists() {
    let broker = MemoryBroker::new();
    let connection = broker.connect("p").await.unwrap();

    connection.create_topic("orders").await.unwrap();
    let result = connection.create_topic("orders").await;
    assert!(matches!(result, Err(BusError::AlreadyExists(_))));
    assert_eq!(broker.topic_count().await, 1);
}

#[tokio::test]
async fn test_connections_share_state() {
    let broker = MemoryBroker::new();
    let a = broker.connect("p").await.unwrap();
    let b = broker.clone().connect("p").await.unwrap();

    a.create_topic("orders").await.unwrap();
    assert!(matches!(
        b.create_topic("orders").await,
        Err(BusError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn test_fail_on_connect() {
    let broker = MemoryBroker::new();
    broker.set_fail_on_connect(true);
    assert!(matches!(
        broker.connect("p").await,
        Err(BusError::Connection(_))
    ));
}

#[tokio::test]
async fn test_subscription_requires_topic() {
    let broker = MemoryBroker::new();
    let connection = broker.connect("p").await.unwrap();

    let result = connection.create_subscription("s", &pull_spec("orders")).await;
    assert!(matches!(result, Err(BusError::NotFound(_))));
}

#[tokio::test]
async fn test_publish_fans_out_to_bound_subscriptions() {
    let broker = MemoryBroker::new();
    let connection = broker.connect("p").await.unwrap();
    connection.create_topic("orders").await.unwrap();
    connection.create_topic("other").await.unwrap();
    connection.create_subscription("a", &pull_spec("orders")).await.unwrap();
    connection.create_subscription("b", &pull_spec("orders")).await.unwrap();
    connection.create_subscription("c", &pull_spec("other")).await.unwrap();

    connection
        .publish("orders", OutboundMessage::new(b"hello".to_vec()))
        .await
        .unwrap();

    assert_eq!(broker.published("orders").await, vec![b"hello".to_vec()]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    for name in ["a", "b", "c"] {
        let cancel = CancellationToken::new();
        let handler = Arc::new(RecordingHandler {
            decision: AckDecision::Ack,
            seen: seen.clone(),
        });
        let conn = connection.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { conn.receive(name, 1, handler, token).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    assert_eq!(seen.lock().await.len(), 2);
    assert_eq!(broker.stats("a").await.unwrap().acked(), 1);
    assert_eq!(broker.stats("c").await.unwrap().acked(), 0);
}

#[tokio::test]
async fn test_publish_to_missing_topic_fails() {
    let broker = MemoryBroker::new();
    let connection = broker.connect("p").await.unwrap();
    let result = connection.publish("nope", OutboundMessage::default()).await;
    assert!(matches!(result, Err(BusError::NotFound(_))));
}

#[tokio::test]
async fn test_nack_redelivers() {
    let broker = MemoryBroker::new().with_redelivery_delay(Duration::from_millis(1));
    let connection = broker.connect("p").await.unwrap();
    connection.create_topic("orders").await.unwrap();
    connection.create_subscription("s", &pull_spec("orders")).await.unwrap();
    broker.inject("s", b"again".to_vec()).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(RecordingHandler {
        decision: AckDecision::Nack,
        seen: seen.clone(),
    });
    let cancel = CancellationToken::new();
    let conn = connection.clone();
    let token = cancel.clone();
    let task = tokio::spawn(async move { conn.receive("s", 1, handler, token).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert!(broker.stats("s").await.unwrap().nacked() >= 2);
    assert!(seen.lock().await.iter().all(|d| d == b"again"));
}

#[tokio::test]
async fn test_delete_subscription_ends_receive_with_error() {
    let broker = MemoryBroker::new();
    let connection = broker.connect("p").await.unwrap();
    connection.create_topic("orders").await.unwrap();
    connection.create_subscription("s", &pull_spec("orders")).await.unwrap();

    let handler = Arc::new(RecordingHandler {
        decision: AckDecision::Ack,
        seen: Arc::new(Mutex::new(Vec::new())),
    });
    let conn = connection.clone();
    let task =
        tokio::spawn(async move { conn.receive("s", 1, handler, CancellationToken::new()).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    connection.delete_subscription("s").await.unwrap();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(BusError::Receive(_))));
    assert_eq!(broker.subscription_count().await, 0);
}

#[tokio::test]
async fn test_closed_connection_rejects_calls() {
    let broker = MemoryBroker::new();
    let connection = broker.connect("p").await.unwrap();
    connection.close().await;

    assert!(matches!(
        connection.create_topic("orders").await,
        Err(BusError::Closed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_outlives_receive_loop() {
    let broker = MemoryBroker::new().with_redelivery_delay(Duration::from_secs(5));
    let connection = broker.connect("p").await.unwrap();
    connection.create_topic("orders").await.unwrap();
    connection.create_subscription("s", &pull_spec("orders")).await.unwrap();
    broker.inject("s", b"later".to_vec()).await.unwrap();
    let stats = broker.stats("s").await.unwrap();

    let rejecting = Arc::new(RecordingHandler {
        decision: AckDecision::Nack,
        seen: Arc::new(Mutex::new(Vec::new())),
    });
    let cancel = CancellationToken::new();
    let conn = connection.clone();
    let token = cancel.clone();
    let task = tokio::spawn(async move { conn.receive("s", 1, rejecting, token).await });

    while stats.nacked() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(broker.pending_redeliveries(), 1);
    broker.settle().await;
    assert_eq!(broker.pending_redeliveries(), 0);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let accepting = Arc::new(RecordingHandler {
        decision: AckDecision::Ack,
        seen: seen.clone(),
    });
    let cancel = CancellationToken::new();
    let conn = connection.clone();
    let token = cancel.clone();
    let task = tokio::spawn(async move { conn.receive("s", 1, accepting, token).await });

    while stats.acked() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(*seen.lock().await, vec![b"later".to_vec()]);
}
