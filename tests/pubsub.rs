//! Fan-out pub/sub integration tests against a containerized Redis.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rrb::subscriber::HandlerError;
use rrb::{BrokerError, Publisher, Subscriber};
use serde_json::{json, Value};

fn counting_handler(
    count: Arc<AtomicUsize>,
    expected: Value,
) -> impl Fn(Value) -> futures::future::BoxFuture<'static, Result<(), HandlerError>> {
    move |message: Value| {
        let count = Arc::clone(&count);
        let expected = expected.clone();
        Box::pin(async move {
            assert_eq!(message, expected);
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_publish_reaches_every_subscriber() {
    let redis = common::TestRedis::start().await;
    let options = redis.options();

    let count = Arc::new(AtomicUsize::new(0));
    let subscribers: Vec<Subscriber> = (0..3)
        .map(|_| {
            Subscriber::new(
                "three",
                counting_handler(Arc::clone(&count), json!("message")),
                options.clone(),
            )
        })
        .collect();
    for subscriber in &subscribers {
        subscriber.listen().await.expect("subscriber should listen");
    }

    let publisher = Publisher::new("three", options);
    publisher.connect().await.unwrap();

    let recipients = publisher.publish(json!("message")).await.unwrap();
    assert_eq!(recipients, 3);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);

    publisher.disconnect().await.unwrap();
    for subscriber in &subscribers {
        subscriber.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_insufficient_recipients_rejects() {
    let redis = common::TestRedis::start().await;
    let options = redis.options();

    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = Subscriber::new(
        "busy",
        counting_handler(Arc::clone(&count), json!("message")),
        options.clone(),
    );
    subscriber.listen().await.unwrap();

    let publisher = Publisher::new("busy", options.with_minimum_recipients(2));
    publisher.connect().await.unwrap();

    match publisher.publish(json!("message")).await {
        Err(BrokerError::InsufficientRecipients { required, actual }) => {
            assert_eq!(required, 2);
            assert_eq!(actual, 1);
        }
        other => panic!("expected insufficient recipients, got {other:?}"),
    }

    // Fire-and-forget from the recipient side: the lone subscriber still
    // received the message.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    publisher.disconnect().await.unwrap();
    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_failure_does_not_stop_subscriber() {
    let redis = common::TestRedis::start().await;
    let options = redis.options();

    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = Subscriber::new(
        "flaky",
        {
            let count = Arc::clone(&count);
            move |_message: Value| {
                let seen = count.fetch_add(1, Ordering::SeqCst);
                async move {
                    if seen == 0 {
                        return Err::<(), HandlerError>("first message rejected".into());
                    }
                    Ok(())
                }
            }
        },
        options.clone(),
    );
    subscriber.listen().await.unwrap();

    let publisher = Publisher::new("flaky", options);
    publisher.connect().await.unwrap();

    publisher.publish(json!(1)).await.unwrap();
    publisher.publish(json!(2)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);

    publisher.disconnect().await.unwrap();
    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_publisher_connect_twice_fails() {
    let redis = common::TestRedis::start().await;
    let options = redis.options();

    let publisher = Publisher::new("test", options);
    publisher.connect().await.unwrap();
    assert!(matches!(
        publisher.connect().await,
        Err(BrokerError::AlreadyConnected)
    ));

    publisher.disconnect().await.unwrap();
    publisher.connect().await.expect("reconnect after disconnect should succeed");
    publisher.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_subscriber_listen_twice_fails() {
    let redis = common::TestRedis::start().await;
    let options = redis.options();

    let subscriber = Subscriber::new(
        "test",
        |_message: Value| async move { Ok::<_, HandlerError>(()) },
        options,
    );
    subscriber.listen().await.unwrap();
    assert!(matches!(
        subscriber.listen().await,
        Err(BrokerError::AlreadyListening)
    ));
    subscriber.stop().await.unwrap();
    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_stopped_subscriber_is_not_counted() {
    let redis = common::TestRedis::start().await;
    let options = redis.options();

    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = Subscriber::new(
        "test",
        counting_handler(Arc::clone(&count), json!("message")),
        options.clone(),
    );
    subscriber.listen().await.unwrap();
    subscriber.stop().await.unwrap();

    let publisher = Publisher::new("test", options);
    publisher.connect().await.unwrap();
    let recipients = publisher.publish(json!("message")).await.unwrap();
    assert_eq!(recipients, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);

    publisher.disconnect().await.unwrap();
}
