use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_gnat::header::{HeaderMap, HeaderName, HeaderValue};
use async_gnat::{ClientError, ConnectOptions, ConnectionState};
use futures::StreamExt;
use tokio::time::timeout;

mod common;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn publish_subscribe_roundtrip_with_headers() {
    let server = common::MockServer::start().await;
    let client = async_gnat::connect(server.url()).await.unwrap();

    let mut subscriber = client.subscribe("test.>".into()).await.unwrap();

    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("foo"),
        HeaderValue::from_static("bar"),
    );
    client
        .publish_with_headers("test.a".into(), headers.clone(), "hello".into())
        .await
        .unwrap();

    let message = timeout(WAIT, subscriber.next()).await.unwrap().unwrap();
    assert_eq!(message.subject, "test.a");
    assert_eq!(message.payload.as_ref(), b"hello");
    assert_eq!(message.headers, Some(headers));
}

#[tokio::test]
async fn plain_publish_has_no_headers() {
    let server = common::MockServer::start().await;
    let client = async_gnat::connect(server.url()).await.unwrap();

    let mut subscriber = client.subscribe("test.*".into()).await.unwrap();
    client.publish("test.b".into(), "plain".into()).await.unwrap();

    let message = timeout(WAIT, subscriber.next()).await.unwrap().unwrap();
    assert_eq!(message.payload.as_ref(), b"plain");
    assert_eq!(message.headers, None);
    assert_eq!(message.reply, None);
}

#[tokio::test]
async fn request_reply_over_shared_inbox() {
    let server = common::MockServer::start().await;
    let client = async_gnat::connect(server.url()).await.unwrap();

    let mut echo = client.subscribe("svc.echo".into()).await.unwrap();
    tokio::spawn({
        let client = client.clone();
        async move {
            while let Some(message) = echo.next().await {
                if let Some(reply) = message.reply {
                    client.publish(reply, message.payload).await.unwrap();
                }
            }
        }
    });

    let response = timeout(
        WAIT,
        client.request_timeout("svc.echo".into(), "ping".into(), Duration::from_millis(500)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(response.payload.as_ref(), b"ping");

    // Concurrent requests correlate through distinct tokens.
    let first = client.request("svc.echo".into(), "one".into());
    let second = client.request("svc.echo".into(), "two".into());
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap().payload.as_ref(), b"one");
    assert_eq!(second.unwrap().payload.as_ref(), b"two");
}

#[tokio::test]
async fn request_old_style_uses_single_use_inbox() {
    let server = common::MockServer::start().await;
    let client = async_gnat::connect(server.url()).await.unwrap();

    let mut echo = client.subscribe("svc.echo".into()).await.unwrap();
    tokio::spawn({
        let client = client.clone();
        async move {
            while let Some(message) = echo.next().await {
                if let Some(reply) = message.reply {
                    client.publish(reply, message.payload).await.unwrap();
                }
            }
        }
    });

    let response = timeout(WAIT, client.request_old_style("svc.echo".into(), "ping".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.payload.as_ref(), b"ping");
}

#[tokio::test]
async fn request_without_responders_returns_status_message() {
    let server = common::MockServer::start().await;
    let client = async_gnat::connect(server.url()).await.unwrap();

    let response = timeout(WAIT, client.request("nobody.home".into(), "hi".into()))
        .await
        .unwrap()
        .unwrap();
    assert!(response.is_no_responders());
    assert_eq!(response.status(), Some(503));
}

#[tokio::test]
async fn request_times_out_without_any_reply() {
    let server = common::MockServer::start().await;
    let client = async_gnat::connect(server.url()).await.unwrap();

    // A subscriber exists but never responds, so no 503 is generated.
    let _black_hole = client.subscribe("slow.service".into()).await.unwrap();

    let result = client
        .request_timeout(
            "slow.service".into(),
            "hi".into(),
            Duration::from_millis(100),
        )
        .await;
    let err = result.unwrap_err();
    assert_eq!(
        err.downcast_ref::<ClientError>(),
        Some(&ClientError::TimedOut)
    );
}

#[tokio::test]
async fn publish_over_max_payload_fails_without_writing() {
    let server = common::MockServer::with_options(common::MockOptions { max_payload: 64 }).await;
    let client = async_gnat::connect(server.url()).await.unwrap();
    assert_eq!(client.max_payload(), 64);

    let mut subscriber = client.subscribe("big.*".into()).await.unwrap();

    let oversized = vec![b'x'; 65];
    let err = client
        .publish("big.one".into(), oversized.into())
        .await
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ClientError>(),
        Some(&ClientError::MaxPayload)
    );

    // The connection stays healthy and smaller payloads go through.
    client.publish("big.two".into(), "ok".into()).await.unwrap();
    let message = timeout(WAIT, subscriber.next()).await.unwrap().unwrap();
    assert_eq!(message.subject, "big.two");
}

#[tokio::test]
async fn empty_subject_is_rejected() {
    let server = common::MockServer::start().await;
    let client = async_gnat::connect(server.url()).await.unwrap();

    let err = client.publish("".into(), "data".into()).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<ClientError>(),
        Some(&ClientError::BadSubject)
    );
}

#[tokio::test]
async fn slow_consumer_drops_messages_and_reports() {
    let server = common::MockServer::start().await;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let client = ConnectOptions::new()
        .subscription_pending_msgs_limit(2)
        .error_callback({
            let errors = errors.clone();
            move |err| errors.lock().unwrap().push(err)
        })
        .connect(server.url())
        .await
        .unwrap();

    let mut subscriber = client.subscribe("flood.*".into()).await.unwrap();
    for i in 0..5 {
        client
            .publish("flood.x".into(), format!("{}", i).into())
            .await
            .unwrap();
    }
    // The flush round trip guarantees every delivery has been processed.
    client.flush().await.unwrap();

    let slow: Vec<_> = errors
        .lock()
        .unwrap()
        .iter()
        .filter(|err| matches!(err, ClientError::SlowConsumer { .. }))
        .cloned()
        .collect();
    assert_eq!(slow.len(), 3);
    assert!(matches!(
        &slow[0],
        ClientError::SlowConsumer { subject, .. } if subject == "flood.*"
    ));

    // The subscription stays live and retains the first two messages.
    let first = timeout(WAIT, subscriber.next()).await.unwrap().unwrap();
    let second = timeout(WAIT, subscriber.next()).await.unwrap().unwrap();
    assert_eq!(first.payload.as_ref(), b"0");
    assert_eq!(second.payload.as_ref(), b"1");

    client
        .publish("flood.x".into(), "again".into())
        .await
        .unwrap();
    let third = timeout(WAIT, subscriber.next()).await.unwrap().unwrap();
    assert_eq!(third.payload.as_ref(), b"again");
}

#[tokio::test]
async fn slow_consumer_by_bytes_drops_messages() {
    let server = common::MockServer::start().await;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let client = ConnectOptions::new()
        .error_callback({
            let errors = errors.clone();
            move |err| errors.lock().unwrap().push(err)
        })
        .connect(server.url())
        .await
        .unwrap();

    // Plenty of queue slots, but only eight pending bytes.
    let mut subscriber = client
        .subscribe_with_limits("bytes.*".into(), None, 100, 8)
        .await
        .unwrap();

    for _ in 0..3 {
        client
            .publish("bytes.x".into(), "12345".into())
            .await
            .unwrap();
    }
    client.flush().await.unwrap();

    let slow = errors
        .lock()
        .unwrap()
        .iter()
        .filter(|err| matches!(err, ClientError::SlowConsumer { .. }))
        .count();
    assert_eq!(slow, 2);

    // Consuming the retained message frees the byte budget again.
    let first = timeout(WAIT, subscriber.next()).await.unwrap().unwrap();
    assert_eq!(first.payload.as_ref(), b"12345");

    client
        .publish("bytes.x".into(), "abcde".into())
        .await
        .unwrap();
    let second = timeout(WAIT, subscriber.next()).await.unwrap().unwrap();
    assert_eq!(second.payload.as_ref(), b"abcde");
}

#[tokio::test]
async fn unsubscribe_after_caps_deliveries() {
    let server = common::MockServer::start().await;
    let client = async_gnat::connect(server.url()).await.unwrap();

    let mut subscriber = client.subscribe("capped.*".into()).await.unwrap();
    subscriber.unsubscribe_after(2).await.unwrap();

    for subject in ["capped.a", "capped.b", "capped.c"] {
        client
            .publish(subject.into(), "data".into())
            .await
            .unwrap();
    }
    client.flush().await.unwrap();

    let first = timeout(WAIT, subscriber.next()).await.unwrap().unwrap();
    let second = timeout(WAIT, subscriber.next()).await.unwrap().unwrap();
    assert_eq!(first.subject, "capped.a");
    assert_eq!(second.subject, "capped.b");

    // The cap removed the subscription, so the stream ends.
    assert!(timeout(WAIT, subscriber.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn reconnects_and_replays_subscriptions() {
    let server = common::MockServer::start().await;

    let disconnects = Arc::new(AtomicUsize::new(0));
    let reconnects = Arc::new(AtomicUsize::new(0));
    let client = ConnectOptions::new()
        .reconnect_time_wait(Duration::from_millis(50))
        .disconnect_callback({
            let disconnects = disconnects.clone();
            move || {
                disconnects.fetch_add(1, Ordering::SeqCst);
            }
        })
        .reconnect_callback({
            let reconnects = reconnects.clone();
            move || {
                reconnects.fetch_add(1, Ordering::SeqCst);
            }
        })
        .error_callback(|_| {})
        .connect(server.url())
        .await
        .unwrap();

    let mut subscriber = client.subscribe("x.>".into()).await.unwrap();
    client.flush().await.unwrap();

    server.bounce();

    // Wait for the client to recover.
    timeout(WAIT, async {
        while client.statistics().reconnects < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(client.statistics().reconnects, 1);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert!(disconnects.load(Ordering::SeqCst) >= 1);
    assert_eq!(reconnects.load(Ordering::SeqCst), 1);

    // The replayed subscription keeps receiving on the new connection.
    client.publish("x.y".into(), "after".into()).await.unwrap();
    let message = timeout(WAIT, subscriber.next()).await.unwrap().unwrap();
    assert_eq!(message.subject, "x.y");
    assert_eq!(message.payload.as_ref(), b"after");
}

#[tokio::test]
async fn connect_failure_without_reconnect_fails_fast() {
    let result = ConnectOptions::new()
        .allow_reconnect(false)
        .connect_timeout(Duration::from_millis(200))
        .connect("127.0.0.1:1")
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn verbose_handshake_accepts_ok_before_pong() {
    let server = common::MockServer::start().await;
    let client = ConnectOptions::new()
        .verbose(true)
        .connect(server.url())
        .await
        .unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    client.publish("v.1".into(), "data".into()).await.unwrap();
    client.flush().await.unwrap();
}

#[tokio::test]
async fn callback_subscription_dispatches_messages() {
    let server = common::MockServer::start().await;
    let client = async_gnat::connect(server.url()).await.unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let subscription = client
        .subscribe_with_callback("cb.*".into(), {
            let received = received.clone();
            move |message| {
                received.lock().unwrap().push(message.subject.clone());
                Ok(())
            }
        })
        .await
        .unwrap();

    client.publish("cb.a".into(), "1".into()).await.unwrap();
    client.publish("cb.b".into(), "2".into()).await.unwrap();
    client.flush().await.unwrap();

    timeout(WAIT, async {
        while received.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(&*received.lock().unwrap(), &["cb.a", "cb.b"]);

    subscription.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn drain_delivers_buffered_messages_then_closes() {
    let server = common::MockServer::start().await;
    let closed = Arc::new(AtomicUsize::new(0));
    let client = ConnectOptions::new()
        .close_callback({
            let closed = closed.clone();
            move || {
                closed.fetch_add(1, Ordering::SeqCst);
            }
        })
        .connect(server.url())
        .await
        .unwrap();

    let mut subscriber = client.subscribe("d.*".into()).await.unwrap();
    client.publish("d.1".into(), "one".into()).await.unwrap();
    client.flush().await.unwrap();

    client.drain().await.unwrap();

    // Buffered messages stay readable, then the stream ends.
    let message = timeout(WAIT, subscriber.next()).await.unwrap().unwrap();
    assert_eq!(message.subject, "d.1");
    assert!(timeout(WAIT, subscriber.next()).await.unwrap().is_none());

    timeout(WAIT, async {
        while !client.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    let err = client
        .publish("d.2".into(), "late".into())
        .await
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ClientError>(),
        Some(&ClientError::ConnectionClosed)
    );

    // Draining a closed connection fails, double drain is a no-op earlier.
    let err = client.drain().await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<ClientError>(),
        Some(&ClientError::ConnectionClosed)
    );
}

#[tokio::test]
async fn statistics_count_messages_and_bytes() {
    let server = common::MockServer::start().await;
    let client = async_gnat::connect(server.url()).await.unwrap();

    let mut subscriber = client.subscribe("s.*".into()).await.unwrap();
    client.publish("s.1".into(), "12345".into()).await.unwrap();
    client.flush().await.unwrap();
    timeout(WAIT, subscriber.next()).await.unwrap().unwrap();

    let statistics = client.statistics();
    assert_eq!(statistics.out_msgs, 1);
    assert_eq!(statistics.in_msgs, 1);
    assert_eq!(statistics.out_bytes, 5);
    assert_eq!(statistics.in_bytes, 5);
    assert_eq!(statistics.reconnects, 0);
}
