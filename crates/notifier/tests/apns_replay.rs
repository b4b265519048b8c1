//! Binary gateway delivery against a local fake gateway.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use pushgate_common::config::{AppConfig, ApnsConfig};
use pushgate_common::types::{App, DeliveryStatus, Environment, Notification, Provider};
use pushgate_notifier::batch::Batch;
use pushgate_notifier::connection::Connector;
use pushgate_notifier::delivery::Outcome;
use pushgate_notifier::delivery::apns::{ApnsDispatcher, decode_frame, encode_error_frame};
use pushgate_notifier::delivery::feedback::{FeedbackReceiver, TUPLE_BYTES};
use pushgate_notifier::error::{ConnectionError, DispatchError};
use pushgate_notifier::queue::QueuePayload;
use pushgate_notifier::{AppRunner, Dispatcher, DispatcherFactory, Feeder};
use pushgate_store::MemoryStore;

// ============================================================
// Fake gateway
// ============================================================

/// Error frame sent on the first connection after `after` frames.
#[derive(Clone, Copy)]
struct ErrorScript {
    after: usize,
    status: u8,
    identifier: u32,
}

struct FakeGateway {
    port: u16,
    /// `(connection index, sequence id)` in arrival order.
    received: Arc<Mutex<Vec<(usize, u32)>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeGateway {
    async fn spawn(script: Option<ErrorScript>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        tokio::spawn({
            let received = received.clone();
            let connections = connections.clone();
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let index = connections.fetch_add(1, Ordering::SeqCst);
                    let script = if index == 0 { script } else { None };
                    tokio::spawn(serve(socket, index, script, received.clone()));
                }
            }
        });

        Self {
            port,
            received,
            connections,
        }
    }

    fn ids_on(&self, connection: usize) -> Vec<u32> {
        self.received
            .lock()
            .iter()
            .filter(|(index, _)| *index == connection)
            .map(|(_, id)| *id)
            .collect()
    }
}

async fn serve(
    mut socket: TcpStream,
    index: usize,
    script: Option<ErrorScript>,
    received: Arc<Mutex<Vec<(usize, u32)>>>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut frames = 0;
    loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some((frame, used)) = decode_frame(&buf) {
            buf.drain(..used);
            received.lock().push((index, frame.identifier));
            frames += 1;

            if let Some(script) = script
                && frames == script.after
            {
                socket
                    .write_all(&encode_error_frame(script.status, script.identifier))
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                return;
            }
        }
    }
}

// ============================================================
// Helpers
// ============================================================

fn make_app() -> App {
    App {
        id: Uuid::new_v4(),
        name: "ios".to_string(),
        provider: Provider::Apns,
        environment: Some(Environment::Sandbox),
        certificate: None,
        password: None,
        auth_key: None,
        client_id: None,
        client_secret: None,
        access_token: None,
        access_token_expires_at: None,
        connections: 1,
        enabled: true,
    }
}

fn token(i: usize) -> String {
    format!("{:064x}", i)
}

fn apns_config() -> ApnsConfig {
    ApnsConfig {
        error_select_timeout: Duration::from_millis(200),
        ..ApnsConfig::default()
    }
}

async fn connect(app: &App, port: u16) -> ApnsDispatcher {
    ApnsDispatcher::connect(
        app,
        Connector::Plain,
        ("127.0.0.1".to_string(), port),
        apns_config(),
        Duration::from_secs(2),
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

async fn send_all(dispatcher: &ApnsDispatcher, app: &App, count: usize) -> Vec<Notification> {
    let mut sent = Vec::new();
    for i in 1..=count {
        let n = Notification::new(app.id, vec![token(i)], serde_json::json!({"aps": {"alert": i}}));
        let report = dispatcher
            .dispatch(&Batch::single(QueuePayload::new(n.clone())))
            .await
            .unwrap();
        assert_eq!(report.outcomes, vec![Outcome::Delivered]);
        sent.push(n);
    }
    sent
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

// ============================================================
// Replay
// ============================================================

#[tokio::test]
async fn test_error_frame_fails_one_and_replays_suffix() {
    let gateway = FakeGateway::spawn(Some(ErrorScript {
        after: 6,
        status: 8,
        identifier: 3,
    }))
    .await;
    let app = make_app();
    let dispatcher = connect(&app, gateway.port).await;

    let sent = send_all(&dispatcher, &app, 6).await;
    wait_until(|| gateway.ids_on(1).len() == 3).await;

    assert_eq!(gateway.ids_on(0), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(gateway.ids_on(1), vec![4, 5, 6]);
    assert_eq!(gateway.connections.load(Ordering::SeqCst), 2);

    let late = dispatcher.take_late_outcomes();
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].notification.id, sent[2].id);
    match &late[0].outcome {
        Outcome::Failed(error) => assert_eq!(error.code, Some(8)),
        other => panic!("unexpected outcome {:?}", other),
    }
    let feedback = late[0].feedback.as_ref().unwrap();
    assert_eq!(feedback.token, token(3));

    // Replayed frames stay correlated for a later error.
    assert_eq!(dispatcher.recorded_sequence_ids().await, vec![4, 5, 6]);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_status_replays_without_failing() {
    let gateway = FakeGateway::spawn(Some(ErrorScript {
        after: 5,
        status: 10,
        identifier: 3,
    }))
    .await;
    let app = make_app();
    let dispatcher = connect(&app, gateway.port).await;

    send_all(&dispatcher, &app, 5).await;
    wait_until(|| gateway.ids_on(1).len() == 2).await;

    assert_eq!(gateway.ids_on(1), vec![4, 5]);
    assert!(dispatcher.take_late_outcomes().is_empty());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_unknown_identifier_replays_whole_buffer() {
    let gateway = FakeGateway::spawn(Some(ErrorScript {
        after: 3,
        status: 1,
        identifier: 999,
    }))
    .await;
    let app = make_app();
    let dispatcher = connect(&app, gateway.port).await;

    send_all(&dispatcher, &app, 3).await;
    wait_until(|| gateway.ids_on(1).len() == 3).await;

    assert_eq!(gateway.ids_on(1), vec![1, 2, 3]);
    assert!(dispatcher.take_late_outcomes().is_empty());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_new_sends_follow_replayed_frames() {
    let gateway = FakeGateway::spawn(Some(ErrorScript {
        after: 4,
        status: 8,
        identifier: 2,
    }))
    .await;
    let app = make_app();
    let dispatcher = connect(&app, gateway.port).await;

    send_all(&dispatcher, &app, 4).await;
    wait_until(|| gateway.ids_on(1).len() == 2).await;

    let n = Notification::new(app.id, vec![token(9)], serde_json::json!({"aps": {}}));
    dispatcher
        .dispatch(&Batch::single(QueuePayload::new(n)))
        .await
        .unwrap();
    wait_until(|| gateway.ids_on(1).len() == 3).await;

    assert_eq!(gateway.ids_on(1), vec![3, 4, 5]);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_invalid_token_fails_without_writing() {
    let gateway = FakeGateway::spawn(None).await;
    let app = make_app();
    let dispatcher = connect(&app, gateway.port).await;

    let n = Notification::new(app.id, vec!["not-hex".to_string()], serde_json::json!({}));
    let report = dispatcher
        .dispatch(&Batch::single(QueuePayload::new(n)))
        .await
        .unwrap();
    assert!(matches!(report.outcomes[0], Outcome::Failed(_)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(gateway.received.lock().is_empty());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_connect_refused_is_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = ApnsDispatcher::connect(
        &make_app(),
        Connector::Plain,
        ("127.0.0.1".to_string(), port),
        apns_config(),
        Duration::from_secs(1),
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(result, Err(DispatchError::Connection(_))));
}

// ============================================================
// Through the worker pool
// ============================================================

struct PlainGateway {
    port: u16,
}

#[async_trait]
impl DispatcherFactory for PlainGateway {
    async fn build(
        &self,
        app: &App,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn Dispatcher>, DispatchError> {
        Ok(Arc::new(
            ApnsDispatcher::connect(
                app,
                Connector::Plain,
                ("127.0.0.1".to_string(), self.port),
                apns_config(),
                Duration::from_secs(2),
                cancel,
            )
            .await?,
        ))
    }
}

#[tokio::test]
async fn test_pool_records_late_failure_and_feedback() {
    let gateway = FakeGateway::spawn(Some(ErrorScript {
        after: 4,
        status: 8,
        identifier: 2,
    }))
    .await;
    let store = Arc::new(MemoryStore::new());
    let app = make_app();
    store.upsert_app(app.clone());

    let mut ids = Vec::new();
    for i in 1..=4 {
        let mut n = Notification::new(app.id, vec![token(i)], serde_json::json!({"aps": {}}));
        n.created_at = chrono::Utc::now() - chrono::Duration::seconds(10 - i as i64);
        ids.push(n.id);
        store.insert_notification(n);
    }

    let config = AppConfig {
        pop_timeout: Duration::from_millis(20),
        apns: apns_config(),
        ..AppConfig::default()
    };
    let runner = Arc::new(AppRunner::new(
        &config,
        store.clone(),
        Arc::new(PlainGateway { port: gateway.port }),
    ));
    runner.add(app.clone()).await.unwrap();
    let feeder = Feeder::new(&config, store.clone(), runner.clone(), CancellationToken::new());
    assert_eq!(feeder.feed_once().await, 4);

    wait_until(|| {
        store
            .notification(ids[1])
            .is_some_and(|n| n.status == DeliveryStatus::Failed)
    })
    .await;

    let rejected = store.notification(ids[1]).unwrap();
    assert_eq!(rejected.error_code, Some(8));
    for id in [ids[0], ids[2], ids[3]] {
        assert_eq!(store.notification(id).unwrap().status, DeliveryStatus::Sent);
    }
    assert_eq!(store.token_feedback().len(), 1);
    assert_eq!(store.token_feedback()[0].token, token(2));

    wait_until(|| gateway.ids_on(1).len() == 2).await;
    assert_eq!(gateway.ids_on(1), vec![3, 4]);
    runner.stop().await;
}

// ============================================================
// Feedback service
// ============================================================

fn feedback_tuple(timestamp: u32, token: u8) -> [u8; TUPLE_BYTES] {
    let mut buf = [0u8; TUPLE_BYTES];
    buf[..4].copy_from_slice(&timestamp.to_be_bytes());
    buf[4..6].copy_from_slice(&32u16.to_be_bytes());
    buf[6..].copy_from_slice(&[token; 32]);
    buf
}

/// Accepts one connection, writes `tuples`, then either closes or goes
/// silent while keeping the connection open.
async fn fake_feedback(tuples: Vec<[u8; TUPLE_BYTES]>, stall: bool) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        for tuple in &tuples {
            socket.write_all(tuple).await.unwrap();
        }
        if stall {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
    });
    port
}

fn feedback_receiver(app: &App, port: u16, store: Arc<MemoryStore>) -> FeedbackReceiver {
    FeedbackReceiver::new(
        app,
        Connector::Plain,
        ("127.0.0.1".to_string(), port),
        Duration::from_secs(60),
        Duration::from_secs(2),
        Duration::from_millis(200),
        store,
    )
}

#[tokio::test]
async fn test_feedback_records_tuples_until_close() {
    let port = fake_feedback(
        vec![feedback_tuple(1_700_000_000, 0xAA), feedback_tuple(1_700_000_060, 0xBB)],
        false,
    )
    .await;
    let store = Arc::new(MemoryStore::new());
    let app = make_app();
    let receiver = feedback_receiver(&app, port, store.clone());

    let recorded = receiver.check_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(recorded, 2);

    let feedback = store.token_feedback();
    assert_eq!(feedback.len(), 2);
    assert_eq!(feedback[0].app_id, app.id);
    assert_eq!(feedback[0].token, "aa".repeat(32));
    assert_eq!(feedback[0].observed_at.timestamp(), 1_700_000_000);
    assert_eq!(feedback[1].token, "bb".repeat(32));
}

#[tokio::test]
async fn test_feedback_stalled_service_times_out() {
    let port = fake_feedback(vec![feedback_tuple(1_700_000_000, 0xCC)], true).await;
    let store = Arc::new(MemoryStore::new());
    let app = make_app();
    let receiver = feedback_receiver(&app, port, store.clone());

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        receiver.check_once(&CancellationToken::new()),
    )
    .await
    .expect("check_once must not hang on a silent service");
    assert!(matches!(result, Err(ConnectionError::Timeout(_))));
    // The tuple read before the stall is kept.
    assert_eq!(store.token_feedback().len(), 1);
}

#[tokio::test]
async fn test_feedback_partial_tuple_ends_check() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket
            .write_all(&feedback_tuple(1_700_000_000, 0xDD))
            .await
            .unwrap();
        socket.write_all(&[0u8; 10]).await.unwrap();
    });
    let store = Arc::new(MemoryStore::new());
    let receiver = feedback_receiver(&make_app(), port, store.clone());

    assert_eq!(receiver.check_once(&CancellationToken::new()).await.unwrap(), 1);
    assert_eq!(store.token_feedback().len(), 1);
}
