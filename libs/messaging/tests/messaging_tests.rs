use courier_core::{codes, CommandMessage, CommandResponse, ResponseType};
use courier_fabric::{ConnectionId, DesyncPolicy, PlainCipher};
use courier_messaging::{
    provider::{INACTIVE_TEXT, NOT_WAITING_TEXT, TIMED_OUT_TEXT},
    ConsumerConfig, ConsumerEvent, Error, MessagingConsumer, MessagingProvider, ProviderConfig,
    ProviderEvent, RoutingConfig, RoutingManager,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedReceiver;

const SLOW_REPLY: Duration = Duration::from_millis(800);

fn provider_config() -> ProviderConfig {
    ProviderConfig::default().with_reconnect_backoff(Duration::from_millis(100))
}

fn provider() -> MessagingProvider {
    MessagingProvider::new(provider_config(), Arc::new(PlainCipher))
}

/// A consumer answering every command with `name:command`
///
/// `silent` commands get no reply and `slow` ones are answered late.
async fn echo_consumer(name: &'static str) -> (Arc<MessagingConsumer>, SocketAddr) {
    let consumer = Arc::new(MessagingConsumer::new(Arc::new(PlainCipher)));
    let mut events = consumer.subscribe();
    let addr = consumer
        .start("127.0.0.1", 0, ConsumerConfig::default())
        .await
        .unwrap();

    let responder = consumer.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ConsumerEvent::Message { connection, message } = event {
                let responder = responder.clone();
                tokio::spawn(async move {
                    match message.command.as_str() {
                        "silent" => return,
                        "slow" => tokio::time::sleep(SLOW_REPLY).await,
                        _ => {}
                    }
                    let reply = CommandResponse::for_message(
                        &message,
                        codes::SUCCESS,
                        ResponseType::Text,
                        format!("{}:{}", name, message.command),
                    );
                    responder.send_response(connection, &reply).await;
                });
            }
        }
    });

    (consumer, addr)
}

async fn next_matching<T>(rx: &mut UnboundedReceiver<T>, mut wanted: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream ended");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

async fn wait_connected(provider: &MessagingProvider) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !provider.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("provider never connected");
}

#[tokio::test]
async fn persistent_send_receives_correlated_response() {
    let (_consumer, addr) = echo_consumer("c1").await;
    let provider = provider();
    provider.connect_persistent("127.0.0.1", addr.port()).unwrap();
    wait_connected(&provider).await;

    let message = CommandMessage::new(3, "orders", "ping").with_argument("id", "8");
    let key = message.unique_key;
    let response = provider.send(message, Duration::from_secs(2)).await;

    assert_eq!(response.response_code, codes::SUCCESS);
    assert_eq!(response.unique_key, key);
    assert_eq!(response.company_id, 3);
    assert_eq!(response.response, "c1:ping");
    assert_eq!(provider.awaiting(), 0);
    provider.dispose().await;
}

#[tokio::test]
async fn timeout_returns_promptly_and_late_response_is_unsolicited() {
    let (_consumer, addr) = echo_consumer("c1").await;
    let provider = provider();
    let mut events = provider.subscribe();
    provider.connect_persistent("127.0.0.1", addr.port()).unwrap();
    wait_connected(&provider).await;

    let message = CommandMessage::new(1, "orders", "slow");
    let key = message.unique_key;
    let started = Instant::now();
    let response = provider.send(message, Duration::from_millis(500)).await;
    let elapsed = started.elapsed();

    assert_eq!(response.response_code, codes::TIMED_OUT);
    assert_eq!(response.response, TIMED_OUT_TEXT);
    assert_eq!(response.unique_key, key);
    assert!(elapsed >= Duration::from_millis(480), "returned after {:?}", elapsed);
    assert!(elapsed < SLOW_REPLY, "returned after {:?}", elapsed);

    let late = next_matching(&mut events, |e| matches!(e, ProviderEvent::Unsolicited(_))).await;
    match late {
        ProviderEvent::Unsolicited(late) => {
            assert_eq!(late.unique_key, key);
            assert_eq!(late.response, "c1:slow");
        }
        other => panic!("Expected an unsolicited response, got {:?}", other),
    }
    provider.dispose().await;
}

#[tokio::test]
async fn fire_and_forget_returns_immediately() {
    let (_consumer, addr) = echo_consumer("c1").await;
    let provider = provider();
    provider.connect_persistent("127.0.0.1", addr.port()).unwrap();
    wait_connected(&provider).await;

    let started = Instant::now();
    let response = provider
        .send(CommandMessage::new(1, "orders", "silent"), Duration::ZERO)
        .await;

    assert_eq!(response.response_code, codes::SUCCESS);
    assert_eq!(response.response, NOT_WAITING_TEXT);
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(provider.awaiting(), 0);
    provider.dispose().await;
}

#[tokio::test]
async fn send_without_connection_is_inactive() {
    let provider = provider();
    let message = CommandMessage::new(1, "orders", "ping");
    let key = message.unique_key;

    let response = provider.send(message, Duration::from_secs(1)).await;
    assert_eq!(response.response_code, codes::CONNECTION_INACTIVE);
    assert_eq!(response.response, INACTIVE_TEXT);
    assert_eq!(response.unique_key, key);
}

#[tokio::test]
async fn persistent_connection_reports_failures_and_keeps_retrying() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let provider = provider();
    let mut events = provider.subscribe();
    provider.connect_persistent("127.0.0.1", port).unwrap();

    for _ in 0..2 {
        next_matching(&mut events, |e| matches!(e, ProviderEvent::Error { .. })).await;
    }
    assert!(!provider.is_connected());
    provider.dispose().await;
}

#[tokio::test]
async fn persistent_connection_recovers_after_consumer_restart() {
    let consumer = Arc::new(MessagingConsumer::new(Arc::new(PlainCipher)));
    let addr = consumer
        .start("127.0.0.1", 0, ConsumerConfig::default())
        .await
        .unwrap();

    let provider = provider();
    let mut events = provider.subscribe();
    provider.connect_persistent("127.0.0.1", addr.port()).unwrap();
    next_matching(&mut events, |e| matches!(e, ProviderEvent::Connected)).await;

    consumer.stop().await;
    next_matching(&mut events, |e| matches!(e, ProviderEvent::Closed)).await;

    consumer
        .start("127.0.0.1", addr.port(), ConsumerConfig::default())
        .await
        .unwrap();
    next_matching(&mut events, |e| matches!(e, ProviderEvent::Connected)).await;
    assert!(provider.is_connected());

    provider.dispose().await;
    consumer.stop().await;
}

#[tokio::test]
async fn dispatch_callback_runs_before_the_reply_arrives() {
    let (consumer, addr) = echo_consumer("c1").await;
    let provider = provider();

    let dispatched = std::sync::Mutex::new(None);
    let response = provider
        .send_with(CommandMessage::new(1, "r", "slow"), Duration::from_secs(2), || {
            *dispatched.lock().unwrap() = Some(Instant::now());
        })
        .await;
    assert_eq!(response.response_code, codes::CONNECTION_INACTIVE);
    assert!(dispatched.lock().unwrap().is_none());

    provider.connect_persistent("127.0.0.1", addr.port()).unwrap();
    wait_connected(&provider).await;

    let started = Instant::now();
    let response = provider
        .send_with(CommandMessage::new(1, "r", "slow"), Duration::from_secs(2), || {
            *dispatched.lock().unwrap() = Some(Instant::now());
        })
        .await;
    assert_eq!(response.response, "c1:slow");
    let dispatched_at = dispatched.lock().unwrap().expect("callback never ran");
    assert!(dispatched_at.duration_since(started) < SLOW_REPLY / 2);

    provider.dispose().await;
    consumer.stop().await;
}

#[tokio::test]
async fn dispose_right_after_connect_leaves_no_connection_open() {
    let (consumer, addr) = echo_consumer("c1").await;

    for round in 0..20u64 {
        let provider = provider();
        provider.connect_persistent("127.0.0.1", addr.port()).unwrap();
        tokio::time::sleep(Duration::from_millis(round % 5)).await;
        provider.dispose().await;
        assert!(!provider.is_connected());
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while consumer.connection_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("a disposed provider kept its connection open");
    consumer.stop().await;
}

#[tokio::test]
async fn second_connect_persistent_is_rejected() {
    let (_consumer, addr) = echo_consumer("c1").await;
    let provider = provider();
    provider.connect_persistent("127.0.0.1", addr.port()).unwrap();

    assert!(matches!(
        provider.connect_persistent("127.0.0.1", addr.port()),
        Err(Error::AlreadyRunning(_))
    ));

    provider.dispose().await;
    provider.dispose().await;
    assert!(matches!(
        provider.connect_persistent("127.0.0.1", addr.port()),
        Err(Error::Disposed)
    ));
}

#[tokio::test]
async fn ad_hoc_send_round_trip() {
    let (consumer, addr) = echo_consumer("adhoc").await;
    let provider = provider();

    let response = provider
        .send_ad_hoc(
            "127.0.0.1",
            addr.port(),
            CommandMessage::new(1, "orders", "ping"),
            Duration::from_secs(2),
        )
        .await;
    assert_eq!(response.response_code, codes::SUCCESS);
    assert_eq!(response.response, "adhoc:ping");
    assert!(!provider.is_connected());

    // The ad hoc connection is gone once the exchange completes
    tokio::time::timeout(Duration::from_secs(2), async {
        while consumer.connection_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("ad hoc connection was not closed");
}

#[tokio::test]
async fn ad_hoc_send_to_closed_port_fails() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let provider = provider();

    let response = provider
        .send_ad_hoc(
            "127.0.0.1",
            port,
            CommandMessage::new(1, "orders", "ping"),
            Duration::from_secs(1),
        )
        .await;
    assert_eq!(response.response_code, codes::SEND_FAILED);
}

#[tokio::test]
async fn consumer_reports_accept_and_close() {
    let (consumer, addr) = echo_consumer("c1").await;
    let mut events = consumer.subscribe();

    let provider = provider();
    provider.connect_persistent("127.0.0.1", addr.port()).unwrap();

    let accepted = match next_matching(&mut events, |e| matches!(e, ConsumerEvent::Accepted { .. })).await {
        ConsumerEvent::Accepted { connection, peer } => {
            assert!(peer.starts_with("127.0.0.1:"));
            connection
        }
        other => panic!("Expected accept, got {:?}", other),
    };
    assert!(!accepted.is_none());
    assert_eq!(consumer.connection_count().await, 1);

    provider.dispose().await;
    match next_matching(&mut events, |e| matches!(e, ConsumerEvent::Closed { .. })).await {
        ConsumerEvent::Closed { connection } => assert_eq!(connection, accepted),
        other => panic!("Expected close, got {:?}", other),
    }
}

#[tokio::test]
async fn every_accepted_connection_is_announced_once() {
    let (consumer, addr) = echo_consumer("c1").await;
    let mut events = consumer.subscribe();

    let first = tokio::net::TcpStream::connect(addr).await.unwrap();
    let second = tokio::net::TcpStream::connect(addr).await.unwrap();

    let mut accepted = Vec::new();
    for _ in 0..2 {
        if let ConsumerEvent::Accepted { connection, .. } =
            next_matching(&mut events, |e| matches!(e, ConsumerEvent::Accepted { .. })).await
        {
            accepted.push(connection);
        }
    }
    assert_ne!(accepted[0], accepted[1]);
    assert_eq!(consumer.connection_count().await, 2);

    drop((first, second));
    consumer.stop().await;
}

#[tokio::test]
async fn response_to_unknown_connection_only_warns() {
    let (consumer, _addr) = echo_consumer("c1").await;
    let mut events = consumer.subscribe();
    let response = CommandResponse::detached(1, codes::SUCCESS, ResponseType::Text, "orphan");

    consumer.send_response(ConnectionId::NONE, &response).await;
    consumer
        .send_response(ConnectionId::from(u64::MAX), &response)
        .await;

    match next_matching(&mut events, |_| true).await {
        ConsumerEvent::Warning { connection, .. } => {
            assert_eq!(connection, ConnectionId::from(u64::MAX))
        }
        other => panic!("Expected a warning, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err(), "no further events expected");
}

#[tokio::test]
async fn broadcast_reaches_every_provider() {
    let (consumer, addr) = echo_consumer("c1").await;
    let first = provider();
    let second = provider();
    let mut first_events = first.subscribe();
    let mut second_events = second.subscribe();
    first.connect_persistent("127.0.0.1", addr.port()).unwrap();
    second.connect_persistent("127.0.0.1", addr.port()).unwrap();
    wait_connected(&first).await;
    wait_connected(&second).await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while consumer.connection_count().await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("consumer never registered both providers");

    let notice = CommandResponse::detached(1, codes::SUCCESS, ResponseType::Text, "maintenance");
    consumer.send_response_to_all(&notice).await;

    for events in [&mut first_events, &mut second_events] {
        match next_matching(events, |e| matches!(e, ProviderEvent::Unsolicited(_))).await {
            ProviderEvent::Unsolicited(received) => assert_eq!(received, notice),
            other => panic!("Expected broadcast, got {:?}", other),
        }
    }

    first.dispose().await;
    second.dispose().await;
}

#[tokio::test]
async fn consumer_start_while_running_is_rejected() {
    let consumer = MessagingConsumer::new(Arc::new(PlainCipher));
    let addr = consumer
        .start("127.0.0.1", 0, ConsumerConfig::default())
        .await
        .unwrap();

    assert!(matches!(
        consumer.start("127.0.0.1", 0, ConsumerConfig::default()).await,
        Err(Error::AlreadyRunning(_))
    ));
    assert_eq!(consumer.local_addr().await, Some(addr));

    consumer.stop().await;
    consumer.stop().await;
    assert_eq!(consumer.local_addr().await, None);
    consumer
        .start("127.0.0.1", 0, ConsumerConfig::default())
        .await
        .unwrap();
    consumer.stop().await;
}

#[tokio::test]
async fn consumer_closes_connection_on_desync_when_configured() {
    let consumer = MessagingConsumer::new(Arc::new(PlainCipher));
    let mut events = consumer.subscribe();
    let config = ConsumerConfig {
        desync_policy: DesyncPolicy::Close,
        ..ConsumerConfig::default()
    };
    let addr = consumer.start("127.0.0.1", 0, config).await.unwrap();

    let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    raw.write_all(&[0x55u8; 16]).await.unwrap();
    raw.flush().await.unwrap();

    match next_matching(&mut events, |e| matches!(e, ConsumerEvent::Error { .. })).await {
        ConsumerEvent::Error { message, .. } => assert!(message.contains("out of sync")),
        other => panic!("Expected desync error, got {:?}", other),
    }
    next_matching(&mut events, |e| matches!(e, ConsumerEvent::Closed { .. })).await;
    consumer.stop().await;
}

#[tokio::test]
async fn routing_prefers_lowest_count_then_registration_order() {
    let (_c1, addr1) = echo_consumer("c1").await;
    let (_c2, addr2) = echo_consumer("c2").await;

    let manager = RoutingManager::new(provider_config(), Arc::new(PlainCipher));
    let first = manager.add_consumer("127.0.0.1", addr1.port(), "x").unwrap();
    let second = manager.add_consumer("127.0.0.1", addr2.port(), "x, y").unwrap();
    wait_connected(first.provider()).await;
    wait_connected(second.provider()).await;

    for _ in 0..5 {
        second.increment_message_count();
    }

    for expected_count in 1..=3 {
        let response = manager
            .send_message("x", CommandMessage::new(1, "r", "route"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.response, "c1:route");
        assert_eq!(first.message_count(), expected_count);
    }
    assert_eq!(second.message_count(), 5);

    let response = manager
        .send_message("y", CommandMessage::new(1, "r", "only"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.response, "c2:only");
    assert_eq!(second.message_count(), 6);

    manager.dispose().await;
}

#[tokio::test]
async fn routing_alternates_between_equal_consumers() {
    let (_c1, addr1) = echo_consumer("c1").await;
    let (_c2, addr2) = echo_consumer("c2").await;

    let manager = RoutingManager::new(provider_config(), Arc::new(PlainCipher));
    let first = manager.add_consumer("127.0.0.1", addr1.port(), "x").unwrap();
    let second = manager.add_consumer("127.0.0.1", addr2.port(), "x").unwrap();
    wait_connected(first.provider()).await;
    wait_connected(second.provider()).await;

    let mut handled = Vec::new();
    for _ in 0..4 {
        let response = manager
            .send_message("x", CommandMessage::new(1, "r", "go"), Duration::from_secs(2))
            .await
            .unwrap();
        handled.push(response.response);
    }
    assert_eq!(handled, vec!["c1:go", "c2:go", "c1:go", "c2:go"]);
    manager.dispose().await;
}

#[tokio::test]
async fn concurrent_routing_spreads_commands_still_awaiting_replies() {
    let (_c1, addr1) = echo_consumer("c1").await;
    let (_c2, addr2) = echo_consumer("c2").await;

    let manager = Arc::new(RoutingManager::new(provider_config(), Arc::new(PlainCipher)));
    let first = manager.add_consumer("127.0.0.1", addr1.port(), "x").unwrap();
    let second = manager.add_consumer("127.0.0.1", addr2.port(), "x").unwrap();
    wait_connected(first.provider()).await;
    wait_connected(second.provider()).await;

    // Every reply takes longer than all six sends together
    let mut sends = Vec::new();
    for _ in 0..6 {
        let manager = manager.clone();
        sends.push(tokio::spawn(async move {
            manager
                .send_message("x", CommandMessage::new(1, "r", "slow"), Duration::from_secs(3))
                .await
                .unwrap()
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut handled = Vec::new();
    for send in sends {
        handled.push(send.await.unwrap().response);
    }
    assert_eq!(handled.iter().filter(|r| *r == "c1:slow").count(), 3);
    assert_eq!(handled.iter().filter(|r| *r == "c2:slow").count(), 3);
    assert_eq!(first.message_count(), 3);
    assert_eq!(second.message_count(), 3);
    manager.dispose().await;
}

#[tokio::test]
async fn routing_fire_and_forget_returns_immediately() {
    let (_c1, addr) = echo_consumer("c1").await;
    let manager = RoutingManager::new(provider_config(), Arc::new(PlainCipher));
    let consumer = manager.add_consumer("127.0.0.1", addr.port(), "x").unwrap();
    wait_connected(consumer.provider()).await;

    let started = Instant::now();
    let response = manager
        .send_message("x", CommandMessage::new(1, "r", "silent"), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(response.response_code, codes::SUCCESS);
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(consumer.message_count(), 1);
    manager.dispose().await;
}

#[tokio::test]
async fn routing_events_are_tagged_with_their_consumer() {
    let (_c1, addr) = echo_consumer("c1").await;
    let manager = RoutingManager::new(provider_config(), Arc::new(PlainCipher));
    let mut events = manager.subscribe();
    manager.add_consumer("127.0.0.1", addr.port(), "x").unwrap();

    let connected = next_matching(&mut events, |e| matches!(e.event, ProviderEvent::Connected)).await;
    assert_eq!(connected.consumer.port(), addr.port());
    assert_eq!(connected.consumer.services(), ["x".to_string()]);
    manager.dispose().await;
}

#[tokio::test]
async fn routing_manager_from_config() {
    let (_c1, addr) = echo_consumer("c1").await;
    let config = RoutingConfig::from_toml_str(&format!(
        r#"
        [provider]
        reconnect_backoff_ms = 100

        [[consumers]]
        server = "127.0.0.1"
        port = {}
        services = "billing;reports"
        "#,
        addr.port()
    ))
    .unwrap();

    let manager = RoutingManager::from_config(&config, Arc::new(PlainCipher)).unwrap();
    let consumers = manager.consumers();
    assert_eq!(consumers.len(), 1);
    wait_connected(consumers[0].provider()).await;

    let response = manager
        .send_message("reports", CommandMessage::new(1, "r", "daily"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.response, "c1:daily");
    manager.dispose().await;
}

#[test]
fn routing_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("routing.toml");
    std::fs::write(
        &path,
        "[[consumers]]\nserver = \"127.0.0.1\"\nport = 9400\nservices = \"billing\"\n",
    )
    .unwrap();

    let config = RoutingConfig::from_file(&path).unwrap();
    assert_eq!(config.consumers[0].services, "billing");
    assert!(matches!(
        RoutingConfig::from_file(dir.path().join("missing.toml")),
        Err(Error::Io(_))
    ));
}
