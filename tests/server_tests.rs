use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_util::sync::CancellationToken;
use tripcast::*;

async fn read_message<S>(stream: &mut S) -> Message
where
    S: futures::Stream<Item = Result<Frame, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .unwrap();
        if let Frame::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_end_to_end_over_tcp() {
    let (hub, hub_task) = Hub::start(HubConfig::default()).unwrap();
    let store = Arc::new(MemoryStore::with_seed_routes());
    // Short simulated minutes keep the run quick
    let config = DriverConfig {
        route_minute: Duration::from_millis(5),
        ..DriverConfig::default()
    };
    let driver = Driver::new(store.clone(), hub.clone(), config);
    let dispatcher = TripDispatcher::new(store.clone(), driver.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = CancellationToken::new();
    let server = tokio::spawn(server::serve(
        listener,
        hub.clone(),
        store.clone(),
        SessionConfig::default(),
        stop.clone(),
    ));

    let (ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
    let (mut sink, mut stream) = ws.split();
    assert_eq!(read_message(&mut stream).await.kind(), MessageType::Welcome);

    let route = store.routes().into_iter().find(|r| r.name == "Surabaya - Malang").unwrap();
    let bus = store.insert_bus(Bus::new("Coach 12"));
    let trip = dispatcher.create_trip(bus.id, route.id).await.unwrap();

    let mut kinds = Vec::new();
    loop {
        let message = read_message(&mut stream).await;
        assert_eq!(message.trip_id(), Some(trip.id));
        kinds.push(message.kind());
        if message.kind() == MessageType::TripCompleted {
            break;
        }
    }
    assert_eq!(kinds.len(), 12);
    assert_eq!(kinds[0], MessageType::TripStarted);

    // A late subscriber gets the final persisted state
    sink.send(Frame::text(Message::subscribe_trip(trip.id).to_json().unwrap()))
        .await
        .unwrap();
    let update = read_message(&mut stream).await;
    assert_eq!(update.kind(), MessageType::TripUpdate);
    assert_eq!(update.snapshot().unwrap().trip.status, TripStatus::Completed);

    driver.shutdown().await;
    hub.shutdown().await;
    stop.cancel();
    server.await.unwrap();
    let stats = hub_task.await.unwrap();
    assert_eq!(stats.registered, 1);
    assert_eq!(stats.evicted, 0);
}

#[tokio::test]
async fn test_non_websocket_client_is_dropped() {
    use tokio::io::AsyncWriteExt;

    let (hub, _hub_task) = Hub::start(HubConfig::default()).unwrap();
    let store = Arc::new(MemoryStore::with_seed_routes());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = CancellationToken::new();
    let server = tokio::spawn(server::serve(listener, hub.clone(), store, SessionConfig::default(), stop.clone()));

    let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    raw.write_all(b"hello\r\n\r\n").await.unwrap();
    drop(raw);

    // A failed handshake never reaches the hub
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.connection_count().await.unwrap(), 0);

    stop.cancel();
    server.await.unwrap();
}
