use serde_json::json;
use tokio::sync::mpsc;
use tripcast::hub::HubStats;
use tripcast::*;

fn numbered(n: u64) -> Message {
    Message::new(MessageType::TripProgress, json!(n))
}

#[tokio::test]
async fn test_register_and_unregister_update_registry() {
    let (hub, task) = Hub::start(HubConfig::default()).unwrap();
    let (a, _a_rx) = Connection::channel(8);
    let (b, _b_rx) = Connection::channel(8);
    let (a_id, b_id) = (a.id(), b.id());

    hub.register(a).await;
    hub.register(b).await;
    let mut expected = vec![a_id, b_id];
    expected.sort();
    assert_eq!(hub.connection_ids().await.unwrap(), expected);

    hub.unregister(a_id).await;
    // Unregistering twice is harmless
    hub.unregister(a_id).await;
    assert_eq!(hub.connection_ids().await.unwrap(), vec![b_id]);

    hub.shutdown().await;
    let stats = task.await.unwrap();
    assert_eq!(stats.registered, 2);
    assert_eq!(stats.unregistered, 1);
}

#[tokio::test]
async fn test_unregistered_connection_gets_nothing_more() {
    let (hub, _task) = Hub::start(HubConfig::default()).unwrap();
    let (conn, mut rx) = Connection::channel(8);
    let id = conn.id();

    hub.register(conn).await;
    hub.broadcast(numbered(1)).await;
    hub.unregister(id).await;
    hub.broadcast(numbered(2)).await;
    assert_eq!(hub.connection_count().await.unwrap(), 0);

    assert_eq!(rx.recv().await.unwrap().data(), &json!(1));
    // Queue closes once the hub drops its sender
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_broadcast_reaches_exactly_registered_connections() {
    let (hub, _task) = Hub::start(HubConfig::default()).unwrap();
    let (early, mut early_rx) = Connection::channel(8);
    let (late, mut late_rx) = Connection::channel(8);

    hub.register(early).await;
    hub.broadcast(numbered(1)).await;
    hub.register(late).await;
    hub.broadcast(numbered(2)).await;
    // Round trip through the loop so both broadcasts have been applied
    assert_eq!(hub.connection_count().await.unwrap(), 2);

    assert_eq!(early_rx.try_recv().unwrap().data(), &json!(1));
    assert_eq!(early_rx.try_recv().unwrap().data(), &json!(2));
    assert!(matches!(early_rx.try_recv(), Err(mpsc::error::TryRecvError::Empty)));

    // Joined after the first broadcast, so only sees the second
    assert_eq!(late_rx.try_recv().unwrap().data(), &json!(2));
    assert!(matches!(late_rx.try_recv(), Err(mpsc::error::TryRecvError::Empty)));
}

#[tokio::test]
async fn test_broadcast_preserves_order_per_connection() {
    let (hub, _task) = Hub::start(HubConfig::default()).unwrap();
    let (conn, mut rx) = Connection::channel(64);
    hub.register(conn).await;

    for n in 0..50 {
        hub.broadcast(numbered(n)).await;
    }
    hub.connection_count().await.unwrap();

    for n in 0..50 {
        assert_eq!(rx.try_recv().unwrap().data(), &json!(n));
    }
}

#[tokio::test]
async fn test_slow_consumer_evicted_without_stalling_others() {
    let (hub, task) = Hub::start(HubConfig::default()).unwrap();
    let (slow, mut slow_rx) = Connection::channel(2);
    let (fast, mut fast_rx) = Connection::channel(32);
    let fast_id = fast.id();
    hub.register(slow).await;
    hub.register(fast).await;

    for n in 0..10 {
        hub.broadcast(numbered(n)).await;
    }
    assert_eq!(hub.connection_ids().await.unwrap(), vec![fast_id]);

    // The evicted queue drains what it held, then reports closed
    assert_eq!(slow_rx.recv().await.unwrap().data(), &json!(0));
    assert_eq!(slow_rx.recv().await.unwrap().data(), &json!(1));
    assert!(slow_rx.recv().await.is_none());

    for n in 0..10 {
        assert_eq!(fast_rx.recv().await.unwrap().data(), &json!(n));
    }

    hub.shutdown().await;
    let stats = task.await.unwrap();
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.broadcasts, 10);
}

#[tokio::test]
async fn test_send_to_targets_one_connection() {
    let (hub, _task) = Hub::start(HubConfig::default()).unwrap();
    let (a, mut a_rx) = Connection::channel(8);
    let (b, mut b_rx) = Connection::channel(8);
    let a_id = a.id();
    hub.register(a).await;
    hub.register(b).await;

    hub.send_to(a_id, Message::welcome("hello")).await;
    // Unknown targets are ignored
    hub.send_to(ConnectionId::next(), numbered(9)).await;
    assert_eq!(hub.connection_count().await.unwrap(), 2);

    assert_eq!(a_rx.try_recv().unwrap().kind(), MessageType::Welcome);
    assert!(b_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_shutdown_closes_all_queues() {
    let (hub, task) = Hub::start(HubConfig::default()).unwrap();
    let (conn, mut rx) = Connection::channel(8);
    hub.register(conn).await;

    hub.shutdown().await;
    let stats: HubStats = task.await.unwrap();
    assert_eq!(stats.registered, 1);
    assert!(rx.recv().await.is_none());

    // Requests after shutdown are dropped, queries report the closed loop
    hub.broadcast(numbered(1)).await;
    assert!(hub.is_closed());
    assert_eq!(hub.connection_count().await, Err(HubError::Closed));
}

#[tokio::test]
async fn test_concurrent_registrations_all_land() {
    let (hub, _task) = Hub::start(HubConfig::default()).unwrap();
    let mut receivers = Vec::new();
    let mut joins = Vec::new();
    for _ in 0..20 {
        let (conn, rx) = Connection::channel(4);
        receivers.push(rx);
        let hub = hub.clone();
        joins.push(tokio::spawn(async move { hub.register(conn).await }));
    }
    for join in joins {
        join.await.unwrap();
    }
    assert_eq!(hub.connection_count().await.unwrap(), 20);

    hub.broadcast(numbered(7)).await;
    hub.connection_count().await.unwrap();
    for rx in &mut receivers {
        assert_eq!(rx.try_recv().unwrap().data(), &json!(7));
    }
}
