use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tripcast::model::{BusId, BusUpdate, RouteId, TripId};
use tripcast::store::StoreError;
use tripcast::*;

fn setup() -> (Hub, Arc<MemoryStore>, Driver, TripDispatcher) {
    let (hub, _task) = Hub::start(HubConfig::default()).unwrap();
    let store = Arc::new(MemoryStore::with_seed_routes());
    let driver = Driver::new(store.clone(), hub.clone(), DriverConfig::default());
    let dispatcher = TripDispatcher::new(store.clone(), driver.clone());
    (hub, store, driver, dispatcher)
}

fn route_named(store: &MemoryStore, name: &str) -> Route {
    store.routes().into_iter().find(|r| r.name == name).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_create_trip_reserves_bus_and_starts_run() {
    let (hub, store, driver, dispatcher) = setup();
    let route = route_named(&store, "Surabaya - Malang");
    let mut bus = Bus::new("Coach 3");
    bus.operating_cost = 4_000.0;
    let bus = store.insert_bus(bus);

    let (watcher, mut events) = Connection::channel(64);
    hub.register(watcher).await;

    let trip = dispatcher.create_trip(bus.id, route.id).await.unwrap();
    assert_eq!(trip.status, TripStatus::Planned);
    assert_eq!(trip.route_id, route.id);
    // 40 seats at 85% popularity
    assert_eq!(trip.passengers, 34);
    assert!((trip.revenue - 34.0 * 35_000.0).abs() < 1e-6);
    assert!((trip.cost - 90.0 * 4_000.0).abs() < 1e-6);
    assert!((trip.profit - (trip.revenue - trip.cost)).abs() < 1e-6);

    assert!(driver.is_running(trip.id));
    assert_eq!(store.load_bus(bus.id).await.unwrap().status, BusStatus::OnTrip);

    let first = events.recv().await.unwrap();
    assert_eq!(first.kind(), MessageType::TripStarted);
    assert_eq!(first.trip_id(), Some(trip.id));

    driver.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_completed_trip_frees_bus_and_burns_fuel() {
    let (hub, store, driver, dispatcher) = setup();
    let route = route_named(&store, "Jakarta - Bandung");
    let bus = store.insert_bus(Bus::new("Coach 4"));
    let (watcher, mut events) = Connection::channel(64);
    hub.register(watcher).await;

    let trip = dispatcher.create_trip(bus.id, route.id).await.unwrap();
    while let Some(event) = events.recv().await {
        if event.kind() == MessageType::TripCompleted {
            break;
        }
    }

    let bus = store.load_bus(bus.id).await.unwrap();
    assert_eq!(bus.status, BusStatus::Available);
    assert!((bus.current_fuel - 85.0).abs() < 1e-9);
    assert_eq!(store.load_trip(trip.id).await.unwrap().status, TripStatus::Completed);
    driver.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_busy_bus_is_refused() {
    let (_hub, store, driver, dispatcher) = setup();
    let route = route_named(&store, "Surabaya - Malang");
    let bus = store.insert_bus(Bus::new("Coach 5"));

    dispatcher.create_trip(bus.id, route.id).await.unwrap();
    let err = dispatcher.create_trip(bus.id, route.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::BusUnavailable(id) if id == bus.id));

    driver.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_bus_in_maintenance_is_refused() {
    let (_hub, store, _driver, dispatcher) = setup();
    let route = route_named(&store, "Surabaya - Malang");
    let bus = store.insert_bus(Bus::new("Coach 6"));
    store
        .save_bus(bus.id, BusUpdate::status(BusStatus::Maintenance))
        .await
        .unwrap();

    let err = dispatcher.create_trip(bus.id, route.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::BusUnavailable(_)));
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_fuel_is_refused() {
    let (_hub, store, _driver, dispatcher) = setup();
    // 785 km needs 78.5 L
    let route = route_named(&store, "Jakarta - Surabaya");
    let bus = store.insert_bus(Bus::new("Coach 9"));
    store
        .save_bus(bus.id, BusUpdate::default().with_fuel_delta(-30.0))
        .await
        .unwrap();

    let err = dispatcher.create_trip(bus.id, route.id).await.unwrap_err();
    match err {
        DispatchError::InsufficientFuel {
            available, required, ..
        } => {
            assert!((available - 70.0).abs() < 1e-9);
            assert!((required - 78.5).abs() < 1e-9);
        }
        other => panic!("unexpected error: {other}"),
    }
    // Nothing was reserved
    assert_eq!(store.load_bus(bus.id).await.unwrap().status, BusStatus::Available);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_route_or_bus_is_not_found() {
    let (_hub, store, _driver, dispatcher) = setup();
    let bus = store.insert_bus(Bus::new("Coach 10"));
    let route = route_named(&store, "Surabaya - Malang");

    let err = dispatcher.create_trip(bus.id, 777).await.unwrap_err();
    assert!(matches!(err, DispatchError::Store(StoreError::NotFound { .. })));
    assert_eq!(store.load_bus(bus.id).await.unwrap().status, BusStatus::Available);

    let err = dispatcher.create_trip(888, route.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::Store(ref e) if e.is_not_found()));
}

#[tokio::test(start_paused = true)]
async fn test_refused_start_releases_bus() {
    let (_hub, store, driver, dispatcher) = setup();
    let route = route_named(&store, "Surabaya - Malang");
    let bus = store.insert_bus(Bus::new("Coach 11"));
    driver.shutdown().await;

    let err = dispatcher.create_trip(bus.id, route.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::Driver(DriverError::ShuttingDown)));
    assert_eq!(store.load_bus(bus.id).await.unwrap().status, BusStatus::Available);
}

/// Holds every bus read for `delay`, so concurrent dispatches all see the
/// bus before any of them reserves it.
struct SlowBusReads {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

#[async_trait]
impl TripStore for SlowBusReads {
    async fn load_trip(&self, id: TripId) -> Result<Trip, StoreError> {
        self.inner.load_trip(id).await
    }

    async fn save_trip(&self, trip: &Trip) -> Result<(), StoreError> {
        self.inner.save_trip(trip).await
    }

    async fn insert_trip(&self, trip: Trip) -> Result<Trip, StoreError> {
        self.inner.insert_trip(trip).await
    }

    async fn load_bus(&self, id: BusId) -> Result<Bus, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.load_bus(id).await
    }

    async fn save_bus(&self, id: BusId, update: BusUpdate) -> Result<Bus, StoreError> {
        self.inner.save_bus(id, update).await
    }

    async fn load_route(&self, id: RouteId) -> Result<Route, StoreError> {
        self.inner.load_route(id).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_dispatch_reserves_bus_once() {
    let (hub, _hub_task) = Hub::start(HubConfig::default()).unwrap();
    let memory = Arc::new(MemoryStore::with_seed_routes());
    let route = route_named(&memory, "Surabaya - Malang");
    let bus = memory.insert_bus(Bus::new("Coach 12"));
    let store = Arc::new(SlowBusReads {
        inner: memory.clone(),
        delay: Duration::from_millis(10),
    });
    let driver = Driver::new(store.clone(), hub, DriverConfig::default());
    let dispatcher = TripDispatcher::new(store, driver.clone());

    let first = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.create_trip(bus.id, route.id).await }
    });
    let second = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.create_trip(bus.id, route.id).await }
    });
    let results = [first.await.unwrap(), second.await.unwrap()];

    let won: Vec<&Trip> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(won.len(), 1, "bus reserved twice: {results:?}");
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(DispatchError::BusUnavailable(id)) if *id == bus.id)));

    // Only the winner holds the bus and a run
    assert_eq!(driver.active_runs(), 1);
    assert!(driver.is_running(won[0].id));
    assert_eq!(memory.load_bus(bus.id).await.unwrap().status, BusStatus::OnTrip);

    driver.shutdown().await;
    assert_eq!(memory.load_bus(bus.id).await.unwrap().status, BusStatus::Available);
}
