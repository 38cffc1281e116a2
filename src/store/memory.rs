use super::{Entity, StoreError, TripStore};
use crate::model::{Bus, BusId, BusUpdate, GeoPoint, Route, RouteId, Trip, TripId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Scripted save failures: let `skip` trip saves through, then fail the next
/// `fail` of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveFaultPlan {
    pub skip: u32,
    pub fail: u32,
}

impl SaveFaultPlan {
    pub fn fail_after(skip: u32, fail: u32) -> Self {
        Self { skip, fail }
    }

    fn next_save_fails(&mut self) -> bool {
        if self.skip > 0 {
            self.skip -= 1;
            false
        } else if self.fail > 0 {
            self.fail -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    trips: HashMap<TripId, Trip>,
    buses: HashMap<BusId, Bus>,
    routes: HashMap<RouteId, Route>,
    next_id: u64,
    trip_faults: SaveFaultPlan,
    trip_saves: u32,
}

impl Tables {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process store used by the server binary and the tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding the intercity routes of the Java network.
    pub fn with_seed_routes() -> Self {
        let store = Self::new();
        for route in seed_routes() {
            store.insert_route(route);
        }
        store
    }

    pub fn insert_route(&self, mut route: Route) -> Route {
        let mut tables = self.tables.lock();
        route.id = tables.allocate_id();
        tables.routes.insert(route.id, route.clone());
        route
    }

    pub fn insert_bus(&self, mut bus: Bus) -> Bus {
        let mut tables = self.tables.lock();
        bus.id = tables.allocate_id();
        tables.buses.insert(bus.id, bus.clone());
        bus
    }

    pub fn routes(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self.tables.lock().routes.values().cloned().collect();
        routes.sort_by_key(|r| r.id);
        routes
    }

    /// Top up a bus tank the way the maintenance collaborator does; only the
    /// fuel field is touched.
    pub fn refuel(&self, id: BusId, liters: f64) -> Result<Bus, StoreError> {
        let mut tables = self.tables.lock();
        let bus = tables
            .buses
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: Entity::Bus, id })?;
        BusUpdate::default().with_fuel_delta(liters).apply(bus);
        Ok(bus.clone())
    }

    pub fn inject_trip_save_faults(&self, plan: SaveFaultPlan) {
        self.tables.lock().trip_faults = plan;
    }

    /// Number of successful trip saves so far.
    pub fn trip_save_count(&self) -> u32 {
        self.tables.lock().trip_saves
    }
}

#[async_trait]
impl TripStore for MemoryStore {
    async fn load_trip(&self, id: TripId) -> Result<Trip, StoreError> {
        self.tables
            .lock()
            .trips
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: Entity::Trip, id })
    }

    async fn save_trip(&self, trip: &Trip) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if tables.trip_faults.next_save_fails() {
            debug!(trip_id = trip.id, "injected trip save failure");
            return Err(StoreError::Unavailable(format!("injected failure saving trip {}", trip.id)));
        }
        let slot = tables
            .trips
            .get_mut(&trip.id)
            .ok_or(StoreError::NotFound { entity: Entity::Trip, id: trip.id })?;
        *slot = trip.clone();
        tables.trip_saves += 1;
        Ok(())
    }

    async fn insert_trip(&self, mut trip: Trip) -> Result<Trip, StoreError> {
        let mut tables = self.tables.lock();
        trip.id = tables.allocate_id();
        tables.trips.insert(trip.id, trip.clone());
        Ok(trip)
    }

    async fn load_bus(&self, id: BusId) -> Result<Bus, StoreError> {
        self.tables
            .lock()
            .buses
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: Entity::Bus, id })
    }

    async fn save_bus(&self, id: BusId, update: BusUpdate) -> Result<Bus, StoreError> {
        let mut tables = self.tables.lock();
        let bus = tables
            .buses
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: Entity::Bus, id })?;
        if !update.applies_to(bus) {
            return Err(StoreError::Conflict {
                entity: Entity::Bus,
                id,
                expected: update.expect_status.map(|s| s.to_string()).unwrap_or_default(),
                found: bus.status.to_string(),
            });
        }
        update.apply(bus);
        Ok(bus.clone())
    }

    async fn load_route(&self, id: RouteId) -> Result<Route, StoreError> {
        self.tables
            .lock()
            .routes
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: Entity::Route, id })
    }
}

fn seed_routes() -> Vec<Route> {
    let jakarta = GeoPoint::new(-6.2088, 106.8456);
    let bandung = GeoPoint::new(-6.9175, 107.6191);
    let surabaya = GeoPoint::new(-7.2575, 112.7521);
    let yogyakarta = GeoPoint::new(-7.7956, 110.3695);
    let malang = GeoPoint::new(-7.9797, 112.6304);
    let surakarta = GeoPoint::new(-7.5760, 110.8295);

    // (name, from, to, km, minutes, popularity, fare in IDR)
    let table = [
        ("Jakarta - Bandung", jakarta, bandung, 150.0, 180, 80, 50_000.0),
        ("Jakarta - Surabaya", jakarta, surabaya, 785.0, 660, 90, 250_000.0),
        ("Bandung - Yogyakarta", bandung, yogyakarta, 400.0, 360, 70, 120_000.0),
        ("Surabaya - Malang", surabaya, malang, 90.0, 120, 85, 35_000.0),
        ("Yogyakarta - Surakarta", yogyakarta, surakarta, 60.0, 90, 75, 25_000.0),
    ];

    table
        .into_iter()
        .map(|(name, from, to, distance, duration, popularity, fare)| {
            let mut route = Route::new(name, from, to, distance, duration);
            route.popularity = popularity;
            route.base_fare = fare;
            route
        })
        .collect()
}
