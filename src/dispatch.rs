use crate::driver::{Driver, DriverError};
use crate::model::{Bus, BusId, BusStatus, BusUpdate, Route, RouteId, Trip};
use crate::store::{StoreError, TripStore};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("bus {0} is not available")]
    BusUnavailable(BusId),
    #[error("bus {bus_id} has {available:.1} L of fuel, route needs {required:.1} L")]
    InsufficientFuel { bus_id: BusId, available: f64, required: f64 },
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Fare and cost figures for one trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripEconomics {
    pub passengers: u32,
    pub revenue: f64,
    pub cost: f64,
    pub profit: f64,
}

impl TripEconomics {
    /// Seats filled in proportion to route popularity, fares per passenger,
    /// cost per kilometer.
    pub fn estimate(bus: &Bus, route: &Route) -> Self {
        let passengers = (f64::from(bus.capacity) * f64::from(route.popularity) / 100.0).floor() as u32;
        let revenue = f64::from(passengers) * route.base_fare;
        let cost = route.distance * bus.operating_cost;
        Self {
            passengers,
            revenue,
            cost,
            profit: revenue - cost,
        }
    }
}

/// Creates trip records and hands them to the driver.
#[derive(Clone)]
pub struct TripDispatcher {
    store: Arc<dyn TripStore>,
    driver: Driver,
}

impl TripDispatcher {
    pub fn new(store: Arc<dyn TripStore>, driver: Driver) -> Self {
        Self { store, driver }
    }

    /// Check the bus can make the trip, reserve it, record a planned trip and
    /// start the simulation. The bus is released again if a later step fails.
    pub async fn create_trip(&self, bus_id: BusId, route_id: RouteId) -> Result<Trip, DispatchError> {
        let bus = self.store.load_bus(bus_id).await?;
        if bus.status != BusStatus::Available {
            return Err(DispatchError::BusUnavailable(bus_id));
        }
        let route = self.store.load_route(route_id).await?;

        let required = self.driver.config().fuel_for(route.distance);
        if bus.current_fuel < required {
            return Err(DispatchError::InsufficientFuel {
                bus_id,
                available: bus.current_fuel,
                required,
            });
        }

        let economics = TripEconomics::estimate(&bus, &route);
        let mut trip = Trip::planned(bus_id, &route);
        trip.passengers = economics.passengers;
        trip.revenue = economics.revenue;
        trip.cost = economics.cost;
        trip.profit = economics.profit;

        // Another dispatch may have taken the bus since it was loaded
        let reserve = BusUpdate::status(BusStatus::OnTrip).expecting(BusStatus::Available);
        match self.store.save_bus(bus_id, reserve).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return Err(DispatchError::BusUnavailable(bus_id)),
            Err(e) => return Err(e.into()),
        }

        let trip = match self.store.insert_trip(trip).await {
            Ok(trip) => trip,
            Err(e) => {
                self.release_bus(bus_id).await;
                return Err(e.into());
            }
        };
        info!(
            trip_id = trip.id,
            bus_id,
            route = %route.name,
            passengers = trip.passengers,
            "trip dispatched"
        );

        if let Err(e) = self.driver.start(trip.id).await {
            warn!(trip_id = trip.id, error = %e, "driver refused trip, releasing bus");
            self.release_bus(bus_id).await;
            return Err(e.into());
        }
        Ok(trip)
    }

    async fn release_bus(&self, bus_id: BusId) {
        let release = BusUpdate::status(BusStatus::Available).expecting(BusStatus::OnTrip);
        if let Err(e) = self.store.save_bus(bus_id, release).await {
            warn!(bus_id, error = %e, "could not release bus");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GeoPoint;

    #[test]
    fn test_economics_follow_popularity_and_fare() {
        let mut bus = Bus::new("Coach");
        bus.operating_cost = 5_000.0;
        let mut route = Route::new("A - B", GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 1.0), 60.0, 90);
        route.popularity = 75;
        route.base_fare = 25_000.0;

        let economics = TripEconomics::estimate(&bus, &route);
        assert_eq!(economics.passengers, 30);
        assert!((economics.revenue - 750_000.0).abs() < 1e-6);
        assert!((economics.cost - 300_000.0).abs() < 1e-6);
        assert!((economics.profit - 450_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_passengers_round_down() {
        let bus = Bus::new("Coach");
        let mut route = Route::new("A - B", GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 1.0), 10.0, 10);
        route.popularity = 33;
        assert_eq!(TripEconomics::estimate(&bus, &route).passengers, 13);
    }
}
