use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TripId = u64;
pub type BusId = u64;
pub type RouteId = u64;

// Defaults for freshly purchased buses
const DEFAULT_BUS_CAPACITY: u32 = 40;
const DEFAULT_FUEL_CAPACITY: f64 = 100.0; // liters
const DEFAULT_POPULARITY: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Planned,
    Active,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Cancelled)
    }

    /// Status only moves forward: Planned -> Active -> Completed, or to
    /// Cancelled from any non-terminal status.
    pub fn can_transition_to(self, next: TripStatus) -> bool {
        matches!(
            (self, next),
            (TripStatus::Planned, TripStatus::Active)
                | (TripStatus::Active, TripStatus::Completed)
                | (TripStatus::Planned | TripStatus::Active, TripStatus::Cancelled)
        )
    }
}

impl core::fmt::Display for TripStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            TripStatus::Planned => "planned",
            TripStatus::Active => "active",
            TripStatus::Completed => "completed",
            TripStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusStatus {
    Available,
    OnTrip,
    Maintenance,
}

impl core::fmt::Display for BusStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            BusStatus::Available => "available",
            BusStatus::OnTrip => "on_trip",
            BusStatus::Maintenance => "maintenance",
        };
        f.write_str(name)
    }
}

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Linear interpolation towards `to`; latitude and longitude move independently.
    pub fn lerp(self, to: GeoPoint, ratio: f64) -> GeoPoint {
        GeoPoint {
            lat: self.lat + (to.lat - self.lat) * ratio,
            lng: self.lng + (to.lng - self.lng) * ratio,
        }
    }
}

/// Fixed route geometry and fare data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub name: String,
    pub origin: String,
    pub destination: String,
    pub origin_lat: f64,
    pub origin_lng: f64,
    pub dest_lat: f64,
    pub dest_lng: f64,
    pub distance: f64, // km
    pub duration: u32, // minutes
    pub popularity: u8, // 1-100
    pub base_fare: f64,
}

impl Route {
    pub fn new(name: &str, origin: GeoPoint, destination: GeoPoint, distance: f64, duration: u32) -> Self {
        let (from, to) = name.split_once(" - ").unwrap_or((name, name));
        Self {
            id: 0,
            name: name.to_string(),
            origin: from.to_string(),
            destination: to.to_string(),
            origin_lat: origin.lat,
            origin_lng: origin.lng,
            dest_lat: destination.lat,
            dest_lng: destination.lng,
            distance,
            duration,
            popularity: DEFAULT_POPULARITY,
            base_fare: 0.0,
        }
    }

    pub fn origin_point(&self) -> GeoPoint {
        GeoPoint::new(self.origin_lat, self.origin_lng)
    }

    pub fn destination_point(&self) -> GeoPoint {
        GeoPoint::new(self.dest_lat, self.dest_lng)
    }

    /// Position after `step` of `steps` evenly spaced steps.
    pub fn position_at(&self, step: u32, steps: u32) -> GeoPoint {
        if steps == 0 {
            return self.destination_point();
        }
        let ratio = f64::from(step) / f64::from(steps);
        self.origin_point().lerp(self.destination_point(), ratio)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    pub id: BusId,
    pub name: String,
    pub capacity: u32,
    pub fuel_capacity: f64,
    pub current_fuel: f64,
    pub operating_cost: f64, // per km
    pub status: BusStatus,
}

impl Bus {
    /// A bus with a full tank, parked and available.
    pub fn new(name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            capacity: DEFAULT_BUS_CAPACITY,
            fuel_capacity: DEFAULT_FUEL_CAPACITY,
            current_fuel: DEFAULT_FUEL_CAPACITY,
            operating_cost: 0.0,
            status: BusStatus::Available,
        }
    }
}

/// Field-level bus update. Only the fields the simulation owns are present,
/// and fuel is expressed as a delta so concurrent writers merge instead of
/// overwriting each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BusUpdate {
    pub fuel_delta: Option<f64>,
    pub status: Option<BusStatus>,
    /// Only apply while the bus is in this status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_status: Option<BusStatus>,
}

impl BusUpdate {
    pub fn status(status: BusStatus) -> Self {
        Self {
            fuel_delta: None,
            status: Some(status),
            expect_status: None,
        }
    }

    pub fn expecting(mut self, status: BusStatus) -> Self {
        self.expect_status = Some(status);
        self
    }

    /// False when the update carries a status precondition `bus` does not meet.
    pub fn applies_to(&self, bus: &Bus) -> bool {
        match self.expect_status {
            Some(expected) => bus.status == expected,
            None => true,
        }
    }

    pub fn with_fuel_delta(mut self, delta: f64) -> Self {
        self.fuel_delta = Some(delta);
        self
    }

    /// Merge into `bus`. Fuel never drops below empty nor rises above capacity.
    pub fn apply(&self, bus: &mut Bus) {
        if let Some(delta) = self.fuel_delta {
            bus.current_fuel = (bus.current_fuel + delta).clamp(0.0, bus.fuel_capacity.max(0.0));
        }
        if let Some(status) = self.status {
            bus.status = status;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    pub bus_id: BusId,
    pub route_id: RouteId,
    pub status: TripStatus,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    pub passengers: u32,
    pub revenue: f64,
    pub cost: f64,
    pub profit: f64,
    pub current_lat: f64,
    pub current_lng: f64,
    pub progress: f64, // percentage 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Trip {
    /// A planned trip parked at the route origin.
    pub fn planned(bus_id: BusId, route: &Route) -> Self {
        Self {
            id: 0,
            bus_id,
            route_id: route.id,
            status: TripStatus::Planned,
            actual_start: None,
            actual_end: None,
            passengers: 0,
            revenue: 0.0,
            cost: 0.0,
            profit: 0.0,
            current_lat: route.origin_lat,
            current_lng: route.origin_lng,
            progress: 0.0,
            error: None,
        }
    }

    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.current_lat, self.current_lng)
    }

    pub fn set_position(&mut self, point: GeoPoint) {
        self.current_lat = point.lat;
        self.current_lng = point.lng;
    }

    /// Move to `next`, refusing anything that is not a forward transition.
    pub fn transition(&mut self, next: TripStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("trip cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: TripStatus,
    pub to: TripStatus,
}

/// A trip with its route and bus embedded; the payload of every
/// trip-carrying message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSnapshot {
    #[serde(flatten)]
    pub trip: Trip,
    pub route: Route,
    pub bus: Bus,
}
