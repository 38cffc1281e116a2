pub mod memory;

pub use memory::{MemoryStore, SaveFaultPlan};

use crate::model::{Bus, BusId, BusUpdate, Route, RouteId, Trip, TripId, TripSnapshot};
use async_trait::async_trait;

/// Persistence surface the simulation consumes.
///
/// Implementations only promise per-entity read-then-write. `save_bus` is a
/// field-level merge so that writers touching other bus fields are not lost,
/// and is the one conditional write.
#[async_trait]
pub trait TripStore: Send + Sync {
    async fn load_trip(&self, id: TripId) -> Result<Trip, StoreError>;
    async fn save_trip(&self, trip: &Trip) -> Result<(), StoreError>;
    /// Persist a new trip and return it with its assigned id.
    async fn insert_trip(&self, trip: Trip) -> Result<Trip, StoreError>;
    async fn load_bus(&self, id: BusId) -> Result<Bus, StoreError>;
    /// Merge `update` into the stored bus and return the result.
    ///
    /// When the update carries an expected status, the check and the merge
    /// happen as one step; a mismatch fails with [`StoreError::Conflict`] and
    /// leaves the bus untouched.
    async fn save_bus(&self, id: BusId, update: BusUpdate) -> Result<Bus, StoreError>;
    async fn load_route(&self, id: RouteId) -> Result<Route, StoreError>;
}

/// Load a trip together with its route and bus.
pub async fn load_snapshot(store: &dyn TripStore, trip_id: TripId) -> Result<TripSnapshot, StoreError> {
    let trip = store.load_trip(trip_id).await?;
    let route = store.load_route(trip.route_id).await?;
    let bus = store.load_bus(trip.bus_id).await?;
    Ok(TripSnapshot { trip, route, bus })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Trip,
    Bus,
    Route,
}

impl core::fmt::Display for Entity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Entity::Trip => f.write_str("trip"),
            Entity::Bus => f.write_str("bus"),
            Entity::Route => f.write_str("route"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: Entity, id: u64 },
    #[error("{entity} {id} is {found}, expected {expected}")]
    Conflict {
        entity: Entity,
        id: u64,
        expected: String,
        found: String,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}
