//! # Trip Progress Fan-out
//!
//! A real-time fan-out service that lets many observers watch simulated bus
//! trips as they progress, and a driver that advances each trip over
//! wall-clock time and publishes the resulting events.
//!
//! ## Features
//!
//! - **Single-owner hub**: one control loop owns the live-connection set; every
//!   register, unregister and broadcast is a request to that loop
//! - **Backpressure**: bounded per-connection queues, slow consumers are evicted
//!   instead of stalling the broadcast
//! - **Dual-loop sessions**: independent inbound and outbound tasks per WebSocket
//! - **Time-stepped trips**: one independent run per trip with duplicate-start
//!   guard, cancellation between steps and retry-once persistence
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tripcast::{Driver, DriverConfig, Hub, HubConfig, MemoryStore, TripStore};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let (hub, _hub_task) = Hub::start(HubConfig::default())?;
//! let store: Arc<dyn TripStore> = Arc::new(MemoryStore::with_seed_routes());
//! let driver = Driver::new(Arc::clone(&store), hub.clone(), DriverConfig::default());
//!
//! driver.start(1).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`store`] - Persistence interface for trips, buses and routes, plus an in-memory store
//! - [`hub`] - Connection registry and fan-out control loop
//! - [`session`] - Per-connection inbound/outbound loops
//! - [`driver`] - Per-trip simulation runs
//! - [`dispatch`] - Trip creation hook that starts the driver
//! - [`server`] - TCP accept loop and WebSocket upgrade
//! - [`protocol`] - Wire envelope and client commands
//! - [`model`] - Trip, bus and route records
//! - [`config`] - Construction-time defaults

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod config;
pub mod dispatch;
pub mod driver;
pub mod hub;
pub mod model;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;

// Re-export main public types for convenience
pub use config::{DriverConfig, HubConfig, ServerConfig, SessionConfig};
pub use dispatch::{DispatchError, TripDispatcher};
pub use driver::{Driver, DriverError, StartOutcome};
pub use hub::{Connection, ConnectionId, Hub, HubError};
pub use model::{Bus, BusStatus, Route, Trip, TripSnapshot, TripStatus};
pub use protocol::{Message, MessageType};
pub use session::{ClientSession, SessionError};
pub use store::{MemoryStore, StoreError, TripStore};
