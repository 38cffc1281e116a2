//! Per-trip simulation runs.
//!
//! Each started trip gets one task that walks it from `planned` through
//! `steps` evenly spaced positions to `completed`, saving and broadcasting
//! every step. A trip id can own at most one run at a time; the slot is held by
//! a guard that releases it however the run ends.

use crate::config::DriverConfig;
use crate::hub::Hub;
use crate::model::{Bus, BusStatus, BusUpdate, Route, Trip, TripId, TripSnapshot, TripStatus};
use crate::protocol::{Message, MessageType};
use crate::store::{StoreError, TripStore};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("cannot start trip: {0}")]
    NotFound(#[source] StoreError),
    #[error("persistence failed: {0}")]
    Persistence(#[source] StoreError),
    #[error("trip {trip_id} is already {status}")]
    Finished { trip_id: TripId, status: TripStatus },
    #[error("driver is shutting down")]
    ShuttingDown,
}

impl DriverError {
    fn from_load(e: StoreError) -> Self {
        if e.is_not_found() {
            DriverError::NotFound(e)
        } else {
            DriverError::Persistence(e)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A run for this trip is already in progress; nothing was done.
    AlreadyRunning,
}

type RunTable = Arc<Mutex<HashMap<TripId, RunHandle>>>;

struct RunHandle {
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

/// Holds a trip's run slot. Dropping it frees the slot and wakes anyone
/// waiting for the run to end.
struct RunSlot {
    trip_id: TripId,
    runs: RunTable,
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.runs.lock().remove(&self.trip_id);
        self.finished.send_replace(true);
    }
}

struct DriverInner {
    store: Arc<dyn TripStore>,
    hub: Hub,
    config: DriverConfig,
    runs: RunTable,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Starts, cancels and drains trip runs.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

impl Driver {
    pub fn new(store: Arc<dyn TripStore>, hub: Hub, config: DriverConfig) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                store,
                hub,
                config,
                runs: Arc::new(Mutex::new(HashMap::new())),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    /// Load the trip, its route and bus, then run it in the background.
    ///
    /// Calling this while a run for `trip_id` is active is a no-op. Missing
    /// records fail with [`DriverError::NotFound`] before anything is written.
    #[instrument(skip(self))]
    pub async fn start(&self, trip_id: TripId) -> Result<StartOutcome, DriverError> {
        // Held until the run is spawned, so `shutdown` also waits for starts in flight
        let _in_flight = self.inner.tracker.token();
        if self.inner.shutdown.is_cancelled() {
            return Err(DriverError::ShuttingDown);
        }
        let Some(slot) = self.claim(trip_id) else {
            debug!("run already active, ignoring start");
            return Ok(StartOutcome::AlreadyRunning);
        };

        // Any early return drops the slot and frees it again
        let state = self.load(trip_id).await?;
        if self.inner.shutdown.is_cancelled() {
            return Err(DriverError::ShuttingDown);
        }
        if state.trip.status.is_terminal() {
            return Err(DriverError::Finished {
                trip_id,
                status: state.trip.status,
            });
        }

        let run = TripRun {
            inner: Arc::clone(&self.inner),
            state,
            slot,
        };
        self.inner
            .tracker
            .spawn(run.execute().instrument(info_span!("trip_run", trip_id)));
        Ok(StartOutcome::Started)
    }

    /// Stop a run between steps and wait until it has saved its final state.
    /// Returns `false` when no run was active for `trip_id`.
    pub async fn cancel(&self, trip_id: TripId) -> bool {
        let handle = {
            let runs = self.inner.runs.lock();
            runs.get(&trip_id).map(|h| (h.cancel.clone(), h.finished.clone()))
        };
        let Some((cancel, mut finished)) = handle else {
            return false;
        };
        info!(trip_id, "cancelling trip run");
        cancel.cancel();
        // An error means the slot is already gone, which is just as final
        let _ = finished.wait_for(|done| *done).await;
        true
    }

    pub fn is_running(&self, trip_id: TripId) -> bool {
        self.inner.runs.lock().contains_key(&trip_id)
    }

    pub fn active_runs(&self) -> usize {
        self.inner.runs.lock().len()
    }

    /// Cancel every run, then wait for all of them to persist and exit.
    /// Starts still loading when this is called are refused, as are later
    /// calls to [`Driver::start`].
    pub async fn shutdown(&self) {
        info!(active_runs = self.active_runs(), "driver shutting down");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    fn claim(&self, trip_id: TripId) -> Option<RunSlot> {
        let mut runs = self.inner.runs.lock();
        if runs.contains_key(&trip_id) {
            return None;
        }
        let cancel = self.inner.shutdown.child_token();
        let (finished_tx, finished_rx) = watch::channel(false);
        runs.insert(
            trip_id,
            RunHandle {
                cancel: cancel.clone(),
                finished: finished_rx,
            },
        );
        Some(RunSlot {
            trip_id,
            runs: Arc::clone(&self.inner.runs),
            cancel,
            finished: finished_tx,
        })
    }

    async fn load(&self, trip_id: TripId) -> Result<TripRunState, DriverError> {
        let store = self.inner.store.as_ref();
        let trip = store.load_trip(trip_id).await.map_err(DriverError::from_load)?;
        let route = store.load_route(trip.route_id).await.map_err(DriverError::from_load)?;
        let bus = store.load_bus(trip.bus_id).await.map_err(DriverError::from_load)?;
        Ok(TripRunState { trip, route, bus })
    }
}

/// The run's working copy of a trip and the records it references.
#[derive(Debug, Clone)]
struct TripRunState {
    trip: Trip,
    route: Route,
    bus: Bus,
}

impl TripRunState {
    fn snapshot(&self) -> TripSnapshot {
        TripSnapshot {
            trip: self.trip.clone(),
            route: self.route.clone(),
            bus: self.bus.clone(),
        }
    }

    /// Position and progress after `step` of `steps`.
    fn advance(&mut self, step: u32, steps: u32) {
        let ratio = f64::from(step) / f64::from(steps);
        self.trip.set_position(self.route.position_at(step, steps));
        self.trip.progress = ratio * 100.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Completed,
    Cancelled,
}

struct TripRun {
    inner: Arc<DriverInner>,
    state: TripRunState,
    slot: RunSlot,
}

impl TripRun {
    async fn execute(mut self) {
        match self.drive().await {
            Ok(RunEnd::Completed) => {
                info!(bus_fuel = self.state.bus.current_fuel, "trip completed");
            }
            Ok(RunEnd::Cancelled) => {
                info!(progress = self.state.trip.progress, "trip cancelled");
                self.finish_cancelled(None).await;
            }
            Err(e) => {
                error!(progress = self.state.trip.progress, error = %e, "trip run aborted");
                self.finish_cancelled(Some(e.to_string())).await;
            }
        }
        // Dropping `self` releases the run slot
    }

    async fn drive(&mut self) -> Result<RunEnd, DriverError> {
        if self.slot.cancel.is_cancelled() {
            return Ok(RunEnd::Cancelled);
        }

        let steps = self.inner.config.effective_steps();
        let first_step = next_step(self.state.trip.progress, steps);
        if self.state.trip.status == TripStatus::Planned {
            self.activate();
        } else {
            info!(first_step, "resuming active trip");
        }
        self.persist_trip().await?;
        self.publish(MessageType::TripStarted).await;

        let interval = self.inner.config.step_interval(self.state.route.duration);
        debug!(?interval, steps, "trip started");
        for step in first_step..=steps {
            if !self.pause(interval).await {
                return Ok(RunEnd::Cancelled);
            }
            self.state.advance(step, steps);
            self.persist_trip().await?;
            debug!(step, progress = self.state.trip.progress, "trip progress");
            self.publish(MessageType::TripProgress).await;
        }

        self.complete().await?;
        Ok(RunEnd::Completed)
    }

    fn activate(&mut self) {
        if let Err(e) = self.state.trip.transition(TripStatus::Active) {
            warn!(error = %e, "unexpected status on start");
        }
        self.state.trip.actual_start = Some(Utc::now());
    }

    /// Sleep between steps. Returns `false` if the run was cancelled meanwhile.
    async fn pause(&self, interval: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.slot.cancel.cancelled() => false,
            () = tokio::time::sleep(interval) => true,
        }
    }

    async fn complete(&mut self) -> Result<(), DriverError> {
        // Commit to the working copy only once the completed record is saved
        let mut finished = self.state.trip.clone();
        if let Err(e) = finished.transition(TripStatus::Completed) {
            warn!(error = %e, "unexpected status on completion");
        }
        finished.actual_end = Some(Utc::now());
        finished.progress = 100.0;
        // Exact destination rather than the last interpolated point
        finished.set_position(self.state.route.destination_point());
        self.save_trip(&finished).await?;
        self.state.trip = finished;

        let fuel = self.inner.config.fuel_for(self.state.route.distance);
        let update = BusUpdate::status(BusStatus::Available).with_fuel_delta(-fuel);
        match self.persist_bus(update).await {
            Ok(bus) => self.state.bus = bus,
            Err(e) => {
                error!(bus_id = self.state.bus.id, error = %e, "bus update after completion lost");
                self.state.trip.error = Some(format!("bus update failed: {e}"));
                if let Err(e) = self.persist_trip().await {
                    error!(error = %e, "could not annotate completed trip");
                }
            }
        }
        self.publish(MessageType::TripCompleted).await;
        Ok(())
    }

    /// Mark the trip cancelled at its last computed progress, free the bus and
    /// tell observers. Every store call here is best effort.
    async fn finish_cancelled(&mut self, reason: Option<String>) {
        if let Err(e) = self.state.trip.transition(TripStatus::Cancelled) {
            warn!(error = %e, "trip not cancellable");
            return;
        }
        self.state.trip.error = reason;
        if let Err(e) = self.persist_trip().await {
            error!(error = %e, "could not persist cancelled trip");
        }
        match self.persist_bus(BusUpdate::status(BusStatus::Available)).await {
            Ok(bus) => self.state.bus = bus,
            Err(e) => error!(bus_id = self.state.bus.id, error = %e, "could not release bus"),
        }
        self.publish(MessageType::TripCancelled).await;
    }

    async fn persist_trip(&self) -> Result<(), DriverError> {
        self.save_trip(&self.state.trip).await
    }

    async fn save_trip(&self, trip: &Trip) -> Result<(), DriverError> {
        let store = self.inner.store.as_ref();
        retry_once(self.inner.config.persist_retry_delay, || store.save_trip(trip))
            .await
            .map_err(DriverError::Persistence)
    }

    async fn persist_bus(&self, update: BusUpdate) -> Result<Bus, DriverError> {
        let store = self.inner.store.as_ref();
        let bus_id = self.state.bus.id;
        retry_once(self.inner.config.persist_retry_delay, || store.save_bus(bus_id, update))
            .await
            .map_err(DriverError::Persistence)
    }

    async fn publish(&self, kind: MessageType) {
        match Message::trip_event(kind, &self.state.snapshot()) {
            Ok(message) => self.inner.hub.broadcast(message).await,
            Err(e) => error!(%kind, error = %e, "failed to encode trip event"),
        }
    }
}

/// Run `op`, and once more after `delay` if it fails.
async fn retry_once<T, F, Fut>(delay: Duration, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!(error = %e, "store write failed, retrying once");
            tokio::time::sleep(delay).await;
            op().await
        }
    }
}

/// First step still to run for a trip at `progress` percent.
fn next_step(progress: f64, steps: u32) -> u32 {
    let done = (progress / 100.0 * f64::from(steps) + 1e-9).floor().max(0.0) as u32;
    done.min(steps) + 1
}
