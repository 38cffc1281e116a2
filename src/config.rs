use serde::{Deserialize, Serialize};
use std::time::Duration;

// Hub control loop request queue
const HUB_COMMAND_QUEUE_SIZE: usize = 1024;

// Per-connection outbound queue, kept small so a stalled peer is evicted quickly
const OUTBOUND_QUEUE_SIZE: usize = 256;
const WRITE_TIMEOUT_MS: u64 = 10_000;
const MAX_INBOUND_MESSAGE_BYTES: usize = 4096;
const WELCOME_TEXT: &str = "Connected to trip progress updates";

// Simulation defaults
const SIMULATION_STEPS: u32 = 10;
const ROUTE_MINUTE_MS: u64 = 1000; // One route minute plays out in one wall-clock second
const FUEL_PER_KM: f64 = 0.1; // 1 liter per 10 km
const PERSIST_RETRY_DELAY_MS: u64 = 250;

const BIND_HOST: &str = "127.0.0.1";
const BIND_PORT: u16 = 8080;

/// Hub control loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub command_queue_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_queue_size: HUB_COMMAND_QUEUE_SIZE,
        }
    }
}

/// Per-connection session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub outbound_queue_size: usize,
    #[serde(with = "millis")]
    pub write_timeout: Duration,
    pub max_inbound_bytes: usize,
    pub welcome_text: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_queue_size: OUTBOUND_QUEUE_SIZE,
            write_timeout: Duration::from_millis(WRITE_TIMEOUT_MS),
            max_inbound_bytes: MAX_INBOUND_MESSAGE_BYTES,
            welcome_text: WELCOME_TEXT.to_string(),
        }
    }
}

/// Simulation driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Number of progress steps per trip.
    pub steps: u32,
    /// Wall-clock length of one route minute.
    #[serde(with = "millis")]
    pub route_minute: Duration,
    /// Fuel consumed per route kilometer.
    pub fuel_per_km: f64,
    /// Pause before the single retry of a failed save.
    #[serde(with = "millis")]
    pub persist_retry_delay: Duration,
}

impl DriverConfig {
    /// Wall-clock pause between two steps of a route lasting `duration_minutes`.
    pub fn step_interval(&self, duration_minutes: u32) -> Duration {
        self.route_minute * duration_minutes / self.effective_steps()
    }

    /// A trip always takes at least one step.
    pub fn effective_steps(&self) -> u32 {
        self.steps.max(1)
    }

    /// Fuel a trip over `distance_km` burns.
    pub fn fuel_for(&self, distance_km: f64) -> f64 {
        distance_km * self.fuel_per_km
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            steps: SIMULATION_STEPS,
            route_minute: Duration::from_millis(ROUTE_MINUTE_MS),
            fuel_per_km: FUEL_PER_KM,
            persist_retry_delay: Duration::from_millis(PERSIST_RETRY_DELAY_MS),
        }
    }
}

/// Everything the server binary needs to come up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: BindConfig,
    pub hub: HubConfig,
    pub session: SessionConfig,
    pub driver: DriverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    pub host: String,
    pub port: u16,
}

impl BindConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: BIND_HOST.to_string(),
            port: BIND_PORT,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
