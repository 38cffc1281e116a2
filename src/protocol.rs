use crate::model::{BusId, TripId, TripSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Welcome,
    SubscribeTrip,
    TripUpdate,
    TripStarted,
    TripProgress,
    TripCompleted,
    TripCancelled,
}

impl MessageType {
    /// Types a client is allowed to send.
    pub fn is_client_command(self) -> bool {
        matches!(self, MessageType::SubscribeTrip)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Welcome => "welcome",
            MessageType::SubscribeTrip => "subscribe_trip",
            MessageType::TripUpdate => "trip_update",
            MessageType::TripStarted => "trip_started",
            MessageType::TripProgress => "trip_progress",
            MessageType::TripCompleted => "trip_completed",
            MessageType::TripCancelled => "trip_cancelled",
        }
    }
}

impl core::fmt::Display for MessageType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope shared by both directions.
///
/// Fields are private: a message is built once and then only read, and the hub
/// shares one instance between every recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trip_id: Option<TripId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bus_id: Option<BusId>,
}

impl Message {
    pub fn new(kind: MessageType, data: Value) -> Self {
        Self {
            kind,
            data,
            trip_id: None,
            bus_id: None,
        }
    }

    pub fn welcome(text: &str) -> Self {
        Self::new(MessageType::Welcome, Value::String(text.to_string()))
    }

    pub fn subscribe_trip(trip_id: TripId) -> Self {
        Self::new(MessageType::SubscribeTrip, Value::from(trip_id))
    }

    /// A trip-carrying event with both correlation ids filled in.
    pub fn trip_event(kind: MessageType, snapshot: &TripSnapshot) -> Result<Self, ProtocolError> {
        let data = serde_json::to_value(snapshot).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            kind,
            data,
            trip_id: Some(snapshot.trip.id),
            bus_id: Some(snapshot.trip.bus_id),
        })
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn trip_id(&self) -> Option<TripId> {
        self.trip_id
    }

    pub fn bus_id(&self) -> Option<BusId> {
        self.bus_id
    }

    /// Decode the trip snapshot carried in `data`.
    pub fn snapshot(&self) -> Result<TripSnapshot, ProtocolError> {
        serde_json::from_value(self.data.clone()).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Commands a client can issue over its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    SubscribeTrip(TripId),
}

impl ClientCommand {
    /// Interpret an inbound message. Server-to-client types echoed back by a
    /// client carry no command and yield `None`.
    pub fn from_message(message: &Message) -> Result<Option<Self>, ProtocolError> {
        match message.kind {
            MessageType::SubscribeTrip => parse_trip_id(&message.data).map(|id| Some(ClientCommand::SubscribeTrip(id))),
            _ => Ok(None),
        }
    }
}

/// Trip identifiers arrive as JSON numbers; integral floats such as `7.0` are
/// accepted since browser clients cannot tell the two apart.
fn parse_trip_id(data: &Value) -> Result<TripId, ProtocolError> {
    if let Some(id) = data.as_u64() {
        return Ok(id);
    }
    match data.as_f64() {
        // 2^64 rounds to exactly u64::MAX as f64 and would saturate
        Some(f) if f >= 0.0 && f.fract() == 0.0 && f < u64::MAX as f64 => Ok(f as u64),
        _ => Err(ProtocolError::InvalidPayload(format!("expected a trip id, got {data}"))),
    }
}

/// Decodes inbound frames with a size cap.
#[derive(Debug, Clone, Copy)]
pub struct MessageDecoder {
    max_bytes: usize,
}

impl MessageDecoder {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn decode_text(&self, text: &str) -> Result<Message, ProtocolError> {
        self.decode_bytes(text.as_bytes())
    }

    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<Message, ProtocolError> {
        if bytes.len() > self.max_bytes {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("serialization failed: {0}")]
    Serialization(String),
}
