use crate::config::SessionConfig;
use crate::hub::{Connection, ConnectionId, Hub, Outbound};
use crate::model::TripId;
use crate::protocol::{ClientCommand, Message, MessageDecoder, MessageType, ProtocolError};
use crate::store::{self, TripStore};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connection(#[from] tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("outbound task failed: {0}")]
    Task(String),
}

/// Bridges one upgraded WebSocket to the hub.
///
/// Runs an inbound loop (client commands) and an outbound loop (queued
/// messages) as independent tasks. The hub holds the only sender of the
/// outbound queue, so an eviction closes it; whichever loop ends first stops
/// the other, and the session is unregistered on every exit path.
pub struct ClientSession {
    id: ConnectionId,
    hub: Hub,
    store: Arc<dyn TripStore>,
    config: SessionConfig,
}

impl ClientSession {
    pub fn new(hub: Hub, store: Arc<dyn TripStore>, config: SessionConfig) -> Self {
        Self {
            id: ConnectionId::next(),
            hub,
            store,
            config,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[instrument(skip_all, fields(conn_id = %self.id))]
    pub async fn run<S>(self, ws: WebSocketStream<S>) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (queue_tx, queue_rx) = mpsc::channel(self.config.outbound_queue_size.max(1));

        self.hub.register(Connection::new(self.id, queue_tx)).await;
        self.hub.send_to(self.id, Message::welcome(&self.config.welcome_text)).await;

        let stop = CancellationToken::new();
        let outbound = tokio::spawn(outbound_loop(sink, queue_rx, self.config.write_timeout, stop.clone()));

        let inbound_result = self.inbound_loop(stream, &stop).await;

        // Closes the outbound queue, which lets the outbound loop drain and send a close frame
        self.hub.unregister(self.id).await;

        let outbound_result = match outbound.await {
            Ok(result) => result,
            Err(e) => Err(SessionError::Task(e.to_string())),
        };

        match (&inbound_result, &outbound_result) {
            (Ok(()), Ok(())) => info!("session closed"),
            (Err(e), _) | (_, Err(e)) => warn!(error = %e, "session closed with error"),
        }
        inbound_result.and(outbound_result)
    }

    async fn inbound_loop<S>(
        &self,
        mut stream: SplitStream<WebSocketStream<S>>,
        stop: &CancellationToken,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let decoder = MessageDecoder::new(self.config.max_inbound_bytes);
        loop {
            let frame = tokio::select! {
                biased;
                () = stop.cancelled() => return Ok(()),
                frame = stream.next() => frame,
            };

            let message = match frame {
                None => return Ok(()),
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(WsMessage::Text(text))) => decoder.decode_text(text.as_str())?,
                Some(Ok(WsMessage::Binary(bytes))) => decoder.decode_bytes(&bytes)?,
                Some(Ok(WsMessage::Close(_))) => {
                    debug!("client sent close frame");
                    return Ok(());
                }
                Some(Ok(_)) => continue,
            };

            if !message.kind().is_client_command() {
                debug!(kind = %message.kind(), "ignoring non-command message");
                continue;
            }
            if let Some(ClientCommand::SubscribeTrip(trip_id)) = ClientCommand::from_message(&message)? {
                self.subscribe_trip(trip_id).await;
            }
        }
    }

    /// One-shot lookup of the trip's persisted state, queued as a `trip_update`.
    async fn subscribe_trip(&self, trip_id: TripId) {
        let snapshot = match store::load_snapshot(self.store.as_ref(), trip_id).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_not_found() => {
                debug!(trip_id, error = %e, "subscription to unknown trip");
                return;
            }
            Err(e) => {
                warn!(trip_id, error = %e, "trip lookup failed");
                return;
            }
        };
        match Message::trip_event(MessageType::TripUpdate, &snapshot) {
            Ok(message) => {
                debug!(trip_id, progress = snapshot.trip.progress, "sending trip snapshot");
                self.hub.send_to(self.id, message).await;
            }
            Err(e) => warn!(trip_id, error = %e, "failed to encode trip snapshot"),
        }
    }
}

async fn outbound_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut queue: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
    stop: CancellationToken,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Ending this loop for any reason stops the inbound loop too
    let _stop_inbound = stop.drop_guard();

    while let Some(message) = queue.recv().await {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = %message.kind(), error = %e, "dropping unencodable message");
                continue;
            }
        };
        match tokio::time::timeout(write_timeout, sink.send(WsMessage::text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(SessionError::WriteTimeout(write_timeout)),
        }
    }

    // Queue closed: unregistered or evicted by the hub
    debug!("outbound queue closed, sending close frame");
    let _ = tokio::time::timeout(write_timeout, sink.send(WsMessage::Close(None))).await;
    Ok(())
}
