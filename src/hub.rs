//! Connection registry and fan-out.
//!
//! The registry lives inside one control loop task. [`Hub`] handles only send
//! requests to that loop, which applies them one at a time, so the set of live
//! connections needs no lock and is never visible outside the loop.

use crate::config::HubConfig;
use crate::protocol::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Messages are shared between every recipient of a broadcast.
pub type Outbound = Arc<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// A process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live connection as the hub sees it: an id and the sending half of its
/// bounded outbound queue. Dropping it closes the queue.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    queue: mpsc::Sender<Outbound>,
}

impl Connection {
    pub fn new(id: ConnectionId, queue: mpsc::Sender<Outbound>) -> Self {
        Self { id, queue }
    }

    /// A fresh connection plus the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(ConnectionId::next(), tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn try_deliver(&self, message: &Outbound) -> Result<(), Eviction> {
        self.queue.try_send(Arc::clone(message)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Eviction::SlowConsumer,
            mpsc::error::TrySendError::Closed(_) => Eviction::Disconnected,
        })
    }
}

/// Why a connection was dropped during delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// Outbound queue was full.
    SlowConsumer,
    /// Receiving side already went away.
    Disconnected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    pub registered: u64,
    pub unregistered: u64,
    pub broadcasts: u64,
    pub delivered: u64,
    pub evicted: u64,
}

enum HubCommand {
    Register(Connection),
    Unregister(ConnectionId),
    Broadcast(Outbound),
    SendTo(ConnectionId, Outbound),
    Count(oneshot::Sender<usize>),
    Ids(oneshot::Sender<Vec<ConnectionId>>),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("hub control loop needs a running tokio runtime")]
    NoRuntime,
    #[error("hub control loop has stopped")]
    Closed,
}

/// Handle to the hub control loop. Cheap to clone; the loop exits once every
/// handle is dropped or [`Hub::shutdown`] is called.
#[derive(Debug, Clone)]
pub struct Hub {
    commands: mpsc::Sender<HubCommand>,
}

impl core::fmt::Debug for HubCommand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HubCommand::Register(conn) => write!(f, "Register({})", conn.id),
            HubCommand::Unregister(id) => write!(f, "Unregister({id})"),
            HubCommand::Broadcast(msg) => write!(f, "Broadcast({})", msg.kind()),
            HubCommand::SendTo(id, msg) => write!(f, "SendTo({id}, {})", msg.kind()),
            HubCommand::Count(_) => f.write_str("Count"),
            HubCommand::Ids(_) => f.write_str("Ids"),
            HubCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl Hub {
    /// Spawn the control loop on the current runtime. This is the only
    /// fallible step of the hub's life.
    pub fn start(config: HubConfig) -> Result<(Hub, JoinHandle<HubStats>), HubError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| HubError::NoRuntime)?;
        let (tx, rx) = mpsc::channel(config.command_queue_size.max(1));
        let task = runtime.spawn(HubLoop::new().run(rx));
        info!("hub control loop started");
        Ok((Hub { commands: tx }, task))
    }

    pub async fn register(&self, connection: Connection) {
        self.submit(HubCommand::Register(connection)).await;
    }

    pub async fn unregister(&self, id: ConnectionId) {
        self.submit(HubCommand::Unregister(id)).await;
    }

    pub async fn broadcast(&self, message: Message) {
        self.submit(HubCommand::Broadcast(Arc::new(message))).await;
    }

    /// Enqueue onto one connection's queue with the same backpressure rule as
    /// a broadcast.
    pub async fn send_to(&self, id: ConnectionId, message: Message) {
        self.submit(HubCommand::SendTo(id, Arc::new(message))).await;
    }

    pub async fn connection_count(&self) -> Result<usize, HubError> {
        let (tx, rx) = oneshot::channel();
        self.try_submit(HubCommand::Count(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn connection_ids(&self) -> Result<Vec<ConnectionId>, HubError> {
        let (tx, rx) = oneshot::channel();
        self.try_submit(HubCommand::Ids(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Close every outbound queue and stop the loop.
    pub async fn shutdown(&self) {
        self.submit(HubCommand::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn submit(&self, command: HubCommand) {
        if let Err(e) = self.try_submit(command).await {
            debug!("dropping hub request: {}", e);
        }
    }

    async fn try_submit(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }
}

/// State owned by the control loop.
#[derive(Debug, Default)]
struct HubLoop {
    connections: HashMap<ConnectionId, Connection>,
    stats: HubStats,
}

impl HubLoop {
    fn new() -> Self {
        Self::default()
    }

    async fn run(mut self, mut commands: mpsc::Receiver<HubCommand>) -> HubStats {
        while let Some(command) = commands.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        let open = self.connections.len();
        self.connections.clear();
        info!(
            open_connections = open,
            delivered = self.stats.delivered,
            evicted = self.stats.evicted,
            "hub control loop stopped"
        );
        self.stats
    }

    /// Apply one request. Returns `false` once the loop should stop.
    fn handle(&mut self, command: HubCommand) -> bool {
        match command {
            HubCommand::Register(connection) => self.register(connection),
            HubCommand::Unregister(id) => self.unregister(id),
            HubCommand::Broadcast(message) => self.broadcast(&message),
            HubCommand::SendTo(id, message) => self.send_to(id, &message),
            HubCommand::Count(reply) => {
                let _ = reply.send(self.connections.len());
            }
            HubCommand::Ids(reply) => {
                let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
                ids.sort_unstable();
                let _ = reply.send(ids);
            }
            HubCommand::Shutdown => return false,
        }
        true
    }

    fn register(&mut self, connection: Connection) {
        let id = connection.id;
        if self.connections.contains_key(&id) {
            warn!(conn_id = %id, "connection already registered, ignoring");
            return;
        }
        self.connections.insert(id, connection);
        self.stats.registered += 1;
        info!(conn_id = %id, total = self.connections.len(), "client connected");
    }

    fn unregister(&mut self, id: ConnectionId) {
        // Dropping the connection closes its outbound queue
        if self.connections.remove(&id).is_some() {
            self.stats.unregistered += 1;
            info!(conn_id = %id, total = self.connections.len(), "client disconnected");
        }
    }

    fn broadcast(&mut self, message: &Outbound) {
        self.stats.broadcasts += 1;
        let mut evicted = Vec::new();
        for (id, connection) in &self.connections {
            match connection.try_deliver(message) {
                Ok(()) => self.stats.delivered += 1,
                Err(reason) => evicted.push((*id, reason)),
            }
        }
        debug!(
            kind = %message.kind(),
            trip_id = message.trip_id(),
            recipients = self.connections.len() - evicted.len(),
            "broadcast"
        );
        for (id, reason) in evicted {
            self.evict(id, reason);
        }
    }

    fn send_to(&mut self, id: ConnectionId, message: &Outbound) {
        let Some(connection) = self.connections.get(&id) else {
            debug!(conn_id = %id, kind = %message.kind(), "target connection is gone");
            return;
        };
        match connection.try_deliver(message) {
            Ok(()) => self.stats.delivered += 1,
            Err(reason) => self.evict(id, reason),
        }
    }

    fn evict(&mut self, id: ConnectionId, reason: Eviction) {
        if self.connections.remove(&id).is_none() {
            return;
        }
        self.stats.evicted += 1;
        match reason {
            Eviction::SlowConsumer => {
                warn!(conn_id = %id, total = self.connections.len(), "outbound queue full, evicting slow consumer");
            }
            Eviction::Disconnected => {
                info!(conn_id = %id, total = self.connections.len(), "dropping closed connection");
            }
        }
    }
}
