//! TCP accept loop. Performs the WebSocket upgrade and hands each live
//! connection to a [`ClientSession`].

use crate::config::SessionConfig;
use crate::hub::Hub;
use crate::session::ClientSession;
use crate::store::TripStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Accept connections until `shutdown` fires, then wait for open sessions to
/// wind down.
pub async fn serve(
    listener: TcpListener,
    hub: Hub,
    store: Arc<dyn TripStore>,
    config: SessionConfig,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "🌐 WebSocket server listening");
    }
    let sessions = TaskTracker::new();

    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                let session = ClientSession::new(hub.clone(), Arc::clone(&store), config.clone());
                sessions.spawn(handle_connection(stream, addr, session));
            }
            Err(e) => error!(error = %e, "failed to accept connection"),
        }
    }

    sessions.close();
    sessions.wait().await;
    info!("WebSocket server stopped");
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, session: ClientSession) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%addr, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    info!(%addr, conn_id = %session.id(), "🔗 client upgraded");
    if let Err(e) = session.run(ws).await {
        debug!(%addr, error = %e, "session ended with error");
    }
    info!(%addr, "🔌 client disconnected");
}
