//! WebSocket transport for the live protocol.
//!
//! This module only frames the transport-agnostic protocol: it upgrades
//! connections at `/live`, feeds inbound JSON messages to
//! [`Hub::dispatch`], and drains the connection's outbound channel into
//! the socket. Acknowledgements are only sent for messages that carried a
//! request id.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::Result;
use crate::live::{Hub, LiveError};
use crate::protocol::{ClientMessage, ServerMessage};

/// Manages the listener lifecycle of the live endpoint. Owned exclusively
/// by its caller; `&mut self` provides the synchronization.
pub struct LiveServer {
    hub: Arc<Hub>,
    running: bool,
    shutdown: Option<oneshot::Sender<()>>,
    address: Option<String>,
}

impl LiveServer {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            running: false,
            shutdown: None,
            address: None,
        }
    }

    fn create_router(hub: Arc<Hub>) -> Router {
        Router::new().route("/live", get(ws_handler)).with_state(hub)
    }

    /// Bind and serve the live endpoint. Returns once the listener is
    /// ready; the actual bound address (important for port 0) is available
    /// through [`LiveServer::address`].
    pub async fn start(&mut self, addr: &str) -> Result<()> {
        if self.running {
            return Err(LiveError::ServerAlreadyRunning {
                address: addr.to_string(),
            }
            .into());
        }

        let socket_addr: SocketAddr = addr.parse().map_err(|e| LiveError::ServerBind {
            address: addr.to_string(),
            reason: format!("Invalid address: {e}"),
        })?;

        let router = Self::create_router(self.hub.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (addr_tx, addr_rx) = oneshot::channel::<SocketAddr>();

        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(socket_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(error = %e, "failed to bind live endpoint");
                    return;
                }
            };
            if let Ok(actual) = listener.local_addr() {
                let _ = addr_tx.send(actual);
            }

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                warn!(error = %e, "live endpoint failed");
            }
        });

        let actual_addr = addr_rx.await.map_err(|_| LiveError::ServerBind {
            address: addr.to_string(),
            reason: "Server startup failed".to_string(),
        })?;

        self.running = true;
        self.address = Some(actual_addr.to_string());
        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Trigger graceful shutdown of the listener.
    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Err(LiveError::ServerNotRunning.into());
        }
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.running = false;
        self.address = None;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The bound address of a running server.
    pub fn address(&self) -> Result<String> {
        self.address
            .clone()
            .ok_or_else(|| LiveError::ServerNotRunning.into())
    }
}

async fn ws_handler(State(hub): State<Arc<Hub>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(hub, socket))
}

/// Per-connection task: one select loop over inbound frames and the
/// connection's outbound queue. Dispatch runs inline, so one connection's
/// store round trips never block another's.
async fn handle_socket(hub: Arc<Hub>, mut socket: WebSocket) {
    let (conn, mut outbound) = hub.connect();

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let message = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!(error = %e, "malformed client message");
                                continue;
                            }
                        };
                        let response = hub.dispatch(&conn, &message).await;
                        if let Some(req_id) = message.req_id {
                            let ack = ServerMessage::Ack {
                                event: message.event.clone(),
                                req_id,
                                response,
                            };
                            if send_message(&mut socket, &ack).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "socket receive failed");
                        break;
                    }
                }
            }
            queued = outbound.recv() => {
                match queued {
                    Some(message) => {
                        if send_message(&mut socket, &message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    hub.disconnect(&conn).await;
}

async fn send_message(
    socket: &mut WebSocket,
    message: &ServerMessage,
) -> std::result::Result<(), axum::Error> {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "failed to encode server message");
            return Ok(());
        }
    };
    socket.send(Message::Text(text.into())).await
}
