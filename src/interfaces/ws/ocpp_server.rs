//! OCPP WebSocket server
//!
//! Accepts charge-point connections at `ws://<host>:<port>/ocpp/{charge_point_id}`
//! (or `/{charge_point_id}`). Each connection gets one receive task, which
//! dispatches frames strictly in arrival order, and one send task, which
//! drains the connection's bounded send queue onto the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::application::pending::SharedPendingRequests;
use crate::application::registry::SharedConnectionRegistry;
use crate::support::shutdown::ShutdownSignal;

use super::connection::{Connection, ConnectionError, Outbound};
use super::dispatcher::{DispatchContext, DispatchError, ProcessError, SharedDispatcher};
use super::manager::{AcceptedConnection, SharedConnectionManager, UpgradeRequest};

type WsStream = WebSocketStream<TcpStream>;

/// OCPP WebSocket Server
#[derive(Clone)]
pub struct OcppServer {
    manager: SharedConnectionManager,
    dispatcher: SharedDispatcher,
    pending: SharedPendingRequests,
    registry: SharedConnectionRegistry,
    instance_id: Arc<str>,
    write_timeout: Duration,
    handshake_timeout: Duration,
    tracker: TaskTracker,
    shutdown: ShutdownSignal,
}

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

impl OcppServer {
    pub fn new(
        manager: SharedConnectionManager,
        dispatcher: SharedDispatcher,
        pending: SharedPendingRequests,
        registry: SharedConnectionRegistry,
        instance_id: &str,
        write_timeout: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            manager,
            dispatcher,
            pending,
            registry,
            instance_id: Arc::from(instance_id),
            write_timeout,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    /// Deadline for a peer to complete the WebSocket upgrade.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Tracks every per-connection task.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Accept connections until shutdown is triggered.
    pub async fn run(&self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "🔌 OCPP WebSocket server started");
        info!("   Charge points should connect to: ws://{}/ocpp/{{charge_point_id}}", addr);

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                result = listener.accept() => match result {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                }
            }
        }

        info!("🛑 WebSocket server stopped accepting connections");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }
        let server = self.clone();
        self.tracker.spawn(async move {
            server.handle_connection(stream, peer).await;
        });
    }

    async fn handle_connection(self, stream: TcpStream, peer: SocketAddr) {
        let (ws, accepted) = match self.handshake(stream, peer).await {
            Some(parts) => parts,
            None => return,
        };
        let AcceptedConnection {
            connection,
            outbound,
            ..
        } = accepted;

        let (sink, stream) = ws.split();
        let send_task = self.tracker.spawn(send_loop(
            connection.clone(),
            sink,
            outbound,
            self.write_timeout,
        ));

        let reason = self.receive_loop(&connection, stream).await;

        self.manager.release(&connection, reason);
        let _ = send_task.await;
        self.cleanup(&connection).await;
    }

    /// Run the WebSocket handshake. The upgrade is decided by the connection
    /// manager inside the handshake callback so a rejection becomes an HTTP
    /// error response.
    async fn handshake(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Option<(WsStream, AcceptedConnection)> {
        let mut accepted: Option<AcceptedConnection> = None;

        let callback = |req: &Request, mut response: Response| {
            let path = req.uri().path();
            debug!(%peer, path, "WebSocket handshake");

            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };

            let upgrade = UpgradeRequest {
                charge_point_id: extract_charge_point_id(path).unwrap_or_default(),
                remote_addr: Some(peer.to_string()),
                requested_protocols: header("Sec-WebSocket-Protocol"),
                authorization: header("Authorization"),
            };

            match self.manager.accept(upgrade) {
                Ok(connection) => {
                    if let Some(subprotocol) = connection.subprotocol {
                        response.headers_mut().insert(
                            "Sec-WebSocket-Protocol",
                            HeaderValue::from_static(subprotocol),
                        );
                    }
                    accepted = Some(connection);
                    Ok(response)
                }
                Err(e) => Err(rejection(&e)),
            }
        };

        let handshake = tokio_tungstenite::accept_hdr_async(stream, callback);
        let result = tokio::select! {
            _ = self.shutdown.wait() => {
                debug!(%peer, "Handshake abandoned on shutdown");
                None
            }
            result = tokio::time::timeout(self.handshake_timeout, handshake) => match result {
                Ok(result) => Some(result),
                Err(_) => {
                    warn!(
                        %peer,
                        timeout_ms = self.handshake_timeout.as_millis() as u64,
                        "WebSocket handshake timed out"
                    );
                    None
                }
            },
        };

        match result {
            Some(Ok(ws)) => return accepted.map(|connection| (ws, connection)),
            Some(Err(e)) => warn!(%peer, error = %e, "WebSocket handshake failed"),
            None => {}
        }

        // The upgrade may have been admitted before the handshake broke off.
        if let Some(connection) = accepted {
            self.manager.release(&connection.connection, "handshake failed");
            self.pending.cancel_connection(connection.connection.id());
        }
        None
    }

    /// Read frames until the peer leaves or the connection scope is
    /// cancelled. Returns the disconnect reason.
    async fn receive_loop(
        &self,
        connection: &Arc<Connection>,
        mut stream: SplitStream<WsStream>,
    ) -> &'static str {
        let ctx = DispatchContext::new(connection.clone());
        let charge_point_id = connection.charge_point_id();

        loop {
            let message = tokio::select! {
                _ = ctx.cancel.cancelled() => return "cancelled",
                message = stream.next() => message,
            };

            match message {
                Some(Ok(Message::Text(text))) => {
                    connection.record_received(text.len());
                    let version = self.dispatcher.identify_version(charge_point_id).await;
                    let reply = match self.dispatcher.dispatch(&ctx, version, &text).await {
                        Ok(reply) => reply,
                        Err(DispatchError::Cancelled) => return "cancelled",
                        // Logged by the dispatcher.
                        Err(DispatchError::Timeout { reply, .. }) => reply,
                        // Already logged by the processor.
                        Err(DispatchError::Process(ProcessError::Frame(_)))
                        | Err(DispatchError::Process(ProcessError::Correlation(_))) => None,
                        Err(e) => {
                            warn!(
                                charge_point_id,
                                connection_id = connection.id(),
                                error = %e,
                                "Dispatch failed"
                            );
                            None
                        }
                    };

                    if let Some(reply) = reply {
                        if let Err(e) = connection.send_text(reply) {
                            warn!(
                                charge_point_id,
                                connection_id = connection.id(),
                                error = %e,
                                "Failed to enqueue reply"
                            );
                            if matches!(e, ConnectionError::Closed(_)) {
                                return "send queue closed";
                            }
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    connection.record_received(data.len());
                    warn!(
                        charge_point_id,
                        bytes = data.len(),
                        "Binary message received, ignoring"
                    );
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => connection.touch(),
                Some(Ok(Message::Close(frame))) => {
                    debug!(charge_point_id, ?frame, "Close frame received");
                    return "closed by peer";
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    warn!(charge_point_id, error = %e, "WebSocket error");
                    return "transport error";
                }
                None => return "connection lost",
            }
        }
    }

    async fn cleanup(&self, connection: &Connection) {
        let charge_point_id = connection.charge_point_id();
        let cancelled = self.pending.cancel_connection(connection.id());

        // A newer connection, here or on another instance, may own the record.
        if !self.manager.is_connected(charge_point_id) {
            match self.registry.get_connection(charge_point_id).await {
                Ok(Some(owner)) if owner.as_str() == &*self.instance_id => {
                    if let Err(e) = self.registry.delete_connection(charge_point_id).await {
                        warn!(charge_point_id, error = %e, "Failed to clear connection registry");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(charge_point_id, error = %e, "Failed to read connection registry"),
            }
        }

        debug!(
            charge_point_id,
            connection_id = connection.id(),
            pending_cancelled = cancelled,
            "Connection cleaned up"
        );
    }
}

/// Drain the send queue onto the socket. Each write is bounded by
/// `write_timeout`; a failed or stalled write faults the connection.
async fn send_loop(
    connection: Arc<Connection>,
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
) {
    let cancel = connection.cancel_token().clone();
    let charge_point_id = connection.charge_point_id();

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = outbound.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let (message, bytes) = match item {
            Outbound::Text(text) => {
                let bytes = text.len();
                (Message::Text(text), bytes)
            }
            Outbound::Ping => (Message::Ping(Vec::new()), 0),
        };

        match tokio::time::timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {
                if bytes > 0 {
                    connection.record_sent(bytes);
                }
            }
            Ok(Err(e)) => {
                warn!(charge_point_id, error = %e, "Send error");
                connection.fault();
                break;
            }
            Err(_) => {
                warn!(
                    charge_point_id,
                    timeout_ms = write_timeout.as_millis() as u64,
                    "Write timed out"
                );
                connection.fault();
                break;
            }
        }
    }

    outbound.close();
    let dropped = std::iter::from_fn(|| outbound.try_recv().ok()).count();
    if dropped > 0 {
        debug!(charge_point_id, dropped, "Discarded queued frames on close");
    }
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}

fn rejection(error: &ConnectionError) -> ErrorResponse {
    let status = match error {
        ConnectionError::LimitExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ConnectionError::AlreadyConnected(_) => StatusCode::CONFLICT,
        ConnectionError::UpgradeFailed(reason)
            if reason.contains("auth") || reason.contains("credentials") =>
        {
            StatusCode::UNAUTHORIZED
        }
        ConnectionError::UpgradeFailed(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = status;
    response
}

/// Extract charge point ID from WebSocket request path.
/// Expected format: /ocpp/{charge_point_id} or /{charge_point_id}
pub fn extract_charge_point_id(path: &str) -> Option<String> {
    let path = path.trim_start_matches('/');

    if let Some(id) = path.strip_prefix("ocpp/") {
        let id = id.trim_matches('/');
        if !id.is_empty() && !id.contains('/') {
            return Some(id.to_string());
        }
        return None;
    }

    if !path.is_empty() && !path.contains('/') {
        return Some(path.to_string());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_point_id_from_path() {
        assert_eq!(extract_charge_point_id("/ocpp/CP001").as_deref(), Some("CP001"));
        assert_eq!(extract_charge_point_id("/ocpp/CP001/").as_deref(), Some("CP001"));
        assert_eq!(extract_charge_point_id("/CP002").as_deref(), Some("CP002"));
        assert_eq!(extract_charge_point_id("/ocpp/"), None);
        assert_eq!(extract_charge_point_id("/"), None);
        assert_eq!(extract_charge_point_id("/a/b/c"), None);
    }

    #[test]
    fn rejection_status_codes() {
        assert_eq!(
            rejection(&ConnectionError::LimitExceeded { limit: 1 }).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            rejection(&ConnectionError::AlreadyConnected("CP".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            rejection(&ConnectionError::UpgradeFailed("authentication failed".into())).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            rejection(&ConnectionError::UpgradeFailed("missing charge point id".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
