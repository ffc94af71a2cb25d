//! Connection manager
//!
//! Owns the table of live charge point connections. Accepts upgrades,
//! enforces the connection limit, routes outbound frames onto per-connection
//! send queues and emits the connection lifecycle events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::events::SharedEventBus;
use crate::domain::events::{
    ChargePointConnectedEvent, ChargePointDisconnectedEvent, ConnectionErrorEvent, DomainEvent,
};
use crate::domain::OcppVersion;
use crate::support::credentials::{parse_basic_auth, verify_password};

use super::connection::{Connection, ConnectionError, ConnectionSnapshot, ConnectionState, Outbound};
use super::negotiator::ProtocolNegotiator;
use super::ping::{PingScheduler, PingStats};

/// Longest charge point identity accepted on the upgrade path
pub const MAX_CHARGE_POINT_ID_LEN: usize = 48;

/// What the WebSocket handshake hands to `accept`
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    pub charge_point_id: String,
    pub remote_addr: Option<String>,
    /// Raw `Sec-WebSocket-Protocol` header
    pub requested_protocols: Option<String>,
    /// Raw `Authorization` header
    pub authorization: Option<String>,
}

/// A connection that passed the upgrade checks
pub struct AcceptedConnection {
    pub connection: Arc<Connection>,
    pub outbound: mpsc::Receiver<Outbound>,
    /// Subprotocol to echo in the handshake response, if one was negotiated.
    pub subprotocol: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_connections: usize,
    pub send_queue_capacity: usize,
    pub idle_timeout: Duration,
    pub require_auth: bool,
    /// charge point id -> SHA-256 hex digest of its password
    pub credentials: HashMap<String, String>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            send_queue_capacity: 64,
            idle_timeout: Duration::from_secs(600),
            require_auth: false,
            credentials: HashMap::new(),
        }
    }
}

/// Outcome of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct ConnectionManager {
    connections: DashMap<String, Arc<Connection>>,
    active: AtomicUsize,
    next_connection_id: AtomicU64,
    settings: ManagerSettings,
    negotiator: ProtocolNegotiator,
    ping: Arc<PingScheduler>,
    event_bus: SharedEventBus,
    root: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        settings: ManagerSettings,
        negotiator: ProtocolNegotiator,
        ping: Arc<PingScheduler>,
        event_bus: SharedEventBus,
        root: CancellationToken,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            active: AtomicUsize::new(0),
            next_connection_id: AtomicU64::new(1),
            settings,
            negotiator,
            ping,
            event_bus,
            root,
        }
    }

    /// Admit a new connection.
    ///
    /// Rejects when at capacity or when the charge point already has a live
    /// connection. A stale entry in a terminal state is replaced.
    pub fn accept(&self, request: UpgradeRequest) -> Result<AcceptedConnection, ConnectionError> {
        let charge_point_id = request.charge_point_id.trim().to_string();

        let authenticated = match self.check_upgrade(&charge_point_id, request.authorization.as_deref()) {
            Ok(authenticated) => authenticated,
            Err(e) => {
                self.reject(&charge_point_id, &e);
                return Err(e);
            }
        };

        let (version, offered) = self
            .negotiator
            .select(request.requested_protocols.as_deref());

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (connection, outbound) = Connection::new(
            connection_id,
            charge_point_id.clone(),
            version,
            request.remote_addr.clone(),
            self.settings.send_queue_capacity,
            self.root.child_token(),
        );
        let connection = Arc::new(connection);

        let admitted = match self.connections.entry(charge_point_id.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().state().is_terminal() {
                    debug!(
                        charge_point_id = %charge_point_id,
                        stale_connection_id = slot.get().id(),
                        "Replacing stale connection"
                    );
                    self.ping.deregister(slot.get().id());
                    slot.insert(connection.clone());
                    Ok(())
                } else {
                    Err(ConnectionError::AlreadyConnected(charge_point_id.clone()))
                }
            }
            Entry::Vacant(slot) => {
                let limit = self.settings.max_connections;
                let reserved = self
                    .active
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < limit).then_some(n + 1)
                    });
                match reserved {
                    Ok(_) => {
                        slot.insert(connection.clone());
                        Ok(())
                    }
                    Err(_) => Err(ConnectionError::LimitExceeded { limit }),
                }
            }
        };

        if let Err(e) = admitted {
            self.reject(&charge_point_id, &e);
            return Err(e);
        }

        let _ = connection.transition(ConnectionState::Connected);
        if authenticated {
            let _ = connection.transition(ConnectionState::Authenticated);
        }
        self.ping.register(&connection);
        metrics::gauge!("ocpp_active_connections").set(self.count() as f64);

        info!(
            charge_point_id = %charge_point_id,
            connection_id,
            version = %version,
            remote_addr = ?request.remote_addr,
            authenticated,
            "Charge point connected"
        );

        self.event_bus
            .publish(DomainEvent::ChargePointConnected(ChargePointConnectedEvent {
                charge_point_id,
                connection_id,
                ocpp_version: version.version_string().to_string(),
                remote_addr: request.remote_addr,
                timestamp: Utc::now(),
            }));

        Ok(AcceptedConnection {
            connection,
            outbound,
            subprotocol: offered.then(|| version.subprotocol()),
        })
    }

    /// Validate identity and credentials. Returns whether the peer was
    /// authenticated.
    fn check_upgrade(
        &self,
        charge_point_id: &str,
        authorization: Option<&str>,
    ) -> Result<bool, ConnectionError> {
        if charge_point_id.is_empty() {
            return Err(ConnectionError::UpgradeFailed("missing charge point id".into()));
        }
        if charge_point_id.len() > MAX_CHARGE_POINT_ID_LEN {
            return Err(ConnectionError::UpgradeFailed(format!(
                "charge point id longer than {} characters",
                MAX_CHARGE_POINT_ID_LEN
            )));
        }

        if !self.settings.require_auth {
            return Ok(false);
        }

        let stored = self
            .settings
            .credentials
            .get(charge_point_id)
            .ok_or_else(|| ConnectionError::UpgradeFailed("unknown charge point".into()))?;
        let creds = authorization
            .and_then(parse_basic_auth)
            .ok_or_else(|| ConnectionError::UpgradeFailed("missing or malformed credentials".into()))?;

        if creds.username != charge_point_id || !verify_password(&creds.password, stored) {
            return Err(ConnectionError::UpgradeFailed("authentication failed".into()));
        }
        Ok(true)
    }

    fn reject(&self, charge_point_id: &str, error: &ConnectionError) {
        warn!(charge_point_id, error = %error, "Connection rejected");
        let error_type = match error {
            ConnectionError::LimitExceeded { .. } => "limit_exceeded",
            ConnectionError::AlreadyConnected(_) => "already_connected",
            _ => "upgrade_failed",
        };
        self.event_bus
            .publish(DomainEvent::ConnectionError(ConnectionErrorEvent {
                charge_point_id: charge_point_id.to_string(),
                connection_id: None,
                error_type: error_type.to_string(),
                message: error.to_string(),
                timestamp: Utc::now(),
            }));
    }

    /// Non-blocking enqueue of an encoded frame.
    pub fn send(&self, charge_point_id: &str, frame: impl Into<String>) -> Result<(), ConnectionError> {
        let connection = self
            .get(charge_point_id)
            .ok_or_else(|| ConnectionError::NotFound(charge_point_id.to_string()))?;

        connection.send_text(frame).inspect_err(|e| {
            warn!(
                charge_point_id,
                connection_id = connection.id(),
                error = %e,
                "Outbound frame dropped"
            );
        })
    }

    /// Enqueue `frame` on every live connection. Failures are isolated.
    pub fn broadcast(&self, frame: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for connection in self.live_connections() {
            match connection.send_text(frame) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    debug!(
                        charge_point_id = connection.charge_point_id(),
                        error = %e,
                        "Broadcast skipped connection"
                    );
                }
            }
        }
        report
    }

    /// Close the connection of a charge point. Idempotent.
    pub fn close(&self, charge_point_id: &str, reason: &str) -> bool {
        match self.get(charge_point_id) {
            Some(connection) => self.release(&connection, reason),
            None => false,
        }
    }

    /// Tear down a specific connection: cancel its scope, remove it from the
    /// table and emit the disconnect event. Only the first call does work.
    pub fn release(&self, connection: &Arc<Connection>, reason: &str) -> bool {
        if !connection.begin_close() {
            return false;
        }

        if connection.state() != ConnectionState::Faulted {
            let _ = connection.transition(ConnectionState::Disconnecting);
        }
        connection.cancel_token().cancel();
        self.ping.deregister(connection.id());

        let removed = self
            .connections
            .remove_if(connection.charge_point_id(), |_, c| c.id() == connection.id())
            .is_some();
        if removed {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }

        if connection.state() != ConnectionState::Faulted {
            let _ = connection.transition(ConnectionState::Disconnected);
        }
        metrics::gauge!("ocpp_active_connections").set(self.count() as f64);

        info!(
            charge_point_id = connection.charge_point_id(),
            connection_id = connection.id(),
            reason,
            "Charge point disconnected"
        );

        self.event_bus
            .publish(DomainEvent::ChargePointDisconnected(ChargePointDisconnectedEvent {
                charge_point_id: connection.charge_point_id().to_string(),
                connection_id: connection.id(),
                reason: Some(reason.to_string()),
                timestamp: Utc::now(),
            }));
        true
    }

    /// Force-close connections that are terminal or idle past the timeout.
    /// Returns the charge point ids that were closed.
    pub fn sweep_idle(&self) -> Vec<String> {
        let now = Utc::now();
        let timeout = self.settings.idle_timeout;
        let candidates: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|c| c.state().is_terminal() || c.is_idle(now, timeout))
            .map(|c| c.value().clone())
            .collect();

        let mut closed = Vec::new();
        for connection in candidates {
            let reason = if connection.state().is_terminal() {
                "stale"
            } else {
                "idle timeout"
            };
            if !self.release(&connection, reason) {
                // Already closed elsewhere but still in the table.
                if self
                    .connections
                    .remove_if(connection.charge_point_id(), |_, c| c.id() == connection.id())
                    .is_some()
                {
                    self.active.fetch_sub(1, Ordering::AcqRel);
                }
            }
            closed.push(connection.charge_point_id().to_string());
        }
        if !closed.is_empty() {
            info!(count = closed.len(), "Idle sweep closed connections");
        }
        closed
    }

    /// Run `sweep_idle` periodically until `cancel` fires.
    pub async fn run_idle_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_idle();
                }
            }
        }
        debug!("Idle sweeper stopped");
    }

    /// Close every connection, used during shutdown.
    pub fn close_all(&self, reason: &str) -> usize {
        let all: Vec<Arc<Connection>> = self.connections.iter().map(|c| c.value().clone()).collect();
        all.iter().filter(|c| self.release(c, reason)).count()
    }

    pub fn get(&self, charge_point_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(charge_point_id).map(|c| c.value().clone())
    }

    pub fn is_connected(&self, charge_point_id: &str) -> bool {
        self.connections
            .get(charge_point_id)
            .map(|c| c.is_active())
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .iter()
            .filter(|c| c.is_active())
            .map(|c| c.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn version_of(&self, charge_point_id: &str) -> Option<OcppVersion> {
        self.connections.get(charge_point_id).map(|c| c.version())
    }

    pub fn snapshot(&self, charge_point_id: &str) -> Option<ConnectionSnapshot> {
        self.connections.get(charge_point_id).map(|c| c.snapshot())
    }

    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        let mut all: Vec<ConnectionSnapshot> =
            self.connections.iter().map(|c| c.snapshot()).collect();
        all.sort_by(|a, b| a.charge_point_id.cmp(&b.charge_point_id));
        all
    }

    pub fn ping_stats(&self) -> PingStats {
        self.ping.stats()
    }

    pub fn max_connections(&self) -> usize {
        self.settings.max_connections
    }

    fn live_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|c| c.is_active())
            .map(|c| c.value().clone())
            .collect()
    }
}

pub type SharedConnectionManager = Arc<ConnectionManager>;
