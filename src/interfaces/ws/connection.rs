//! A single charge point connection
//!
//! Shared between the connection manager, the ping scheduler, the receive
//! task and the send task. All mutable state is atomic so enqueueing and
//! state inspection never take a lock.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::OcppVersion;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Authenticated = 2,
    Registered = 3,
    Disconnecting = 4,
    Disconnected = 5,
    Faulted = 6,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Authenticated,
            3 => Self::Registered,
            4 => Self::Disconnecting,
            5 => Self::Disconnected,
            _ => Self::Faulted,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Faulted)
    }

    /// States in which the charge point counts as connected.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated | Self::Registered)
    }

    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if next == Faulted {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connected, Authenticated)
                | (Connected, Registered)
                | (Connected, Disconnecting)
                | (Authenticated, Registered)
                | (Authenticated, Disconnecting)
                | (Registered, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection limit of {limit} reached")]
    LimitExceeded { limit: usize },

    #[error("charge point '{0}' already has an active connection")]
    AlreadyConnected(String),

    #[error("upgrade rejected: {0}")]
    UpgradeFailed(String),

    #[error("charge point '{0}' is not connected")]
    NotFound(String),

    #[error("send queue full for '{0}'")]
    QueueFull(String),

    #[error("connection to '{0}' is closed")]
    Closed(String),

    #[error("illegal state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Item on a connection's send queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
}

/// Point-in-time view of a connection for introspection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub charge_point_id: String,
    pub connection_id: u64,
    pub ocpp_version: String,
    pub state: ConnectionState,
    pub remote_addr: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub dropped: u64,
}

pub struct Connection {
    id: u64,
    charge_point_id: String,
    version: OcppVersion,
    remote_addr: Option<String>,
    connected_at: DateTime<Utc>,
    state: AtomicU8,
    closing: AtomicBool,
    last_activity_ms: AtomicI64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    dropped: AtomicU64,
    sender: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl Connection {
    /// Create a connection in `Connecting` state with a send queue of
    /// `queue_capacity` frames. `cancel` is the connection's own scope.
    pub fn new(
        id: u64,
        charge_point_id: impl Into<String>,
        version: OcppVersion,
        remote_addr: Option<String>,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let now = Utc::now();
        let connection = Self {
            id,
            charge_point_id: charge_point_id.into(),
            version,
            remote_addr,
            connected_at: now,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            closing: AtomicBool::new(false),
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sender,
            cancel,
        };
        (connection, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn charge_point_id(&self) -> &str {
        &self.charge_point_id
    }

    pub fn version(&self) -> OcppVersion {
        self.version
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active() && !self.cancel.is_cancelled()
    }

    /// Move to `next`. Transitioning to the current state is a no-op.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, ConnectionError> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = ConnectionState::from_u8(current);
            if from == next {
                return Ok(from);
            }
            if !from.can_transition_to(next) {
                return Err(ConnectionError::InvalidTransition { from, to: next });
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }

    /// Mark the connection faulted and cancel its scope.
    pub fn fault(&self) {
        let _ = self.transition(ConnectionState::Faulted);
        self.cancel.cancel();
    }

    /// Claim the close of this connection. Only the first caller gets `true`.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Non-blocking enqueue onto the send queue. A full queue drops the
    /// frame and counts it.
    pub fn try_enqueue(&self, item: Outbound) -> Result<(), ConnectionError> {
        if self.cancel.is_cancelled() || self.state().is_terminal() {
            return Err(ConnectionError::Closed(self.charge_point_id.clone()));
        }
        match self.sender.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(item)) => {
                if matches!(item, Outbound::Text(_)) {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("ocpp_frames_dropped_total").increment(1);
                }
                Err(ConnectionError::QueueFull(self.charge_point_id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(ConnectionError::Closed(self.charge_point_id.clone()))
            }
        }
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.try_enqueue(Outbound::Text(text.into()))
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.touch();
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// True when nothing was received for longer than `timeout` as of `now`.
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        let elapsed = now.timestamp_millis().saturating_sub(last);
        elapsed >= 0 && elapsed as u128 >= timeout.as_millis()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            charge_point_id: self.charge_point_id.clone(),
            connection_id: self.id,
            ocpp_version: self.version.version_string().to_string(),
            state: self.state(),
            remote_addr: self.remote_addr.clone(),
            connected_at: self.connected_at,
            last_activity: self.last_activity(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(capacity: usize) -> (Connection, mpsc::Receiver<Outbound>) {
        Connection::new(
            1,
            "CP001",
            OcppVersion::V16,
            None,
            capacity,
            CancellationToken::new(),
        )
    }

    #[test]
    fn lifecycle_transitions() {
        let (conn, _rx) = connection(4);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.transition(ConnectionState::Connected).unwrap();
        conn.transition(ConnectionState::Registered).unwrap();
        assert!(conn.is_active());
        // Re-registering is idempotent.
        conn.transition(ConnectionState::Registered).unwrap();

        let err = conn.transition(ConnectionState::Connecting).unwrap_err();
        assert_eq!(
            err,
            ConnectionError::InvalidTransition {
                from: ConnectionState::Registered,
                to: ConnectionState::Connecting
            }
        );

        conn.transition(ConnectionState::Disconnecting).unwrap();
        conn.transition(ConnectionState::Disconnected).unwrap();
        assert!(conn.state().is_terminal());
        assert!(conn.transition(ConnectionState::Faulted).is_err());
    }

    #[test]
    fn faulted_from_any_live_state() {
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Authenticated,
            ConnectionState::Registered,
            ConnectionState::Disconnecting,
        ] {
            assert!(state.can_transition_to(ConnectionState::Faulted));
        }
    }

    #[test]
    fn full_queue_fails_fast_and_counts() {
        let (conn, _rx) = connection(1);
        conn.transition(ConnectionState::Connected).unwrap();
        conn.send_text("a").unwrap();
        assert_eq!(
            conn.send_text("b"),
            Err(ConnectionError::QueueFull("CP001".into()))
        );
        assert_eq!(conn.dropped(), 1);
        // Pings skipped on a full queue are not counted as dropped frames.
        assert!(conn.try_enqueue(Outbound::Ping).is_err());
        assert_eq!(conn.dropped(), 1);
    }

    #[test]
    fn cancelled_connection_rejects_enqueue() {
        let (conn, _rx) = connection(4);
        conn.transition(ConnectionState::Connected).unwrap();
        conn.cancel_token().cancel();
        assert_eq!(
            conn.send_text("a"),
            Err(ConnectionError::Closed("CP001".into()))
        );
    }

    #[test]
    fn idle_detection() {
        let (conn, _rx) = connection(4);
        let now = Utc::now();
        assert!(!conn.is_idle(now, Duration::from_secs(60)));
        let later = now + chrono::Duration::seconds(120);
        assert!(conn.is_idle(later, Duration::from_secs(60)));
    }

    #[test]
    fn begin_close_is_claimed_once() {
        let (conn, _rx) = connection(4);
        assert!(conn.begin_close());
        assert!(!conn.begin_close());
    }
}
