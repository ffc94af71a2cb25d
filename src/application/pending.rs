//! Pending request correlation
//!
//! Tracks every request in flight on a connection, keyed by
//! `(connection id, direction, message id)`. Each side picks its own ids,
//! so an inbound Call may reuse an id the gateway has outstanding:
//!
//! - **Outbound**: a Call the gateway sent to a charge point. The entry holds
//!   the waiter that receives the CallResult, CallError, timeout or close.
//! - **Inbound**: a Call from a charge point that is still being handled.
//!   Guards against a second frame reusing the same message id.
//!
//! Every entry leaves the table exactly once: `remove_if` decides which of
//! resolve, sweep or connection close wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PendingError {
    #[error("a request with message id '{0}' is already in flight")]
    Duplicate(String),

    #[error("no outstanding request with message id '{0}'")]
    NotFound(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed before a response arrived")]
    Closed,

    #[error("{code}: {description}")]
    CallError { code: String, description: String },
}

pub type PendingResult = Result<Value, PendingError>;

type Key = (u64, Direction, String);

struct PendingEntry {
    direction: Direction,
    action: String,
    submitted_at: Instant,
    deadline: Instant,
    waiter: Option<oneshot::Sender<PendingResult>>,
}

impl PendingEntry {
    fn deliver(mut self, result: PendingResult) {
        if let Some(waiter) = self.waiter.take() {
            // The waiter may have given up already.
            let _ = waiter.send(result);
        }
    }
}

pub struct PendingRequests {
    entries: DashMap<Key, PendingEntry>,
    default_timeout: Duration,
    timeouts: AtomicU64,
}

impl PendingRequests {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_timeout,
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn insert(
        &self,
        connection_id: u64,
        message_id: &str,
        direction: Direction,
        action: &str,
        timeout: Duration,
        waiter: Option<oneshot::Sender<PendingResult>>,
    ) -> Result<(), PendingError> {
        let now = Instant::now();
        match self.entries.entry((connection_id, direction, message_id.to_string())) {
            Entry::Occupied(_) => Err(PendingError::Duplicate(message_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    direction,
                    action: action.to_string(),
                    submitted_at: now,
                    deadline: now + timeout,
                    waiter,
                });
                Ok(())
            }
        }
    }

    /// Register a Call sent to the charge point. The receiver yields exactly
    /// one result.
    pub fn register_outbound(
        &self,
        connection_id: u64,
        message_id: &str,
        action: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<PendingResult>, PendingError> {
        let (tx, rx) = oneshot::channel();
        self.insert(connection_id, message_id, Direction::Outbound, action, timeout, Some(tx))?;
        Ok(rx)
    }

    /// Mark an inbound Call as in flight until the returned guard drops.
    pub fn register_inbound(
        &self,
        connection_id: u64,
        message_id: &str,
        action: &str,
    ) -> Result<InboundGuard<'_>, PendingError> {
        self.insert(
            connection_id,
            message_id,
            Direction::Inbound,
            action,
            self.default_timeout,
            None,
        )?;
        Ok(InboundGuard {
            table: self,
            key: (connection_id, Direction::Inbound, message_id.to_string()),
        })
    }

    /// Deliver a CallResult or CallError to the matching outbound request.
    /// Returns the action of the request that was resolved.
    pub fn resolve(
        &self,
        connection_id: u64,
        message_id: &str,
        result: PendingResult,
    ) -> Result<String, PendingError> {
        let key = (connection_id, Direction::Outbound, message_id.to_string());
        let (_, entry) = self
            .entries
            .remove(&key)
            .ok_or_else(|| PendingError::NotFound(message_id.to_string()))?;

        let action = entry.action.clone();
        debug!(
            connection_id,
            message_id,
            action = %action,
            elapsed_ms = entry.submitted_at.elapsed().as_millis() as u64,
            "Pending request resolved"
        );
        entry.deliver(result);
        Ok(action)
    }

    /// Drop an outbound entry whose Call never reached the connection.
    pub fn forget(&self, connection_id: u64, message_id: &str) {
        self.entries
            .remove(&(connection_id, Direction::Outbound, message_id.to_string()));
    }

    /// Fail every request of a closed connection with `Closed`.
    pub fn cancel_connection(&self, connection_id: u64) -> usize {
        let keys: Vec<Key> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == connection_id)
            .map(|e| e.key().clone())
            .collect();

        let mut cancelled = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                entry.deliver(Err(PendingError::Closed));
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(connection_id, cancelled, "Pending requests cancelled");
        }
        cancelled
    }

    /// Evict entries whose deadline has passed and deliver `Timeout` to
    /// their waiters.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<Key> = self
            .entries
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for key in expired {
            // A concurrent resolve may have won in the meantime.
            if let Some((_, entry)) = self.entries.remove_if(&key, |_, e| e.deadline <= now) {
                warn!(
                    connection_id = key.0,
                    message_id = %key.2,
                    action = %entry.action,
                    direction = ?entry.direction,
                    "Pending request timed out"
                );
                entry.deliver(Err(PendingError::Timeout));
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.timeouts.fetch_add(evicted as u64, Ordering::Relaxed);
            metrics::counter!("ocpp_pending_timeouts_total").increment(evicted as u64);
        }
        evicted
    }

    /// Periodic sweep until `cancel` fires.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "Pending request sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_expired(Instant::now());
                }
            }
        }
        info!("Pending request sweeper stopped");
    }

    pub fn contains(&self, connection_id: u64, direction: Direction, message_id: &str) -> bool {
        self.entries
            .contains_key(&(connection_id, direction, message_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

/// Removes an inbound entry when the handler finishes, however it finishes.
pub struct InboundGuard<'a> {
    table: &'a PendingRequests,
    key: Key,
}

impl Drop for InboundGuard<'_> {
    fn drop(&mut self) {
        self.table.entries.remove(&self.key);
    }
}

pub type SharedPendingRequests = Arc<PendingRequests>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> PendingRequests {
        PendingRequests::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn resolve_delivers_payload() {
        let pending = table();
        let rx = pending
            .register_outbound(1, "m1", "Reset", Duration::from_secs(5))
            .unwrap();
        let action = pending.resolve(1, "m1", Ok(json!({"status": "Accepted"}))).unwrap();
        assert_eq!(action, "Reset");
        assert_eq!(rx.await.unwrap().unwrap()["status"], "Accepted");
        assert!(pending.is_empty());
    }

    #[test]
    fn duplicate_registration_keeps_original() {
        let pending = table();
        let _rx = pending
            .register_outbound(1, "m1", "Reset", Duration::from_secs(5))
            .unwrap();
        let err = pending
            .register_outbound(1, "m1", "UnlockConnector", Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err, PendingError::Duplicate("m1".into()));
        assert_eq!(pending.resolve(1, "m1", Ok(json!({}))).unwrap(), "Reset");
    }

    #[test]
    fn same_message_id_on_other_connection_is_independent() {
        let pending = table();
        let _a = pending.register_outbound(1, "m1", "Reset", Duration::from_secs(5)).unwrap();
        let _b = pending.register_outbound(2, "m1", "Reset", Duration::from_secs(5)).unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn unmatched_response_is_not_found() {
        let pending = table();
        assert_eq!(
            pending.resolve(1, "nope", Ok(json!({}))).unwrap_err(),
            PendingError::NotFound("nope".into())
        );
    }

    #[tokio::test]
    async fn timeout_is_delivered_exactly_once() {
        let pending = table();
        let rx = pending.register_outbound(1, "m1", "Reset", Duration::ZERO).unwrap();
        let now = Instant::now();

        assert_eq!(pending.sweep_expired(now), 1);
        assert_eq!(pending.sweep_expired(now), 0);
        assert_eq!(pending.timeouts(), 1);
        assert_eq!(rx.await.unwrap(), Err(PendingError::Timeout));
        // A late response finds nothing.
        assert!(pending.resolve(1, "m1", Ok(json!({}))).is_err());
    }

    #[tokio::test]
    async fn connection_close_fails_waiters() {
        let pending = table();
        let rx = pending.register_outbound(7, "m1", "Reset", Duration::from_secs(5)).unwrap();
        let _other = pending.register_outbound(8, "m1", "Reset", Duration::from_secs(5)).unwrap();

        assert_eq!(pending.cancel_connection(7), 1);
        assert_eq!(rx.await.unwrap(), Err(PendingError::Closed));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn inbound_guard_clears_entry() {
        let pending = table();
        {
            let _guard = pending.register_inbound(1, "in-1", "Heartbeat").unwrap();
            assert!(pending.contains(1, Direction::Inbound, "in-1"));
            assert!(pending.register_inbound(1, "in-1", "Heartbeat").is_err());
        }
        assert!(!pending.contains(1, Direction::Inbound, "in-1"));
    }

    #[test]
    fn inbound_entry_is_not_resolvable_as_response() {
        let pending = table();
        let _guard = pending.register_inbound(1, "in-1", "Heartbeat").unwrap();
        assert!(pending.resolve(1, "in-1", Ok(json!({}))).is_err());
        assert!(pending.contains(1, Direction::Inbound, "in-1"));
    }

    #[tokio::test]
    async fn inbound_call_may_reuse_outstanding_outbound_id() {
        let pending = table();
        let rx = pending
            .register_outbound(1, "42", "Reset", Duration::from_secs(5))
            .unwrap();
        {
            let _guard = pending.register_inbound(1, "42", "Heartbeat").unwrap();
            assert_eq!(pending.len(), 2);
        }
        assert!(pending.contains(1, Direction::Outbound, "42"));
        assert_eq!(pending.resolve(1, "42", Ok(json!({"status": "Accepted"}))).unwrap(), "Reset");
        assert_eq!(rx.await.unwrap().unwrap()["status"], "Accepted");
        assert!(pending.is_empty());
    }
}
