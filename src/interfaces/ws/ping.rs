//! Global ping scheduler
//!
//! A single ticker pings every registered connection, instead of one timer
//! task per connection. Pings go through the connection's send queue like
//! any other frame, so a slow peer only ever costs a skipped ping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::{Connection, ConnectionError, Outbound};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PingStats {
    pub cycles: u64,
    pub sent: u64,
    pub skipped: u64,
    pub registered: usize,
}

/// Result of one scheduler cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingCycle {
    pub sent: usize,
    pub skipped: usize,
    pub removed: usize,
}

pub struct PingScheduler {
    interval: Duration,
    registrations: DashMap<u64, Weak<Connection>>,
    cycles: AtomicU64,
    sent: AtomicU64,
    skipped: AtomicU64,
}

impl PingScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            registrations: DashMap::new(),
            cycles: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn register(&self, connection: &Arc<Connection>) {
        self.registrations
            .insert(connection.id(), Arc::downgrade(connection));
    }

    pub fn deregister(&self, connection_id: u64) {
        self.registrations.remove(&connection_id);
    }

    pub fn registered(&self) -> usize {
        self.registrations.len()
    }

    /// Enqueue one ping per registered connection.
    pub fn tick(&self) -> PingCycle {
        let mut cycle = PingCycle::default();
        let mut gone = Vec::new();

        for entry in self.registrations.iter() {
            let Some(connection) = entry.value().upgrade() else {
                gone.push(*entry.key());
                continue;
            };
            match connection.try_enqueue(Outbound::Ping) {
                Ok(()) => cycle.sent += 1,
                Err(ConnectionError::QueueFull(_)) => {
                    cycle.skipped += 1;
                    debug!(
                        charge_point_id = connection.charge_point_id(),
                        connection_id = connection.id(),
                        "Send queue full, ping skipped"
                    );
                }
                Err(_) => gone.push(*entry.key()),
            }
        }

        for id in gone {
            self.registrations.remove(&id);
            cycle.removed += 1;
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.sent.fetch_add(cycle.sent as u64, Ordering::Relaxed);
        if cycle.skipped > 0 {
            self.skipped.fetch_add(cycle.skipped as u64, Ordering::Relaxed);
            metrics::counter!("ocpp_pings_skipped_total").increment(cycle.skipped as u64);
        }
        cycle
    }

    /// Tick until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        info!(interval_secs = self.interval.as_secs(), "Ping scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let cycle = self.tick();
                    debug!(sent = cycle.sent, skipped = cycle.skipped, removed = cycle.removed, "Ping cycle");
                }
            }
        }
        info!("Ping scheduler stopped");
    }

    pub fn stats(&self) -> PingStats {
        PingStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            registered: self.registrations.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OcppVersion;
    use crate::interfaces::ws::connection::ConnectionState;
    use tokio::sync::mpsc;

    fn live(id: u64, capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (conn, rx) = Connection::new(
            id,
            format!("CP{id}"),
            OcppVersion::V16,
            None,
            capacity,
            CancellationToken::new(),
        );
        conn.transition(ConnectionState::Connected).unwrap();
        (Arc::new(conn), rx)
    }

    #[test]
    fn pings_every_registered_connection() {
        let scheduler = PingScheduler::new(Duration::from_secs(30));
        let (a, mut rx_a) = live(1, 4);
        let (b, mut rx_b) = live(2, 4);
        scheduler.register(&a);
        scheduler.register(&b);

        let cycle = scheduler.tick();
        assert_eq!(cycle.sent, 2);
        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Ping);
        assert_eq!(rx_b.try_recv().unwrap(), Outbound::Ping);
    }

    #[test]
    fn full_queue_is_skipped_not_blocked() {
        let scheduler = PingScheduler::new(Duration::from_secs(30));
        let (a, _rx) = live(1, 1);
        scheduler.register(&a);
        a.send_text("pending frame").unwrap();

        let cycle = scheduler.tick();
        assert_eq!(cycle, PingCycle { sent: 0, skipped: 1, removed: 0 });
        assert_eq!(scheduler.stats().skipped, 1);
        assert_eq!(scheduler.registered(), 1);
    }

    #[test]
    fn closed_and_dropped_connections_are_deregistered() {
        let scheduler = PingScheduler::new(Duration::from_secs(30));
        let (a, _rx_a) = live(1, 4);
        let (b, _rx_b) = live(2, 4);
        scheduler.register(&a);
        scheduler.register(&b);

        a.cancel_token().cancel();
        drop(b);

        let cycle = scheduler.tick();
        assert_eq!(cycle.removed, 2);
        assert_eq!(scheduler.registered(), 0);
    }
}
