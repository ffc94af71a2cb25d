//! In-memory transaction store
//!
//! Transaction ids come from a process-local counter. They are unique for
//! the lifetime of one gateway instance only; a deployment running several
//! instances must move id allocation to shared storage.

use std::sync::atomic::{AtomicI32, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::model::Transaction;

pub struct TransactionStore {
    next_id: AtomicI32,
    transactions: DashMap<i32, Transaction>,
}

impl Default for TransactionStore {
    fn default() -> Self {
        Self {
            next_id: AtomicI32::new(1),
            transactions: DashMap::new(),
        }
    }
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction and return a copy of it.
    pub fn start(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        id_tag: &str,
        meter_start: i32,
        at: DateTime<Utc>,
    ) -> Transaction {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tx = Transaction::new(id, charge_point_id, connector_id, id_tag, meter_start, at);
        self.transactions.insert(id, tx.clone());
        tx
    }

    /// Close an active transaction owned by `charge_point_id`. Returns `None`
    /// when the id is unknown, belongs to another charge point, or the
    /// transaction was already stopped.
    pub fn stop(
        &self,
        charge_point_id: &str,
        transaction_id: i32,
        meter_stop: i32,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Option<Transaction> {
        let mut tx = self.transactions.get_mut(&transaction_id)?;
        if !tx.is_active() || tx.charge_point_id != charge_point_id {
            return None;
        }
        tx.stop(meter_stop, reason, at);
        Some(tx.clone())
    }

    pub fn record_meter_value(
        &self,
        charge_point_id: &str,
        transaction_id: i32,
        energy_wh: f64,
    ) -> bool {
        match self.transactions.get_mut(&transaction_id) {
            Some(mut tx) if tx.is_active() && tx.charge_point_id == charge_point_id => {
                tx.record_meter_value(energy_wh);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, transaction_id: i32) -> Option<Transaction> {
        self.transactions.get(&transaction_id).map(|tx| tx.clone())
    }

    pub fn active_for(&self, charge_point_id: &str) -> Vec<Transaction> {
        self.transactions
            .iter()
            .filter(|tx| tx.charge_point_id == charge_point_id && tx.is_active())
            .map(|tx| tx.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.transactions.iter().filter(|tx| tx.is_active()).count()
    }
}
