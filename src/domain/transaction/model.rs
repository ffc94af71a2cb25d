//! Transaction domain entity

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionStatus {
    Active,
    Completed,
}

/// Charging session started by a StartTransaction
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: i32,
    pub charge_point_id: String,
    pub connector_id: u32,
    pub id_tag: String,
    /// Meter reading in Wh at start
    pub meter_start: i32,
    pub meter_stop: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    pub status: TransactionStatus,
    /// Last Energy.Active.Import.Register sample in Wh
    pub last_meter_value: Option<f64>,
    pub last_meter_update: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn new(
        id: i32,
        charge_point_id: impl Into<String>,
        connector_id: u32,
        id_tag: impl Into<String>,
        meter_start: i32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            charge_point_id: charge_point_id.into(),
            connector_id,
            id_tag: id_tag.into(),
            meter_start,
            meter_stop: None,
            started_at,
            stopped_at: None,
            stop_reason: None,
            status: TransactionStatus::Active,
            last_meter_value: None,
            last_meter_update: None,
        }
    }

    pub fn stop(&mut self, meter_stop: i32, reason: Option<String>, at: DateTime<Utc>) {
        self.meter_stop = Some(meter_stop);
        self.stopped_at = Some(at);
        self.stop_reason = reason;
        self.status = TransactionStatus::Completed;
    }

    pub fn record_meter_value(&mut self, energy_wh: f64) {
        self.last_meter_value = Some(energy_wh);
        self.last_meter_update = Some(Utc::now());
    }

    /// Energy consumed in Wh
    pub fn energy_consumed(&self) -> Option<i32> {
        self.meter_stop.map(|stop| stop.saturating_sub(self.meter_start))
    }

    pub fn energy_consumed_kwh(&self) -> Option<f64> {
        self.energy_consumed().map(|wh| wh as f64 / 1000.0)
    }

    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction::new(1, "CP001", 1, "TAG-001", 1000, Utc::now())
    }

    #[test]
    fn new_transaction_is_active() {
        let tx = sample_tx();
        assert!(tx.is_active());
        assert!(tx.meter_stop.is_none());
        assert!(tx.energy_consumed().is_none());
    }

    #[test]
    fn stop_computes_energy() {
        let mut tx = sample_tx();
        tx.stop(13_500, Some("Local".into()), Utc::now());
        assert!(!tx.is_active());
        assert_eq!(tx.energy_consumed(), Some(12_500));
        assert_eq!(tx.energy_consumed_kwh(), Some(12.5));
        assert_eq!(tx.stop_reason.as_deref(), Some("Local"));
    }
}
