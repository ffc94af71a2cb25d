//! In-memory charge point store
//!
//! Process-local view of the charge points that have talked to this gateway
//! instance. Entries are sharded by charge point id.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::model::{ChargePoint, ConnectorStatus, StatusChange};

/// Fields reported by a BootNotification
#[derive(Debug, Clone, Default)]
pub struct BootInfo {
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
}

#[derive(Default)]
pub struct ChargePointStore {
    charge_points: DashMap<String, ChargePoint>,
}

impl ChargePointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a charge point from its BootNotification.
    pub fn record_boot(&self, charge_point_id: &str, boot: BootInfo, at: DateTime<Utc>) {
        let mut entry = self
            .charge_points
            .entry(charge_point_id.to_string())
            .or_insert_with(|| ChargePoint::new(charge_point_id));
        entry.vendor = Some(boot.vendor);
        entry.model = Some(boot.model);
        entry.serial_number = boot.serial_number;
        entry.firmware_version = boot.firmware_version;
        entry.last_boot = Some(at);
    }

    pub fn record_heartbeat(&self, charge_point_id: &str, at: DateTime<Utc>) {
        self.charge_points
            .entry(charge_point_id.to_string())
            .or_insert_with(|| ChargePoint::new(charge_point_id))
            .update_heartbeat(at);
    }

    pub fn update_connector_status(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        status: ConnectorStatus,
        error_code: Option<String>,
        info: Option<String>,
    ) -> StatusChange {
        self.charge_points
            .entry(charge_point_id.to_string())
            .or_insert_with(|| ChargePoint::new(charge_point_id))
            .update_connector_status(connector_id, status, error_code, info)
    }

    pub fn connector_status(&self, charge_point_id: &str, connector_id: u32) -> Option<ConnectorStatus> {
        self.charge_points
            .get(charge_point_id)
            .and_then(|cp| cp.get_connector(connector_id).map(|c| c.status))
    }

    pub fn get(&self, charge_point_id: &str) -> Option<ChargePoint> {
        self.charge_points.get(charge_point_id).map(|cp| cp.clone())
    }

    pub fn count(&self) -> usize {
        self.charge_points.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_then_heartbeat() {
        let store = ChargePointStore::new();
        let now = Utc::now();
        store.record_boot(
            "CP001",
            BootInfo {
                vendor: "Acme".into(),
                model: "X1".into(),
                ..Default::default()
            },
            now,
        );
        store.record_heartbeat("CP001", now);

        let cp = store.get("CP001").unwrap();
        assert_eq!(cp.vendor.as_deref(), Some("Acme"));
        assert_eq!(cp.last_boot, Some(now));
        assert_eq!(cp.last_heartbeat, Some(now));
        assert_eq!(store.count(), 1);
    }
}
