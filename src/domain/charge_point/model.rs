//! Charge Point domain entity

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Connector status on a charge point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectorStatus {
    #[default]
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Connector on a charge point
#[derive(Debug, Clone, Serialize)]
pub struct Connector {
    pub id: u32,
    pub status: ConnectorStatus,
    pub error_code: Option<String>,
    pub info: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Connector {
    pub fn new(id: u32, status: ConnectorStatus) -> Self {
        Self {
            id,
            status,
            error_code: None,
            info: None,
            updated_at: Utc::now(),
        }
    }
}

/// Outcome of applying a StatusNotification to a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// Connector was not known before; created with the reported status.
    Created,
    /// Status differs from the previously known one.
    Changed { old: ConnectorStatus },
    Unchanged,
}

/// Charge Point entity
#[derive(Debug, Clone, Serialize)]
pub struct ChargePoint {
    pub id: String,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub connectors: Vec<Connector>,
    pub first_seen: DateTime<Utc>,
    pub last_boot: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl ChargePoint {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vendor: None,
            model: None,
            serial_number: None,
            firmware_version: None,
            connectors: Vec::new(),
            first_seen: Utc::now(),
            last_boot: None,
            last_heartbeat: None,
        }
    }

    pub fn update_heartbeat(&mut self, at: DateTime<Utc>) {
        self.last_heartbeat = Some(at);
    }

    pub fn get_connector(&self, id: u32) -> Option<&Connector> {
        self.connectors.iter().find(|c| c.id == id)
    }

    pub fn get_connector_mut(&mut self, id: u32) -> Option<&mut Connector> {
        self.connectors.iter_mut().find(|c| c.id == id)
    }

    /// Apply a reported connector status, creating the connector when unknown.
    pub fn update_connector_status(
        &mut self,
        connector_id: u32,
        status: ConnectorStatus,
        error_code: Option<String>,
        info: Option<String>,
    ) -> StatusChange {
        let now = Utc::now();
        match self.get_connector_mut(connector_id) {
            Some(connector) => {
                let old = connector.status;
                connector.status = status;
                connector.error_code = error_code;
                connector.info = info;
                connector.updated_at = now;
                if old == status {
                    StatusChange::Unchanged
                } else {
                    StatusChange::Changed { old }
                }
            }
            None => {
                let mut connector = Connector::new(connector_id, status);
                connector.error_code = error_code;
                connector.info = info;
                self.connectors.push(connector);
                self.connectors.sort_by_key(|c| c.id);
                StatusChange::Created
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_connector_is_created() {
        let mut cp = ChargePoint::new("CP001");
        let change = cp.update_connector_status(2, ConnectorStatus::Preparing, None, None);
        assert_eq!(change, StatusChange::Created);
        assert_eq!(cp.get_connector(2).unwrap().status, ConnectorStatus::Preparing);
    }

    #[test]
    fn status_change_reports_old_status() {
        let mut cp = ChargePoint::new("CP001");
        cp.update_connector_status(1, ConnectorStatus::Available, None, None);
        assert_eq!(
            cp.update_connector_status(1, ConnectorStatus::Charging, None, None),
            StatusChange::Changed {
                old: ConnectorStatus::Available
            }
        );
        assert_eq!(
            cp.update_connector_status(1, ConnectorStatus::Charging, None, None),
            StatusChange::Unchanged
        );
    }

    #[test]
    fn connectors_stay_sorted() {
        let mut cp = ChargePoint::new("CP001");
        cp.update_connector_status(3, ConnectorStatus::Available, None, None);
        cp.update_connector_status(1, ConnectorStatus::Available, None, None);
        let ids: Vec<u32> = cp.connectors.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
