//! Domain events
//!
//! Immutable facts emitted by the connection manager and the OCPP processor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event types emitted by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DomainEvent {
    ChargePointConnected(ChargePointConnectedEvent),
    ChargePointDisconnected(ChargePointDisconnectedEvent),
    ConnectionError(ConnectionErrorEvent),
    BootNotification(BootNotificationEvent),
    ConnectorStatusChanged(ConnectorStatusChangedEvent),
    TransactionStarted(TransactionStartedEvent),
    TransactionStopped(TransactionStoppedEvent),
    MeterValuesReceived(MeterValuesEvent),
    HeartbeatReceived(HeartbeatEvent),
    AuthorizationResult(AuthorizationEvent),
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ChargePointConnected(_) => "charge_point_connected",
            Self::ChargePointDisconnected(_) => "charge_point_disconnected",
            Self::ConnectionError(_) => "connection_error",
            Self::BootNotification(_) => "boot_notification",
            Self::ConnectorStatusChanged(_) => "connector_status_changed",
            Self::TransactionStarted(_) => "transaction_started",
            Self::TransactionStopped(_) => "transaction_stopped",
            Self::MeterValuesReceived(_) => "meter_values_received",
            Self::HeartbeatReceived(_) => "heartbeat_received",
            Self::AuthorizationResult(_) => "authorization_result",
        }
    }

    pub fn charge_point_id(&self) -> &str {
        match self {
            Self::ChargePointConnected(e) => &e.charge_point_id,
            Self::ChargePointDisconnected(e) => &e.charge_point_id,
            Self::ConnectionError(e) => &e.charge_point_id,
            Self::BootNotification(e) => &e.charge_point_id,
            Self::ConnectorStatusChanged(e) => &e.charge_point_id,
            Self::TransactionStarted(e) => &e.charge_point_id,
            Self::TransactionStopped(e) => &e.charge_point_id,
            Self::MeterValuesReceived(e) => &e.charge_point_id,
            Self::HeartbeatReceived(e) => &e.charge_point_id,
            Self::AuthorizationResult(e) => &e.charge_point_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargePointConnectedEvent {
    pub charge_point_id: String,
    pub connection_id: u64,
    pub ocpp_version: String,
    pub remote_addr: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargePointDisconnectedEvent {
    pub charge_point_id: String,
    pub connection_id: u64,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionErrorEvent {
    pub charge_point_id: String,
    pub connection_id: Option<u64>,
    pub error_type: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootNotificationEvent {
    pub charge_point_id: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorStatusChangedEvent {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub old_status: String,
    pub new_status: String,
    pub error_code: Option<String>,
    pub info: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionStartedEvent {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub transaction_id: i32,
    pub id_tag: String,
    pub meter_start: i32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionStoppedEvent {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub transaction_id: i32,
    pub id_tag: Option<String>,
    pub meter_start: i32,
    pub meter_stop: i32,
    pub energy_used_kwh: f64,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterValuesEvent {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub transaction_id: Option<i32>,
    pub energy_wh: Option<f64>,
    pub power_w: Option<f64>,
    pub soc: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub charge_point_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationEvent {
    pub charge_point_id: String,
    pub id_tag: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Envelope handed to consumers of the event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DomainEvent,
}

impl EventMessage {
    pub fn new(event: DomainEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event,
        }
    }
}
