//! OCPP 1.6 protocol processor
//!
//! Turns raw OCPP-J frames into validated requests, runs the action
//! handlers and encodes their results. CallResult and CallError frames are
//! correlated with the outbound requests waiting in the pending table.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::events::SharedEventBus;
use crate::application::handlers::ocpp_v16::{
    action_matcher, is_cs_to_cp_action, SUPPORTED_ACTIONS,
};
use crate::application::pending::{PendingError, SharedPendingRequests};
use crate::application::registry::SharedConnectionRegistry;
use crate::domain::{ChargePointStore, OcppVersion, TransactionStore};
use crate::interfaces::ws::dispatcher::{DispatchContext, ProcessError, ProtocolHandler};
use crate::support::ocpp_frame::{salvage_message_id, CallErrorCode, FrameError, OcppFrame};

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Identity written to the connection registry
    pub instance_id: String,
    /// Heartbeat interval returned in BootNotification, in seconds
    pub heartbeat_interval: u32,
    pub max_message_size: usize,
    pub registry_ttl: Duration,
    pub registry_write_timeout: Duration,
    pub pending_sweep_interval: Duration,
    pub blocked_id_tags: HashSet<String>,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            instance_id: "gateway-local".to_string(),
            heartbeat_interval: 300,
            max_message_size: 65_536,
            registry_ttl: Duration::from_secs(900),
            registry_write_timeout: Duration::from_millis(500),
            pending_sweep_interval: Duration::from_secs(1),
            blocked_id_tags: HashSet::new(),
        }
    }
}

/// Processor counters
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ProcessorStats {
    pub frames_parsed: u64,
    pub frames_rejected: u64,
    pub calls_handled: u64,
    pub call_errors_sent: u64,
}

pub struct OcppV16Processor {
    pub(crate) settings: ProcessorSettings,
    pub(crate) charge_points: Arc<ChargePointStore>,
    pub(crate) transactions: Arc<TransactionStore>,
    pub(crate) registry: SharedConnectionRegistry,
    pub(crate) event_bus: SharedEventBus,
    pending: SharedPendingRequests,
    frames_parsed: AtomicU64,
    frames_rejected: AtomicU64,
    calls_handled: AtomicU64,
    call_errors_sent: AtomicU64,
    background: Mutex<Option<CancellationToken>>,
}

impl OcppV16Processor {
    pub fn new(
        settings: ProcessorSettings,
        charge_points: Arc<ChargePointStore>,
        transactions: Arc<TransactionStore>,
        pending: SharedPendingRequests,
        registry: SharedConnectionRegistry,
        event_bus: SharedEventBus,
    ) -> Self {
        Self {
            settings,
            charge_points,
            transactions,
            registry,
            event_bus,
            pending,
            frames_parsed: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
            calls_handled: AtomicU64::new(0),
            call_errors_sent: AtomicU64::new(0),
            background: Mutex::new(None),
        }
    }

    pub fn is_blocked(&self, id_tag: &str) -> bool {
        self.settings.blocked_id_tags.contains(id_tag)
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            frames_parsed: self.frames_parsed.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            calls_handled: self.calls_handled.load(Ordering::Relaxed),
            call_errors_sent: self.call_errors_sent.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, ctx: &DispatchContext, error: FrameError) -> ProcessError {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ocpp_frames_rejected_total").increment(1);
        warn!(
            charge_point_id = ctx.charge_point_id(),
            connection_id = ctx.connection_id(),
            error = %error,
            "Frame rejected"
        );
        ProcessError::Frame(error)
    }

    async fn handle_call(
        &self,
        ctx: &DispatchContext,
        message_id: String,
        action: String,
        payload: Value,
    ) -> OcppFrame {
        let charge_point_id = ctx.charge_point_id();

        if !SUPPORTED_ACTIONS.contains(&action.as_str()) {
            let (code, description) = if is_cs_to_cp_action(&action) {
                (
                    CallErrorCode::NotSupported,
                    format!("{} is sent by the central system, not the charge point", action),
                )
            } else {
                (
                    CallErrorCode::NotImplemented,
                    format!("Unknown action {}", action),
                )
            };
            warn!(charge_point_id, message_id = %message_id, action = %action, "Unsupported action");
            return self.call_error(message_id, code, description);
        }

        let _inflight = match self
            .pending
            .register_inbound(ctx.connection_id(), &message_id, &action)
        {
            Ok(guard) => guard,
            Err(e) => {
                warn!(charge_point_id, message_id = %message_id, error = %e, "Duplicate inbound message id");
                return self.call_error(message_id, CallErrorCode::ProtocolError, e.to_string());
            }
        };

        debug!(charge_point_id, message_id = %message_id, action = %action, "Handling Call");

        match action_matcher(self, ctx, &action, payload).await {
            Ok((response, events)) => {
                self.calls_handled.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ocpp_calls_total", "action" => action.clone(), "outcome" => "ok")
                    .increment(1);
                self.event_bus.publish_all(events);
                OcppFrame::CallResult {
                    message_id,
                    payload: response,
                }
            }
            Err(failure) => {
                metrics::counter!("ocpp_calls_total", "action" => action.clone(), "outcome" => "error")
                    .increment(1);
                warn!(
                    charge_point_id,
                    message_id = %message_id,
                    action = %action,
                    code = %failure.code,
                    description = %failure.description,
                    "Call rejected"
                );
                self.call_error(message_id, failure.code, failure.description)
            }
        }
    }

    fn call_error(&self, message_id: String, code: CallErrorCode, description: String) -> OcppFrame {
        self.call_errors_sent.fetch_add(1, Ordering::Relaxed);
        OcppFrame::error_response(message_id, code, description)
    }

    fn correlate(
        &self,
        ctx: &DispatchContext,
        message_id: &str,
        result: Result<Value, PendingError>,
    ) -> Result<(), ProcessError> {
        match self.pending.resolve(ctx.connection_id(), message_id, result) {
            Ok(action) => {
                debug!(
                    charge_point_id = ctx.charge_point_id(),
                    message_id,
                    action = %action,
                    "Response correlated"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    charge_point_id = ctx.charge_point_id(),
                    message_id,
                    error = %e,
                    "Response does not match any outstanding request"
                );
                Err(ProcessError::Correlation(e))
            }
        }
    }
}

#[async_trait]
impl ProtocolHandler for OcppV16Processor {
    fn version(&self) -> OcppVersion {
        OcppVersion::V16
    }

    fn supported_actions(&self) -> &'static [&'static str] {
        SUPPORTED_ACTIONS
    }

    async fn process_message(
        &self,
        ctx: &DispatchContext,
        raw: &str,
    ) -> Result<Option<String>, ProcessError> {
        let limit = self.settings.max_message_size;
        if raw.len() > limit {
            return Err(self.reject(
                ctx,
                FrameError::TooLarge {
                    size: raw.len(),
                    limit,
                },
            ));
        }

        self.frames_parsed.fetch_add(1, Ordering::Relaxed);
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => return Err(self.reject(ctx, FrameError::InvalidJson(e.to_string()))),
        };
        let salvaged_id = salvage_message_id(&value);

        let frame = match OcppFrame::from_value(value) {
            Ok(frame) => frame,
            Err(e) => {
                let error = self.reject(ctx, e.clone());
                return match salvaged_id {
                    Some(message_id) => Ok(Some(
                        self.call_error(message_id, CallErrorCode::FormationViolation, e.to_string())
                            .serialize(),
                    )),
                    None => Err(error),
                };
            }
        };

        match frame {
            OcppFrame::Call {
                message_id,
                action,
                payload,
            } => {
                let reply = self.handle_call(ctx, message_id, action, payload).await;
                Ok(Some(reply.serialize()))
            }
            OcppFrame::CallResult {
                message_id,
                payload,
            } => {
                self.correlate(ctx, &message_id, Ok(payload))?;
                Ok(None)
            }
            OcppFrame::CallError {
                message_id,
                error_code,
                error_description,
                ..
            } => {
                self.correlate(
                    ctx,
                    &message_id,
                    Err(PendingError::CallError {
                        code: error_code,
                        description: error_description,
                    }),
                )?;
                Ok(None)
            }
        }
    }

    fn start(&self, cancel: CancellationToken) {
        let mut guard = match self.background.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return;
        }
        tokio::spawn(
            self.pending
                .clone()
                .run_sweeper(self.settings.pending_sweep_interval, cancel.clone()),
        );
        *guard = Some(cancel);
        info!(version = %OcppVersion::V16, "Protocol handler started");
    }

    fn stop(&self) {
        let token = match self.background.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(token) = token {
            token.cancel();
            info!(version = %OcppVersion::V16, "Protocol handler stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::events::EventBus;
    use crate::application::pending::PendingRequests;
    use crate::application::registry::{
        ConnectionRegistry, InMemoryConnectionRegistry, RegistryError,
    };
    use crate::domain::events::EventMessage;
    use crate::domain::ConnectorStatus;
    use crate::interfaces::ws::connection::{Connection, ConnectionState};
    use serde_json::json;
    use tokio::sync::mpsc;

    /// In-memory registry that remembers every write.
    #[derive(Default)]
    struct RecordingRegistry {
        inner: InMemoryConnectionRegistry,
        writes: Mutex<Vec<(String, String, Duration)>>,
    }

    #[async_trait]
    impl ConnectionRegistry for RecordingRegistry {
        async fn set_connection(
            &self,
            charge_point_id: &str,
            instance_id: &str,
            ttl: Duration,
        ) -> Result<(), RegistryError> {
            self.writes.lock().unwrap().push((
                charge_point_id.to_string(),
                instance_id.to_string(),
                ttl,
            ));
            self.inner.set_connection(charge_point_id, instance_id, ttl).await
        }

        async fn get_connection(&self, charge_point_id: &str) -> Result<Option<String>, RegistryError> {
            self.inner.get_connection(charge_point_id).await
        }

        async fn delete_connection(&self, charge_point_id: &str) -> Result<(), RegistryError> {
            self.inner.delete_connection(charge_point_id).await
        }
    }

    struct Harness {
        processor: OcppV16Processor,
        ctx: DispatchContext,
        events: mpsc::Receiver<EventMessage>,
        registry: Arc<RecordingRegistry>,
        pending: SharedPendingRequests,
    }

    fn context(connection_id: u64, charge_point_id: &str) -> DispatchContext {
        let (connection, _rx) = Connection::new(
            connection_id,
            charge_point_id,
            OcppVersion::V16,
            None,
            16,
            CancellationToken::new(),
        );
        connection.transition(ConnectionState::Connected).unwrap();
        DispatchContext::new(Arc::new(connection))
    }

    fn harness_with(settings: ProcessorSettings) -> Harness {
        let bus = Arc::new(EventBus::with_capacity(64));
        let events = bus.take_receiver().unwrap();
        let registry = Arc::new(RecordingRegistry::default());
        let pending = Arc::new(PendingRequests::new(Duration::from_secs(30)));
        let processor = OcppV16Processor::new(
            settings,
            Arc::new(ChargePointStore::new()),
            Arc::new(TransactionStore::new()),
            pending.clone(),
            registry.clone(),
            bus,
        );
        Harness {
            processor,
            ctx: context(7, "CP001"),
            events,
            registry,
            pending,
        }
    }

    fn harness() -> Harness {
        harness_with(ProcessorSettings {
            instance_id: "gw-1".into(),
            ..Default::default()
        })
    }

    async fn call(h: &Harness, frame: Value) -> Value {
        call_as(h, &h.ctx, frame).await
    }

    async fn call_as(h: &Harness, ctx: &DispatchContext, frame: Value) -> Value {
        let reply = h
            .processor
            .process_message(ctx, &frame.to_string())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    fn drain(h: &mut Harness) -> Vec<EventMessage> {
        let mut out = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn boot_notification_registers_charge_point() {
        let mut h = harness();
        let reply = call(
            &h,
            json!([2, "boot-1", "BootNotification", {"chargePointVendor": "Acme", "chargePointModel": "X1"}]),
        )
        .await;

        assert_eq!(reply[0], 3);
        assert_eq!(reply[1], "boot-1");
        assert_eq!(reply[2]["status"], "Accepted");
        assert_eq!(reply[2]["interval"], 300);
        assert!(reply[2]["currentTime"].is_string());

        assert_eq!(h.ctx.connection.state(), ConnectionState::Registered);
        assert_eq!(
            h.registry.get_connection("CP001").await.unwrap().as_deref(),
            Some("gw-1")
        );
        let writes = h.registry.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "CP001");
        assert_eq!(writes[0].1, "gw-1");
        assert!(writes[0].2 > Duration::ZERO);

        let events = drain(&mut h);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.event_type(), "boot_notification");
    }

    #[tokio::test]
    async fn heartbeat_returns_current_time() {
        let mut h = harness();
        let reply = call(&h, json!([2, "hb-1", "Heartbeat", {}])).await;
        assert_eq!(reply[0], 3);
        assert!(reply[2]["currentTime"].as_str().unwrap().ends_with('Z'));
        assert_eq!(drain(&mut h)[0].event.event_type(), "heartbeat_received");
        assert!(h.processor.charge_points.get("CP001").unwrap().last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn status_notification_emits_only_on_change() {
        let mut h = harness();
        let status = |id: &str, status: &str| {
            json!([2, id, "StatusNotification", {"connectorId": 1, "errorCode": "NoError", "status": status}])
        };

        call(&h, status("s1", "Available")).await;
        assert!(drain(&mut h).is_empty());

        call(&h, status("s2", "Charging")).await;
        let events = drain(&mut h);
        assert_eq!(events.len(), 1);
        let json = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(json["data"]["old_status"], "Available");
        assert_eq!(json["data"]["new_status"], "Charging");

        call(&h, status("s3", "Charging")).await;
        assert!(drain(&mut h).is_empty());
        assert_eq!(
            h.processor.charge_points.connector_status("CP001", 1),
            Some(ConnectorStatus::Charging)
        );
    }

    #[tokio::test]
    async fn transaction_energy_in_kwh() {
        let mut h = harness();
        let started = call(
            &h,
            json!([2, "st-1", "StartTransaction", {"connectorId": 1, "idTag": "TAG1", "meterStart": 1000, "timestamp": "2024-01-01T10:00:00Z"}]),
        )
        .await;
        assert_eq!(started[2]["idTagInfo"]["status"], "Accepted");
        let transaction_id = started[2]["transactionId"].as_i64().unwrap();

        let stopped = call(
            &h,
            json!([2, "sp-1", "StopTransaction", {"transactionId": transaction_id, "meterStop": 13500, "timestamp": "2024-01-01T11:00:00Z", "idTag": "TAG1"}]),
        )
        .await;
        assert_eq!(stopped[0], 3);

        let events = drain(&mut h);
        let stop = events
            .iter()
            .find(|e| e.event.event_type() == "transaction_stopped")
            .unwrap();
        let json = serde_json::to_value(stop).unwrap();
        assert_eq!(json["data"]["energy_used_kwh"], 12.5);
    }

    #[tokio::test]
    async fn five_thousand_wh_is_five_kwh() {
        let mut h = harness();
        let started = call(
            &h,
            json!([2, "st-1", "StartTransaction", {"connectorId": 2, "idTag": "TAG1", "meterStart": 1000, "timestamp": "2024-01-01T10:00:00Z"}]),
        )
        .await;
        let transaction_id = started[2]["transactionId"].as_i64().unwrap();

        call(
            &h,
            json!([2, "sp-1", "StopTransaction", {"transactionId": transaction_id, "meterStop": 6000, "timestamp": "2024-01-01T11:00:00Z"}]),
        )
        .await;

        let events = drain(&mut h);
        let stop = events
            .iter()
            .find(|e| e.event.event_type() == "transaction_stopped")
            .unwrap();
        let json = serde_json::to_value(stop).unwrap();
        assert_eq!(json["data"]["meter_stop"], 6000);
        assert_eq!(json["data"]["energy_used_kwh"], 5.0);
    }

    #[tokio::test]
    async fn stop_from_other_charge_point_is_ignored() {
        let mut h = harness();
        let other = context(8, "CP002");

        let started = call(
            &h,
            json!([2, "st-1", "StartTransaction", {"connectorId": 1, "idTag": "TAG1", "meterStart": 0, "timestamp": "2024-01-01T10:00:00Z"}]),
        )
        .await;
        let transaction_id = started[2]["transactionId"].as_i64().unwrap();
        drain(&mut h);

        let reply = call_as(
            &h,
            &other,
            json!([2, "sp-1", "StopTransaction", {"transactionId": transaction_id, "meterStop": 500, "timestamp": "2024-01-01T11:00:00Z"}]),
        )
        .await;
        assert_eq!(reply[0], 3);
        assert!(drain(&mut h).is_empty());

        let tx = h.processor.transactions.get(transaction_id as i32).unwrap();
        assert!(tx.is_active());
        assert_eq!(tx.charge_point_id, "CP001");

        call(
            &h,
            json!([2, "sp-2", "StopTransaction", {"transactionId": transaction_id, "meterStop": 500, "timestamp": "2024-01-01T11:00:00Z"}]),
        )
        .await;
        let events = drain(&mut h);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.charge_point_id(), "CP001");
    }

    #[tokio::test]
    async fn unknown_transaction_stop_emits_nothing() {
        let mut h = harness();
        let reply = call(
            &h,
            json!([2, "sp-1", "StopTransaction", {"transactionId": 999, "meterStop": 10, "timestamp": "2024-01-01T11:00:00Z"}]),
        )
        .await;
        assert_eq!(reply[0], 3);
        assert!(drain(&mut h).is_empty());
    }

    #[tokio::test]
    async fn blocked_id_tag_is_reported() {
        let mut settings = ProcessorSettings::default();
        settings.blocked_id_tags.insert("BAD".into());
        let h = harness_with(settings);
        let reply = call(&h, json!([2, "a-1", "Authorize", {"idTag": "BAD"}])).await;
        assert_eq!(reply[2]["idTagInfo"]["status"], "Blocked");
        let reply = call(&h, json!([2, "a-2", "Authorize", {"idTag": "GOOD"}])).await;
        assert_eq!(reply[2]["idTagInfo"]["status"], "Accepted");
    }

    #[tokio::test]
    async fn unknown_and_central_system_actions() {
        let h = harness();
        let reply = call(&h, json!([2, "x-1", "FlyToMoon", {}])).await;
        assert_eq!(reply[0], 4);
        assert_eq!(reply[2], "NotImplemented");
        assert_eq!(reply[4], json!({}));

        let reply = call(&h, json!([2, "x-2", "RemoteStartTransaction", {"idTag": "T"}])).await;
        assert_eq!(reply[2], "NotSupported");
    }

    #[tokio::test]
    async fn validation_failure_is_call_error_with_same_id() {
        let mut h = harness();
        let reply = call(&h, json!([2, "v-1", "Authorize", {"idTag": "X".repeat(30)}])).await;
        assert_eq!(reply[0], 4);
        assert_eq!(reply[1], "v-1");
        assert_eq!(reply[2], "PropertyConstraintViolation");
        assert!(drain(&mut h).is_empty());
        assert!(h.pending.is_empty());
    }

    #[tokio::test]
    async fn malformed_call_with_readable_id_gets_formation_violation() {
        let h = harness();
        let reply = call(&h, json!([2, "f-1", "Heartbeat"])).await;
        assert_eq!(reply[1], "f-1");
        assert_eq!(reply[2], "FormationViolation");
    }

    #[tokio::test]
    async fn unknown_message_type_has_no_side_effects() {
        let mut h = harness();
        let err = h
            .processor
            .process_message(&h.ctx, r#"[7,"id","Heartbeat",{}]"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Frame(FrameError::UnknownMessageType(7))));
        assert!(drain(&mut h).is_empty());
        assert_eq!(h.processor.stats().calls_handled, 0);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_parsing() {
        let h = harness_with(ProcessorSettings {
            max_message_size: 16,
            ..Default::default()
        });
        let raw = json!([2, "big", "DataTransfer", {"vendorId": "V".repeat(64)}]).to_string();
        let err = h.processor.process_message(&h.ctx, &raw).await.unwrap_err();
        assert!(matches!(err, ProcessError::Frame(FrameError::TooLarge { .. })));
        assert_eq!(h.processor.stats().frames_parsed, 0);
    }

    #[tokio::test]
    async fn call_result_resolves_outbound_request() {
        let h = harness();
        let rx = h
            .pending
            .register_outbound(h.ctx.connection_id(), "cs-1", "Reset", Duration::from_secs(5))
            .unwrap();

        let reply = h
            .processor
            .process_message(&h.ctx, r#"[3,"cs-1",{"status":"Accepted"}]"#)
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(rx.await.unwrap().unwrap()["status"], "Accepted");
    }

    #[tokio::test]
    async fn call_error_resolves_with_error() {
        let h = harness();
        let rx = h
            .pending
            .register_outbound(h.ctx.connection_id(), "cs-2", "Reset", Duration::from_secs(5))
            .unwrap();
        h.processor
            .process_message(&h.ctx, r#"[4,"cs-2","NotSupported","nope",{}]"#)
            .await
            .unwrap();
        assert_eq!(
            rx.await.unwrap(),
            Err(PendingError::CallError {
                code: "NotSupported".into(),
                description: "nope".into()
            })
        );
    }

    #[tokio::test]
    async fn uncorrelated_response_is_an_error_without_reply() {
        let h = harness();
        let err = h
            .processor
            .process_message(&h.ctx, r#"[3,"ghost",{}]"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Correlation(PendingError::NotFound(_))));
    }

    #[tokio::test]
    async fn meter_values_extract_energy_power_soc() {
        let mut h = harness();
        call(
            &h,
            json!([2, "mv-1", "MeterValues", {
                "connectorId": 1,
                "meterValue": [{
                    "timestamp": "2024-01-01T10:30:00Z",
                    "sampledValue": [
                        {"value": "2.5", "measurand": "Energy.Active.Import.Register", "unit": "kWh"},
                        {"value": "7.2", "measurand": "Power.Active.Import", "unit": "kW"},
                        {"value": "64", "measurand": "SoC", "unit": "Percent"}
                    ]
                }]
            }]),
        )
        .await;

        let events = drain(&mut h);
        let json = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(json["type"], "MeterValuesReceived");
        assert_eq!(json["data"]["energy_wh"], 2500.0);
        assert_eq!(json["data"]["power_w"], 7200.0);
        assert_eq!(json["data"]["soc"], 64.0);
    }
}
