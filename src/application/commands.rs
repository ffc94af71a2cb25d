//! Command sender for Central System to Charge Point communication
//!
//! Encodes a Call, hands it to the charge point's send queue and waits for
//! the correlated CallResult or CallError.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::application::pending::{PendingError, SharedPendingRequests};
use crate::application::registry::{RegistryError, SharedConnectionRegistry};
use crate::interfaces::ws::manager::SharedConnectionManager;
use crate::support::ocpp_frame::OcppFrame;

/// Command sender errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("charge point not connected: {0}")]
    NotConnected(String),

    #[error("charge point {charge_point_id} is connected to instance {instance_id}")]
    RemoteInstance {
        charge_point_id: String,
        instance_id: String,
    },

    #[error("failed to send: {0}")]
    SendFailed(String),

    #[error("response timeout")]
    Timeout,

    #[error("CallError {code}: {description}")]
    CallError { code: String, description: String },

    #[error("connection closed before a response arrived")]
    Closed,

    #[error("message id already in flight: {0}")]
    Duplicate(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<PendingError> for CommandError {
    fn from(error: PendingError) -> Self {
        match error {
            PendingError::Timeout => Self::Timeout,
            PendingError::Closed => Self::Closed,
            PendingError::CallError { code, description } => Self::CallError { code, description },
            PendingError::Duplicate(id) => Self::Duplicate(id),
            PendingError::NotFound(id) => Self::SendFailed(format!("request {} vanished", id)),
        }
    }
}

/// Command sender for sending OCPP commands to charge points
pub struct CommandSender {
    manager: SharedConnectionManager,
    pending: SharedPendingRequests,
    registry: SharedConnectionRegistry,
    instance_id: String,
    timeout: Duration,
}

impl CommandSender {
    pub fn new(
        manager: SharedConnectionManager,
        pending: SharedPendingRequests,
        registry: SharedConnectionRegistry,
        instance_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            manager,
            pending,
            registry,
            instance_id: instance_id.into(),
            timeout,
        }
    }

    /// Send a command to a charge point and wait for its response payload.
    pub async fn send_command(
        &self,
        charge_point_id: &str,
        action: &str,
        payload: Value,
    ) -> Result<Value, CommandError> {
        let Some(connection) = self
            .manager
            .get(charge_point_id)
            .filter(|c| c.is_active())
        else {
            return Err(self.locate(charge_point_id).await);
        };

        let connection_id = connection.id();
        let message_id = uuid::Uuid::new_v4().to_string();
        let rx = self
            .pending
            .register_outbound(connection_id, &message_id, action, self.timeout)?;

        let frame = OcppFrame::Call {
            message_id: message_id.clone(),
            action: action.to_string(),
            payload,
        };

        if let Err(e) = self.manager.send(charge_point_id, frame.serialize()) {
            self.pending.forget(connection_id, &message_id);
            warn!(charge_point_id, action, message_id = %message_id, error = %e, "Command not sent");
            return Err(CommandError::SendFailed(e.to_string()));
        }

        info!(charge_point_id, action, message_id = %message_id, "Command sent");

        // The pending sweeper delivers Timeout; the outer bound only covers a
        // sweeper that is not running.
        let grace = self.timeout + Duration::from_secs(1);
        match tokio::time::timeout(grace, rx).await {
            Ok(Ok(result)) => result.map_err(CommandError::from),
            Ok(Err(_)) => Err(CommandError::Closed),
            Err(_) => {
                self.pending.forget(connection_id, &message_id);
                warn!(charge_point_id, action, message_id = %message_id, "Command timed out");
                Err(CommandError::Timeout)
            }
        }
    }

    async fn locate(&self, charge_point_id: &str) -> CommandError {
        match self.registry.get_connection(charge_point_id).await {
            Ok(Some(instance_id)) if instance_id != self.instance_id => CommandError::RemoteInstance {
                charge_point_id: charge_point_id.to_string(),
                instance_id,
            },
            Ok(_) => CommandError::NotConnected(charge_point_id.to_string()),
            Err(e) => CommandError::Registry(e),
        }
    }
}

pub type SharedCommandSender = Arc<CommandSender>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::events::EventBus;
    use crate::application::pending::PendingRequests;
    use crate::application::registry::{ConnectionRegistry, InMemoryConnectionRegistry};
    use crate::domain::OcppVersion;
    use crate::interfaces::ws::connection::Outbound;
    use crate::interfaces::ws::manager::{ConnectionManager, ManagerSettings, UpgradeRequest};
    use crate::interfaces::ws::negotiator::ProtocolNegotiator;
    use crate::interfaces::ws::ping::PingScheduler;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct Setup {
        sender: Arc<CommandSender>,
        manager: SharedConnectionManager,
        pending: SharedPendingRequests,
        registry: Arc<InMemoryConnectionRegistry>,
    }

    fn setup(timeout: Duration) -> Setup {
        let manager = Arc::new(ConnectionManager::new(
            ManagerSettings::default(),
            ProtocolNegotiator::new(vec![OcppVersion::V16], OcppVersion::V16),
            Arc::new(PingScheduler::new(Duration::from_secs(30))),
            Arc::new(EventBus::new()),
            CancellationToken::new(),
        ));
        let pending = Arc::new(PendingRequests::new(Duration::from_secs(30)));
        let registry = Arc::new(InMemoryConnectionRegistry::new());
        let sender = Arc::new(CommandSender::new(
            manager.clone(),
            pending.clone(),
            registry.clone(),
            "gw-1",
            timeout,
        ));
        Setup {
            sender,
            manager,
            pending,
            registry,
        }
    }

    fn message_id_of(frame: &Outbound) -> String {
        match frame {
            Outbound::Text(text) => {
                let value: Value = serde_json::from_str(text).unwrap();
                assert_eq!(value[0], 2);
                value[1].as_str().unwrap().to_string()
            }
            Outbound::Ping => panic!("expected a text frame"),
        }
    }

    #[tokio::test]
    async fn round_trip_through_pending_table() {
        let s = setup(Duration::from_secs(5));
        let mut accepted = s
            .manager
            .accept(UpgradeRequest {
                charge_point_id: "CP001".into(),
                ..Default::default()
            })
            .unwrap();
        let connection_id = accepted.connection.id();

        let sender = s.sender.clone();
        let task = tokio::spawn(async move {
            sender
                .send_command("CP001", "Reset", json!({"type": "Soft"}))
                .await
        });

        let frame = accepted.outbound.recv().await.unwrap();
        let message_id = message_id_of(&frame);
        s.pending
            .resolve(connection_id, &message_id, Ok(json!({"status": "Accepted"})))
            .unwrap();

        let response = task.await.unwrap().unwrap();
        assert_eq!(response["status"], "Accepted");
        assert!(s.pending.is_empty());
    }

    #[tokio::test]
    async fn unknown_charge_point_is_not_connected() {
        let s = setup(Duration::from_secs(1));
        let err = s
            .sender
            .send_command("CP404", "Reset", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::NotConnected("CP404".into()));
    }

    #[tokio::test]
    async fn charge_point_on_other_instance_is_reported() {
        let s = setup(Duration::from_secs(1));
        s.registry
            .set_connection("CP002", "gw-2", Duration::from_secs(60))
            .await
            .unwrap();
        let err = s
            .sender
            .send_command("CP002", "Reset", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::RemoteInstance { ref instance_id, .. } if instance_id == "gw-2"));
    }

    #[tokio::test]
    async fn closed_connection_fails_waiter() {
        let s = setup(Duration::from_secs(5));
        let mut accepted = s
            .manager
            .accept(UpgradeRequest {
                charge_point_id: "CP003".into(),
                ..Default::default()
            })
            .unwrap();
        let connection_id = accepted.connection.id();

        let sender = s.sender.clone();
        let task = tokio::spawn(async move { sender.send_command("CP003", "ClearCache", json!({})).await });

        accepted.outbound.recv().await.unwrap();
        assert_eq!(s.pending.cancel_connection(connection_id), 1);
        assert_eq!(task.await.unwrap().unwrap_err(), CommandError::Closed);
    }

    #[tokio::test]
    async fn no_response_times_out() {
        let s = setup(Duration::from_millis(20));
        let _accepted = s
            .manager
            .accept(UpgradeRequest {
                charge_point_id: "CP004".into(),
                ..Default::default()
            })
            .unwrap();
        tokio::spawn(
            s.pending
                .clone()
                .run_sweeper(Duration::from_millis(5), CancellationToken::new()),
        );
        let err = s
            .sender
            .send_command("CP004", "Reset", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::Timeout);
        assert!(s.pending.is_empty());
    }
}
