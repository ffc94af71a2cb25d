//! Message dispatcher
//!
//! Routes inbound frames to the protocol handler registered for the
//! connection's negotiated OCPP version. Handlers can be registered and
//! removed while frames are being dispatched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::pending::PendingError;
use crate::domain::OcppVersion;
use crate::support::ocpp_frame::{salvage_message_id, CallErrorCode, FrameError, OcppFrame};

use super::connection::Connection;
use super::manager::ConnectionManager;

/// Per-frame context handed to a protocol handler
#[derive(Clone)]
pub struct DispatchContext {
    pub connection: Arc<Connection>,
    pub cancel: CancellationToken,
}

impl DispatchContext {
    pub fn new(connection: Arc<Connection>) -> Self {
        let cancel = connection.cancel_token().clone();
        Self { connection, cancel }
    }

    pub fn charge_point_id(&self) -> &str {
        self.connection.charge_point_id()
    }

    pub fn connection_id(&self) -> u64 {
        self.connection.id()
    }
}

/// Errors a protocol handler reports for a frame it could not answer.
/// Frames that can be answered with a CallError are not errors here.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("frame rejected: {0}")]
    Frame(#[from] FrameError),

    #[error("uncorrelated response: {0}")]
    Correlation(#[from] PendingError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no protocol handler registered for {0}")]
    NoHandler(OcppVersion),

    /// `reply` is an `InternalError` CallError when the frame was a Call.
    #[error("processing exceeded {after:?}")]
    Timeout {
        after: Duration,
        reply: Option<String>,
    },

    #[error("connection cancelled")]
    Cancelled,

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Contract every protocol version implements
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn version(&self) -> OcppVersion;

    /// Inbound actions this handler answers
    fn supported_actions(&self) -> &'static [&'static str];

    /// Handle one raw frame. `Ok(Some(_))` is an encoded reply for the peer.
    async fn process_message(
        &self,
        ctx: &DispatchContext,
        raw: &str,
    ) -> Result<Option<String>, ProcessError>;

    /// Spawn background work bound to `cancel`.
    fn start(&self, cancel: CancellationToken);

    fn stop(&self);
}

pub struct MessageDispatcher {
    handlers: RwLock<HashMap<OcppVersion, Arc<dyn ProtocolHandler>>>,
    default_version: OcppVersion,
    message_timeout: Duration,
    manager: Arc<ConnectionManager>,
}

impl MessageDispatcher {
    pub fn new(
        manager: Arc<ConnectionManager>,
        default_version: OcppVersion,
        message_timeout: Duration,
    ) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            default_version,
            message_timeout,
            manager,
        }
    }

    pub async fn register(&self, handler: Arc<dyn ProtocolHandler>) {
        let version = handler.version();
        info!(
            %version,
            actions = handler.supported_actions().len(),
            "Registered protocol handler"
        );
        self.handlers.write().await.insert(version, handler);
    }

    pub async fn deregister(&self, version: OcppVersion) -> Option<Arc<dyn ProtocolHandler>> {
        let removed = self.handlers.write().await.remove(&version);
        if removed.is_some() {
            info!(%version, "Deregistered protocol handler");
        }
        removed
    }

    pub async fn registered_versions(&self) -> Vec<OcppVersion> {
        let mut versions: Vec<OcppVersion> = self.handlers.read().await.keys().copied().collect();
        versions.sort_by_key(|v| std::cmp::Reverse(v.rank()));
        versions
    }

    /// Version to route a charge point's frames with: the negotiated one if
    /// it has a handler, otherwise the configured default.
    pub async fn identify_version(&self, charge_point_id: &str) -> OcppVersion {
        match self.manager.version_of(charge_point_id) {
            Some(version) if self.handlers.read().await.contains_key(&version) => version,
            _ => self.default_version,
        }
    }

    /// Route one frame, bounded by the connection's scope and the
    /// per-message timeout.
    pub async fn dispatch(
        &self,
        ctx: &DispatchContext,
        version: OcppVersion,
        raw: &str,
    ) -> Result<Option<String>, DispatchError> {
        let handler = self
            .handlers
            .read()
            .await
            .get(&version)
            .cloned()
            .ok_or(DispatchError::NoHandler(version))?;

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(DispatchError::Cancelled),
            outcome = tokio::time::timeout(self.message_timeout, handler.process_message(ctx, raw)) => {
                match outcome {
                    Ok(result) => result.map_err(DispatchError::from),
                    Err(_) => {
                        warn!(
                            charge_point_id = ctx.charge_point_id(),
                            connection_id = ctx.connection_id(),
                            timeout_ms = self.message_timeout.as_millis() as u64,
                            "Message processing timed out"
                        );
                        Err(DispatchError::Timeout {
                            after: self.message_timeout,
                            reply: timeout_reply(raw, self.message_timeout),
                        })
                    }
                }
            }
        }
    }

    pub async fn start_all(&self, cancel: &CancellationToken) {
        for handler in self.handlers.read().await.values() {
            handler.start(cancel.child_token());
        }
    }

    pub async fn stop_all(&self) {
        for handler in self.handlers.read().await.values() {
            handler.stop();
        }
    }
}

pub type SharedDispatcher = Arc<MessageDispatcher>;

/// CallError answering a Call that ran out of time.
fn timeout_reply(raw: &str, after: Duration) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let message_id = salvage_message_id(&value)?;
    let reply = OcppFrame::error_response(
        message_id,
        CallErrorCode::InternalError,
        format!("Processing exceeded {} ms", after.as_millis()),
    );
    Some(reply.serialize())
}
