//! Reusable OCPP gateway server runtime.
//!
//! Provides [`ServerHandle`] that encapsulates the full server lifecycle:
//! protocol handlers, OCPP WebSocket server, operational HTTP API, background
//! sweepers, metrics, and graceful shutdown.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::application::events::{create_event_bus, SharedEventBus};
use crate::application::handlers::{OcppV16Processor, ProcessorSettings};
use crate::application::pending::{PendingRequests, SharedPendingRequests};
use crate::application::registry::{InMemoryConnectionRegistry, SharedConnectionRegistry};
use crate::application::{CommandSender, SharedCommandSender};
use crate::config::{AppConfig, ConfigError};
use crate::domain::events::EventMessage;
use crate::domain::{ChargePointStore, OcppVersion, TransactionStore};
use crate::interfaces::http::{create_api_router, ApiState};
use crate::interfaces::ws::{
    ConnectionManager, ManagerSettings, MessageDispatcher, OcppServer, PingScheduler,
    ProtocolNegotiator, SharedConnectionManager, SharedDispatcher,
};
use crate::support::shutdown::{ShutdownCoordinator, ShutdownSignal};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Options ────────────────────────────────────────────────────────

/// Options for starting the gateway.
pub struct ServerOptions {
    /// Application configuration.
    pub config: AppConfig,
    /// Install the global Prometheus recorder (default: true).
    pub install_metrics: bool,
    /// External connection registry. Defaults to the in-memory one.
    pub registry: Option<SharedConnectionRegistry>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            config: AppConfig::default(),
            install_metrics: true,
            registry: None,
        }
    }
}

// ── ServerHandle ───────────────────────────────────────────────────

/// Handle to a running gateway.
///
/// # Examples
///
/// ```rust,no_run
/// use ocpp_gateway::server::{ServerHandle, ServerOptions};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let handle = ServerHandle::start(ServerOptions::default()).await?;
///     let mut events = handle.take_events().expect("first caller");
///     tokio::spawn(async move {
///         while let Some(event) = events.recv().await {
///             println!("{}", event.event.event_type());
///         }
///     });
///     handle.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct ServerHandle {
    /// Domain event stream.
    pub event_bus: SharedEventBus,
    /// Live connection table.
    pub manager: SharedConnectionManager,
    /// Central system to charge point commands.
    pub commands: SharedCommandSender,
    pub charge_points: Arc<ChargePointStore>,
    pub transactions: Arc<TransactionStore>,
    pub registry: SharedConnectionRegistry,
    /// The configuration the server was started with.
    pub config: AppConfig,
    /// Address the WebSocket server is listening on.
    pub ws_addr: SocketAddr,
    /// Address the HTTP API is listening on.
    pub api_addr: SocketAddr,

    shutdown: ShutdownCoordinator,
    dispatcher: SharedDispatcher,
    connection_tasks: TaskTracker,
    connections_root: CancellationToken,
    background: TaskTracker,
    background_cancel: CancellationToken,
    ws_task: tokio::task::JoinHandle<()>,
    api_task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Start the gateway with the given options.
    ///
    /// This will:
    /// 1. Validate the configuration and install the metrics recorder
    /// 2. Register the OCPP 1.6 protocol handler
    /// 3. Start the ping scheduler, idle sweeper and pending sweeper
    /// 4. Start the OCPP WebSocket server
    /// 5. Start the HTTP API
    pub async fn start(opts: ServerOptions) -> Result<Self, ServerError> {
        let app_cfg = opts.config;
        app_cfg.check()?;
        let gw = &app_cfg.gateway;

        info!(instance_id = %app_cfg.server.instance_id, "Starting OCPP gateway...");

        let prometheus = if opts.install_metrics {
            prometheus_handle()
        } else {
            None
        };

        // ── Shared state ───────────────────────────────────────
        let shutdown = ShutdownCoordinator::new(app_cfg.server.shutdown_timeout);
        let shutdown_signal = shutdown.signal();
        let connections_root = CancellationToken::new();
        let background_cancel = CancellationToken::new();

        let event_bus = create_event_bus(gw.event_queue_capacity);
        let registry: SharedConnectionRegistry = match opts.registry {
            Some(registry) => registry,
            None => Arc::new(InMemoryConnectionRegistry::new()),
        };
        let pending: SharedPendingRequests = Arc::new(PendingRequests::new(gw.pending_timeout()));
        let charge_points = Arc::new(ChargePointStore::new());
        let transactions = Arc::new(TransactionStore::new());

        // ── Protocol handlers ──────────────────────────────────
        let processor = Arc::new(OcppV16Processor::new(
            ProcessorSettings {
                instance_id: app_cfg.server.instance_id.clone(),
                heartbeat_interval: gw.heartbeat_interval,
                max_message_size: gw.max_message_size,
                registry_ttl: gw.registry_ttl(),
                registry_write_timeout: gw.registry_write_timeout(),
                pending_sweep_interval: gw.pending_sweep_interval(),
                blocked_id_tags: gw.blocked_id_tags.iter().cloned().collect(),
            },
            charge_points.clone(),
            transactions.clone(),
            pending.clone(),
            registry.clone(),
            event_bus.clone(),
        ));

        let handled = [OcppVersion::V16];
        let mut default_version = gw.default_version();
        if !handled.contains(&default_version) {
            warn!(
                configured = %default_version,
                "No protocol handler for the configured default version, using OCPP 1.6"
            );
            default_version = OcppVersion::V16;
        }

        // ── Connection management ──────────────────────────────
        let ping = Arc::new(PingScheduler::new(gw.ping_interval()));
        let manager = Arc::new(ConnectionManager::new(
            ManagerSettings {
                max_connections: gw.max_connections,
                send_queue_capacity: gw.send_queue_capacity,
                idle_timeout: gw.idle_timeout(),
                require_auth: app_cfg.security.require_auth,
                credentials: app_cfg.security.charge_points.clone(),
            },
            ProtocolNegotiator::new(handled.to_vec(), default_version),
            ping.clone(),
            event_bus.clone(),
            connections_root.clone(),
        ));

        let dispatcher = Arc::new(MessageDispatcher::new(
            manager.clone(),
            default_version,
            gw.message_timeout(),
        ));
        dispatcher.register(processor.clone()).await;

        let commands: SharedCommandSender = Arc::new(CommandSender::new(
            manager.clone(),
            pending.clone(),
            registry.clone(),
            app_cfg.server.instance_id.clone(),
            gw.pending_timeout(),
        ));

        // ── Background tasks ───────────────────────────────────
        let background = TaskTracker::new();
        background.spawn(ping.clone().run(background_cancel.child_token()));
        background.spawn(
            manager
                .clone()
                .run_idle_sweeper(gw.idle_sweep_interval(), background_cancel.child_token()),
        );
        dispatcher.start_all(&background_cancel).await;

        // ── OCPP WebSocket server ──────────────────────────────
        let ws_listener = bind(&app_cfg.server.ws_address()).await?;
        let ws_addr = ws_listener.local_addr()?;
        let ws_server = OcppServer::new(
            manager.clone(),
            dispatcher.clone(),
            pending.clone(),
            registry.clone(),
            &app_cfg.server.instance_id,
            gw.write_timeout(),
            shutdown_signal.clone(),
        )
        .with_handshake_timeout(gw.handshake_timeout());
        let connection_tasks = ws_server.tracker().clone();

        // ── HTTP API ───────────────────────────────────────────
        let api_router = create_api_router(ApiState {
            manager: manager.clone(),
            commands: commands.clone(),
            processor,
            pending,
            transactions: transactions.clone(),
            event_bus: event_bus.clone(),
            prometheus,
            shutdown: shutdown_signal.clone(),
            instance_id: Arc::from(app_cfg.server.instance_id.as_str()),
            started_at: Instant::now(),
        });
        let api_listener = bind(&app_cfg.server.api_address()).await?;
        let api_addr = api_listener.local_addr()?;
        info!("HTTP API listening on http://{}", api_addr);

        let api_shutdown = shutdown_signal.clone();
        let api_server = axum::serve(api_listener, api_router).with_graceful_shutdown(async move {
            api_shutdown.wait().await;
            info!("🛑 HTTP API received shutdown signal");
        });

        // ── Spawn server tasks ─────────────────────────────────
        let ws_task = tokio::spawn(async move {
            if let Err(e) = ws_server.run(ws_listener).await {
                error!(error = %e, "WebSocket server error");
            }
        });
        let api_task = tokio::spawn(async move {
            if let Err(e) = api_server.await {
                error!(error = %e, "HTTP API server error");
            }
        });

        info!(%ws_addr, %api_addr, "🚀 All servers started.");

        Ok(Self {
            event_bus,
            manager,
            commands,
            charge_points,
            transactions,
            registry,
            config: app_cfg,
            ws_addr,
            api_addr,
            shutdown,
            dispatcher,
            connection_tasks,
            connections_root,
            background,
            background_cancel,
            ws_task,
            api_task,
        })
    }

    /// The single receiver of the domain event stream.
    pub fn take_events(&self) -> Option<mpsc::Receiver<EventMessage>> {
        self.event_bus.take_receiver()
    }

    /// Get a cloneable shutdown signal.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.signal()
    }

    /// Install OS signal listeners (SIGTERM, SIGINT) that trigger shutdown.
    pub fn install_signal_handler(&self) {
        self.shutdown.start_signal_listener();
    }

    /// Trigger graceful shutdown (non-blocking).
    pub fn trigger_shutdown(&self) {
        self.shutdown.signal().trigger();
    }

    /// Wait for shutdown to be triggered, then stop in order: stop
    /// accepting, close connections, wait for connection tasks, stop
    /// background work, close the event stream.
    pub async fn wait(self) {
        let Self {
            event_bus,
            manager,
            shutdown,
            dispatcher,
            connection_tasks,
            connections_root,
            background,
            background_cancel,
            ws_task,
            api_task,
            ..
        } = self;

        let completed = shutdown
            .shutdown_with_cleanup(move || async move {
                if let Err(e) = ws_task.await {
                    error!(error = %e, "WebSocket server task panicked");
                }

                let closed = manager.close_all("server shutdown");
                connections_root.cancel();
                info!(closed, "Connections closed");

                connection_tasks.close();
                connection_tasks.wait().await;
                info!("Connection tasks finished");

                background_cancel.cancel();
                dispatcher.stop_all().await;
                background.close();
                background.wait().await;

                if let Err(e) = api_task.await {
                    error!(error = %e, "HTTP API task panicked");
                }
            })
            .await;

        if !completed {
            warn!("Some tasks did not finish before the shutdown timeout");
        }

        event_bus.close();
        info!("👋 OCPP gateway shutdown complete");
    }

    /// Trigger shutdown and wait for completion.
    pub async fn shutdown(self) {
        info!("🛑 Shutting down OCPP gateway...");
        self.trigger_shutdown();
        self.wait().await;
    }

    /// Check if the server is still running.
    pub fn is_running(&self) -> bool {
        !self.ws_task.is_finished() || !self.api_task.is_finished()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// The global metrics recorder can only be installed once per process; a
/// restart within the same process reuses it.
fn prometheus_handle() -> Option<PrometheusHandle> {
    static PROM_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

    PROM_HANDLE
        .get_or_init(|| {
            match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
                Ok(handle) => {
                    info!("📊 Prometheus metrics recorder installed");
                    Some(handle)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install Prometheus metrics recorder");
                    None
                }
            }
        })
        .clone()
}

/// Initialize tracing (logging) from the application config.
///
/// `RUST_LOG` takes precedence over `logging.level`. Calling this more than
/// once keeps the first subscriber.
pub fn init_tracing(config: &AppConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let result = match config.logging.format.to_lowercase().as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
    };
    if result.is_err() {
        warn!("Tracing subscriber already installed");
    }
}
