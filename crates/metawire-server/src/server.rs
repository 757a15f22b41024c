//! `MetawireServer`: one listener for HTTP, WebSocket and the balancer role.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::header::{CONNECTION, UPGRADE};
use axum::http::{HeaderMap, Response};
use axum::response::IntoResponse;
use metawire_protocol::protocol::API_PATH;
use metawire_protocol::{Protocol, TransportOptions};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::balancer::Balancer;
use crate::config::{ConfigError, Role, ServerConfig};
use crate::http;
use crate::shutdown::{DrainOutcome, ShutdownCoordinator};
use crate::static_files::StaticFiles;
use crate::websocket::{self, WsSettings};

/// Server lifecycle errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The address stayed unavailable through every bind attempt.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Address that was tried.
        address: String,
        /// Last bind error.
        source: std::io::Error,
    },
    /// Listener I/O failure.
    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// `listen` or `attach` was called on a running server.
    #[error("server is already running")]
    AlreadyRunning,
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Protocol engine.
    pub protocol: Arc<Protocol>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Settings handed to every HTTP transport.
    pub transport_options: Arc<TransportOptions>,
    /// Present in the balancer role.
    pub balancer: Option<Arc<Balancer>>,
    /// Non-API path handler.
    pub static_files: Option<Arc<dyn StaticFiles>>,
}

/// The metawire server.
pub struct MetawireServer {
    state: AppState,
    shutdown: ShutdownCoordinator,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl MetawireServer {
    /// Create a server around `protocol`. Nothing is bound yet.
    pub fn new(config: ServerConfig, protocol: Arc<Protocol>) -> Self {
        let balancer = (config.role == Role::Balancer)
            .then(|| Arc::new(Balancer::new(config.scheme.clone(), config.ports.clone())));
        let state = AppState {
            protocol,
            transport_options: Arc::new(config.transport_options()),
            config: Arc::new(config),
            balancer,
            static_files: None,
        };
        Self {
            state,
            shutdown: ShutdownCoordinator::new(),
            serve_task: Mutex::new(None),
        }
    }

    /// Serve non-API paths from `files`.
    #[must_use]
    pub fn with_static_files(mut self, files: impl StaticFiles + 'static) -> Self {
        self.state.static_files = Some(Arc::new(files));
        self
    }

    /// Build the router. Every request goes through one dispatcher.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(self.state.clone())
    }

    /// Get the protocol engine.
    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.state.protocol
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Whether the server is serving.
    pub fn is_listening(&self) -> bool {
        self.serve_task.lock().is_some()
    }

    /// Bind `host:port` and serve. Returns the bound address.
    ///
    /// `AddrInUse` is retried `bind_retry` times in total,
    /// `bind_retry_delay_ms` apart; any other error fails at once.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        if self.is_listening() {
            return Err(ServerError::AlreadyRunning);
        }
        let config = &self.state.config;
        let address = config.bind_address();
        let delay = Duration::from_millis(config.bind_retry_delay_ms);
        let mut attempt = 0;
        let listener = loop {
            attempt += 1;
            match TcpListener::bind(&address).await {
                Ok(listener) => break listener,
                Err(err)
                    if err.kind() == std::io::ErrorKind::AddrInUse
                        && attempt < config.bind_retry =>
                {
                    warn!(address, attempt, "address in use, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(source) => return Err(ServerError::Bind { address, source }),
            }
        };
        self.attach(listener)
    }

    /// Serve on an already bound listener.
    pub fn attach(&self, listener: TcpListener) -> Result<SocketAddr, ServerError> {
        let mut task = self.serve_task.lock();
        if task.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        let local_addr = listener.local_addr()?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let token = self.shutdown.token();
        *task = Some(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %err, "server stopped with error");
            }
        }));
        info!(address = %local_addr, role = ?self.state.config.role, "listening");
        Ok(local_addr)
    }

    /// Stop accepting, close every client and wait for them to go away.
    ///
    /// The wait is bounded by `drain_timeout_ms`; clients still live after
    /// that are abandoned. Returns how the drain ended.
    pub async fn close(&self) -> DrainOutcome {
        let Some(task) = self.serve_task.lock().take() else {
            return DrainOutcome::Drained;
        };
        self.shutdown.shutdown();

        let config = &self.state.config;
        let timeout = Duration::from_millis(config.drain_timeout_ms);
        let outcome = self
            .shutdown
            .drain(
                &self.state.protocol,
                Duration::from_millis(config.drain_poll_ms),
                timeout,
            )
            .await;
        if tokio::time::timeout(timeout, task).await.is_err() {
            warn!("listener did not stop within {timeout:?}");
        }
        info!(?outcome, "server closed");
        outcome
    }
}

async fn dispatch(State(state): State<AppState>, request: Request) -> Response<Body> {
    let (mut parts, body) = request.into_parts();
    let address = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_owned(), |ConnectInfo(addr)| addr.to_string());
    let path = parts.uri.path().to_owned();
    let api = path.starts_with(API_PATH);

    if state.balancer.is_some() {
        if api || path == "/" {
            return http::handle_balancer(&state, &parts, &address);
        }
    } else if is_websocket_upgrade(&parts.headers) {
        return match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(upgrade) => {
                let config = &state.config;
                let settings = WsSettings {
                    outbound_queue: config.outbound_queue,
                    heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
                    heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
                };
                let protocol = Arc::clone(&state.protocol);
                upgrade
                    .max_message_size(config.max_message_size)
                    .on_upgrade(move |socket| {
                        websocket::run_ws_session(socket, protocol, address, settings)
                    })
            }
            Err(rejection) => rejection.into_response(),
        };
    }

    if api {
        http::handle_api(&state, parts, body, address).await
    } else {
        http::handle_static(&state, &path, address).await
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let has_token = |name, token: &str| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|part| part.trim().eq_ignore_ascii_case(token))
    };
    has_token(UPGRADE, "websocket") && has_token(CONNECTION, "upgrade")
}
