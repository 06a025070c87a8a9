//! Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use secrecy::SecretString;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use parley_core::gateway::{MembershipOracle, PersistenceGateway};
use parley_core::ConnectionId;
use parley_store::{Database, SqliteGateway};
use parley_telemetry::{names, MetricsRecorder};

use crate::api;
use crate::auth::{AuthUser, TokenService};
use crate::config::{ConfigError, ServerConfig};
use crate::error::ApiError;
use crate::health;
use crate::hub::Hub;
use crate::session::{self, SessionContext, SessionTiming};
use crate::shutdown::ShutdownCoordinator;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub oracle: Arc<dyn MembershipOracle>,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub db: Database,
    pub tokens: Arc<TokenService>,
    pub config: Arc<ServerConfig>,
    pub metrics: Arc<MetricsRecorder>,
    /// Fires once shutdown begins; sessions run on child tokens.
    pub shutdown: ShutdownCoordinator,
    /// Every live websocket session.
    pub sessions: TaskTracker,
    pub started_at: Instant,
}

impl AppState {
    /// Validate `config`, start the hub and wire the SQLite gateway. Must be
    /// called from within a tokio runtime.
    pub fn new(
        config: ServerConfig,
        db: Database,
        metrics: Arc<MetricsRecorder>,
        shutdown: ShutdownCoordinator,
    ) -> Result<(Self, JoinHandle<()>), ServerError> {
        config.validate()?;

        let gateway = Arc::new(SqliteGateway::new(db.clone()));
        let secret = SecretString::from(config.jwt_secret.clone());
        let tokens = TokenService::new(&secret, config.token_ttl())
            .with_refresh_ttl(config.refresh_token_ttl());
        let (hub, hub_task) = Hub::spawn(Arc::clone(&metrics));

        let state = Self {
            hub,
            oracle: gateway.clone(),
            gateway,
            db,
            tokens: Arc::new(tokens),
            config: Arc::new(config),
            metrics,
            shutdown,
            sessions: TaskTracker::new(),
            started_at: Instant::now(),
        };
        Ok((state, hub_task))
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            hub: self.hub.clone(),
            gateway: Arc::clone(&self.gateway),
            metrics: Arc::clone(&self.metrics),
            timing: SessionTiming::from_config(&self.config),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let api = api::routes().layer(TimeoutLayer::new(state.config.request_timeout()));

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health::health_handler))
        .route("/metrics", get(health::metrics_handler))
        .nest("/api", api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// GET /ws
///
/// Authentication and the subscription lookup both happen before the
/// upgrade, so a rejected client gets a plain HTTP error.
async fn ws_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if state.shutdown.is_shutting_down() {
        return Err(ApiError::unavailable("server is shutting down"));
    }

    let subscriptions = match state.oracle.resolve_subscriptions(user_id).await {
        Ok(subscriptions) => subscriptions,
        Err(e) => {
            state
                .metrics
                .counter_inc(names::WS_REJECTED_TOTAL, &[("reason", "lookup_failed")], 1);
            return Err(ApiError::internal(e));
        }
    };
    if subscriptions.is_empty() {
        state
            .metrics
            .counter_inc(names::WS_REJECTED_TOTAL, &[("reason", "no_chats")], 1);
        return Err(ApiError::bad_request("user has no chats"));
    }

    let id = ConnectionId::new();
    let ctx = state.session_context();
    let shutdown = state.shutdown.token();
    let sessions = state.sessions.clone();

    let response = ws
        .max_message_size(state.config.max_message_size)
        .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| {
            sessions.track_future(session::run_session(
                socket,
                id,
                user_id,
                subscriptions,
                ctx,
                shutdown,
            ))
        });
    Ok(response.into_response())
}

/// Bind, spawn the server and return a handle to stop it.
pub async fn start(
    config: ServerConfig,
    db: Database,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, ServerError> {
    let (state, hub_task) = AppState::new(config, db, metrics, ShutdownCoordinator::new())?;

    let listener = match tokio::net::TcpListener::bind(state.config.bind_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            state.hub.shutdown().await;
            return Err(e.into());
        }
    };
    let addr = listener.local_addr()?;

    let router = build_router(state.clone());
    let token = state.shutdown.token();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        {
            error!(error = %e, "server stopped with error");
        }
    });

    info!(%addr, "parley server listening");
    Ok(ServerHandle {
        addr,
        state,
        server,
        hub_task,
    })
}

/// Handle returned by [`start`]; keeps the server and hub running.
pub struct ServerHandle {
    pub addr: SocketAddr,
    state: AppState,
    server: JoinHandle<()>,
    hub_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Close every session, stop the hub, then drain the HTTP server.
    pub async fn shutdown(self) {
        info!("shutting down");
        let timeout = self.state.config.shutdown_timeout();

        if !self
            .state
            .shutdown
            .graceful_shutdown(&self.state.sessions, timeout)
            .await
        {
            warn!("sessions still open after shutdown timeout");
        }

        self.state.hub.shutdown().await;
        if let Err(e) = self.hub_task.await {
            error!(error = %e, "hub task failed");
        }

        let mut server = self.server;
        if tokio::time::timeout(timeout, &mut server).await.is_err() {
            warn!("http server did not drain in time, aborting");
            server.abort();
        }
        info!("shutdown complete");
    }
}

/// State over an in-memory database with a fixed secret.
#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    let config = ServerConfig {
        jwt_secret: "test-secret".into(),
        password_hash_cost: 4,
        ..ServerConfig::default()
    };
    let db = Database::in_memory().unwrap();
    let (state, _hub_task) =
        AppState::new(config, db, Arc::new(MetricsRecorder::new()), ShutdownCoordinator::new()).unwrap();
    state
}
