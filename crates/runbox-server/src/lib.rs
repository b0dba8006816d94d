//! Websocket front end for on-demand code execution sandboxes
//!
//! Each websocket connection to `/term` or `/run` becomes one session: a
//! sandbox is provisioned for the requested language, lifecycle status frames
//! are reported to the client, and the sandbox's terminal is bridged to the
//! connection until either side hangs up. The sandbox is always removed when
//! the session ends.

pub mod bridge;
pub mod error;
pub mod images;
pub mod session;

pub use bridge::ClientSocket;
pub use error::{Result, ServerError};
pub use session::{
    run_session, SessionContext, SessionOutcome, SessionStatus, SessionSupervisor,
    SessionTimeouts, StatusUpdate,
};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::{middleware, Router};
use runbox_core::{ContainerRuntime, LanguageTable, SessionKind};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub languages: usize,
}

/// Configuration for the runbox server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Enable request logging
    pub enable_logging: bool,
    /// Deadlines applied to every session
    pub session_timeouts: SessionTimeouts,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            enable_logging: true,
            session_timeouts: SessionTimeouts::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address: {}", e)))?;
        Ok(self)
    }

    /// Enable or disable request logging.
    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }

    /// Set the session deadlines.
    pub fn with_session_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.session_timeouts = timeouts;
        self
    }
}

/// Shared application state: the read-only language table, the session
/// context handed to every session and the supervisor that runs them.
#[derive(Clone)]
pub struct AppState {
    pub languages: Arc<LanguageTable>,
    pub sessions: SessionContext,
    pub supervisor: SessionSupervisor,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub lang: Option<String>,
}

/// Resolve the language, then upgrade and hand the socket to a session.
///
/// The language is checked before the upgrade result is looked at, so an
/// unsupported language is a 400 whether or not the request was a websocket
/// handshake.
fn dispatch(
    state: AppState,
    kind: SessionKind,
    query: SessionQuery,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(profile) = query
        .lang
        .as_deref()
        .and_then(|lang| state.languages.get(lang))
    else {
        log::info!(
            "Rejecting {} session for language {:?}",
            kind,
            query.lang.as_deref().unwrap_or_default()
        );
        return ServerError::UnsupportedLanguage.into_response();
    };

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let spec = profile.spec_for(kind).clone();
    ws.on_upgrade(move |socket| async move {
        state.supervisor.spawn(state.sessions, kind, spec, socket);
    })
}

/// Handler for the /term endpoint.
async fn term_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    dispatch(state, SessionKind::Terminal, query, upgrade)
}

/// Handler for the /run endpoint.
async fn run_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    dispatch(state, SessionKind::Run, query, upgrade)
}

/// The runbox websocket server.
pub struct RunboxServer {
    languages: Arc<LanguageTable>,
    runtime: Arc<dyn ContainerRuntime>,
    config: ServerConfig,
    supervisor: SessionSupervisor,
}

impl RunboxServer {
    /// Create a new server with default configuration.
    pub fn new(languages: LanguageTable, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::with_config(languages, runtime, ServerConfig::default())
    }

    /// Create a new server with custom configuration.
    pub fn with_config(
        languages: LanguageTable,
        runtime: Arc<dyn ContainerRuntime>,
        config: ServerConfig,
    ) -> Self {
        Self {
            languages: Arc::new(languages),
            runtime,
            config,
            supervisor: SessionSupervisor::new(),
        }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The supervisor running this server's sessions.
    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            languages: Arc::clone(&self.languages),
            sessions: SessionContext::new(
                Arc::clone(&self.runtime),
                self.config.session_timeouts,
            ),
            supervisor: self.supervisor.clone(),
        };
        let language_count = self.languages.len();

        let mut router = Router::new()
            .route(
                "/health",
                get(move || async move {
                    Json(HealthResponse {
                        status: "healthy".to_string(),
                        timestamp: chrono::Utc::now(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                        languages: language_count,
                    })
                }),
            )
            .route("/term", get(term_handler))
            .route("/run", get(run_handler))
            .with_state(state);

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>,
                 next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();

                    // health probes are frequent
                    if uri.path() == "/health" {
                        log::debug!("Request {} {} {}", request_id, method, uri);
                    } else {
                        log::info!("Request {} {} {}", request_id, method, uri);
                    }

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    log::debug!(
                        "Response {} {} in {:?}",
                        request_id,
                        response.status(),
                        start.elapsed()
                    );

                    response
                },
            ));
        }

        router.layer(TraceLayer::new_for_http())
    }

    /// Interrupt live sessions and wait for their cleanup, bounded by the
    /// longest a session can take to provision and then remove its sandbox.
    pub async fn stop_sessions(&self) -> bool {
        let timeouts = self.config.session_timeouts;
        let limit = timeouts.provision + timeouts.upload + timeouts.cleanup;
        let active = self.supervisor.active();
        if active > 0 {
            log::info!("Stopping {} active sessions", active);
        }
        let stopped = self.supervisor.shutdown(limit).await;
        if !stopped {
            log::warn!(
                "{} sessions still running after {:?}",
                self.supervisor.active(),
                limit
            );
        }
        stopped
    }

    /// Start the server with graceful shutdown support.
    ///
    /// The server will shut down when the provided shutdown signal is received.
    /// Live sessions are then interrupted and given time to remove their
    /// sandboxes before this returns.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                ServerError::config_error(format!(
                    "Failed to bind to {}: {}",
                    self.config.bind_addr, e
                ))
            })?;

        log::info!(
            "runbox server listening on {} with {} languages",
            self.config.bind_addr,
            self.languages.len()
        );
        log::info!("Terminal sessions: ws://{}/term?lang=<name>", self.config.bind_addr);
        log::info!("Run sessions: ws://{}/run?lang=<name>", self.config.bind_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)))?;

        self.stop_sessions().await;
        log::info!("runbox server shut down gracefully");
        Ok(())
    }
}

/// Utility function to create a shutdown signal from Ctrl+C.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use runbox_core::runtime::memory::MemoryRuntime;
    use tower::ServiceExt; // for `oneshot`

    fn server(runtime: Arc<MemoryRuntime>) -> RunboxServer {
        let languages = LanguageTable::from_json_str(
            r#"{"python": {"term": {"image": "python:3", "cmd": ["python3"]},
                           "run": {"image": "python:3", "cmd": ["python3", "/code"]}}}"#,
        )
        .unwrap();
        RunboxServer::new(languages, runtime)
    }

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_unknown_language_is_rejected_before_upgrade() {
        let runtime = Arc::new(MemoryRuntime::new());
        let app = server(runtime.clone()).build_router();

        let (status, body) = get_text(app, "/run?lang=cobol").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "language not supported");
        assert!(runtime.created().is_empty());
    }

    #[tokio::test]
    async fn test_missing_language_is_rejected() {
        let runtime = Arc::new(MemoryRuntime::new());
        let app = server(runtime.clone()).build_router();

        let (status, body) = get_text(app, "/term").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "language not supported");
    }

    #[tokio::test]
    async fn test_known_language_without_handshake_is_not_upgraded() {
        let runtime = Arc::new(MemoryRuntime::new());
        let app = server(runtime.clone()).build_router();

        let (status, body) = get_text(app, "/term?lang=python").await;

        assert!(status.is_client_error());
        assert_ne!(body, "language not supported");
        assert!(runtime.created().is_empty());
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = server(Arc::new(MemoryRuntime::new())).build_router();

        let (status, body) = get_text(app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["languages"], 1);
    }

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::new()
            .with_bind_addr_str("127.0.0.1:8080")
            .unwrap()
            .with_logging(false);
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(!config.enable_logging);
        assert_eq!(config.session_timeouts, SessionTimeouts::default());
        assert!(ServerConfig::new().with_bind_addr_str("nope").is_err());
    }
}
