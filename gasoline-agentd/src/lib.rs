//! Gasoline: a loopback daemon that collects browser telemetry from the
//! Gasoline extension and serves it to LLM clients as MCP tools, plus the
//! stdio bridge those clients actually launch.

pub mod access;
pub mod adapters;
pub mod app;
pub mod bridge;
pub mod domain;
mod ingest;
pub mod lifecycle;
mod media;
pub mod ports;
pub mod protocol;
mod server;
pub mod state;
pub mod telemetry;

use crate::access::AccessPolicy;
use crate::app::annotations::AnnotationStore;
use crate::app::capture::{CaptureBuffers, CaptureOverrides, ScreenshotRateLimiter};
use crate::app::dispatch::{spawn_janitor, CommandRegistry, QueryRegistry};
use crate::app::extension::{ExtensionSettings, ExtensionState};
use crate::app::session::SessionStore;
use crate::app::tools::{RuntimeInfo, ToolContext, ToolHandler, ToolTimeouts};
use crate::domain::tool_error::{ErrorCode, ToolError};
use crate::lifecycle::pid::{PidFile, PidGuard};
use crate::lifecycle::upgrade::{
    auto_upgrade_disabled, spawn_upgrade_watcher, UpgradeMarker, UpgradeWatchConfig,
    UpgradeWatchGuard, UPGRADE_GRACE,
};
use crate::protocol::jsonrpc::INVALID_PARAMS;
use crate::protocol::{catalog, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::state::StatePaths;
use crate::telemetry::JsonlLog;
use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tokio::sync::broadcast;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info, warn};

pub use bridge::{run_bridge, BridgeConfig, BridgeStats};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_PORT: u16 = 7890;
pub const API_KEY_HEADER: &str = "X-Gasoline-Key";
pub const API_KEY_ENV: &str = "GASOLINE_API_KEY";
pub const CLIENT_HEADER: &str = "X-Gasoline-Client";

pub const MAX_POST_BODY: usize = 10 * 1024 * 1024;
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(3);
/// Upper bound for one `tools/call`; the bridge waits 65 s for the response.
const TOOL_CALL_BUDGET: Duration = Duration::from_secs(64);
const LIMITER_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub state_dir: PathBuf,
    pub api_key: Option<String>,
    /// Project the session store is keyed on; defaults to the working directory.
    pub project_path: Option<PathBuf>,
    /// Pins the accepted browser-extension id.
    pub extension_id: Option<String>,
    pub auto_upgrade: bool,
    pub timeouts: ToolTimeouts,
}

impl Default for Settings {
    fn default() -> Self {
        let state_dir = StatePaths::resolve(None)
            .map(|paths| paths.root().to_path_buf())
            .unwrap_or_else(|_| PathBuf::from(".gasoline"));
        Self {
            port: DEFAULT_PORT,
            state_dir,
            api_key: None,
            project_path: None,
            extension_id: None,
            auto_upgrade: true,
            timeouts: ToolTimeouts::default(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    tools: Arc<ToolHandler>,
    paths: StatePaths,
    access: Arc<AccessPolicy>,
    screenshot_limiter: Arc<ScreenshotRateLimiter>,
    lifecycle: Arc<JsonlLog>,
    shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    fn new(
        settings: &Settings,
        sessions: Option<Arc<SessionStore>>,
        upgraded_from: Option<String>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let paths = StatePaths::new(&settings.state_dir);
        let commands = Arc::new(CommandRegistry::new());
        let ctx = ToolContext {
            capture: Arc::new(CaptureBuffers::new()),
            queries: Arc::new(QueryRegistry::new(Arc::clone(&commands))),
            commands,
            annotations: Arc::new(AnnotationStore::new()),
            sessions,
            extension: Arc::new(ExtensionState::new()),
            overrides: Arc::new(CaptureOverrides::new()),
            timeouts: settings.timeouts,
            runtime: RuntimeInfo {
                version: VERSION,
                port: settings.port,
                started_at: Instant::now(),
                upgraded_from,
            },
        };
        Self {
            tools: Arc::new(ToolHandler::new(ctx)),
            lifecycle: Arc::new(JsonlLog::lifecycle(paths.lifecycle_log())),
            paths,
            access: Arc::new(AccessPolicy::new(
                settings.api_key.clone(),
                settings.extension_id.clone(),
            )),
            screenshot_limiter: Arc::new(ScreenshotRateLimiter::default()),
            shutdown_tx,
        }
    }

    pub(crate) fn ctx(&self) -> &ToolContext {
        self.tools.context()
    }

    pub(crate) fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub(crate) fn screenshot_limiter(&self) -> &ScreenshotRateLimiter {
        &self.screenshot_limiter
    }

    pub(crate) fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub(crate) fn invalid(code: &'static str, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub(crate) fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub(crate) fn unauthorized(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub(crate) fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::FORBIDDEN, code, message)
    }

    pub(crate) fn too_many(code: &'static str, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::TOO_MANY_REQUESTS, code, message)
    }

    pub(crate) fn unavailable(code: &'static str, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }

    pub(crate) fn internal(code: &'static str, err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        warn!(code, error = %err, "request failed");
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, err.to_string())
    }

    fn with_status(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Decodes a JSON request body regardless of its content type; the
/// extension does not always label its posts.
pub(crate) fn decode_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|err| ApiError::invalid("invalid_json", err.to_string()))
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/mcp", post(mcp))
        .route("/health", get(health))
        .route("/settings", get(get_settings).post(post_settings))
        .route("/openapi.json", get(openapi))
        .route("/shutdown", post(shutdown))
        .route("/diagnostics", get(diagnostics))
        .route("/sync", post(ingest::sync))
        .route("/query-result", post(ingest::query_result))
        .route("/logs", post(ingest::post_logs).delete(ingest::clear_logs))
        .route("/websocket-events", post(ingest::websocket_events))
        .route("/network-bodies", post(ingest::network_bodies))
        .route("/network-waterfall", post(ingest::network_waterfall))
        .route("/enhanced-actions", post(ingest::enhanced_actions))
        .route("/performance-snapshots", post(ingest::performance_snapshots))
        .route("/screenshot", post(media::screenshot))
        .route("/draw-mode-complete", post(media::draw_mode_complete))
        .layer(DefaultBodyLimit::max(MAX_POST_BODY))
        .layer(middleware::from_fn_with_state(state.clone(), access_guard))
        .layer(TimeoutLayer::new(server::RESPONSE_TIMEOUT))
        .with_state(state)
}

/// Host and Origin checks, CORS preflight and API-key auth for every route.
async fn access_guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let headers = request.headers();
    let host = headers.get(header::HOST).and_then(|value| value.to_str().ok());
    if !state.access.host_allowed(host) {
        return ApiError::forbidden("invalid_host", "Invalid Host header").into_response();
    }
    let origin = headers.get(header::ORIGIN).cloned();
    if let Some(origin) = &origin {
        let allowed = origin
            .to_str()
            .map_or(false, |origin| state.access.origin_allowed(origin));
        if !allowed {
            return ApiError::forbidden("invalid_origin", "forbidden: invalid origin")
                .into_response();
        }
    }
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(response.headers_mut(), origin);
        return response;
    }
    if !state.access.authorized(headers.get(API_KEY_HEADER)) {
        return ApiError::unauthorized("missing or invalid X-Gasoline-Key").into_response();
    }
    let mut response = next.run(request).await;
    apply_cors(response.headers_mut(), origin);
    response
}

fn apply_cors(headers: &mut HeaderMap, origin: Option<HeaderValue>) {
    if let Some(origin) = origin {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(
            "Content-Type, X-Gasoline-Key, X-Gasoline-Client, X-Gasoline-Extension-Version",
        ),
    );
}

fn rpc_reply(response: JsonRpcResponse) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        response.to_bytes(),
    )
        .into_response()
}

async fn mcp(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match JsonRpcRequest::parse(&body) {
        Ok(request) => request,
        Err(err) => {
            debug!(%err, "rejected mcp request");
            return rpc_reply(err.to_response());
        }
    };
    if request.is_notification() {
        debug!(method = %request.method, "mcp notification");
        return StatusCode::NO_CONTENT.into_response();
    }
    let outcome = answer_rpc(&state, &request).await;
    rpc_reply(JsonRpcResponse::from_outcome(request.id.as_ref(), outcome))
}

async fn answer_rpc(state: &AppState, request: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
    if let Some(outcome) = catalog::answer(&request.method, request.params.as_ref(), VERSION) {
        return outcome;
    }
    if request.method != "tools/call" {
        return Err(JsonRpcError::method_not_found(&request.method));
    }
    let Some(name) = request.tool_name() else {
        return Err(JsonRpcError::new(
            INVALID_PARAMS,
            "Invalid params: tools/call requires params.name",
        ));
    };
    let arguments = request
        .tool_arguments()
        .cloned()
        .unwrap_or_else(|| json!({}));
    match time::timeout(TOOL_CALL_BUDGET, state.tools.call(name, arguments)).await {
        Ok(result) => Ok(result),
        Err(_) => {
            warn!(tool = %name, "tool call exceeded its budget");
            Ok(ToolError::new(
                ErrorCode::ExtensionTimeout,
                format!("{name} did not finish within {}s", TOOL_CALL_BUDGET.as_secs()),
            )
            .retry_after(2000)
            .to_result())
        }
    }
}

fn health_payload(state: &AppState) -> Value {
    let ctx = state.ctx();
    let mut payload = json!({
        "status": "ok",
        "service-name": catalog::SERVER_NAME,
        "name": catalog::SERVER_NAME,
        "version": VERSION,
        "pid": std::process::id(),
        "uptime_seconds": ctx.runtime.uptime_seconds(),
        "capture": {
            "extension_connected": ctx.extension.is_connected(),
            "tracking_enabled": ctx.extension.tracking_enabled(),
        },
    });
    if let Some(from) = &ctx.runtime.upgraded_from {
        payload["upgraded_from"] = Value::String(from.clone());
    }
    payload
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(health_payload(&state))
}

async fn get_settings(State(state): State<AppState>) -> Json<Value> {
    let ctx = state.ctx();
    Json(json!({
        "capture_overrides": ctx.overrides.effective(),
        "overridden": ctx.overrides.overrides(),
        "extension": ctx.extension.status(),
    }))
}

async fn post_settings(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let settings: ExtensionSettings = decode_json(&body)?;
    debug!(
        tracking = settings.tracking_enabled,
        tab = ?settings.tracked_tab_id,
        "extension settings updated"
    );
    state.ctx().extension.update_settings(settings);
    Ok(Json(json!({
        "status": "ok",
        "capture_overrides": state.ctx().overrides.effective(),
    })))
}

async fn openapi() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/json")],
        include_str!("../assets/openapi.json"),
    )
}

async fn shutdown(State(state): State<AppState>) -> Json<Value> {
    info!("shutdown requested over http");
    state
        .lifecycle
        .record("shutdown_requested", json!({ "via": "http" }));
    let _ = state.shutdown_tx.send(());
    Json(json!({ "status": "shutting_down" }))
}

async fn diagnostics(State(state): State<AppState>) -> Json<Value> {
    let ctx = state.ctx();
    let (sessions, named, details) = ctx.annotations.counts();
    let session_store = ctx
        .sessions
        .as_ref()
        .map(|store| store.meta())
        .and_then(|meta| serde_json::to_value(meta).ok());
    Json(json!({
        "version": VERSION,
        "pid": std::process::id(),
        "port": ctx.runtime.port,
        "uptime_seconds": ctx.runtime.uptime_seconds(),
        "upgraded_from": ctx.runtime.upgraded_from,
        "extension": ctx.extension.status(),
        "capture": ctx.capture.stats(),
        "capture_overrides": ctx.overrides.effective(),
        "queries": {
            "pending": ctx.queries.list_pending(),
            "failed": ctx.queries.list_failed().len(),
        },
        "commands": {
            "pending": ctx.commands.list_pending(),
            "failed": ctx.commands.list_failed(),
        },
        "annotations": {
            "sessions": sessions,
            "named_sessions": named,
            "details": details,
        },
        "screenshot_clients": state.screenshot_limiter.len(),
        "session_store": session_store,
    }))
}

fn open_session_store(settings: &Settings, paths: &StatePaths) -> Option<Arc<SessionStore>> {
    let project = match settings.project_path.clone() {
        Some(project) => project,
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(err) => {
                warn!(%err, "cannot determine project directory; session store disabled");
                return None;
            }
        },
    };
    match SessionStore::open(&paths.sessions_dir(), &project) {
        Ok(store) => Some(store),
        Err(err) => {
            warn!(%err, project = %project.display(), "session store unavailable");
            None
        }
    }
}

fn start_upgrade_watcher(
    settings: &Settings,
    paths: &StatePaths,
    lifecycle: Arc<JsonlLog>,
    shutdown_tx: broadcast::Sender<()>,
) -> Option<UpgradeWatchGuard> {
    if !settings.auto_upgrade || auto_upgrade_disabled() {
        debug!("binary upgrade watcher disabled");
        return None;
    }
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            warn!(%err, "cannot locate executable; upgrade watcher disabled");
            return None;
        }
    };
    let config = UpgradeWatchConfig {
        exe,
        current_version: VERSION.to_string(),
        marker_path: paths.upgrade_marker(),
        grace: UPGRADE_GRACE,
    };
    match spawn_upgrade_watcher(config, lifecycle, shutdown_tx) {
        Ok(guard) => Some(guard),
        Err(err) => {
            warn!(%err, "failed to start upgrade watcher");
            None
        }
    }
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let paths = StatePaths::new(&settings.state_dir);
    paths.ensure()?;

    let listener = TcpListener::bind(("127.0.0.1", settings.port))
        .await
        .with_context(|| format!("failed to bind 127.0.0.1:{}", settings.port))?;
    let _pid_guard = PidGuard::acquire(PidFile::for_port(&paths, settings.port))?;

    let upgraded_from = UpgradeMarker::take(&paths.upgrade_marker()).map(|marker| {
        info!(from = %marker.from_version, to = %marker.to_version, "started after binary upgrade");
        marker.from_version
    });
    let sessions = open_session_store(&settings, &paths);

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let state = AppState::new(&settings, sessions.clone(), upgraded_from.clone(), shutdown_tx.clone());
    let ctx = state.ctx().clone();

    let janitor = spawn_janitor(
        Arc::clone(&ctx.queries),
        Arc::clone(&ctx.commands),
        None,
        shutdown_tx.subscribe(),
    );
    let sweeper = ctx.annotations.spawn_sweeper(None);
    let flusher = sessions.as_ref().map(|store| store.spawn_flusher(None));
    let limiter_purge = {
        let limiter = Arc::clone(&state.screenshot_limiter);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let mut ticker = time::interval(LIMITER_PURGE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let purged = limiter.purge_stale();
                        if purged > 0 {
                            debug!(purged, "screenshot limiter purge");
                        }
                    }
                }
            }
        })
    };
    let upgrade_guard = start_upgrade_watcher(
        &settings,
        &paths,
        Arc::clone(&state.lifecycle),
        shutdown_tx.clone(),
    );

    state.lifecycle.record(
        "daemon_started",
        json!({
            "port": settings.port,
            "server_pid": std::process::id(),
            "upgraded_from": upgraded_from,
        }),
    );
    info!(
        port = settings.port,
        state_dir = %paths.root().display(),
        auth = state.access.requires_key(),
        "gasoline daemon started"
    );

    let app = router(state.clone());
    let mut drain_rx = shutdown_tx.subscribe();
    let serve = server::serve(listener, app, server::ConnectionLimits::default(), {
        let shutdown_tx = shutdown_tx.clone();
        let mut trigger = shutdown_tx.subscribe();
        async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = trigger.recv() => {}
            }
            let _ = shutdown_tx.send(());
        }
    });
    let mut server = tokio::spawn(serve);
    tokio::select! {
        joined = &mut server => {
            joined.context("http server task failed")?;
        }
        _ = async {
            let _ = drain_rx.recv().await;
            time::sleep(SHUTDOWN_BUDGET).await;
        } => {
            warn!("graceful shutdown budget exhausted; dropping open connections");
            server.abort();
        }
    }

    let _ = shutdown_tx.send(());
    if let Some(store) = sessions {
        if let Err(err) = tokio::task::spawn_blocking(move || store.shutdown()).await {
            warn!(%err, "session store shutdown task failed");
        }
    }
    ctx.annotations.close();
    if let Some(guard) = upgrade_guard {
        guard.shutdown().await;
    }
    for (name, task) in [("janitor", janitor), ("sweeper", sweeper), ("limiter", limiter_purge)] {
        if let Err(err) = task.await {
            warn!(task = name, %err, "background task join error");
        }
    }
    if let Some(flusher) = flusher {
        let _ = flusher.await;
    }
    state
        .lifecycle
        .record("daemon_shutdown", json!({ "port": settings.port }));
    info!("gasoline daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "cannot listen for SIGTERM");
                let _ = ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c().await;
    }
    info!("shutdown signal received");
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_identifies_service() {
        let daemon = TestDaemon::new();
        let response = daemon
            .router()
            .oneshot(request("GET", "/health", Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service-name"], "gasoline");
        assert_eq!(body["version"], VERSION);
        assert_eq!(body["capture"]["extension_connected"], false);
        assert!(body.get("upgraded_from").is_none());
    }

    #[tokio::test]
    async fn mcp_answers_initialize_and_tools_call() {
        let daemon = TestDaemon::new();
        let response = daemon
            .router()
            .oneshot(request(
                "POST",
                "/mcp",
                json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["result"]["protocolVersion"], "2024-11-05");

        let response = daemon
            .router()
            .oneshot(request(
                "POST",
                "/mcp",
                json!({
                    "jsonrpc": "2.0",
                    "id": "abc",
                    "method": "tools/call",
                    "params": {"name": "observe", "arguments": {"what": "logs"}}
                }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["id"], "abc");
        assert!(body["result"]["content"][0]["text"].is_string());
    }

    #[tokio::test]
    async fn mcp_protocol_errors() {
        let daemon = TestDaemon::new();
        let response = daemon
            .router()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header(header::HOST, "localhost:7890")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], -32700);
        assert_eq!(body["id"], Value::Null);

        let response = daemon
            .router()
            .oneshot(request(
                "POST",
                "/mcp",
                json!({"jsonrpc": "2.0", "id": 3, "method": "unknown/method"}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["error"]["code"], -32601);

        let response = daemon
            .router()
            .oneshot(request(
                "POST",
                "/mcp",
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn api_key_is_required_when_configured() {
        let daemon = TestDaemon::with_settings(|settings| settings.api_key = Some("k3y".into()));
        let response = daemon
            .router()
            .oneshot(request("GET", "/health", Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut authed = request("GET", "/health", Value::Null);
        authed
            .headers_mut()
            .insert(API_KEY_HEADER, HeaderValue::from_static("k3y"));
        let response = daemon.router().oneshot(authed).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn foreign_host_and_origin_are_forbidden() {
        let daemon = TestDaemon::new();
        let mut foreign_host = request("GET", "/health", Value::Null);
        foreign_host
            .headers_mut()
            .insert(header::HOST, HeaderValue::from_static("evil.test"));
        let response = daemon.router().oneshot(foreign_host).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let mut foreign_origin = request("GET", "/health", Value::Null);
        foreign_origin
            .headers_mut()
            .insert(header::ORIGIN, HeaderValue::from_static("https://evil.test"));
        let response = daemon.router().oneshot(foreign_origin).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn allowed_origin_is_echoed() {
        let daemon = TestDaemon::new();
        let mut preflight = request("OPTIONS", "/sync", Value::Null);
        preflight.headers_mut().insert(
            header::ORIGIN,
            HeaderValue::from_static("chrome-extension://abcdefghijklmnop"),
        );
        let response = daemon.router().oneshot(preflight).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "chrome-extension://abcdefghijklmnop"
        );
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let daemon = TestDaemon::new();
        let huge = "x".repeat(MAX_POST_BODY + 1);
        let response = daemon
            .router()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header(header::HOST, "127.0.0.1")
                    .body(Body::from(huge))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let daemon = TestDaemon::new();
        let response = daemon
            .router()
            .oneshot(request(
                "POST",
                "/settings",
                json!({"tracking_enabled": true, "tracked_tab_id": 12}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(daemon.state.ctx().extension.tracked_tab(), Some(12));

        let response = daemon
            .router()
            .oneshot(request("GET", "/settings", Value::Null))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["capture_overrides"]["log_level"], "error");
    }

    #[tokio::test]
    async fn shutdown_broadcasts() {
        let daemon = TestDaemon::new();
        let mut rx = daemon.state.shutdown_receiver();
        let response = daemon
            .router()
            .oneshot(request("POST", "/shutdown", Value::Null))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "shutting_down");
        rx.try_recv().expect("shutdown signal sent");
    }

    #[tokio::test]
    async fn diagnostics_and_openapi() {
        let daemon = TestDaemon::new();
        let response = daemon
            .router()
            .oneshot(request("GET", "/diagnostics", Value::Null))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["version"], VERSION);
        assert!(body["capture"]["kinds"].is_object());

        let response = daemon
            .router()
            .oneshot(request("GET", "/openapi.json", Value::Null))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["openapi"], "3.0.3");
    }
}
