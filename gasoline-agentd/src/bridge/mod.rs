//! MCP stdio bridge: reads JSON-RPC from an MCP client, answers what it can
//! from static data and forwards the rest to the daemon over loopback HTTP.
//!
//! Nothing but JSON-RPC messages is ever written to the output stream.

pub mod fastpath;
pub mod forward;
pub mod supervisor;

use crate::adapters::stdio::{write_frame, FrameReader, Framing, FramingError};
use crate::domain::tool_error::{ErrorCode, ToolError};
use crate::ports::daemon::DaemonControl;
use crate::protocol::{catalog, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestError};
use crate::state::StatePaths;
use crate::telemetry::JsonlLog;
use fastpath::FastPathTelemetry;
use forward::{failure_reply, is_restart, Forwarder};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use supervisor::{DaemonState, DaemonSupervisor, SupervisorTimings};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const STARTING_MESSAGE: &str =
    "Server is starting up. Please retry this tool call in 2 seconds.";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub port: u16,
    pub api_key: Option<String>,
    pub version: String,
    pub paths: StatePaths,
    pub timings: SupervisorTimings,
}

impl BridgeConfig {
    pub fn new(port: u16, paths: StatePaths) -> Self {
        Self {
            port,
            api_key: None,
            version: crate::VERSION.to_string(),
            paths,
            timings: SupervisorTimings::default(),
        }
    }
}

/// Counters reported when the bridge exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub requests: u64,
    pub parse_errors: u64,
    pub invalid_ids: u64,
    pub fast_path: u64,
    pub forwarded: u64,
    pub method_not_found: u64,
    pub starting_retries: u64,
    pub line_framing: u64,
    pub content_length_framing: u64,
    pub last_method: Option<String>,
}

type Output<W> = Arc<Mutex<W>>;

async fn emit<W: AsyncWrite + Unpin>(output: &Output<W>, framing: Framing, payload: &[u8]) {
    let mut writer = output.lock().await;
    if let Err(err) = write_frame(&mut *writer, framing, payload).await {
        warn!(%err, "stdout write failed");
    }
}

fn daemon_starting(request: &JsonRpcRequest) -> JsonRpcResponse {
    failure_reply(
        request,
        ToolError::new(ErrorCode::DaemonStarting, STARTING_MESSAGE)
            .subsystem("bridge_startup")
            .reason("daemon_starting")
            .retry_after(2000),
    )
}

fn daemon_not_ready(request: &JsonRpcRequest, port: u16, detail: &str) -> JsonRpcResponse {
    let lowered = detail.to_ascii_lowercase();
    let hint = if ["port", "bind", "address"]
        .iter()
        .any(|word| lowered.contains(word))
    {
        format!(
            "Port may be in use. Run gasoline --stop --port {port}, or pick another port with --port {}",
            port.saturating_add(1)
        )
    } else {
        "Run gasoline --check for diagnostics.".to_string()
    };
    failure_reply(
        request,
        ToolError::new(
            ErrorCode::DaemonNotReady,
            format!("Server failed to start: {detail}"),
        )
        .subsystem("bridge_startup")
        .reason("daemon_not_ready")
        .retry_after(2000)
        .detail(detail)
        .hint(hint),
    )
}

/// Runs the bridge until `input` ends, then waits for in-flight requests.
///
/// Fails before reading anything when the port holds a daemon of another
/// version or a foreign service; the caller maps that to an exit code.
pub async fn run_bridge<R, W>(
    config: BridgeConfig,
    control: Arc<dyn DaemonControl>,
    input: R,
    output: W,
) -> anyhow::Result<BridgeStats>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let lifecycle = Arc::new(JsonlLog::lifecycle(config.paths.lifecycle_log()));
    let supervisor = Arc::new(
        DaemonSupervisor::new(control, config.version.clone(), config.timings)
            .with_lifecycle(lifecycle.clone()),
    );
    let startup = supervisor.start().await?;
    let telemetry = FastPathTelemetry::new(&config.paths);
    let forwarder = Arc::new(Forwarder::new(
        config.port,
        config.api_key.clone(),
        supervisor.clone(),
    ));
    let output: Output<W> = Arc::new(Mutex::new(output));
    let mut reader = FrameReader::new(input);
    let mut stats = BridgeStats::default();
    let mut inflight = JoinSet::new();
    let mut read_error = None;

    info!(port = config.port, "bridge started");
    loop {
        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) if err.is_recoverable() => {
                stats.requests += 1;
                stats.parse_errors += 1;
                let reply = RequestError::Parse(err.to_string()).to_response();
                emit(&output, err.framing(), &reply.to_bytes()).await;
                continue;
            }
            Err(FramingError::Truncated) => break,
            Err(err) => {
                read_error = Some(err.to_string());
                break;
            }
        };
        let framing = frame.framing;
        stats.requests += 1;
        match framing {
            Framing::Line => stats.line_framing += 1,
            Framing::ContentLength => stats.content_length_framing += 1,
        }

        let request = match JsonRpcRequest::parse(&frame.payload) {
            Ok(request) => request,
            Err(err) => {
                match err {
                    RequestError::Parse(_) => stats.parse_errors += 1,
                    RequestError::Invalid { .. } => stats.invalid_ids += 1,
                }
                emit(&output, framing, &err.to_response().to_bytes()).await;
                continue;
            }
        };
        debug!(method = %request.method, id = ?request.id, "request");
        stats.last_method = Some(request.method.clone());

        if let Some(outcome) =
            catalog::answer(&request.method, request.params.as_ref(), &config.version)
        {
            stats.fast_path += 1;
            telemetry.record(&request.method, request.params.as_ref(), &outcome);
            if !request.is_notification() {
                let reply = JsonRpcResponse::from_outcome(request.id.as_ref(), outcome);
                emit(&output, framing, &reply.to_bytes()).await;
            }
            continue;
        }

        if request.method == "initialized" || request.method.starts_with("notifications/") {
            stats.fast_path += 1;
            if let Some(id) = &request.id {
                let reply = JsonRpcResponse::success(Some(id), json!({}));
                emit(&output, framing, &reply.to_bytes()).await;
            }
            continue;
        }

        if !catalog::is_forwardable(&request.method) {
            stats.method_not_found += 1;
            let outcome: Result<Value, JsonRpcError> =
                Err(JsonRpcError::method_not_found(&request.method));
            telemetry.record(&request.method, None, &outcome);
            if !request.is_notification() {
                let reply = JsonRpcResponse::from_outcome(request.id.as_ref(), outcome);
                emit(&output, framing, &reply.to_bytes()).await;
            }
            continue;
        }

        if is_restart(&request) {
            let supervisor = supervisor.clone();
            let output = output.clone();
            inflight.spawn(async move {
                let outcome = supervisor.restart().await;
                let reply = JsonRpcResponse::success(request.id.as_ref(), outcome.to_result());
                emit(&output, framing, &reply.to_bytes()).await;
            });
            continue;
        }

        let raw = frame.payload;
        match supervisor.state() {
            DaemonState::Starting => {
                stats.starting_retries += 1;
                if !request.is_notification() {
                    emit(&output, framing, &daemon_starting(&request).to_bytes()).await;
                }
                continue;
            }
            DaemonState::Failed(_) => {
                stats.forwarded += 1;
                let supervisor = supervisor.clone();
                let forwarder = forwarder.clone();
                let output = output.clone();
                inflight.spawn(async move {
                    if !supervisor.ensure_ready().await {
                        let detail = match supervisor.state() {
                            DaemonState::Failed(detail) => detail,
                            _ => "daemon did not start".to_string(),
                        };
                        if !request.is_notification() {
                            let reply = daemon_not_ready(&request, supervisor.port(), &detail);
                            emit(&output, framing, &reply.to_bytes()).await;
                        }
                        return;
                    }
                    if let Some(body) = forwarder.forward(&request, &raw).await {
                        emit(&output, framing, &body).await;
                    }
                });
            }
            DaemonState::Ready => {
                stats.forwarded += 1;
                let forwarder = forwarder.clone();
                let output = output.clone();
                inflight.spawn(async move {
                    if let Some(body) = forwarder.forward(&request, &raw).await {
                        emit(&output, framing, &body).await;
                    }
                });
            }
        }
    }

    while let Some(joined) = inflight.join_next().await {
        if let Err(err) = joined {
            warn!(%err, "forwarding task failed");
        }
    }
    if let Some(handle) = startup {
        handle.abort();
    }

    let reason = if read_error.is_some() {
        "stdin_read_error"
    } else {
        "stdin_eof"
    };
    info!(
        reason,
        requests = stats.requests,
        forwarded = stats.forwarded,
        fast_path = stats.fast_path,
        parse_errors = stats.parse_errors,
        "bridge exiting"
    );
    let mut fields = serde_json::to_value(&stats).unwrap_or_else(|_| json!({}));
    fields["reason"] = Value::String(reason.to_string());
    if let Some(err) = read_error {
        fields["read_error"] = Value::String(err);
    }
    lifecycle.record("bridge_exit", fields);
    Ok(stats)
}
