//! Extension-facing endpoints: the `/sync` long-poll, direct query results and
//! the per-kind capture ingestion routes.

use crate::app::capture::{Captured, IngestOutcome};
use crate::app::dispatch::SetOutcome;
use crate::app::extension::{ExtensionSettings, SyncGap};
use crate::domain::capture::{
    CaptureKind, EnhancedAction, LogEntry, NetworkBody, PerformanceSnapshot, WaterfallEntry,
    WebSocketEvent,
};
use crate::domain::command::{CommandStatus, ReportedResult};
use crate::domain::query::DispatchedQuery;
use crate::{decode_json, ApiError, AppState, VERSION};
use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::time::Duration;
use tracing::{debug, info, warn};

const SYNC_LONG_POLL: Duration = Duration::from_secs(5);
const BUSY_POLL_MS: u64 = 200;
const IDLE_POLL_MS: u64 = 1000;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SyncRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    extension_version: Option<String>,
    #[serde(default)]
    settings: Option<ExtensionSettings>,
    #[serde(default)]
    command_results: Vec<ReportedResult>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SyncResponse {
    ack: bool,
    commands: Vec<DispatchedQuery>,
    next_poll_ms: u64,
    server_time: String,
    server_version: &'static str,
    capture_overrides: BTreeMap<String, String>,
}

pub(crate) async fn sync(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SyncResponse>, ApiError> {
    let request: SyncRequest = if body.is_empty() {
        SyncRequest::default()
    } else {
        decode_json(&body)?
    };
    let ctx = state.ctx();

    let gap = ctx.extension.record_sync(
        request.session_id,
        request.extension_version,
        request.settings,
    );
    if gap == SyncGap::Reconnected {
        let expired = ctx.queries.expire_all("extension_disconnected");
        if expired > 0 {
            info!(expired, "extension reconnected; expired stale queries");
        }
    }

    for reported in &request.command_results {
        apply_reported(&state, reported);
    }

    let mut commands = ctx.queries.take_dispatchable();
    if commands.is_empty() {
        let mut shutdown = state.shutdown_receiver();
        commands = tokio::select! {
            ready = ctx.queries.wait_for_dispatchable(SYNC_LONG_POLL) => ready,
            _ = shutdown.recv() => Vec::new(),
        };
    }
    if !commands.is_empty() {
        debug!(count = commands.len(), "dispatching queries to extension");
    }

    let next_poll_ms = if commands.is_empty() {
        IDLE_POLL_MS
    } else {
        BUSY_POLL_MS
    };
    Ok(Json(SyncResponse {
        ack: true,
        commands,
        next_poll_ms,
        server_time: Utc::now().to_rfc3339(),
        server_version: VERSION,
        capture_overrides: ctx.overrides.effective(),
    }))
}

/// Routes one reported outcome to the pending query it answers, or to the
/// async command carrying its correlation id.
fn apply_reported(state: &AppState, reported: &ReportedResult) {
    let ctx = state.ctx();
    let status = CommandStatus::normalize(&reported.status);
    if let Some(id) = reported.id.as_deref().filter(|id| !id.is_empty()) {
        if ctx.queries.status(id).is_some() {
            if !status.is_terminal() {
                return;
            }
            if status.is_failure() {
                let message = reported
                    .error
                    .clone()
                    .unwrap_or_else(|| status.as_str().to_string());
                ctx.queries.set_error(id, message);
            } else {
                let result = reported.result.clone().unwrap_or(Value::Null);
                if let SetOutcome::Rejected(current) = ctx.queries.set_result(id, result) {
                    debug!(%id, status = current.as_str(), "late result ignored");
                }
            }
            return;
        }
    }
    match reported.correlation_id.as_deref() {
        Some(correlation_id) => {
            let applied = ctx.commands.apply_result(
                correlation_id,
                status,
                reported.result.clone(),
                reported.error.clone(),
            );
            if !applied {
                debug!(%correlation_id, status = status.as_str(), "command result not applied");
            }
        }
        None => warn!(id = ?reported.id, "command result without a known id"),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueryResultRequest {
    id: String,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

pub(crate) async fn query_result(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: QueryResultRequest = decode_json(&body)?;
    let queries = &state.ctx().queries;
    if let Some(error) = request.error {
        return if queries.set_error(&request.id, error) {
            Ok(Json(json!({ "status": "error_recorded" })))
        } else {
            Err(ApiError::not_found(
                "unknown_query",
                format!("no pending query {}", request.id),
            ))
        };
    }
    match queries.set_result(&request.id, request.result) {
        SetOutcome::Stored => Ok(Json(json!({ "status": "stored" }))),
        SetOutcome::AlreadyCompleted => Ok(Json(json!({ "status": "already_completed" }))),
        SetOutcome::Rejected(current) => Ok(Json(json!({
            "status": "rejected",
            "query_status": current.as_str(),
        }))),
        SetOutcome::Unknown => Err(ApiError::not_found(
            "unknown_query",
            format!("no pending query {}", request.id),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct EntryBatch {
    #[serde(default)]
    entries: Vec<Value>,
}

fn ingest_batch<T: Captured>(
    state: &AppState,
    body: &Bytes,
) -> Result<Json<IngestOutcome>, ApiError> {
    let batch: EntryBatch = decode_json(body)?;
    let outcome = state.ctx().capture.ingest::<T>(batch.entries);
    if outcome.rejected > 0 {
        debug!(
            kind = T::KIND.as_str(),
            rejected = outcome.rejected,
            "malformed capture entries skipped"
        );
    }
    Ok(Json(outcome))
}

pub(crate) async fn post_logs(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<IngestOutcome>, ApiError> {
    ingest_batch::<LogEntry>(&state, &body)
}

pub(crate) async fn clear_logs(State(state): State<AppState>) -> Json<Value> {
    let cleared = state.ctx().capture.clear(CaptureKind::Logs);
    Json(json!({ "cleared": cleared }))
}

pub(crate) async fn websocket_events(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<IngestOutcome>, ApiError> {
    ingest_batch::<WebSocketEvent>(&state, &body)
}

pub(crate) async fn network_bodies(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<IngestOutcome>, ApiError> {
    ingest_batch::<NetworkBody>(&state, &body)
}

pub(crate) async fn network_waterfall(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<IngestOutcome>, ApiError> {
    ingest_batch::<WaterfallEntry>(&state, &body)
}

pub(crate) async fn enhanced_actions(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<IngestOutcome>, ApiError> {
    ingest_batch::<EnhancedAction>(&state, &body)
}

pub(crate) async fn performance_snapshots(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<IngestOutcome>, ApiError> {
    ingest_batch::<PerformanceSnapshot>(&state, &body)
}
