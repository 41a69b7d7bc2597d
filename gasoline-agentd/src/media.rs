//! Screenshot uploads and draw-mode completion. Image artifacts land in
//! `<state>/screenshots/` under sanitized names.

use crate::app::capture::RateLimitError;
use crate::domain::annotation::{Annotation, AnnotationDetail, AnnotationSession};
use crate::{decode_json, ApiError, AppState, CLIENT_HEADER};
use anyhow::{anyhow, Context};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Local, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

const MAX_NAME_PART: usize = 50;
const ANONYMOUS_CLIENT: &str = "anonymous";

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9._-]").expect("regex compile"));
static DRAW_SEQ: AtomicU32 = AtomicU32::new(0);

fn sanitize_for_filename(raw: &str) -> String {
    let mut cleaned = UNSAFE_CHARS.replace_all(raw, "_").into_owned();
    cleaned.truncate(MAX_NAME_PART);
    cleaned
}

/// Decodes `data:<mime>;base64,<payload>`.
fn decode_data_url(data_url: &str) -> Result<Vec<u8>, ApiError> {
    if data_url.is_empty() {
        return Err(ApiError::invalid("missing_data_url", "Missing dataUrl"));
    }
    let Some((_, payload)) = data_url.split_once(',') else {
        return Err(ApiError::invalid("invalid_data_url", "Invalid dataUrl format"));
    };
    STANDARD
        .decode(payload.trim())
        .map_err(|_| ApiError::invalid("invalid_base64", "Invalid base64 data"))
}

fn screenshot_filename(page_url: Option<&str>, correlation_id: Option<&str>) -> String {
    let host = page_url
        .and_then(|url| reqwest::Url::parse(url).ok())
        .and_then(|url| {
            url.host_str().map(|host| match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            })
        })
        .unwrap_or_else(|| "unknown".to_string());
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    match correlation_id.filter(|id| !id.is_empty()) {
        Some(id) => format!(
            "{}-{stamp}-{}.jpg",
            sanitize_for_filename(&host),
            sanitize_for_filename(id)
        ),
        None => format!("{}-{stamp}.jpg", sanitize_for_filename(&host)),
    }
}

/// Joins `name` onto `dir`, refusing anything that would escape it.
fn contained_path(dir: &Path, name: &str) -> Result<PathBuf, ApiError> {
    let candidate = dir.join(name);
    let escapes = Path::new(name).components().count() != 1
        || candidate.parent() != Some(dir)
        || name.starts_with('.');
    if escapes {
        return Err(ApiError::invalid("invalid_path", "Invalid screenshot path"));
    }
    Ok(candidate)
}

fn write_private(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn screenshots_dir(state: &AppState) -> Result<PathBuf, ApiError> {
    let dir = state.paths().screenshots_dir();
    crate::state::create_private_dir(&dir)
        .map_err(|err| ApiError::internal("screenshots_dir", err))?;
    Ok(dir)
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScreenshotUpload {
    #[serde(default)]
    data_url: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    query_id: Option<String>,
}

pub(crate) async fn screenshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let client = headers
        .get(CLIENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or(ANONYMOUS_CLIENT);
    state
        .screenshot_limiter()
        .check(client)
        .map_err(|err| match err {
            RateLimitError::TooFrequent => ApiError::too_many("rate_limited", err.to_string()),
            RateLimitError::CapacityExceeded => {
                ApiError::unavailable("limiter_full", err.to_string())
            }
        })?;

    let upload: ScreenshotUpload = decode_json(&body)?;
    let image = decode_data_url(&upload.data_url)?;
    let filename = screenshot_filename(upload.url.as_deref(), upload.correlation_id.as_deref());
    let dir = screenshots_dir(&state)?;
    let path = contained_path(&dir, &filename)?;
    write_private(&path, &image).map_err(|err| ApiError::internal("save_failed", err))?;
    info!(file = %filename, bytes = image.len(), "screenshot saved");

    let result = json!({
        "filename": filename,
        "path": path.display().to_string(),
        "correlation_id": upload.correlation_id.clone().unwrap_or_default(),
    });
    if let Some(query_id) = upload.query_id.as_deref().filter(|id| !id.is_empty()) {
        let outcome = state.ctx().queries.set_result(query_id, result.clone());
        debug!(%query_id, ?outcome, "screenshot resolved query");
    }
    Ok(Json(result))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct DrawModeRequest {
    #[serde(default)]
    screenshot_data_url: String,
    #[serde(default)]
    annotations: Vec<Value>,
    #[serde(default)]
    element_details: Map<String, Value>,
    #[serde(default)]
    page_url: String,
    #[serde(default)]
    tab_id: i64,
    #[serde(default)]
    annot_session_name: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
}

fn parse_annotations(raw: Vec<Value>) -> (Vec<Annotation>, Vec<String>) {
    let mut parsed = Vec::with_capacity(raw.len());
    let mut warnings = Vec::new();
    for (index, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<Annotation>(value) {
            Ok(annotation) => parsed.push(annotation),
            Err(err) => warnings.push(format!("annotation[{index}]: {err}")),
        }
    }
    (parsed, warnings)
}

fn store_details(state: &AppState, details: &Map<String, Value>) {
    for (correlation_id, raw) in details {
        match serde_json::from_value::<AnnotationDetail>(raw.clone()) {
            Ok(mut detail) => {
                if detail.selector.is_none() && detail.tag.is_none() {
                    debug!(%correlation_id, "draw detail carries no selector or tag");
                }
                detail.correlation_id = correlation_id.clone();
                state.ctx().annotations.store_detail(detail);
            }
            Err(err) => warn!(%correlation_id, %err, "unreadable draw detail"),
        }
    }
}

/// Best effort; a missing or undecodable image leaves the session without one.
fn save_draw_screenshot(dir: &Path, data_url: &str, tab_id: i64) -> Option<PathBuf> {
    let image = decode_data_url(data_url).ok()?;
    let stamp = sanitize_for_filename(&Local::now().format("%Y%m%d-%H%M%S").to_string());
    let seq = DRAW_SEQ.fetch_add(1, Ordering::Relaxed) % 10_000;
    let path = contained_path(dir, &format!("draw_{stamp}_tab{tab_id}_{seq}.png")).ok()?;
    match write_private(&path, &image) {
        Ok(()) => Some(path),
        Err(err) => {
            warn!(%err, "failed to save draw screenshot");
            None
        }
    }
}

fn persist_draw_session(
    dir: &Path,
    request: &DrawModeRequest,
    screenshot: &str,
    annotations: &[Annotation],
) -> anyhow::Result<PathBuf> {
    let stamp = Utc::now().timestamp_millis();
    let mut session = json!({
        "annotations": annotations,
        "element_details": request.element_details,
        "page_url": request.page_url,
        "tab_id": request.tab_id,
        "screenshot": screenshot,
        "timestamp": stamp,
        "correlation_id": request.correlation_id.clone().unwrap_or_default(),
    });
    if let Some(name) = &request.annot_session_name {
        session["annot_session_name"] = Value::String(name.clone());
    }
    let path = dir.join(format!("draw-session-{}-{stamp}.json", request.tab_id));
    if path.parent() != Some(dir) {
        return Err(anyhow!("draw session path escapes {}", dir.display()));
    }
    let bytes = serde_json::to_vec_pretty(&session)?;
    write_private(&path, &bytes)?;
    Ok(path)
}

pub(crate) async fn draw_mode_complete(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let mut request: DrawModeRequest = decode_json(&body)?;
    if request.tab_id <= 0 {
        return Err(ApiError::invalid("invalid_tab", "tab_id is required and must be > 0"));
    }
    let dir = screenshots_dir(&state)?;
    let screenshot = if request.screenshot_data_url.is_empty() {
        None
    } else {
        save_draw_screenshot(&dir, &request.screenshot_data_url, request.tab_id)
    };
    let screenshot = screenshot
        .map(|path| path.display().to_string())
        .unwrap_or_default();

    let (annotations, warnings) = parse_annotations(std::mem::take(&mut request.annotations));
    let session = AnnotationSession {
        tab_id: request.tab_id,
        page_url: request.page_url.clone(),
        screenshot: (!screenshot.is_empty()).then(|| screenshot.clone()),
        annotations: annotations.clone(),
        timestamp: Utc::now().timestamp_millis(),
    };
    let session_name = request
        .annot_session_name
        .as_deref()
        .filter(|name| !name.is_empty());
    let ctx = state.ctx();
    match ctx.annotations.store_session(session, session_name) {
        Ok(satisfied) => {
            for (correlation_id, completion) in satisfied {
                ctx.commands.complete(&correlation_id, completion.to_value());
            }
        }
        Err(err) => warn!(%err, tab_id = request.tab_id, "annotation session not stored"),
    }
    store_details(&state, &request.element_details);

    if let Err(err) = persist_draw_session(&dir, &request, &screenshot, &annotations) {
        warn!(%err, "failed to persist draw session");
    }

    let mut result = json!({
        "status": "stored",
        "annotation_count": annotations.len(),
        "screenshot": screenshot,
    });
    if !warnings.is_empty() {
        result["warnings"] = json!(warnings);
    }
    if let Some(correlation_id) = request.correlation_id.as_deref().filter(|id| !id.is_empty()) {
        ctx.commands.complete(correlation_id, result.clone());
    }
    info!(
        tab_id = request.tab_id,
        annotations = annotations.len(),
        "draw session stored"
    );
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::CommandStatus;
    use crate::domain::query::{PendingQuery, QueryStatus};
    use crate::test_support::{body_json, request, TestDaemon};
    use axum::http::StatusCode;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const PIXEL: &str = "data:image/png;base64,iVBORw0KGgo=";

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_for_filename("a b/c?d"), "a_b_c_d");
        assert_eq!(sanitize_for_filename(&"x".repeat(80)).len(), 50);
        let name = screenshot_filename(Some("http://localhost:3000/app"), Some("corr/1"));
        assert!(name.starts_with("localhost_3000-"), "{name}");
        assert!(name.ends_with("-corr_1.jpg"), "{name}");
        assert!(screenshot_filename(None, None).starts_with("unknown-"));
    }

    #[test]
    fn contained_path_rejects_escapes() {
        let dir = Path::new("/tmp/shots");
        assert!(contained_path(dir, "ok.jpg").is_ok());
        assert!(contained_path(dir, "../evil.jpg").is_err());
        assert!(contained_path(dir, "a/b.jpg").is_err());
        assert!(contained_path(dir, "..").is_err());
    }

    #[test]
    fn data_url_decoding() {
        assert_eq!(decode_data_url("data:text/plain;base64,aGk=").unwrap(), b"hi");
        assert!(decode_data_url("").is_err());
        assert!(decode_data_url("no-comma").is_err());
        assert!(decode_data_url("data:x;base64,@@@").is_err());
    }

    #[tokio::test]
    async fn screenshot_is_saved_and_resolves_query() {
        let daemon = TestDaemon::new();
        let queries = Arc::clone(&daemon.state.ctx().queries);
        let query_id = queries.create(
            PendingQuery::new("screenshot", json!({})),
            Duration::from_secs(10),
        );
        let response = daemon
            .router()
            .oneshot(request(
                "POST",
                "/screenshot",
                json!({
                    "data_url": "data:image/jpeg;base64,aGVsbG8=",
                    "url": "https://app.test/page",
                    "query_id": query_id,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let path = PathBuf::from(body["path"].as_str().unwrap());
        assert!(path.starts_with(daemon.temp.path().join("screenshots")));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert_eq!(queries.status(&query_id), Some(QueryStatus::Completed));
    }

    #[tokio::test]
    async fn second_screenshot_within_a_second_is_limited() {
        let daemon = TestDaemon::new();
        let upload = json!({"data_url": "data:image/jpeg;base64,aGVsbG8="});
        let first = daemon
            .router()
            .oneshot(request("POST", "/screenshot", upload.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = daemon
            .router()
            .oneshot(request("POST", "/screenshot", upload))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            body_json(second).await["message"],
            "Rate limit exceeded: max 1 screenshot per second"
        );
    }

    #[tokio::test]
    async fn draw_mode_requires_positive_tab() {
        let daemon = TestDaemon::new();
        let response = daemon
            .router()
            .oneshot(request("POST", "/draw-mode-complete", json!({"tab_id": 0})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn draw_mode_completion_stores_and_wakes_waiters() {
        let daemon = TestDaemon::new();
        let ctx = daemon.state.ctx().clone();
        ctx.commands
            .register("ann_1", "draw_mode", Duration::from_secs(60))
            .unwrap();
        ctx.annotations.register_waiter("ann_1", None);

        let response = daemon
            .router()
            .oneshot(request(
                "POST",
                "/draw-mode-complete",
                json!({
                    "tab_id": 7,
                    "page_url": "https://app.test/",
                    "screenshot_data_url": PIXEL,
                    "annotations": [
                        {"text": "make this bigger", "rect": {"x": 1, "y": 2, "width": 3, "height": 4}},
                        "not an annotation"
                    ],
                    "element_details": {"el_1": {"selector": "#hero", "tag": "div"}},
                }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "stored");
        assert_eq!(body["annotation_count"], 1);
        assert_eq!(body["warnings"].as_array().unwrap().len(), 1);
        assert!(body["screenshot"].as_str().unwrap().contains("_tab7_"));

        let stored = ctx.annotations.session_for_tab(7).unwrap();
        assert_eq!(stored.annotations[0].text, "make this bigger");
        assert_eq!(
            ctx.annotations.detail("el_1").unwrap().selector.as_deref(),
            Some("#hero")
        );
        assert_eq!(ctx.commands.get("ann_1").unwrap().status, CommandStatus::Complete);

        let sessions: Vec<_> = std::fs::read_dir(daemon.temp.path().join("screenshots"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("draw-session-7-")
            })
            .collect();
        assert_eq!(sessions.len(), 1);
    }
}
