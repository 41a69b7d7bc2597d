use super::{Args, ToolContext};
use crate::app::capture::OverrideError;
use crate::domain::capture::CaptureKind;
use crate::domain::tool_error::{json_result, soft_failure, ErrorCode, ToolError};
use crate::ports::session::SessionStoreError;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const STORE_ACTIONS: &str = "save, load, list, delete, stats";

pub(super) async fn run(ctx: &ToolContext, action: &str, args: &Args) -> Result<Value, ToolError> {
    match action {
        "health" => Ok(health(ctx).await),
        "clear" => clear(ctx, args),
        "capture" => capture(ctx, args),
        "store" => store(ctx, args).await,
        "load" => {
            let sessions = Arc::clone(ctx.sessions()?);
            let context = blocking(move || sessions.load_session_context()).await?;
            Ok(json_result(
                &format!(
                    "Session context for project {} (session #{})",
                    context.project_id, context.session_count
                ),
                &serde_json::to_value(&context).unwrap_or(Value::Null),
            ))
        }
        "restart" => Ok(soft_failure(
            "Restart is handled by the gasoline bridge process",
            &json!({
                "status": "error",
                "restarted": false,
                "message": "This request reached the daemon directly. Restart through the stdio bridge, or run gasoline --stop and start it again.",
            }),
        )),
        other => Err(ToolError::new(
            ErrorCode::Internal,
            format!("configure action {other} has no handler"),
        )),
    }
}

async fn health_payload(ctx: &ToolContext) -> Value {
    let (sessions, named, details) = ctx.annotations.counts();
    let store = match ctx.sessions.as_ref() {
        Some(store) => {
            let store = Arc::clone(store);
            match blocking(move || store.stats()).await {
                Ok(stats) => serde_json::to_value(stats).unwrap_or(Value::Null),
                Err(err) => json!({ "error": err.message }),
            }
        }
        None => Value::Null,
    };
    json!({
        "status": "ok",
        "service": "gasoline",
        "version": ctx.runtime.version,
        "pid": std::process::id(),
        "port": ctx.runtime.port,
        "uptime_seconds": ctx.runtime.uptime_seconds(),
        "upgraded_from": ctx.runtime.upgraded_from,
        "extension": ctx.extension.status(),
        "capture": ctx.capture.stats(),
        "capture_settings": ctx.overrides.effective(),
        "queries": {
            "pending": ctx.queries.pending_count(),
            "failed": ctx.queries.list_failed().len(),
        },
        "commands": {
            "pending": ctx.commands.list_pending().len(),
            "failed": ctx.commands.list_failed().len(),
        },
        "annotations": {
            "sessions": sessions,
            "named_sessions": named,
            "details": details,
        },
        "session_store": store,
    })
}

async fn health(ctx: &ToolContext) -> Value {
    let payload = health_payload(ctx).await;
    let connected = ctx.extension.is_connected();
    json_result(
        &format!(
            "gasoline {} healthy; extension {}",
            ctx.runtime.version,
            if connected { "connected" } else { "not connected" }
        ),
        &payload,
    )
}

fn clear(ctx: &ToolContext, args: &Args) -> Result<Value, ToolError> {
    let buffer = args.str("buffer")?.unwrap_or("all");
    let (label, cleared) = if buffer.eq_ignore_ascii_case("all") {
        ("all buffers".to_string(), ctx.capture.clear_all())
    } else {
        let kind: CaptureKind = buffer.parse().map_err(|_| {
            let mut valid: Vec<&str> = CaptureKind::ALL.iter().map(CaptureKind::as_str).collect();
            valid.push("all");
            ToolError::invalid_param("buffer", format!("Unknown buffer: {buffer}"))
                .hint(format!("Valid values: {}", valid.join(", ")))
        })?;
        (kind.as_str().to_string(), ctx.capture.clear(kind))
    };
    info!(buffer = %label, cleared, "buffers cleared");
    Ok(json_result(
        &format!("Cleared {cleared} entries from {label}"),
        &json!({ "cleared": cleared, "buffer": buffer }),
    ))
}

fn capture(ctx: &ToolContext, args: &Args) -> Result<Value, ToolError> {
    if args.bool_or("reset", false)? {
        ctx.overrides.reset();
        return Ok(json_result(
            "Capture settings reset to defaults",
            &json!({ "settings": ctx.overrides.effective() }),
        ));
    }
    let settings = args.object("settings")?.ok_or_else(|| {
        ToolError::missing_param(
            "settings",
            "Pass settings, e.g. {\"log_level\": \"all\"}, or reset=true.",
        )
    })?;
    let changes: BTreeMap<String, String> = settings
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect();
    ctx.overrides.apply(&changes).map_err(|err| match err {
        OverrideError::RateLimited => {
            ToolError::new(ErrorCode::RateLimited, err.to_string()).retry_after(1000)
        }
        OverrideError::UnknownKey { ref key, ref valid } => {
            ToolError::invalid_param("settings", err.to_string())
                .detail(key.clone())
                .hint(format!("Valid settings: {valid}"))
        }
        OverrideError::InvalidValue { ref key, ref valid, .. } => {
            ToolError::invalid_param("settings", err.to_string())
                .detail(key.clone())
                .hint(format!("Valid values: {valid}"))
        }
    })?;
    info!(?changes, "capture settings changed");
    Ok(json_result(
        "Capture settings updated; the extension picks them up on its next sync",
        &json!({
            "settings": ctx.overrides.effective(),
            "overrides": ctx.overrides.overrides(),
        }),
    ))
}

async fn store(ctx: &ToolContext, args: &Args) -> Result<Value, ToolError> {
    let store_action = args.required_str(
        "store_action",
        &format!("Valid values: {STORE_ACTIONS}"),
    )?;
    let sessions = Arc::clone(ctx.sessions()?);
    match store_action {
        "save" => {
            let (namespace, key) = namespace_and_key(args)?;
            let data = args
                .value("data")
                .ok_or_else(|| ToolError::missing_param("data", "Pass the JSON value to save."))?;
            let bytes = serde_json::to_vec(data)
                .map_err(|err| ToolError::new(ErrorCode::InvalidJson, err.to_string()))?;
            let size = bytes.len();
            let (ns, k) = (namespace.clone(), key.clone());
            blocking(move || sessions.save(&ns, &k, &bytes)).await?;
            Ok(json_result(
                &format!("Saved {namespace}/{key}"),
                &json!({ "namespace": namespace, "key": key, "bytes": size }),
            ))
        }
        "load" => {
            let (namespace, key) = namespace_and_key(args)?;
            let (ns, k) = (namespace.clone(), key.clone());
            let bytes = blocking(move || sessions.load(&ns, &k)).await?;
            let data: Value = serde_json::from_slice(&bytes).map_err(|err| {
                ToolError::new(
                    ErrorCode::Internal,
                    format!("stored value {namespace}/{key} is not valid JSON: {err}"),
                )
            })?;
            Ok(json_result(
                &format!("Loaded {namespace}/{key}"),
                &json!({ "namespace": namespace, "key": key, "data": data }),
            ))
        }
        "list" => {
            let namespace = args
                .required_str("namespace", "Pass the namespace to list.")?
                .to_string();
            let ns = namespace.clone();
            let keys = blocking(move || sessions.list(&ns)).await?;
            Ok(json_result(
                &format!("{} key(s) in {namespace}", keys.len()),
                &json!({ "namespace": namespace, "keys": keys }),
            ))
        }
        "delete" => {
            let (namespace, key) = namespace_and_key(args)?;
            let (ns, k) = (namespace.clone(), key.clone());
            blocking(move || sessions.delete(&ns, &k)).await?;
            Ok(json_result(
                &format!("Deleted {namespace}/{key}"),
                &json!({ "namespace": namespace, "key": key, "deleted": true }),
            ))
        }
        "stats" => {
            let stats = blocking(move || sessions.stats()).await?;
            Ok(json_result(
                &format!("Session store for project {}", stats.project_id),
                &serde_json::to_value(stats).unwrap_or(Value::Null),
            ))
        }
        other => Err(ToolError::invalid_param(
            "store_action",
            format!("unknown action: {other} (valid: {STORE_ACTIONS})"),
        )),
    }
}

fn namespace_and_key(args: &Args) -> Result<(String, String), ToolError> {
    let namespace = args.required_str("namespace", "Pass the store namespace.")?;
    let key = args.required_str("key", "Pass the store key.")?;
    Ok((namespace.to_string(), key.to_string()))
}

/// Runs a session-store call off the async workers.
async fn blocking<T, F>(call: F) -> Result<T, ToolError>
where
    F: FnOnce() -> Result<T, SessionStoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|err| ToolError::new(ErrorCode::Internal, format!("store task failed: {err}")))?
        .map_err(store_error)
}

fn store_error(err: SessionStoreError) -> ToolError {
    let message = err.to_string();
    match err {
        SessionStoreError::NotFound { .. } => ToolError::new(ErrorCode::NoData, message),
        SessionStoreError::InvalidName { what, .. } => ToolError::invalid_param(what, message),
        SessionStoreError::EntryTooLarge { .. } | SessionStoreError::QuotaExceeded { .. } => {
            ToolError::invalid_param("data", message).not_retryable()
        }
        SessionStoreError::Closed
        | SessionStoreError::Io { .. }
        | SessionStoreError::Decode { .. } => {
            ToolError::new(ErrorCode::Internal, message).subsystem("session_store")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::ToolHandler;
    use crate::adapters::session::InMemoryRecordRepository;
    use crate::app::session::SessionStore;
    use crate::domain::capture::LogEntry;
    use serde_json::{json, Value};
    use std::path::Path;
    use std::sync::Arc;

    fn handler_with_store() -> ToolHandler {
        let mut ctx = context();
        let repo = Arc::new(InMemoryRecordRepository::default());
        ctx.sessions = Some(SessionStore::with_repository(repo, Path::new("/work/app")).unwrap());
        ToolHandler::new(ctx)
    }

    fn payload(result: &Value) -> Value {
        serde_json::from_str(text(result).split_once('\n').unwrap().1).unwrap()
    }

    #[tokio::test]
    async fn store_save_load_list_delete() {
        let handler = handler_with_store();
        let saved = handler
            .call(
                "configure",
                json!({"action": "store", "store_action": "save", "namespace": "baselines",
                       "key": "login", "data": {"steps": ["open"]}}),
            )
            .await;
        assert!(saved.get("isError").is_none(), "{saved}");

        let loaded = handler
            .call(
                "configure",
                json!({"action": "store", "store_action": "load", "namespace": "baselines", "key": "login"}),
            )
            .await;
        assert_eq!(payload(&loaded)["data"], json!({"steps": ["open"]}));

        let listed = handler
            .call(
                "configure",
                json!({"action": "store", "store_action": "list", "namespace": "baselines"}),
            )
            .await;
        assert_eq!(payload(&listed)["keys"], json!(["login"]));

        handler
            .call(
                "configure",
                json!({"action": "store", "store_action": "delete", "namespace": "baselines", "key": "login"}),
            )
            .await;
        let gone = handler
            .call(
                "configure",
                json!({"action": "store", "store_action": "load", "namespace": "baselines", "key": "login"}),
            )
            .await;
        assert_eq!(gone["error_code"], "no_data");
        assert!(text(&gone).contains("key not found: baselines/login"));
    }

    #[tokio::test]
    async fn unknown_store_action_lists_valid_ones() {
        let handler = handler_with_store();
        let result = handler
            .call("configure", json!({"action": "store", "store_action": "purge"}))
            .await;
        assert!(text(&result).contains("unknown action: purge (valid: save, load, list, delete, stats)"));
    }

    #[tokio::test]
    async fn load_returns_session_context() {
        let handler = handler_with_store();
        let result = handler.call("configure", json!({"action": "load"})).await;
        let body = payload(&result);
        assert_eq!(body["session_count"], 1);
        assert_eq!(body["error_history"], json!([]));
    }

    #[tokio::test]
    async fn capture_overrides_are_rate_limited() {
        let handler = ToolHandler::new(context());
        let first = handler
            .call("configure", json!({"action": "capture", "settings": {"log_level": "all"}}))
            .await;
        assert_eq!(payload(&first)["settings"]["log_level"], "all");
        let second = handler
            .call("configure", json!({"action": "capture", "settings": {"ws_mode": "messages"}}))
            .await;
        assert_eq!(second["error_code"], "rate_limited");
        assert_eq!(second["retry_after_ms"], 1000);
    }

    #[tokio::test]
    async fn capture_rejects_unknown_setting() {
        let handler = ToolHandler::new(context());
        let result = handler
            .call("configure", json!({"action": "capture", "settings": {"verbosity": "max"}}))
            .await;
        assert_eq!(result["error_code"], "invalid_param");
        assert!(result["hint"].as_str().unwrap().contains("log_level"));
    }

    #[tokio::test]
    async fn clear_single_buffer_and_all() {
        let ctx = context();
        let entry: LogEntry =
            serde_json::from_value(json!({"level": "error", "message": "boom"})).unwrap();
        ctx.capture.append(entry.clone());
        ctx.capture.append(entry);
        let handler = ToolHandler::new(ctx);
        let result = handler
            .call("configure", json!({"action": "clear", "buffer": "logs"}))
            .await;
        assert_eq!(payload(&result)["cleared"], 2);
        let bad = handler
            .call("configure", json!({"action": "clear", "buffer": "cookies"}))
            .await;
        assert_eq!(bad["error_code"], "invalid_param");
    }

    #[tokio::test]
    async fn health_reports_service_and_version() {
        let handler = ToolHandler::new(context());
        let result = handler.call("configure", json!({"action": "health"})).await;
        let body = payload(&result);
        assert_eq!(body["service"], "gasoline");
        assert_eq!(body["version"], crate::VERSION);
    }

    #[tokio::test]
    async fn restart_reaching_daemon_is_reported() {
        let handler = ToolHandler::new(context());
        let result = handler.call("configure", json!({"action": "restart"})).await;
        assert_eq!(result["isError"], true);
        assert_eq!(payload(&result)["restarted"], false);
    }
}
