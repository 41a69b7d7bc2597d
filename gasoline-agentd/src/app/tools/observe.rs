use super::{extension_result, Args, ToolContext};
use crate::app::capture::{Captured, MAX_OBSERVE_LIMIT};
use crate::domain::capture::{
    CaptureFilter, Cursor, EnhancedAction, LogEntry, LogLevel, NetworkBody, PageRequest,
    PerformanceSnapshot, WaterfallEntry, WebSocketEvent,
};
use crate::domain::command::CommandStatus;
use crate::domain::query::PendingQuery;
use crate::domain::tool_error::{json_result, soft_failure, ErrorCode, ToolError};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

const DEFAULT_LIMIT: usize = 100;

pub(super) async fn run(ctx: &ToolContext, what: &str, args: &Args) -> Result<Value, ToolError> {
    match what {
        "errors" => {
            let filter = base_filter(args)?.levels(vec![LogLevel::Error]);
            read::<LogEntry>(ctx, "errors", filter, args)
        }
        "logs" => {
            let mut filter = base_filter(args)?;
            if let Some(levels) = level_filter(args)? {
                filter = filter.levels(levels);
            }
            read::<LogEntry>(ctx, "logs", filter, args)
        }
        "network_waterfall" => {
            refresh_waterfall(ctx).await;
            read::<WaterfallEntry>(ctx, "network_waterfall", base_filter(args)?, args)
        }
        "network_bodies" => {
            let mut filter = base_filter(args)?;
            filter.status_min = args.status_code("status_min")?;
            filter.status_max = args.status_code("status_max")?;
            if let (Some(min), Some(max)) = (filter.status_min, filter.status_max) {
                if min > max {
                    return Err(ToolError::invalid_param(
                        "status_min",
                        format!("status_min ({min}) is greater than status_max ({max})"),
                    ));
                }
            }
            read::<NetworkBody>(ctx, "network_bodies", filter, args)
        }
        "websocket_events" => {
            let mut filter = base_filter(args)?;
            filter.connection_id = args.str("connection_id")?.map(str::to_string);
            read::<WebSocketEvent>(ctx, "websocket_events", filter, args)
        }
        "actions" => read::<EnhancedAction>(ctx, "actions", base_filter(args)?, args),
        "performance" => {
            read::<PerformanceSnapshot>(ctx, "performance", base_filter(args)?, args)
        }
        "page" => page(ctx),
        "screenshot" => screenshot(ctx).await,
        "command_result" => command_result(ctx, args).await,
        "pending_commands" => Ok(pending_commands(ctx)),
        "failed_commands" => {
            let limit = args.limit("limit", DEFAULT_LIMIT, MAX_OBSERVE_LIMIT)?;
            let failed: Vec<_> = ctx.commands.list_failed().into_iter().take(limit).collect();
            Ok(json_result(
                &format!("{} failed command(s)", failed.len()),
                &json!({ "count": failed.len(), "commands": failed }),
            ))
        }
        other => Err(ToolError::new(
            ErrorCode::Internal,
            format!("observe mode {other} has no handler"),
        )),
    }
}

fn base_filter(args: &Args) -> Result<CaptureFilter, ToolError> {
    let mut filter = CaptureFilter::default();
    if let Some(url) = args.str("url")? {
        filter = filter.url(url);
    }
    Ok(filter)
}

/// `level` selects that severity and everything above it; `all` disables the filter.
fn level_filter(args: &Args) -> Result<Option<Vec<LogLevel>>, ToolError> {
    let Some(raw) = args.str("level")? else {
        return Ok(None);
    };
    if raw.eq_ignore_ascii_case("all") {
        return Ok(None);
    }
    let floor: LogLevel = raw.parse().map_err(|_| {
        ToolError::invalid_param("level", format!("Unknown log level: {raw}"))
            .hint("Valid values: debug, log, info, warn, error, all")
    })?;
    let levels = [
        LogLevel::Debug,
        LogLevel::Log,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
    ]
    .into_iter()
    .filter(|level| *level >= floor)
    .collect();
    Ok(Some(levels))
}

fn read<T: Captured>(
    ctx: &ToolContext,
    label: &str,
    filter: CaptureFilter,
    args: &Args,
) -> Result<Value, ToolError> {
    let limit = args.limit("limit", DEFAULT_LIMIT, MAX_OBSERVE_LIMIT)?;
    let request = PageRequest {
        cursor: cursor_arg(args)?,
        limit,
        restart_on_eviction: args.bool_or("restart_on_eviction", false)?,
    };
    let page = ctx.capture.page::<T>(&filter, request).map_err(|err| {
        let param = match request.cursor {
            Some(Cursor::Before(_)) => "before_cursor",
            Some(Cursor::Since(_)) => "since_cursor",
            _ => "after_cursor",
        };
        ToolError::invalid_param(param, err.to_string())
            .hint("Check the cursor or pass restart_on_eviction: true")
    })?;
    let total = ctx.capture.len(T::KIND);
    let forward = page.forward;
    let mut entries: Vec<T> = page.entries.into_iter().map(|(_, entry)| entry).collect();
    if !forward {
        entries.reverse();
    }
    let order = if forward { "oldest first" } else { "newest first" };
    let summary = if entries.is_empty() {
        format!("No {label} captured yet ({total} in buffer before filtering)")
    } else {
        format!("{} {label} entr{} ({order})", entries.len(), plural_y(entries.len()))
    };
    let mut body = listing(&entries, total, limit);
    body["pagination"] = json!(page.meta);
    Ok(json_result(&summary, &body))
}

/// At most one of `after_cursor`, `before_cursor`, `since_cursor`.
fn cursor_arg(args: &Args) -> Result<Option<Cursor>, ToolError> {
    let mut found = None;
    for (param, kind) in [
        ("after_cursor", "after"),
        ("before_cursor", "before"),
        ("since_cursor", "since"),
    ] {
        let Some(raw) = args.str(param)? else {
            continue;
        };
        if found.is_some() {
            return Err(ToolError::invalid_param(
                param,
                "Use only one of after_cursor, before_cursor, since_cursor",
            ));
        }
        let cursor = Cursor::parse(kind, raw)
            .map_err(|err| ToolError::invalid_param(param, err.to_string()))?;
        found = Some(cursor);
    }
    Ok(found)
}

fn listing<T: Serialize>(entries: &[T], total: usize, limit: usize) -> Value {
    json!({
        "count": entries.len(),
        "total_in_buffer": total,
        "limit": limit,
        "entries": entries,
    })
}

fn plural_y(count: usize) -> &'static str {
    if count == 1 {
        "y"
    } else {
        "ies"
    }
}

/// Asks the extension for a fresh waterfall when the buffered one is stale.
/// Any failure falls back to what is already buffered.
async fn refresh_waterfall(ctx: &ToolContext) {
    let staleness = chrono::Duration::from_std(ctx.timeouts.staleness)
        .unwrap_or_else(|_| chrono::Duration::seconds(1));
    let fresh = ctx
        .capture
        .newest_timestamp::<WaterfallEntry>()
        .map_or(false, |newest| Utc::now() - newest < staleness);
    if fresh || !ctx.extension.is_connected() {
        return;
    }
    let Some(tab_id) = ctx.extension.tracked_tab() else {
        return;
    };
    let query = PendingQuery::new("waterfall", json!({})).with_tab(Some(tab_id));
    match ctx.ask_extension(query, ctx.timeouts.waterfall_refresh).await {
        Ok(result) => {
            let entries = match result {
                Value::Array(items) => items,
                Value::Object(mut map) => match map.remove("entries") {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            };
            let outcome = ctx.capture.ingest::<WaterfallEntry>(entries);
            debug!(received = outcome.received, rejected = outcome.rejected, "waterfall refreshed");
        }
        Err(err) => debug!(%err, "waterfall refresh skipped"),
    }
}

fn page(ctx: &ToolContext) -> Result<Value, ToolError> {
    let status = ctx.extension.status();
    if !status.settings.tracking_enabled || status.settings.tracked_tab_id.is_none() {
        return Err(ToolError::new(ErrorCode::NoData, "No tab is tracked")
            .hint("Open the Gasoline extension popup and click 'Track This Tab'."));
    }
    let latest_perf = ctx
        .capture
        .snapshot::<PerformanceSnapshot>(&CaptureFilter::default(), 1)
        .into_iter()
        .next();
    let payload = json!({
        "tab_id": status.settings.tracked_tab_id,
        "url": status.settings.tracked_tab_url,
        "title": status.settings.tracked_tab_title,
        "extension_connected": status.connected,
        "last_sync": status.last_sync,
        "performance": latest_perf,
    });
    let url = status.settings.tracked_tab_url.as_deref().unwrap_or("(unknown url)");
    Ok(json_result(&format!("Tracked page: {url}"), &payload))
}

async fn screenshot(ctx: &ToolContext) -> Result<Value, ToolError> {
    let tab_id = ctx.require_tab()?;
    let query = PendingQuery::new("screenshot", json!({})).with_tab(Some(tab_id));
    let result = ctx.ask_extension(query, ctx.timeouts.screenshot).await?;
    Ok(extension_result("Screenshot captured", &result))
}

async fn command_result(ctx: &ToolContext, args: &Args) -> Result<Value, ToolError> {
    let correlation_id = args.required_str(
        "correlation_id",
        "Pass the correlation_id returned by interact or draw mode.",
    )?;
    let command = if correlation_id.starts_with("ann_") {
        ctx.commands
            .wait_for_command(correlation_id, ctx.timeouts.annotation)
            .await
    } else {
        ctx.commands.get(correlation_id)
    };
    let Some(command) = command else {
        return Err(ToolError::new(
            ErrorCode::NoData,
            format!("No command found for correlation_id {correlation_id}"),
        )
        .param("correlation_id")
        .correlation(correlation_id)
        .hint("Results are kept for 60 seconds after completion."));
    };
    let elapsed_ms = command.elapsed_ms(Utc::now());
    let mut payload = serde_json::to_value(&command).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut payload {
        map.insert("elapsed_ms".into(), json!(elapsed_ms));
        map.insert("final".into(), json!(command.status.is_terminal()));
    }
    let summary = format!("Command {correlation_id}: {}", command.status.as_str());
    Ok(match command.status {
        CommandStatus::Pending => {
            if let Value::Object(map) = &mut payload {
                map.insert("status".into(), json!("still_processing"));
                map.insert("suggested_retry_ms".into(), json!(2000));
            }
            json_result(&format!("Command {correlation_id} is still processing"), &payload)
        }
        status if status.is_failure() => soft_failure(&summary, &payload),
        _ => match &command.result {
            Some(result) => extension_result(&summary, &json!({
                "correlation_id": command.correlation_id,
                "status": command.status,
                "elapsed_ms": elapsed_ms,
                "result": result,
                "success": result.get("success").cloned().unwrap_or(Value::Bool(true)),
                "error": result.get("error").cloned().unwrap_or(Value::Null),
            })),
            None => json_result(&summary, &payload),
        },
    })
}

fn pending_commands(ctx: &ToolContext) -> Value {
    let commands = ctx.commands.list_pending();
    let queries = ctx.queries.list_pending();
    json_result(
        &format!(
            "{} pending command(s), {} pending quer{}",
            commands.len(),
            queries.len(),
            plural_y(queries.len())
        ),
        &json!({
            "commands": commands,
            "queries": queries,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::ToolHandler;
    use crate::domain::capture::{CaptureKind, LogEntry};
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::time::Duration;

    fn payload(result: &Value) -> Value {
        let text = text(result);
        let body = text.split_once('\n').map(|(_, body)| body).unwrap_or("{}");
        serde_json::from_str(body).unwrap()
    }

    fn log(level: &str, message: &str, age_secs: i64) -> LogEntry {
        serde_json::from_value(json!({
            "level": level,
            "message": message,
            "url": "https://app.test/page",
            "timestamp": Utc::now() - ChronoDuration::seconds(age_secs),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn errors_reads_error_level_newest_first() {
        let ctx = context();
        ctx.capture.append(log("error", "older", 10));
        ctx.capture.append(log("warn", "noise", 5));
        ctx.capture.append(log("error", "newer", 1));
        let handler = ToolHandler::new(ctx);

        let result = handler.call("observe", json!({"what": "errors"})).await;
        let body = payload(&result);
        assert_eq!(body["count"], 2);
        assert_eq!(body["entries"][0]["message"], "newer");
        assert_eq!(body["entries"][1]["message"], "older");
    }

    #[tokio::test]
    async fn logs_level_is_a_floor() {
        let ctx = context();
        ctx.capture.append(log("debug", "d", 3));
        ctx.capture.append(log("warn", "w", 2));
        ctx.capture.append(log("error", "e", 1));
        let handler = ToolHandler::new(ctx);

        let result = handler
            .call("observe", json!({"what": "logs", "level": "warn"}))
            .await;
        assert_eq!(payload(&result)["count"], 2);

        let all = handler
            .call("observe", json!({"what": "logs", "level": "all", "limit": 2}))
            .await;
        assert_eq!(payload(&all)["count"], 2);
    }

    #[tokio::test]
    async fn logs_page_forward_with_after_cursor() {
        let ctx = context();
        for i in 0..5 {
            ctx.capture.append(log("info", &format!("m{i}"), 10 - i));
        }
        let handler = ToolHandler::new(ctx);

        let newest = handler
            .call("observe", json!({"what": "logs", "limit": 2}))
            .await;
        let body = payload(&newest);
        assert_eq!(body["entries"][0]["message"], "m4");
        assert_eq!(body["entries"][1]["message"], "m3");
        assert_eq!(body["pagination"]["before_cursor"], "3");
        assert_eq!(body["pagination"]["after_cursor"], "4");
        assert_eq!(body["pagination"]["has_more"], true);

        let forward = handler
            .call(
                "observe",
                json!({"what": "logs", "limit": 2, "after_cursor": "1"}),
            )
            .await;
        let body = payload(&forward);
        assert_eq!(body["entries"][0]["message"], "m2");
        assert_eq!(body["entries"][1]["message"], "m3");
        assert_eq!(body["pagination"]["after_cursor"], "3");
        assert!(text(&forward).contains("oldest first"));
    }

    #[tokio::test]
    async fn evicted_cursor_fails_or_restarts() {
        let ctx = context();
        ctx.capture.set_capacity(CaptureKind::Logs, 3);
        for i in 0..6 {
            ctx.capture.append(log("error", &format!("m{i}"), 10 - i));
        }
        let handler = ToolHandler::new(ctx);

        let stale = handler
            .call("observe", json!({"what": "errors", "after_cursor": "0"}))
            .await;
        assert_eq!(stale["error_code"], "invalid_param");
        assert_eq!(stale["param"], "after_cursor");
        assert!(text(&stale).contains("cursor expired"));

        let restarted = handler
            .call(
                "observe",
                json!({"what": "errors", "after_cursor": "0", "restart_on_eviction": true}),
            )
            .await;
        let body = payload(&restarted);
        assert_eq!(body["count"], 3);
        assert_eq!(body["entries"][0]["message"], "m3");
        assert_eq!(body["pagination"]["cursor_restarted"], true);
        assert_eq!(body["pagination"]["original_cursor"], "0");
    }

    #[tokio::test]
    async fn conflicting_cursors_are_rejected() {
        let handler = ToolHandler::new(context());
        let result = handler
            .call(
                "observe",
                json!({"what": "actions", "after_cursor": "1", "before_cursor": "4"}),
            )
            .await;
        assert_eq!(result["error_code"], "invalid_param");
        assert_eq!(result["param"], "before_cursor");
    }

    #[tokio::test]
    async fn unknown_param_for_mode_is_rejected() {
        let handler = ToolHandler::new(context());
        let result = handler
            .call("observe", json!({"what": "errors", "selector": "#x"}))
            .await;
        assert_eq!(result["error_code"], "invalid_param");
        assert_eq!(result["param"], "selector");
    }

    #[tokio::test]
    async fn network_bodies_rejects_inverted_status_range() {
        let handler = ToolHandler::new(context());
        let result = handler
            .call(
                "observe",
                json!({"what": "network_bodies", "status_min": 500, "status_max": 400}),
            )
            .await;
        assert_eq!(result["error_code"], "invalid_param");
    }

    #[tokio::test]
    async fn screenshot_requires_tracked_tab() {
        let handler = ToolHandler::new(context());
        let result = handler.call("observe", json!({"what": "screenshot"})).await;
        assert_eq!(result["error_code"], "no_data");
        assert!(text(&result).contains("No tab is tracked"));
    }

    #[tokio::test]
    async fn screenshot_times_out_as_extension_timeout() {
        let ctx = context();
        track_tab(&ctx, 7);
        let handler = ToolHandler::new(ctx);
        let result = handler.call("observe", json!({"what": "screenshot"})).await;
        assert_eq!(result["error_code"], "extension_timeout");
        assert_eq!(result["retry_after_ms"], 2000);
    }

    #[tokio::test]
    async fn screenshot_returns_extension_answer() {
        let ctx = context();
        track_tab(&ctx, 7);
        let queries = Arc::clone(&ctx.queries);
        let handler = ToolHandler::new(ctx);
        let answer = tokio::spawn(async move {
            let dispatched = queries.wait_for_dispatchable(Duration::from_secs(1)).await;
            let query = dispatched.first().unwrap();
            assert_eq!(query.kind, "screenshot");
            assert_eq!(query.tab_id, Some(7));
            queries.set_result(&query.id, json!({"success": true, "filename": "shot.jpg"}));
        });
        let result = handler.call("observe", json!({"what": "screenshot"})).await;
        answer.await.unwrap();
        assert!(result.get("isError").is_none());
        assert!(text(&result).contains("shot.jpg"));
    }

    #[tokio::test]
    async fn command_result_for_unknown_id_is_no_data() {
        let handler = ToolHandler::new(context());
        let result = handler
            .call("observe", json!({"what": "command_result", "correlation_id": "nav_1"}))
            .await;
        assert_eq!(result["error_code"], "no_data");
        assert_eq!(result["correlation_id"], "nav_1");
    }

    #[tokio::test]
    async fn command_result_reports_pending_as_still_processing() {
        let ctx = context();
        ctx.commands
            .register("nav_1", "browser_action", Duration::from_secs(30))
            .unwrap();
        let handler = ToolHandler::new(ctx);
        let result = handler
            .call("observe", json!({"what": "command_result", "correlation_id": "nav_1"}))
            .await;
        let body = payload(&result);
        assert_eq!(body["status"], "still_processing");
        assert_eq!(body["final"], false);
    }
}
