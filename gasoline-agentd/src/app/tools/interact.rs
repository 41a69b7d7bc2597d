use super::{extension_result, Args, ToolContext};
use crate::app::annotations::SESSION_TTL;
use crate::domain::command::CommandStatus;
use crate::domain::query::PendingQuery;
use crate::domain::tool_error::{json_result, ErrorCode, ToolError};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

pub(super) async fn run(ctx: &ToolContext, action: &str, args: &Args) -> Result<Value, ToolError> {
    let tab_id = ctx.require_tab()?;
    if action == "draw_mode_start" {
        return draw_mode_start(ctx, tab_id, args);
    }
    let (kind, params) = build_query(action, args)?;
    let correlation_id = format!("{action}_{}", Uuid::new_v4().simple());
    let query = PendingQuery::new(kind, params)
        .with_tab(Some(tab_id))
        .with_correlation(correlation_id.as_str());
    ctx.queries.create(query, ctx.timeouts.interact);
    info!(%action, correlation = %correlation_id, tab_id, "interact queued");

    if args.bool_or("background", false)? {
        return Ok(json_result(
            &format!("{action} queued; poll observe what=command_result"),
            &json!({
                "status": "queued",
                "queued": true,
                "final": false,
                "correlation_id": correlation_id,
            }),
        ));
    }

    let Some(command) = ctx
        .commands
        .wait_for_command(&correlation_id, ctx.timeouts.interact)
        .await
    else {
        return Err(ToolError::new(
            ErrorCode::Internal,
            format!("command {correlation_id} disappeared while waiting"),
        ));
    };
    match command.status {
        CommandStatus::Pending => Ok(json_result(
            &format!("{action} is still processing"),
            &json!({
                "status": "still_processing",
                "final": false,
                "correlation_id": correlation_id,
                "suggested_retry_ms": 2000,
            }),
        )),
        CommandStatus::Complete => {
            let result = command.result.unwrap_or(Value::Null);
            Ok(extension_result(
                &format!("{action} done"),
                &json!({
                    "correlation_id": correlation_id,
                    "status": "complete",
                    "success": result.get("success").cloned().unwrap_or(Value::Bool(true)),
                    "error": result.get("error").cloned().unwrap_or(Value::Null),
                    "result": result,
                }),
            ))
        }
        CommandStatus::Timeout | CommandStatus::Expired => Err(ToolError::new(
            ErrorCode::ExtensionTimeout,
            command
                .error
                .unwrap_or_else(|| format!("Timed out waiting for {action}")),
        )
        .correlation(correlation_id)
        .retry_after(2000)),
        CommandStatus::Error | CommandStatus::Cancelled => Err(ToolError::new(
            ErrorCode::ExtensionError,
            command
                .error
                .unwrap_or_else(|| format!("{action} failed in the extension")),
        )
        .correlation(correlation_id)),
    }
}

fn build_query(action: &str, args: &Args) -> Result<(&'static str, Value), ToolError> {
    Ok(match action {
        "navigate" => {
            let url = args.required_str("url", "Pass the absolute URL to open.")?;
            if !(url.starts_with("http://") || url.starts_with("https://") || url.starts_with("file://")) {
                return Err(ToolError::invalid_param(
                    "url",
                    format!("'{url}' is not an http(s) or file URL"),
                ));
            }
            ("browser_action", json!({ "action": "navigate", "url": url }))
        }
        "refresh" | "back" | "forward" => ("browser_action", json!({ "action": action })),
        "click" | "highlight" => {
            let selector = args.required_str("selector", "Pass a CSS selector for the element.")?;
            ("dom_action", json!({ "action": action, "selector": selector }))
        }
        "type" => {
            let selector = args.required_str("selector", "Pass a CSS selector for the input.")?;
            let text = args.str("text")?.ok_or_else(|| {
                ToolError::missing_param("text", "Pass the text to type.")
            })?;
            (
                "dom_action",
                json!({ "action": "type", "selector": selector, "text": text }),
            )
        }
        "execute_js" => {
            let script = args.required_str("script", "Pass the JavaScript to evaluate.")?;
            ("execute", json!({ "script": script }))
        }
        other => {
            return Err(ToolError::new(
                ErrorCode::Internal,
                format!("interact action {other} has no handler"),
            ))
        }
    })
}

/// Starts draw mode and returns at once; the user may take minutes. The
/// correlation id completes when the extension posts the finished session.
fn draw_mode_start(ctx: &ToolContext, tab_id: i64, args: &Args) -> Result<Value, ToolError> {
    let session = args.str("session")?;
    let correlation_id = format!("ann_{}", Uuid::new_v4().simple());
    ctx.commands
        .register(&correlation_id, "draw_mode", SESSION_TTL)
        .map_err(|err| ToolError::new(ErrorCode::Internal, err.to_string()))?;
    ctx.annotations.mark_draw_started(tab_id);
    ctx.annotations.register_waiter(&correlation_id, session);
    let query = PendingQuery::new(
        "draw_mode",
        json!({
            "action": "start",
            "session": session,
            "correlation_id": correlation_id,
        }),
    )
    .with_tab(Some(tab_id));
    ctx.queries.create(query, ctx.timeouts.interact);
    info!(correlation = %correlation_id, tab_id, session = ?session, "draw mode requested");
    Ok(json_result(
        "Draw mode started. Ask the user to draw on the page and press Escape when done.",
        &json!({
            "status": "waiting_for_user",
            "correlation_id": correlation_id,
            "session": session,
            "final": false,
            "next": "analyze what=annotations wait=true, or observe what=command_result",
        }),
    ))
}
