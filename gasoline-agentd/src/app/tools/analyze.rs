use super::{extension_result, Args, ToolContext};
use crate::app::annotations::SESSION_TTL;
use crate::app::capture::MAX_OBSERVE_LIMIT;
use crate::domain::capture::{CaptureFilter, PerformanceSnapshot, WaterfallEntry};
use crate::domain::command::{CommandResult, CommandStatus};
use crate::domain::query::PendingQuery;
use crate::domain::tool_error::{json_result, soft_failure, ErrorCode, ToolError};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

pub(super) async fn run(ctx: &ToolContext, what: &str, args: &Args) -> Result<Value, ToolError> {
    match what {
        "accessibility" => accessibility(ctx, args).await,
        "annotations" => annotations(ctx, args).await,
        "annotation_detail" => {
            let correlation_id = args.required_str(
                "correlation_id",
                "Pass the element correlation_id from an annotation.",
            )?;
            match ctx.annotations.detail(correlation_id) {
                Some(detail) => Ok(json_result(
                    &format!("Element detail for {correlation_id}"),
                    &serde_json::to_value(&detail).unwrap_or(Value::Null),
                )),
                None => Err(ToolError::new(
                    ErrorCode::NoData,
                    format!("No annotation detail for {correlation_id}"),
                )
                .param("correlation_id")
                .correlation(correlation_id)
                .hint("Element details expire 10 minutes after the draw session.")),
            }
        }
        "performance" => Ok(performance(ctx, args.str("url")?)),
        other => Err(ToolError::new(
            ErrorCode::Internal,
            format!("analyze mode {other} has no handler"),
        )),
    }
}

async fn accessibility(ctx: &ToolContext, args: &Args) -> Result<Value, ToolError> {
    let tab_id = ctx.require_tab()?;
    let tags: Vec<String> = match args.value("tags") {
        None => Vec::new(),
        Some(Value::String(raw)) => raw
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    ToolError::invalid_param("tags", "'tags' must be strings")
                })
            })
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(ToolError::invalid_param(
                "tags",
                "'tags' must be an array of strings",
            ))
        }
    };
    let query = PendingQuery::new(
        "a11y",
        json!({ "scope": args.str("scope")?, "tags": tags }),
    )
    .with_tab(Some(tab_id));
    let result = ctx.ask_extension(query, ctx.timeouts.accessibility).await?;
    let violations = result
        .get("violations")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    Ok(extension_result(
        &format!("Accessibility audit: {violations} violation(s)"),
        &result,
    ))
}

async fn annotations(ctx: &ToolContext, args: &Args) -> Result<Value, ToolError> {
    let session = args.str("session")?;
    let wait = args.bool_or("wait", false)?;

    if let Some(correlation_id) = args.str("correlation_id")? {
        let command = if wait {
            ctx.commands
                .wait_for_command(correlation_id, ctx.timeouts.annotation)
                .await
        } else {
            ctx.commands.get(correlation_id)
        };
        return match command {
            Some(command) => Ok(command_outcome(command)),
            None => Err(ToolError::new(
                ErrorCode::NoData,
                format!("No draw session for correlation_id {correlation_id}"),
            )
            .param("correlation_id")
            .correlation(correlation_id)),
        };
    }

    let tab = ctx.extension.tracked_tab();
    let existing = match session {
        Some(name) => ctx.annotations.named_session(name).map(|named| {
            (named.annotation_count(), serde_json::to_value(named).unwrap_or(Value::Null))
        }),
        None => tab
            .and_then(|tab_id| ctx.annotations.session_for_tab(tab_id))
            .or_else(|| ctx.annotations.latest_session())
            .map(|found| {
                (found.annotations.len(), serde_json::to_value(found).unwrap_or(Value::Null))
            }),
    };
    let drawing = tab.map_or(false, |tab_id| ctx.annotations.draw_in_progress(tab_id));

    match existing {
        Some((count, value)) if !(wait && drawing) => Ok(json_result(
            &format!("{count} annotation(s)"),
            &value,
        )),
        _ if wait => {
            let correlation_id = format!("ann_{}", Uuid::new_v4().simple());
            ctx.commands
                .register(&correlation_id, "annotations", SESSION_TTL)
                .map_err(|err| ToolError::new(ErrorCode::Internal, err.to_string()))?;
            ctx.annotations.register_waiter(&correlation_id, session);
            match ctx
                .commands
                .wait_for_command(&correlation_id, ctx.timeouts.annotation)
                .await
            {
                Some(command) => Ok(command_outcome(command)),
                None => Err(ToolError::new(
                    ErrorCode::Internal,
                    format!("command {correlation_id} disappeared while waiting"),
                )),
            }
        }
        _ => Ok(json_result(
            "No annotations yet",
            &json!({
                "status": "no_annotations",
                "count": 0,
                "hint": "Start draw mode with interact action=draw_mode_start, then call again with wait=true.",
            }),
        )),
    }
}

fn command_outcome(command: CommandResult) -> Value {
    let correlation_id = command.correlation_id.clone();
    match command.status {
        CommandStatus::Pending => json_result(
            "Still waiting for the user to finish drawing",
            &json!({
                "status": "waiting_for_user",
                "correlation_id": correlation_id,
                "final": false,
                "suggested_retry_ms": 2000,
            }),
        ),
        CommandStatus::Complete => {
            let result = command.result.unwrap_or(Value::Null);
            let count = result
                .get("annotations")
                .and_then(Value::as_array)
                .map(Vec::len)
                .or_else(|| {
                    result.get("pages").and_then(Value::as_array).map(|pages| {
                        pages
                            .iter()
                            .filter_map(|page| page.get("annotations").and_then(Value::as_array))
                            .map(Vec::len)
                            .sum()
                    })
                })
                .unwrap_or(0);
            json_result(&format!("{count} annotation(s)"), &result)
        }
        status => soft_failure(
            &format!("Draw session {correlation_id} ended with {}", status.as_str()),
            &serde_json::to_value(&command).unwrap_or(Value::Null),
        ),
    }
}

#[derive(Default)]
struct Accumulator {
    samples: usize,
    load_total: f64,
    dcl_total: f64,
    worst_lcp: Option<f64>,
    worst_cls: Option<f64>,
}

fn performance(ctx: &ToolContext, url: Option<&str>) -> Value {
    let mut filter = CaptureFilter::default();
    if let Some(url) = url {
        filter = filter.url(url);
    }
    let snapshots: Vec<PerformanceSnapshot> = ctx.capture.snapshot(&filter, MAX_OBSERVE_LIMIT);
    let mut per_url: BTreeMap<String, Accumulator> = BTreeMap::new();
    for snapshot in &snapshots {
        let acc = per_url.entry(snapshot.url.clone()).or_default();
        acc.samples += 1;
        acc.load_total += snapshot.load_ms;
        acc.dcl_total += snapshot.dom_content_loaded_ms;
        if let Some(lcp) = snapshot.lcp_ms {
            acc.worst_lcp = Some(acc.worst_lcp.map_or(lcp, |w| w.max(lcp)));
        }
        if let Some(cls) = snapshot.cls {
            acc.worst_cls = Some(acc.worst_cls.map_or(cls, |w| w.max(cls)));
        }
    }
    let pages: Vec<Value> = per_url
        .iter()
        .map(|(url, acc)| {
            let n = acc.samples.max(1) as f64;
            json!({
                "url": url,
                "samples": acc.samples,
                "avg_load_ms": round1(acc.load_total / n),
                "avg_dom_content_loaded_ms": round1(acc.dcl_total / n),
                "worst_lcp_ms": acc.worst_lcp,
                "worst_cls": acc.worst_cls,
            })
        })
        .collect();

    let mut slowest: Vec<WaterfallEntry> = ctx.capture.snapshot(&filter, MAX_OBSERVE_LIMIT);
    slowest.sort_by(|a, b| b.duration_ms.total_cmp(&a.duration_ms));
    slowest.truncate(10);

    json_result(
        &format!(
            "Performance summary: {} snapshot(s) over {} page(s)",
            snapshots.len(),
            pages.len()
        ),
        &json!({
            "pages": pages,
            "latest": snapshots.first(),
            "slowest_requests": slowest,
        }),
    )
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
