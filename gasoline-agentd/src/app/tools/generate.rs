use super::{Args, ToolContext};
use crate::app::capture::MAX_OBSERVE_LIMIT;
use crate::domain::annotation::AnnotationSession;
use crate::domain::capture::{
    CaptureFilter, EnhancedAction, LogEntry, LogLevel, NetworkBody, PerformanceSnapshot,
};
use crate::domain::tool_error::{text_result, ErrorCode, ToolError};
use serde_json::Value;
use std::fmt::Write as _;

pub(super) fn run(ctx: &ToolContext, format: &str, args: &Args) -> Result<Value, ToolError> {
    match format {
        "annotations" => annotation_report(ctx, args.str("session")?),
        "session_summary" => {
            let limit = args.limit("limit", 10, 100)?;
            Ok(text_result(session_summary(ctx, limit)))
        }
        other => Err(ToolError::new(
            ErrorCode::Internal,
            format!("generate format {other} has no handler"),
        )),
    }
}

fn annotation_report(ctx: &ToolContext, session: Option<&str>) -> Result<Value, ToolError> {
    let (title, pages) = match session {
        Some(name) => {
            let named = ctx.annotations.named_session(name).ok_or_else(|| {
                ToolError::new(ErrorCode::NoData, format!("No annotation session named {name}"))
                    .param("session")
                    .hint("Named sessions expire 30 minutes after their last page.")
            })?;
            (format!("Annotation report: {name}"), named.pages)
        }
        None => {
            let latest = ctx
                .extension
                .tracked_tab()
                .and_then(|tab| ctx.annotations.session_for_tab(tab))
                .or_else(|| ctx.annotations.latest_session())
                .ok_or_else(|| {
                    ToolError::new(ErrorCode::NoData, "No annotation session available")
                        .hint("Start draw mode with interact action=draw_mode_start.")
                })?;
            ("Annotation report".to_string(), vec![latest])
        }
    };
    Ok(text_result(render_pages(&title, &pages)))
}

fn render_pages(title: &str, pages: &[AnnotationSession]) -> String {
    let mut out = format!("# {title}\n");
    for page in pages {
        let _ = writeln!(out, "\n## {}\n", page.page_url);
        if let Some(screenshot) = &page.screenshot {
            let _ = writeln!(out, "Screenshot: `{screenshot}`\n");
        }
        if page.annotations.is_empty() {
            out.push_str("_No annotations on this page._\n");
        }
        for (index, annotation) in page.annotations.iter().enumerate() {
            let _ = writeln!(out, "{}. {}", index + 1, annotation.text.trim());
            if let Some(summary) = &annotation.element_summary {
                let _ = writeln!(out, "   - Element: `{summary}`");
            }
            let rect = annotation.rect;
            let _ = writeln!(
                out,
                "   - Region: {:.0}x{:.0} at ({:.0}, {:.0})",
                rect.width, rect.height, rect.x, rect.y
            );
            if let Some(correlation_id) = &annotation.correlation_id {
                let _ = writeln!(
                    out,
                    "   - Details: analyze what=annotation_detail correlation_id={correlation_id}"
                );
            }
        }
    }
    out
}

fn session_summary(ctx: &ToolContext, limit: usize) -> String {
    let everything = CaptureFilter::default();
    let errors: Vec<LogEntry> = ctx
        .capture
        .snapshot(&everything.clone().levels(vec![LogLevel::Error]), limit);
    let failures: Vec<NetworkBody> = ctx.capture.snapshot(
        &CaptureFilter {
            status_min: Some(400),
            ..CaptureFilter::default()
        },
        limit,
    );
    let actions: Vec<EnhancedAction> = ctx.capture.snapshot(&everything, limit);
    let perf: Vec<PerformanceSnapshot> = ctx.capture.snapshot(&everything, MAX_OBSERVE_LIMIT);
    let stats = ctx.capture.stats();

    let mut out = String::from("# Session summary\n");
    let status = ctx.extension.status();
    let _ = writeln!(
        out,
        "\nExtension: {}; tracked tab: {}",
        if status.connected { "connected" } else { "not connected" },
        status
            .settings
            .tracked_tab_url
            .as_deref()
            .unwrap_or("none")
    );
    let _ = writeln!(out, "Captured entries: {}", stats.total_entries);

    let _ = writeln!(out, "\n## Errors ({})", errors.len());
    for entry in &errors {
        let _ = writeln!(out, "- {} {}", entry.timestamp.format("%H:%M:%S"), first_line(&entry.message));
    }
    let _ = writeln!(out, "\n## Failed requests ({})", failures.len());
    for body in &failures {
        let _ = writeln!(out, "- {} {} -> {}", body.method, body.url, body.status);
    }
    let _ = writeln!(out, "\n## Recent actions ({})", actions.len());
    for action in &actions {
        let target = action
            .to_url
            .as_deref()
            .or(action.url.as_deref())
            .unwrap_or("");
        let _ = writeln!(out, "- {} {}", action.action_type, target);
    }
    if !perf.is_empty() {
        let avg_load = perf.iter().map(|p| p.load_ms).sum::<f64>() / perf.len() as f64;
        let _ = writeln!(
            out,
            "\n## Performance\n- {} snapshot(s), average load {:.0} ms",
            perf.len(),
            avg_load
        );
    }
    out
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or("")
}
