//! MCP tool surface: `observe`, `interact`, `analyze`, `configure`, `generate`.
//!
//! Every call produces a tool result. Failures are soft errors carrying an
//! [`ErrorCode`]; nothing here produces a JSON-RPC protocol error.

mod analyze;
mod args;
mod configure;
mod generate;
mod interact;
mod observe;
pub mod spec;

pub use args::Args;

use crate::app::annotations::AnnotationStore;
use crate::app::capture::{CaptureBuffers, CaptureOverrides};
use crate::app::dispatch::{CommandRegistry, QueryError, QueryRegistry};
use crate::app::extension::ExtensionState;
use crate::app::session::SessionStore;
use crate::domain::query::PendingQuery;
use crate::domain::tool_error::{json_result, soft_failure, ErrorCode, ToolError};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct ToolTimeouts {
    pub accessibility: Duration,
    pub screenshot: Duration,
    pub interact: Duration,
    pub annotation: Duration,
    pub waterfall_refresh: Duration,
    /// Buffers older than this trigger a refresh query before reading.
    pub staleness: Duration,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            accessibility: Duration::from_secs(30),
            screenshot: Duration::from_secs(20),
            interact: Duration::from_secs(35),
            annotation: Duration::from_secs(55),
            waterfall_refresh: Duration::from_secs(5),
            staleness: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub version: &'static str,
    pub port: u16,
    pub started_at: Instant,
    pub upgraded_from: Option<String>,
}

impl RuntimeInfo {
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Shared daemon state the tools read and drive.
#[derive(Clone)]
pub struct ToolContext {
    pub capture: Arc<CaptureBuffers>,
    pub queries: Arc<QueryRegistry>,
    pub commands: Arc<CommandRegistry>,
    pub annotations: Arc<AnnotationStore>,
    pub sessions: Option<Arc<SessionStore>>,
    pub extension: Arc<ExtensionState>,
    pub overrides: Arc<CaptureOverrides>,
    pub timeouts: ToolTimeouts,
    pub runtime: RuntimeInfo,
}

impl ToolContext {
    /// Tab id of the tracked tab, or the structured "no tab tracked" error.
    pub(crate) fn require_tab(&self) -> Result<i64, ToolError> {
        self.extension.tracked_tab().ok_or_else(|| {
            ToolError::new(ErrorCode::NoData, "No tab is tracked")
                .hint("Open the Gasoline extension popup and click 'Track This Tab'.")
        })
    }

    /// Issues a query to the extension and waits for its answer.
    pub(crate) async fn ask_extension(
        &self,
        query: PendingQuery,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        let kind = query.kind.clone();
        let id = self.queries.create(query, timeout);
        debug!(query = %id, %kind, "waiting on extension");
        self.queries
            .wait_for_result(&id, timeout)
            .await
            .map_err(|err| query_error_to_tool(&kind, err))
    }

    pub(crate) fn sessions(&self) -> Result<&Arc<SessionStore>, ToolError> {
        self.sessions.as_ref().ok_or_else(|| {
            ToolError::new(ErrorCode::Internal, "Session store is not available")
        })
    }
}

fn query_error_to_tool(kind: &str, err: QueryError) -> ToolError {
    match err {
        QueryError::Timeout { .. } => ToolError::new(
            ErrorCode::ExtensionTimeout,
            format!("Timed out waiting for the extension to answer the {kind} query"),
        )
        .retry_after(2000),
        QueryError::Expired { reason, .. } => ToolError::new(
            ErrorCode::ExtensionTimeout,
            format!("The {kind} query expired before the extension answered ({reason})"),
        )
        .retry_after(2000),
        QueryError::Failed { message, .. } => ToolError::new(
            ErrorCode::ExtensionError,
            format!("Extension reported an error: {message}"),
        ),
        QueryError::NotFound(id) => {
            ToolError::new(ErrorCode::Internal, format!("Query {id} vanished"))
        }
    }
}

/// Extension answers embedding `success: false` become soft failures.
pub(crate) fn extension_result(summary: &str, value: &Value) -> Value {
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        let reason = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("the extension reported failure");
        soft_failure(&format!("{summary} failed: {reason}"), value)
    } else {
        json_result(summary, value)
    }
}

pub struct ToolHandler {
    ctx: ToolContext,
}

impl ToolHandler {
    pub fn new(ctx: ToolContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    /// Runs one `tools/call`. Always returns an MCP tool result.
    pub async fn call(&self, name: &str, arguments: Value) -> Value {
        match self.dispatch(name, arguments).await {
            Ok(result) => result,
            Err(err) => {
                debug!(tool = %name, code = %err.error_code, "tool call failed");
                err.to_result()
            }
        }
    }

    async fn dispatch(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let Some(tool) = spec::find(name) else {
            return Err(ToolError::invalid_param("name", format!("Unknown tool: {name}"))
                .hint(format!("Valid tools: {}", spec::tool_names().join(", "))));
        };
        let args = Args::parse(arguments)?;
        let mode = tool.validate(args.map())?;
        match tool.name {
            "observe" => observe::run(&self.ctx, mode.name, &args).await,
            "interact" => interact::run(&self.ctx, mode.name, &args).await,
            "analyze" => analyze::run(&self.ctx, mode.name, &args).await,
            "configure" => configure::run(&self.ctx, mode.name, &args).await,
            "generate" => generate::run(&self.ctx, mode.name, &args),
            other => Err(ToolError::new(
                ErrorCode::Internal,
                format!("tool {other} has no handler"),
            )),
        }
    }
}
