use super::supervisor::DaemonSupervisor;
use crate::domain::tool_error::{ErrorCode, ToolError};
use crate::protocol::jsonrpc::INTERNAL_ERROR;
use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const FAST: Duration = Duration::from_secs(10);
const SCREENSHOT: Duration = Duration::from_secs(25);
const SLOW: Duration = Duration::from_secs(35);
/// The daemon holds annotation waits for up to 55 s.
const BLOCKING: Duration = Duration::from_secs(65);

const FORWARDER: &str = "bridge_http_forwarder";

/// How long the bridge waits for the daemon to answer `request`.
pub fn forward_timeout(request: &JsonRpcRequest) -> Duration {
    if request.method != "tools/call" {
        return FAST;
    }
    let arg = |key: &str| {
        request
            .tool_arguments()
            .and_then(|args| args.get(key))
            .and_then(Value::as_str)
    };
    match (request.tool_name(), arg("what"), arg("format")) {
        (Some("observe"), Some("command_result"), _)
            if arg("correlation_id").is_some_and(|id| id.starts_with("ann_")) =>
        {
            BLOCKING
        }
        (Some("observe"), Some("screenshot"), _) => SCREENSHOT,
        (Some("analyze"), Some("annotations"), _) => BLOCKING,
        (Some("generate"), _, Some("annotations")) => BLOCKING,
        (Some("analyze" | "interact"), _, _) => SLOW,
        _ => FAST,
    }
}

/// `configure(action="restart")`, which the bridge handles itself.
pub fn is_restart(request: &JsonRpcRequest) -> bool {
    request.method == "tools/call"
        && request.tool_name() == Some("configure")
        && request
            .tool_arguments()
            .and_then(|args| args.get("action"))
            .and_then(Value::as_str)
            == Some("restart")
}

/// Why a forwarded request produced no usable answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardFailure {
    Connection(String),
    Read(String),
    NoContent,
    Status { code: u16, body: String },
    Empty,
    InvalidJson,
}

impl ForwardFailure {
    pub fn message(&self) -> String {
        match self {
            ForwardFailure::Connection(err) => format!("Server connection error: {err}"),
            ForwardFailure::Read(err) => format!("Failed to read response: {err}"),
            ForwardFailure::NoContent => "Server returned no content for request with an id".into(),
            ForwardFailure::Status { code, body } => format!("HTTP {code}: {body}"),
            ForwardFailure::Empty => "Server returned an empty body for request with an id".into(),
            ForwardFailure::InvalidJson => "Server returned invalid JSON response".into(),
        }
    }

    pub fn to_tool_error(&self) -> ToolError {
        let message = self.message();
        let error = match self {
            ForwardFailure::Connection(err) => {
                ToolError::new(ErrorCode::BridgeConnectionError, message)
                    .reason("http_forward_failed")
                    .retry_after(2000)
                    .detail(err.clone())
            }
            ForwardFailure::Read(err) => ToolError::new(ErrorCode::BridgeResponseReadError, message)
                .reason("response_read_failed")
                .retry_after(1000)
                .detail(err.clone()),
            ForwardFailure::NoContent => {
                ToolError::new(ErrorCode::BridgeUnexpectedNoContent, message)
                    .reason("unexpected_no_content")
                    .retry_after(500)
            }
            ForwardFailure::Status { code, .. } => {
                let error = ToolError::new(ErrorCode::BridgeHttpStatusError, message)
                    .reason("http_status_error")
                    .detail(format!("status_code={code}"));
                if *code >= 500 {
                    error.retry_after(1000)
                } else {
                    error
                }
            }
            ForwardFailure::Empty => ToolError::new(ErrorCode::BridgeInvalidResponse, message)
                .reason("empty_response")
                .retry_after(500),
            ForwardFailure::InvalidJson => {
                ToolError::new(ErrorCode::BridgeInvalidResponse, message)
                    .reason("invalid_json_response")
                    .retry_after(1000)
            }
        };
        error.subsystem(FORWARDER)
    }
}

/// Reply for a request the bridge could not get answered: a soft tool error
/// for `tools/call`, a JSON-RPC internal error for anything else.
pub fn failure_reply(request: &JsonRpcRequest, error: ToolError) -> JsonRpcResponse {
    if request.method == "tools/call" {
        let mut error = error;
        if error.subsystem.is_none() {
            error = error.subsystem("bridge");
        }
        if error.reason.is_none() {
            error = error.reason("tool_error");
        }
        if error.correlation_id.is_none() {
            if let Some(id) = &request.id {
                error = error.correlation(id.to_string());
            }
        }
        JsonRpcResponse::success(request.id.as_ref(), error.to_result())
    } else {
        JsonRpcResponse::failure(
            request.id.as_ref(),
            JsonRpcError::new(INTERNAL_ERROR, error.message),
        )
    }
}

/// Posts raw JSON-RPC payloads to the daemon's `/mcp` endpoint.
pub struct Forwarder {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    supervisor: Arc<DaemonSupervisor>,
}

impl Forwarder {
    pub fn new(port: u16, api_key: Option<String>, supervisor: Arc<DaemonSupervisor>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("http://127.0.0.1:{port}/mcp"),
            api_key: api_key.filter(|key| !key.is_empty()),
            supervisor,
        }
    }

    async fn post(&self, raw: &[u8], timeout: Duration) -> reqwest::Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(raw.to_vec());
        if let Some(key) = &self.api_key {
            request = request.header(crate::API_KEY_HEADER, key);
        }
        request.send().await
    }

    /// Forwards one request. Returns the bytes to write back, or `None` for
    /// notifications. A refused connection triggers one respawn and retry.
    pub async fn forward(&self, request: &JsonRpcRequest, raw: &[u8]) -> Option<Vec<u8>> {
        let timeout = forward_timeout(request);
        let mut fallback_used = false;
        let mut sent = self.post(raw, timeout).await;
        if matches!(&sent, Err(err) if err.is_connect()) {
            fallback_used = true;
            debug!(method = %request.method, "daemon unreachable, respawning");
            if self.supervisor.ensure_ready().await {
                sent = self.post(raw, timeout).await;
            }
        }
        match self.read(request, sent).await {
            Ok(body) => body,
            Err(failure) => {
                debug!(method = %request.method, error = %failure.message(), "forward failed");
                if request.is_notification() {
                    return None;
                }
                let error = failure.to_tool_error().fallback(fallback_used);
                Some(failure_reply(request, error).to_bytes())
            }
        }
    }

    async fn read(
        &self,
        request: &JsonRpcRequest,
        sent: reqwest::Result<reqwest::Response>,
    ) -> Result<Option<Vec<u8>>, ForwardFailure> {
        let response = sent.map_err(|err| ForwardFailure::Connection(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| ForwardFailure::Read(err.to_string()))?;
        if request.is_notification() {
            return Ok(None);
        }
        if status == 204 {
            return Err(ForwardFailure::NoContent);
        }
        if status != 200 {
            return Err(ForwardFailure::Status {
                code: status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(ForwardFailure::Empty);
        }
        // re-encoded so a pretty-printed body cannot break line framing
        let value: Value =
            serde_json::from_slice(&body).map_err(|_| ForwardFailure::InvalidJson)?;
        serde_json::to_vec(&value)
            .map(Some)
            .map_err(|_| ForwardFailure::InvalidJson)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;
    use serde_json::json;

    fn call(name: &str, arguments: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(
            Some(RequestId::Number(7u64.into())),
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
    }

    #[test]
    fn timeouts_follow_the_tool() {
        let ping = JsonRpcRequest::new(None, "resources/read", None);
        assert_eq!(forward_timeout(&ping), FAST);
        assert_eq!(
            forward_timeout(&call(
                "observe",
                json!({ "what": "command_result", "correlation_id": "ann_1" })
            )),
            BLOCKING
        );
        assert_eq!(
            forward_timeout(&call(
                "observe",
                json!({ "what": "command_result", "correlation_id": "click_1" })
            )),
            FAST
        );
        assert_eq!(
            forward_timeout(&call("observe", json!({ "what": "screenshot" }))),
            SCREENSHOT
        );
        assert_eq!(
            forward_timeout(&call("analyze", json!({ "what": "annotations" }))),
            BLOCKING
        );
        assert_eq!(
            forward_timeout(&call("generate", json!({ "format": "annotations" }))),
            BLOCKING
        );
        assert_eq!(
            forward_timeout(&call("analyze", json!({ "what": "accessibility" }))),
            SLOW
        );
        assert_eq!(
            forward_timeout(&call("interact", json!({ "action": "click" }))),
            SLOW
        );
        assert_eq!(forward_timeout(&call("observe", json!({ "what": "logs" }))), FAST);
    }

    #[test]
    fn restart_is_detected_only_for_configure() {
        assert!(is_restart(&call("configure", json!({ "action": "restart" }))));
        assert!(!is_restart(&call("configure", json!({ "action": "health" }))));
        assert!(!is_restart(&call("interact", json!({ "action": "restart" }))));
    }

    #[test]
    fn status_failures_are_retryable_only_for_server_errors() {
        let server = ForwardFailure::Status {
            code: 503,
            body: "busy".into(),
        }
        .to_tool_error();
        assert!(server.retryable);
        assert_eq!(server.retry_after_ms, Some(1000));
        assert_eq!(server.detail.as_deref(), Some("status_code=503"));

        let client = ForwardFailure::Status {
            code: 403,
            body: "forbidden".into(),
        }
        .to_tool_error();
        assert!(!client.retryable);
        assert_eq!(client.retry_after_ms, None);
        assert_eq!(client.message, "HTTP 403: forbidden");
    }

    #[test]
    fn empty_body_reports_invalid_response() {
        let error = ForwardFailure::Empty.to_tool_error();
        assert_eq!(error.error_code, ErrorCode::BridgeInvalidResponse);
        assert_eq!(error.reason.as_deref(), Some("empty_response"));
        assert_eq!(error.retry_after_ms, Some(500));
    }

    #[test]
    fn failure_reply_is_soft_for_tool_calls() {
        let request = call("observe", json!({ "what": "logs" }));
        let error = ForwardFailure::Connection("connection refused".into())
            .to_tool_error()
            .fallback(true);
        let reply = failure_reply(&request, error);
        let result = reply.result.unwrap();
        assert_eq!(reply.id, json!(7));
        assert_eq!(result["isError"], true);
        assert_eq!(result["error_code"], "bridge_connection_error");
        assert_eq!(result["subsystem"], "bridge_http_forwarder");
        assert_eq!(result["reason"], "http_forward_failed");
        assert_eq!(result["retry_after_ms"], 2000);
        assert_eq!(result["fallback_used"], true);
        assert_eq!(result["correlation_id"], "7");
    }

    #[test]
    fn failure_reply_defaults_subsystem_and_reason() {
        let request = call("observe", json!({}));
        let reply = failure_reply(&request, ToolError::new(ErrorCode::BridgeToolError, "boom"));
        let result = reply.result.unwrap();
        assert_eq!(result["subsystem"], "bridge");
        assert_eq!(result["reason"], "tool_error");
        assert!(result.get("retry_after_ms").is_none());
    }

    #[test]
    fn failure_reply_is_protocol_error_for_other_methods() {
        let request = JsonRpcRequest::new(
            Some(RequestId::String("r".into())),
            "resources/subscribe",
            None,
        );
        let reply = failure_reply(&request, ForwardFailure::InvalidJson.to_tool_error());
        let error = reply.error.unwrap();
        assert_eq!(error.code, INTERNAL_ERROR);
        assert_eq!(error.message, "Server returned invalid JSON response");
    }
}
