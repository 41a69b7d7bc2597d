use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Closed set of failure codes a tool call can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidJson,
    InvalidParam,
    MissingParam,
    UnknownMode,
    NoData,
    ExtensionTimeout,
    ExtensionError,
    Internal,
    VersionMismatch,
    RateLimited,
    BridgeConnectionError,
    BridgeResponseReadError,
    BridgeHttpStatusError,
    BridgeInvalidResponse,
    BridgeUnexpectedNoContent,
    DaemonStarting,
    DaemonNotReady,
    BridgeToolError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidJson => "invalid_json",
            ErrorCode::InvalidParam => "invalid_param",
            ErrorCode::MissingParam => "missing_param",
            ErrorCode::UnknownMode => "unknown_mode",
            ErrorCode::NoData => "no_data",
            ErrorCode::ExtensionTimeout => "extension_timeout",
            ErrorCode::ExtensionError => "extension_error",
            ErrorCode::Internal => "internal",
            ErrorCode::VersionMismatch => "version_mismatch",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::BridgeConnectionError => "bridge_connection_error",
            ErrorCode::BridgeResponseReadError => "bridge_response_read_error",
            ErrorCode::BridgeHttpStatusError => "bridge_http_status_error",
            ErrorCode::BridgeInvalidResponse => "bridge_invalid_response",
            ErrorCode::BridgeUnexpectedNoContent => "bridge_unexpected_no_content",
            ErrorCode::DaemonStarting => "daemon_starting",
            ErrorCode::DaemonNotReady => "daemon_not_ready",
            ErrorCode::BridgeToolError => "bridge_tool_error",
        }
    }

    /// What the caller should do next.
    pub fn default_action(&self) -> &'static str {
        match self {
            ErrorCode::InvalidJson => "Fix the JSON arguments and call again.",
            ErrorCode::InvalidParam => "Fix the parameter value and call again.",
            ErrorCode::MissingParam => "Add the missing parameter and call again.",
            ErrorCode::UnknownMode => "Use one of the valid values listed in the hint.",
            ErrorCode::NoData => {
                "Make sure the browser extension is connected and a tab is tracked."
            }
            ErrorCode::ExtensionTimeout => {
                "Check that the extension is connected, then retry the call."
            }
            ErrorCode::ExtensionError => "Inspect the error and adjust the request.",
            ErrorCode::Internal => "Retry the call; report the issue if it persists.",
            ErrorCode::VersionMismatch => {
                "Stop the running server (gasoline --stop) and start the current version."
            }
            ErrorCode::RateLimited => "Wait a moment before calling again.",
            ErrorCode::DaemonStarting => "Retry this tool call in 2 seconds.",
            ErrorCode::DaemonNotReady => "Retry shortly, or call configure with action=restart.",
            ErrorCode::BridgeConnectionError
            | ErrorCode::BridgeResponseReadError
            | ErrorCode::BridgeHttpStatusError
            | ErrorCode::BridgeInvalidResponse
            | ErrorCode::BridgeUnexpectedNoContent
            | ErrorCode::BridgeToolError => "Retry the call; use configure action=restart if it keeps failing.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call failure rendered as a soft tool error: a successful JSON-RPC
/// response whose result carries `isError: true` plus this payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolError {
    pub status: &'static str,
    pub error_code: ErrorCode,
    pub message: String,
    pub retry: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: "error",
            error_code: code,
            message: message.into(),
            retry: code.default_action().to_string(),
            param: None,
            hint: None,
            retryable: false,
            retry_after_ms: None,
            subsystem: None,
            reason: None,
            fallback_used: false,
            correlation_id: None,
            detail: None,
        }
    }

    pub fn missing_param(param: &str, hint: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::MissingParam,
            format!("Required parameter '{param}' is missing"),
        )
        .param(param)
        .hint(hint)
    }

    pub fn invalid_param(param: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParam, message).param(param)
    }

    pub fn unknown_mode(param: &str, value: &str, valid: &[&str]) -> Self {
        Self::new(
            ErrorCode::UnknownMode,
            format!("Unknown {param} '{value}'"),
        )
        .param(param)
        .hint(format!("Valid values: {}", valid.join(", ")))
    }

    pub fn param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.retry = action.into();
        self
    }

    /// Marks the error retryable. A zero delay leaves `retry_after_ms` unset.
    pub fn retry_after(mut self, millis: u64) -> Self {
        self.retryable = true;
        self.retry_after_ms = (millis > 0).then_some(millis);
        self
    }

    pub fn not_retryable(mut self) -> Self {
        self.retryable = false;
        self.retry_after_ms = None;
        self
    }

    pub fn subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = Some(subsystem.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set when the bridge had to respawn the daemon before answering.
    pub fn fallback(mut self, used: bool) -> Self {
        self.fallback_used = used;
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// MCP tool result: human text first, the structured payload flattened beside it.
    pub fn to_result(&self) -> Value {
        let payload = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        let text = format!(
            "Error: {}: {}\n{}",
            self.error_code,
            self.message,
            serde_json::to_string(&payload).unwrap_or_default()
        );
        let mut result = Map::new();
        result.insert(
            "content".into(),
            json!([{ "type": "text", "text": text }]),
        );
        result.insert("isError".into(), Value::Bool(true));
        if let Value::Object(fields) = payload {
            for (key, value) in fields {
                result.entry(key).or_insert(value);
            }
        }
        Value::Object(result)
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)
    }
}

impl std::error::Error for ToolError {}

/// Plain text tool result.
pub fn text_result(text: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": text.into() }] })
}

/// Tool result with a one-line summary followed by pretty JSON.
pub fn json_result(summary: &str, payload: &Value) -> Value {
    let body = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
    text_result(format!("{summary}\n{body}"))
}

/// Tool result flagged as an error without the structured taxonomy, used when
/// the extension itself reported `success: false`.
pub fn soft_failure(summary: &str, payload: &Value) -> Value {
    let mut result = json_result(summary, payload);
    if let Value::Object(map) = &mut result {
        map.insert("isError".into(), Value::Bool(true));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_error_flattens_payload() {
        let result = ToolError::new(ErrorCode::DaemonStarting, "Server is starting up.")
            .retry_after(2000)
            .subsystem("bridge_startup")
            .to_result();
        assert_eq!(result["isError"], true);
        assert_eq!(result["error_code"], "daemon_starting");
        assert_eq!(result["retry_after_ms"], 2000);
        assert_eq!(result["retryable"], true);
        assert_eq!(result["status"], "error");
        let text = result["content"][0]["text"].as_str().expect("text");
        assert!(text.starts_with("Error: daemon_starting: Server is starting up."));
    }

    #[test]
    fn zero_delay_omits_retry_after() {
        let err = ToolError::new(ErrorCode::BridgeToolError, "x").retry_after(0);
        let result = err.to_result();
        assert_eq!(result["retryable"], true);
        assert!(result.get("retry_after_ms").is_none());
    }

    #[test]
    fn unknown_mode_lists_valid_values() {
        let err = ToolError::unknown_mode("what", "bogus", &["errors", "logs"]);
        assert_eq!(err.param.as_deref(), Some("what"));
        assert_eq!(err.hint.as_deref(), Some("Valid values: errors, logs"));
        assert!(!err.retryable);
    }

    #[test]
    fn error_codes_serialize_snake_case() {
        assert_eq!(
            serde_json::to_value(ErrorCode::BridgeUnexpectedNoContent).expect("serialize"),
            "bridge_unexpected_no_content"
        );
        assert_eq!(ErrorCode::ExtensionTimeout.to_string(), "extension_timeout");
    }
}
