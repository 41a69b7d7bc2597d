//! Static MCP answers: everything that can be served without touching
//! capture state. Shared by the daemon's `/mcp` route and the bridge fast path.

use super::jsonrpc::{JsonRpcError, INVALID_PARAMS, RESOURCE_NOT_FOUND};
use crate::app::tools::spec::TOOLS;
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "gasoline";
pub const GUIDE_URI: &str = "gasoline://guide";

const GUIDE: &str = include_str!("../../assets/guide.md");

const INSTRUCTIONS: &str = "Gasoline streams what happens in the user's browser tab. \
Start with observe what=errors or observe what=logs; use interact to drive the tracked tab; \
analyze what=annotations to read what the user drew. Every failure is a tool result with \
error_code, retry and hint fields. Read gasoline://guide for the full workflow.";

/// Methods answered from static data.
pub const STATIC_METHODS: &[&str] = &[
    "initialize",
    "ping",
    "prompts/list",
    "tools/list",
    "resources/list",
    "resources/templates/list",
    "resources/read",
];

pub fn initialize_result(version: &str) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "serverInfo": { "name": SERVER_NAME, "version": version },
        "capabilities": { "tools": {}, "resources": {} },
        "instructions": INSTRUCTIONS,
    })
}

pub fn tools_list() -> Value {
    let tools: Vec<Value> = TOOLS.iter().map(|tool| tool.describe()).collect();
    json!({ "tools": tools })
}

pub fn resources_list() -> Value {
    json!({
        "resources": [{
            "uri": GUIDE_URI,
            "name": "Gasoline Usage Guide",
            "description": "How to use the Gasoline tools effectively.",
            "mimeType": "text/markdown",
        }]
    })
}

pub fn read_resource(params: Option<&Value>) -> Result<Value, JsonRpcError> {
    let uri = params
        .and_then(|params| params.get("uri"))
        .and_then(Value::as_str)
        .filter(|uri| !uri.is_empty())
        .ok_or_else(|| JsonRpcError::new(INVALID_PARAMS, "Invalid params: uri is required"))?;
    if uri != GUIDE_URI {
        return Err(JsonRpcError::new(
            RESOURCE_NOT_FOUND,
            format!("Resource not found: {uri}"),
        ));
    }
    Ok(json!({
        "contents": [{
            "uri": GUIDE_URI,
            "mimeType": "text/markdown",
            "text": GUIDE,
        }]
    }))
}

/// Answers a static method, or `None` when the method needs live state.
pub fn answer(method: &str, params: Option<&Value>, version: &str) -> Option<Result<Value, JsonRpcError>> {
    let result = match method {
        "initialize" => Ok(initialize_result(version)),
        "ping" => Ok(json!({})),
        "prompts/list" => Ok(json!({ "prompts": [] })),
        "tools/list" => Ok(tools_list()),
        "resources/list" => Ok(resources_list()),
        "resources/templates/list" => Ok(json!({ "resourceTemplates": [] })),
        "resources/read" => read_resource(params),
        _ => return None,
    };
    Some(result)
}

/// Methods the daemon may know about. Anything else is answered with
/// "method not found" without a round trip.
pub fn is_forwardable(method: &str) -> bool {
    method.starts_with("tools/") || method.starts_with("resources/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::jsonrpc::RESOURCE_NOT_FOUND;

    #[test]
    fn initialize_advertises_protocol_and_capabilities() {
        let result = initialize_result("1.2.3");
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "gasoline");
        assert_eq!(result["serverInfo"]["version"], "1.2.3");
        assert!(result["capabilities"]["tools"].is_object());
        assert!(result["capabilities"]["resources"].is_object());
    }

    #[test]
    fn tools_list_has_the_five_tools() {
        let names: Vec<String> = tools_list()["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|tool| tool["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["observe", "interact", "analyze", "configure", "generate"]);
    }

    #[test]
    fn unknown_resource_is_not_found() {
        let err = read_resource(Some(&json!({"uri": "gasoline://nope"}))).unwrap_err();
        assert_eq!(err.code, RESOURCE_NOT_FOUND);
        assert_eq!(err.message, "Resource not found: gasoline://nope");
        let missing = read_resource(None).unwrap_err();
        assert_eq!(missing.code, INVALID_PARAMS);
    }

    #[test]
    fn guide_is_readable() {
        let result = read_resource(Some(&json!({"uri": GUIDE_URI}))).unwrap();
        assert!(result["contents"][0]["text"].as_str().unwrap().contains("observe"));
    }

    #[test]
    fn tools_call_is_not_static() {
        assert!(answer("tools/call", None, "1").is_none());
        assert!(is_forwardable("tools/call"));
        assert!(!is_forwardable("sampling/createMessage"));
    }
}
