use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use thiserror::Error;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const RESOURCE_NOT_FOUND: i32 = -32002;

/// JSON-RPC request id. Only strings and numbers are legal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    String(String),
}

impl RequestId {
    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(number) => Value::Number(number.clone()),
            RequestId::String(text) => Value::String(text.clone()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(number) => write!(f, "{number}"),
            RequestId::String(text) => f.write_str(text),
        }
    }
}

/// A decoded request. `id == None` marks a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub id: Option<RequestId>,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid Request: {message}")]
    Invalid {
        id: Option<RequestId>,
        message: String,
    },
}

impl RequestError {
    pub fn to_response(&self) -> JsonRpcResponse {
        match self {
            RequestError::Parse(_) => {
                JsonRpcResponse::failure(None, JsonRpcError::new(PARSE_ERROR, self.to_string()))
            }
            RequestError::Invalid { id, .. } => JsonRpcResponse::failure(
                id.as_ref(),
                JsonRpcError::new(INVALID_REQUEST, self.to_string()),
            ),
        }
    }
}

impl JsonRpcRequest {
    pub fn new(id: Option<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, RequestError> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|err| RequestError::Parse(err.to_string()))?;
        Self::from_value(value)
    }

    /// Validates the envelope. An `id` that is present but neither a string
    /// nor a number (null included) is rejected.
    pub fn from_value(value: Value) -> Result<Self, RequestError> {
        let Value::Object(mut map) = value else {
            return Err(RequestError::Invalid {
                id: None,
                message: "expected a JSON object".into(),
            });
        };
        let id = match map.remove("id") {
            None => None,
            Some(Value::String(text)) => Some(RequestId::String(text)),
            Some(Value::Number(number)) => Some(RequestId::Number(number)),
            Some(_) => {
                return Err(RequestError::Invalid {
                    id: None,
                    message: "id must be string or number when present".into(),
                })
            }
        };
        if let Some(version) = map.get("jsonrpc") {
            if version != "2.0" {
                return Err(RequestError::Invalid {
                    id,
                    message: "jsonrpc must be \"2.0\"".into(),
                });
            }
        }
        let method = match map.remove("method") {
            Some(Value::String(method)) if !method.is_empty() => method,
            _ => {
                return Err(RequestError::Invalid {
                    id,
                    message: "method must be a non-empty string".into(),
                })
            }
        };
        Ok(Self {
            id,
            method,
            params: map.remove("params"),
        })
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("jsonrpc".into(), Value::String("2.0".into()));
        if let Some(id) = &self.id {
            map.insert("id".into(), id.to_value());
        }
        map.insert("method".into(), Value::String(self.method.clone()));
        if let Some(params) = &self.params {
            map.insert("params".into(), params.clone());
        }
        Value::Object(map)
    }

    /// `params.name` of a `tools/call`.
    pub fn tool_name(&self) -> Option<&str> {
        self.params.as_ref()?.get("name")?.as_str()
    }

    /// `params.arguments` of a `tools/call`.
    pub fn tool_arguments(&self) -> Option<&Value> {
        self.params.as_ref()?.get("arguments")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<&RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: id.map_or(Value::Null, RequestId::to_value),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<&RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: id.map_or(Value::Null, RequestId::to_value),
            result: None,
            error: Some(error),
        }
    }

    pub fn from_outcome(id: Option<&RequestId>, outcome: Result<Value, JsonRpcError>) -> Self {
        match outcome {
            Ok(result) => Self::success(id, result),
            Err(error) => Self::failure(id, error),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| {
            br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"response encoding failed"}}"#
                .to_vec()
        })
    }
}
