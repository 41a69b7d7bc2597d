use crate::domain::tool_error::{ErrorCode, ToolError};
use serde_json::{Map, Value};

/// Typed accessors over a tool call's `arguments` object. Type mismatches
/// become `invalid_param` errors naming the parameter.
#[derive(Debug, Clone, Default)]
pub struct Args(Map<String, Value>);

impl Args {
    pub fn parse(arguments: Value) -> Result<Self, ToolError> {
        match arguments {
            Value::Null => Ok(Self::default()),
            Value::Object(map) => Ok(Self(map)),
            // some clients double-encode arguments
            Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => Ok(Self(map)),
                _ => Err(ToolError::new(
                    ErrorCode::InvalidJson,
                    "Tool arguments must be a JSON object",
                )),
            },
            _ => Err(ToolError::new(
                ErrorCode::InvalidJson,
                "Tool arguments must be a JSON object",
            )),
        }
    }

    pub fn map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|value| !value.is_null())
    }

    pub fn str(&self, name: &str) -> Result<Option<&str>, ToolError> {
        match self.value(name) {
            None => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.as_str())),
            Some(_) => Err(ToolError::invalid_param(
                name,
                format!("'{name}' must be a string"),
            )),
        }
    }

    /// Non-empty string or `missing_param`.
    pub fn required_str(&self, name: &str, hint: &str) -> Result<&str, ToolError> {
        match self.str(name)? {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(ToolError::missing_param(name, hint)),
        }
    }

    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool, ToolError> {
        match self.value(name) {
            None => Ok(default),
            Some(Value::Bool(value)) => Ok(*value),
            Some(Value::String(raw)) if raw == "true" || raw == "false" => Ok(raw == "true"),
            Some(_) => Err(ToolError::invalid_param(
                name,
                format!("'{name}' must be a boolean"),
            )),
        }
    }

    pub fn i64(&self, name: &str) -> Result<Option<i64>, ToolError> {
        match self.value(name) {
            None => Ok(None),
            Some(Value::Number(number)) => number
                .as_i64()
                .or_else(|| number.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| {
                    ToolError::invalid_param(name, format!("'{name}' must be an integer"))
                }),
            Some(Value::String(raw)) => raw.trim().parse::<i64>().map(Some).map_err(|_| {
                ToolError::invalid_param(name, format!("'{name}' must be an integer"))
            }),
            Some(_) => Err(ToolError::invalid_param(
                name,
                format!("'{name}' must be an integer"),
            )),
        }
    }

    /// `limit`-style parameter: defaults when absent, clamps to `max`, rejects values below 1.
    pub fn limit(&self, name: &str, default: usize, max: usize) -> Result<usize, ToolError> {
        match self.i64(name)? {
            None => Ok(default.min(max)),
            Some(value) if value < 1 => Err(ToolError::invalid_param(
                name,
                format!("'{name}' must be at least 1"),
            )),
            Some(value) => Ok((value as usize).min(max)),
        }
    }

    pub fn status_code(&self, name: &str) -> Result<Option<u16>, ToolError> {
        match self.i64(name)? {
            None => Ok(None),
            Some(value) if (100..=599).contains(&value) => Ok(Some(value as u16)),
            Some(_) => Err(ToolError::invalid_param(
                name,
                format!("'{name}' must be an HTTP status between 100 and 599"),
            )),
        }
    }

    pub fn object(&self, name: &str) -> Result<Option<&Map<String, Value>>, ToolError> {
        match self.value(name) {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(_) => Err(ToolError::invalid_param(
                name,
                format!("'{name}' must be an object"),
            )),
        }
    }
}
