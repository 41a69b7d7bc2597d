use crate::domain::tool_error::{ErrorCode, ToolError};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
    Object,
    Any,
}

impl ParamKind {
    fn schema(&self) -> Value {
        match self {
            ParamKind::String => json!({"type": "string"}),
            ParamKind::Integer => json!({"type": "integer"}),
            ParamKind::Boolean => json!({"type": "boolean"}),
            ParamKind::Object => json!({"type": "object"}),
            ParamKind::Any => json!({}),
        }
    }
}

#[derive(Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct ModeSpec {
    pub name: &'static str,
    /// Parameters accepted in addition to the mode selector.
    pub params: &'static [&'static str],
}

#[derive(Debug)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub mode_param: &'static str,
    pub modes: &'static [ModeSpec],
    pub params: &'static [ParamSpec],
}

const fn p(name: &'static str, kind: ParamKind, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        kind,
        description,
    }
}

const fn m(name: &'static str, params: &'static [&'static str]) -> ModeSpec {
    ModeSpec { name, params }
}

const OBSERVE_FILTERS: &[&str] = &["limit", "url"];
const PAGED_FILTERS: &[&str] = &[
    "limit",
    "url",
    "after_cursor",
    "before_cursor",
    "since_cursor",
    "restart_on_eviction",
];

pub static TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "observe",
        description: "Read what the browser captured: console errors and logs, network \
            waterfall and bodies, WebSocket traffic, user actions, performance, the tracked \
            page, screenshots, and async command results.",
        mode_param: "what",
        modes: &[
            m("errors", PAGED_FILTERS),
            m(
                "logs",
                &[
                    "limit",
                    "url",
                    "level",
                    "after_cursor",
                    "before_cursor",
                    "since_cursor",
                    "restart_on_eviction",
                ],
            ),
            m("network_waterfall", OBSERVE_FILTERS),
            m("network_bodies", &["limit", "url", "status_min", "status_max"]),
            m(
                "websocket_events",
                &[
                    "limit",
                    "url",
                    "connection_id",
                    "after_cursor",
                    "before_cursor",
                    "since_cursor",
                    "restart_on_eviction",
                ],
            ),
            m("actions", PAGED_FILTERS),
            m("performance", OBSERVE_FILTERS),
            m("page", &[]),
            m("screenshot", &[]),
            m("command_result", &["correlation_id"]),
            m("pending_commands", &[]),
            m("failed_commands", &["limit"]),
        ],
        params: &[
            p("what", ParamKind::String, "What to observe."),
            p("limit", ParamKind::Integer, "Maximum entries to return (default 100, max 1000)."),
            p("url", ParamKind::String, "Case-insensitive URL substring filter."),
            p("level", ParamKind::String, "Log level filter: debug, log, info, warn, error or all."),
            p("status_min", ParamKind::Integer, "Lowest HTTP status to include."),
            p("status_max", ParamKind::Integer, "Highest HTTP status to include."),
            p("connection_id", ParamKind::String, "WebSocket connection id filter."),
            p("correlation_id", ParamKind::String, "Correlation id returned by an async command."),
            p(
                "after_cursor",
                ParamKind::String,
                "Entries newer than this cursor (pagination.after_cursor of a prior call).",
            ),
            p(
                "before_cursor",
                ParamKind::String,
                "Entries older than this cursor (pagination.before_cursor of a prior call).",
            ),
            p("since_cursor", ParamKind::String, "Return this cursor's entry and everything newer."),
            p(
                "restart_on_eviction",
                ParamKind::Boolean,
                "Restart from the oldest entry instead of failing when the cursor was evicted.",
            ),
        ],
    },
    ToolSpec {
        name: "interact",
        description: "Drive the tracked tab: navigate, refresh, go back or forward, click, \
            type, run JavaScript, highlight elements, or start draw mode for annotations.",
        mode_param: "action",
        modes: &[
            m("navigate", &["url", "background"]),
            m("refresh", &["background"]),
            m("back", &["background"]),
            m("forward", &["background"]),
            m("click", &["selector", "background"]),
            m("type", &["selector", "text", "background"]),
            m("execute_js", &["script", "background"]),
            m("highlight", &["selector", "background"]),
            m("draw_mode_start", &["session"]),
        ],
        params: &[
            p("action", ParamKind::String, "Action to perform."),
            p("url", ParamKind::String, "Target URL for navigate."),
            p("selector", ParamKind::String, "CSS selector of the target element."),
            p("text", ParamKind::String, "Text to type."),
            p("script", ParamKind::String, "JavaScript to evaluate in the page."),
            p("background", ParamKind::Boolean, "Return immediately with a correlation id instead of waiting."),
            p("session", ParamKind::String, "Named annotation session to append to."),
        ],
    },
    ToolSpec {
        name: "analyze",
        description: "Run an analysis on the tracked page: accessibility audit, annotation \
            sessions drawn by the user, element details, or a performance summary.",
        mode_param: "what",
        modes: &[
            m("accessibility", &["scope", "tags"]),
            m("annotations", &["session", "wait", "correlation_id"]),
            m("annotation_detail", &["correlation_id"]),
            m("performance", &["url"]),
        ],
        params: &[
            p("what", ParamKind::String, "Analysis to run."),
            p("scope", ParamKind::String, "CSS selector limiting the audit."),
            p("tags", ParamKind::Any, "Rule tags to include, e.g. [\"wcag2a\"]."),
            p("session", ParamKind::String, "Named annotation session."),
            p("wait", ParamKind::Boolean, "Block until the user finishes drawing (up to 55 s)."),
            p("correlation_id", ParamKind::String, "Draw-mode or element correlation id."),
            p("url", ParamKind::String, "URL substring filter."),
        ],
    },
    ToolSpec {
        name: "configure",
        description: "Configure the server: health report, clear buffers, capture settings, \
            persistent project store, session context, or restart the server.",
        mode_param: "action",
        modes: &[
            m("health", &[]),
            m("clear", &["buffer"]),
            m("capture", &["settings", "reset"]),
            m("store", &["store_action", "namespace", "key", "data"]),
            m("load", &[]),
            m("restart", &[]),
        ],
        params: &[
            p("action", ParamKind::String, "Configuration action."),
            p("buffer", ParamKind::String, "Buffer to clear (default all)."),
            p("settings", ParamKind::Object, "Capture settings to override."),
            p("reset", ParamKind::Boolean, "Reset capture settings to defaults."),
            p("store_action", ParamKind::String, "save, load, list, delete or stats."),
            p("namespace", ParamKind::String, "Store namespace."),
            p("key", ParamKind::String, "Store key."),
            p("data", ParamKind::Any, "JSON value to save."),
        ],
    },
    ToolSpec {
        name: "generate",
        description: "Generate artifacts from captured data: an annotation report or a \
            session summary.",
        mode_param: "format",
        modes: &[
            m("annotations", &["session"]),
            m("session_summary", &["limit"]),
        ],
        params: &[
            p("format", ParamKind::String, "Artifact to generate."),
            p("session", ParamKind::String, "Named annotation session."),
            p("limit", ParamKind::Integer, "Maximum items per section."),
        ],
    },
];

pub fn find(name: &str) -> Option<&'static ToolSpec> {
    TOOLS.iter().find(|tool| tool.name == name)
}

pub fn tool_names() -> Vec<&'static str> {
    TOOLS.iter().map(|tool| tool.name).collect()
}

impl ToolSpec {
    pub fn mode_names(&self) -> Vec<&'static str> {
        self.modes.iter().map(|mode| mode.name).collect()
    }

    pub fn input_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|param| {
                let mut schema = param.kind.schema();
                if let Value::Object(fields) = &mut schema {
                    fields.insert("description".into(), json!(param.description));
                    if param.name == self.mode_param {
                        fields.insert("enum".into(), json!(self.mode_names()));
                    }
                }
                (param.name.to_string(), schema)
            })
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": [self.mode_param],
        })
    }

    pub fn describe(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema(),
        })
    }

    /// Checks the mode selector and rejects parameters the chosen mode does not take.
    pub fn validate(
        &'static self,
        args: &Map<String, Value>,
    ) -> Result<&'static ModeSpec, ToolError> {
        let valid = self.mode_names().join(", ");
        let mode_name = match args.get(self.mode_param) {
            None | Some(Value::Null) => {
                return Err(ToolError::missing_param(
                    self.mode_param,
                    format!("Valid values for {}: {valid}", self.mode_param),
                ))
            }
            Some(Value::String(value)) => value.as_str(),
            Some(_) => {
                return Err(ToolError::invalid_param(
                    self.mode_param,
                    format!("'{}' must be a string", self.mode_param),
                )
                .hint(format!("Valid values: {valid}")))
            }
        };
        let mode = lookup_mode(self, mode_name).ok_or_else(|| {
            ToolError::unknown_mode(self.mode_param, mode_name, &self.mode_names())
        })?;
        for key in args.keys() {
            if key == self.mode_param || mode.params.contains(&key.as_str()) {
                continue;
            }
            let accepted = if mode.params.is_empty() {
                "none".to_string()
            } else {
                mode.params.join(", ")
            };
            return Err(ToolError::new(
                ErrorCode::InvalidParam,
                format!(
                    "Unknown parameter '{key}' for {} {}={}",
                    self.name, self.mode_param, mode.name
                ),
            )
            .param(key.clone())
            .hint(format!("Valid parameters: {accepted}")));
        }
        Ok(mode)
    }
}

fn lookup_mode(tool: &'static ToolSpec, name: &str) -> Option<&'static ModeSpec> {
    tool.modes.iter().find(|mode| mode.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn every_tool_schema_requires_its_mode() {
        for tool in TOOLS {
            let schema = tool.input_schema();
            assert_eq!(schema["required"][0], tool.mode_param);
            assert!(schema["properties"][tool.mode_param]["enum"].is_array());
            for mode in tool.modes {
                for param in mode.params {
                    assert!(
                        tool.params.iter().any(|p| p.name == *param),
                        "{}.{} references undeclared {param}",
                        tool.name,
                        mode.name
                    );
                }
            }
        }
    }

    #[test]
    fn missing_mode_lists_valid_values() {
        let observe = find("observe").expect("observe");
        let err = observe.validate(&args(json!({}))).expect_err("missing");
        assert_eq!(err.error_code, ErrorCode::MissingParam);
        assert_eq!(err.param.as_deref(), Some("what"));
        assert!(err.hint.as_deref().unwrap_or("").contains("errors"));
    }

    #[test]
    fn unknown_mode_and_unknown_param() {
        let observe = find("observe").expect("observe");
        let err = observe
            .validate(&args(json!({"what": "vibes"})))
            .expect_err("unknown mode");
        assert_eq!(err.error_code, ErrorCode::UnknownMode);

        let err = observe
            .validate(&args(json!({"what": "network_waterfall", "status_min": 500})))
            .expect_err("unknown param");
        assert_eq!(err.error_code, ErrorCode::InvalidParam);
        assert_eq!(err.param.as_deref(), Some("status_min"));
        assert_eq!(err.hint.as_deref(), Some("Valid parameters: limit, url"));

        let mode = observe
            .validate(&args(json!({"what": "network_bodies", "status_min": 500})))
            .expect("valid");
        assert_eq!(mode.name, "network_bodies");
    }
}
