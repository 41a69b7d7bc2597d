use super::{ErrorHistoryEntry, ProjectId};
use serde::Serialize;
use serde_json::{Map, Value};

/// Everything a new assistant session needs to pick up where the last one left off.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionContext {
    pub project_id: ProjectId,
    pub session_count: u64,
    pub baselines: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise_config: Option<Value>,
    pub error_history: Vec<ErrorHistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<Value>,
}
