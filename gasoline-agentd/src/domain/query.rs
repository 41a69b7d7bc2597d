use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    Completed,
    Timeout,
    Expired,
    Error,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Pending => "pending",
            QueryStatus::Completed => "completed",
            QueryStatus::Timeout => "timeout",
            QueryStatus::Expired => "expired",
            QueryStatus::Error => "error",
        }
    }
}

/// What a handler asks the extension to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQuery {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl PendingQuery {
    pub fn new(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params,
            tab_id: None,
            correlation_id: None,
        }
    }

    pub fn with_tab(mut self, tab_id: Option<i64>) -> Self {
        self.tab_id = tab_id;
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub status: QueryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub dispatched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Shape of a query handed to the extension on `/sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedQuery {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl From<&QueryRecord> for DispatchedQuery {
    fn from(record: &QueryRecord) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind.clone(),
            params: record.params.clone(),
            tab_id: record.tab_id,
            correlation_id: record.correlation_id.clone(),
        }
    }
}
