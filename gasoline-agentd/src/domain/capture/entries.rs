use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Buffer kinds held by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    Logs,
    NetworkWaterfall,
    NetworkBodies,
    WebsocketEvents,
    Actions,
    Performance,
}

impl CaptureKind {
    pub const ALL: [CaptureKind; 6] = [
        CaptureKind::Logs,
        CaptureKind::NetworkWaterfall,
        CaptureKind::NetworkBodies,
        CaptureKind::WebsocketEvents,
        CaptureKind::Actions,
        CaptureKind::Performance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureKind::Logs => "logs",
            CaptureKind::NetworkWaterfall => "network_waterfall",
            CaptureKind::NetworkBodies => "network_bodies",
            CaptureKind::WebsocketEvents => "websocket_events",
            CaptureKind::Actions => "actions",
            CaptureKind::Performance => "performance",
        }
    }

    pub fn default_capacity(&self) -> usize {
        match self {
            CaptureKind::Logs => 1000,
            CaptureKind::NetworkWaterfall => 1000,
            CaptureKind::NetworkBodies => 100,
            CaptureKind::WebsocketEvents => 500,
            CaptureKind::Actions => 500,
            CaptureKind::Performance => 100,
        }
    }
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "logs" => Ok(CaptureKind::Logs),
            "network_waterfall" | "waterfall" => Ok(CaptureKind::NetworkWaterfall),
            "network_bodies" => Ok(CaptureKind::NetworkBodies),
            "websocket_events" | "websocket" => Ok(CaptureKind::WebsocketEvents),
            "actions" => Ok(CaptureKind::Actions),
            "performance" => Ok(CaptureKind::Performance),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Log,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Log => "log",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "log" => Ok(LogLevel::Log),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(other.to_string()),
        }
    }
}

/// Read-time predicate applied by snapshots. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct CaptureFilter {
    pub url: Option<String>,
    pub levels: Option<Vec<LogLevel>>,
    pub status_min: Option<u16>,
    pub status_max: Option<u16>,
    pub connection_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl CaptureFilter {
    pub fn url(mut self, needle: impl Into<String>) -> Self {
        self.url = Some(needle.into());
        self
    }

    pub fn levels(mut self, levels: Vec<LogLevel>) -> Self {
        self.levels = Some(levels);
        self
    }

    fn url_matches(&self, url: Option<&str>) -> bool {
        match (&self.url, url) {
            (None, _) => true,
            (Some(needle), Some(url)) => url.to_lowercase().contains(&needle.to_lowercase()),
            (Some(_), None) => false,
        }
    }

    fn since_matches(&self, ts: &DateTime<Utc>) -> bool {
        self.since.map_or(true, |since| *ts >= since)
    }
}

/// Common view over every entry type stored in a capture buffer.
pub trait CaptureRecord: Clone + Send + Sync + 'static {
    fn timestamp(&self) -> DateTime<Utc>;
    fn url(&self) -> Option<&str>;
    /// Rough in-memory footprint, used for stats only.
    fn approx_bytes(&self) -> usize;

    fn matches(&self, filter: &CaptureFilter) -> bool {
        filter.url_matches(self.url()) && filter.since_matches(&self.timestamp())
    }
}

fn opt_len(value: &Option<String>) -> usize {
    value.as_ref().map_or(0, String::len)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default = "Utc::now", alias = "ts")]
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
}

impl CaptureRecord for LogEntry {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    fn approx_bytes(&self) -> usize {
        self.message.len() + opt_len(&self.url) + opt_len(&self.stack) + opt_len(&self.source) + 48
    }

    fn matches(&self, filter: &CaptureFilter) -> bool {
        let level_ok = filter
            .levels
            .as_ref()
            .map_or(true, |levels| levels.contains(&self.level));
        level_ok && filter.url_matches(self.url()) && filter.since_matches(&self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterfallEntry {
    pub url: String,
    #[serde(default)]
    pub initiator_type: String,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub transfer_size: u64,
    #[serde(default)]
    pub decoded_body_size: u64,
    #[serde(default)]
    pub encoded_body_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    /// Arrival time at the daemon, not the browser's clock.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl CaptureRecord for WaterfallEntry {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn url(&self) -> Option<&str> {
        Some(&self.url)
    }

    fn approx_bytes(&self) -> usize {
        self.url.len() + self.initiator_type.len() + opt_len(&self.page_url) + 64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkBody {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl NetworkBody {
    /// Caps both bodies at `limit` bytes, cutting on a char boundary.
    pub fn truncate_bodies(&mut self, limit: usize) {
        for body in [&mut self.request_body, &mut self.response_body]
            .into_iter()
            .flatten()
        {
            if body.len() > limit {
                let mut cut = limit;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
                self.truncated = true;
            }
        }
    }
}

impl CaptureRecord for NetworkBody {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn url(&self) -> Option<&str> {
        Some(&self.url)
    }

    fn approx_bytes(&self) -> usize {
        let headers: usize = self
            .request_headers
            .iter()
            .chain(self.response_headers.iter())
            .map(|(k, v)| k.len() + v.len())
            .sum();
        self.url.len()
            + self.method.len()
            + headers
            + opt_len(&self.request_body)
            + opt_len(&self.response_body)
            + 64
    }

    fn matches(&self, filter: &CaptureFilter) -> bool {
        let min_ok = filter.status_min.map_or(true, |min| self.status >= min);
        let max_ok = filter.status_max.map_or(true, |max| self.status <= max);
        min_ok
            && max_ok
            && filter.url_matches(self.url())
            && filter.since_matches(&self.timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsEventKind {
    Open,
    Message,
    Close,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsDirection {
    Send,
    #[serde(alias = "incoming", alias = "received")]
    Recv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketEvent {
    #[serde(alias = "id")]
    pub connection_id: String,
    #[serde(default)]
    pub url: String,
    pub event: WsEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<WsDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default = "Utc::now", alias = "ts")]
    pub timestamp: DateTime<Utc>,
}

impl CaptureRecord for WebSocketEvent {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn url(&self) -> Option<&str> {
        Some(&self.url)
    }

    fn approx_bytes(&self) -> usize {
        self.connection_id.len() + self.url.len() + opt_len(&self.data) + 32
    }

    fn matches(&self, filter: &CaptureFilter) -> bool {
        let conn_ok = filter
            .connection_id
            .as_ref()
            .map_or(true, |id| *id == self.connection_id);
        conn_ok && filter.url_matches(self.url()) && filter.since_matches(&self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Semantic selectors (`testId`, `role`, `ariaLabel`, `text`, `css`, ...).
    #[serde(default)]
    pub selectors: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl CaptureRecord for EnhancedAction {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn url(&self) -> Option<&str> {
        self.url.as_deref().or(self.to_url.as_deref())
    }

    fn approx_bytes(&self) -> usize {
        let selectors: usize = self
            .selectors
            .iter()
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum();
        self.action_type.len()
            + selectors
            + opt_len(&self.url)
            + opt_len(&self.from_url)
            + opt_len(&self.to_url)
            + opt_len(&self.value)
            + 32
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSummary {
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub transfer_size: u64,
    #[serde(default)]
    pub failed_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub url: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub load_ms: f64,
    #[serde(default)]
    pub dom_content_loaded_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lcp_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcp_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cls: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSummary>,
}

impl CaptureRecord for PerformanceSnapshot {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn url(&self) -> Option<&str> {
        Some(&self.url)
    }

    fn approx_bytes(&self) -> usize {
        self.url.len() + 96
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_entry_accepts_ts_alias_and_defaults_timestamp() {
        let entry: LogEntry = serde_json::from_value(json!({
            "level": "error",
            "message": "boom",
            "url": "https://app.test/login"
        }))
        .expect("parse log entry");
        assert_eq!(entry.level, LogLevel::Error);
        assert!(entry.stack.is_none());

        let aliased: LogEntry = serde_json::from_value(json!({
            "ts": "2026-01-02T03:04:05Z",
            "level": "warn",
            "message": "slow"
        }))
        .expect("parse aliased entry");
        assert_eq!(aliased.timestamp.to_rfc3339(), "2026-01-02T03:04:05+00:00");
    }

    #[test]
    fn unknown_level_is_rejected() {
        let parsed = serde_json::from_value::<LogEntry>(json!({
            "level": "fatal",
            "message": "x"
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn filter_matches_url_case_insensitively_and_levels() {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Warn,
            message: "deprecated".into(),
            url: Some("https://App.test/Checkout".into()),
            stack: None,
            source: None,
            tab_id: None,
        };
        assert!(entry.matches(&CaptureFilter::default().url("checkout")));
        assert!(!entry.matches(&CaptureFilter::default().url("cart")));
        assert!(!entry.matches(&CaptureFilter::default().levels(vec![LogLevel::Error])));
        assert!(entry.matches(
            &CaptureFilter::default().levels(vec![LogLevel::Error, LogLevel::Warn])
        ));
    }

    #[test]
    fn network_body_filters_by_status_range_and_truncates() {
        let mut body: NetworkBody = serde_json::from_value(json!({
            "url": "https://api.test/users",
            "status": 503,
            "response_body": "é".repeat(10)
        }))
        .expect("parse body");
        assert_eq!(body.method, "GET");

        let server_errors = CaptureFilter {
            status_min: Some(500),
            status_max: Some(599),
            ..CaptureFilter::default()
        };
        assert!(body.matches(&server_errors));
        let client_errors = CaptureFilter {
            status_min: Some(400),
            status_max: Some(499),
            ..CaptureFilter::default()
        };
        assert!(!body.matches(&client_errors));

        body.truncate_bodies(5);
        assert_eq!(body.response_body.as_deref(), Some("éé"));
        assert!(body.truncated);
    }

    #[test]
    fn capture_kind_parses_aliases() {
        assert_eq!(
            "waterfall".parse::<CaptureKind>(),
            Ok(CaptureKind::NetworkWaterfall)
        );
        assert_eq!("nope".parse::<CaptureKind>(), Err("nope".to_string()));
        for kind in CaptureKind::ALL {
            assert_eq!(kind.as_str().parse::<CaptureKind>(), Ok(kind));
        }
    }
}
