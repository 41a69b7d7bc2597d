use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Complete,
    Error,
    Timeout,
    Expired,
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CommandStatus::Error
                | CommandStatus::Timeout
                | CommandStatus::Expired
                | CommandStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Complete => "complete",
            CommandStatus::Error => "error",
            CommandStatus::Timeout => "timeout",
            CommandStatus::Expired => "expired",
            CommandStatus::Cancelled => "cancelled",
        }
    }

    /// Maps the loose status vocabulary the extension reports onto the closed set.
    /// Anything unrecognised counts as a completion.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "running" | "still_processing" => CommandStatus::Pending,
            "error" | "failed" => CommandStatus::Error,
            "timeout" | "timed_out" => CommandStatus::Timeout,
            "expired" => CommandStatus::Expired,
            "cancelled" | "canceled" => CommandStatus::Cancelled,
            _ => CommandStatus::Complete,
        }
    }
}

pub const EXPIRED_BEFORE_PICKUP: &str = "Command expired before extension could execute it";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub correlation_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        let end = self.completed_at.unwrap_or(now);
        (end - self.created_at).num_milliseconds().max(0)
    }
}

/// Result payload reported by the extension for one command on `/sync`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportedResult {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_extension_vocabulary() {
        for raw in ["", "ok", "success", "succeeded", "done", "complete", "weird"] {
            assert_eq!(CommandStatus::normalize(raw), CommandStatus::Complete, "{raw}");
        }
        for raw in ["pending", "queued", "running", "still_processing"] {
            assert_eq!(CommandStatus::normalize(raw), CommandStatus::Pending, "{raw}");
        }
        assert_eq!(CommandStatus::normalize("Canceled"), CommandStatus::Cancelled);
        assert_eq!(CommandStatus::normalize("timeout"), CommandStatus::Timeout);
        assert_eq!(CommandStatus::normalize("error"), CommandStatus::Error);
    }

    #[test]
    fn failures_are_terminal() {
        for status in [
            CommandStatus::Error,
            CommandStatus::Timeout,
            CommandStatus::Expired,
            CommandStatus::Cancelled,
        ] {
            assert!(status.is_failure());
            assert!(status.is_terminal());
        }
        assert!(!CommandStatus::Complete.is_failure());
        assert!(!CommandStatus::Pending.is_terminal());
    }
}
