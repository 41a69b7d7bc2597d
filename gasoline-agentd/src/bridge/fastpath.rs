use crate::protocol::JsonRpcError;
use crate::state::StatePaths;
use crate::telemetry::{JsonlLog, Overflow, FASTPATH_MAX_BYTES};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;

pub const FASTPATH_EVENT: &str = "bridge_fastpath_method";
pub const RESOURCE_READ_EVENT: &str = "bridge_fastpath_resource_read";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MethodCounts {
    pub success: u64,
    pub failure: u64,
}

/// Outcomes of methods the bridge answers on its own.
pub struct FastPathTelemetry {
    events: JsonlLog,
    resource_reads: JsonlLog,
    counts: Mutex<BTreeMap<String, MethodCounts>>,
}

impl FastPathTelemetry {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            events: JsonlLog::new(paths.fastpath_events(), FASTPATH_MAX_BYTES, Overflow::Truncate),
            resource_reads: JsonlLog::new(
                paths.fastpath_resource_reads(),
                FASTPATH_MAX_BYTES,
                Overflow::Truncate,
            ),
            counts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record(
        &self,
        method: &str,
        params: Option<&Value>,
        outcome: &Result<Value, JsonRpcError>,
    ) {
        let success = outcome.is_ok();
        let error_code = outcome.as_ref().err().map(|err| err.code);
        let counts = {
            let mut all = self.counts.lock().expect("fastpath counts poisoned");
            let entry = all.entry(method.to_string()).or_default();
            if success {
                entry.success += 1;
            } else {
                entry.failure += 1;
            }
            *entry
        };
        self.events.record(
            FASTPATH_EVENT,
            json!({
                "method": method,
                "success": success,
                "error_code": error_code,
                "success_count": counts.success,
                "failure_count": counts.failure,
            }),
        );
        if method == "resources/read" {
            let uri = params
                .and_then(|params| params.get("uri"))
                .cloned()
                .unwrap_or(Value::Null);
            self.resource_reads.record(
                RESOURCE_READ_EVENT,
                json!({ "uri": uri, "success": success, "error_code": error_code }),
            );
        }
    }

    pub fn counts(&self) -> BTreeMap<String, MethodCounts> {
        self.counts.lock().expect("fastpath counts poisoned").clone()
    }
}

/// Per-method totals from a fast-path event file, for `--check`.
pub fn summarize(events: &[Value]) -> BTreeMap<String, MethodCounts> {
    let mut summary: BTreeMap<String, MethodCounts> = BTreeMap::new();
    for event in events {
        if event.get("event").and_then(Value::as_str) != Some(FASTPATH_EVENT) {
            continue;
        }
        let Some(method) = event.get("method").and_then(Value::as_str) else {
            continue;
        };
        let entry = summary.entry(method.to_string()).or_default();
        if event.get("success").and_then(Value::as_bool) == Some(true) {
            entry.success += 1;
        } else {
            entry.failure += 1;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::jsonrpc::RESOURCE_NOT_FOUND;
    use tempfile::TempDir;

    #[test]
    fn record_counts_and_persists() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::new(temp.path());
        let telemetry = FastPathTelemetry::new(&paths);
        telemetry.record("initialize", None, &Ok(json!({})));
        telemetry.record("initialize", None, &Ok(json!({})));
        let params = json!({ "uri": "gasoline://nope" });
        telemetry.record(
            "resources/read",
            Some(&params),
            &Err(JsonRpcError::new(RESOURCE_NOT_FOUND, "Resource not found")),
        );

        let counts = telemetry.counts();
        assert_eq!(counts["initialize"], MethodCounts { success: 2, failure: 0 });
        assert_eq!(counts["resources/read"].failure, 1);

        let events = JsonlLog::new(paths.fastpath_events(), FASTPATH_MAX_BYTES, Overflow::Truncate)
            .read_all();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1]["success_count"], 2);
        assert_eq!(events[2]["error_code"], RESOURCE_NOT_FOUND);
        assert_eq!(summarize(&events), counts);

        let reads = JsonlLog::new(
            paths.fastpath_resource_reads(),
            FASTPATH_MAX_BYTES,
            Overflow::Truncate,
        )
        .read_all();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0]["uri"], "gasoline://nope");
    }

    #[test]
    fn summarize_ignores_foreign_events() {
        let events = vec![
            json!({ "event": "bridge_exit", "method": "initialize" }),
            json!({ "event": FASTPATH_EVENT, "method": "ping", "success": false }),
        ];
        let summary = summarize(&events);
        assert_eq!(summary.len(), 1);
        assert_eq!(summary["ping"].failure, 1);
    }
}
