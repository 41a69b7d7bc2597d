use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_ERROR_HISTORY: usize = 500;
pub const STALE_ERROR_DAYS: i64 = 30;

pub fn stale_error_threshold() -> Duration {
    Duration::days(STALE_ERROR_DAYS)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHistoryEntry {
    pub fingerprint: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub resolved: bool,
}

/// Keeps the newest `MAX_ERROR_HISTORY` entries by `first_seen`, in their original order.
pub fn enforce_error_history_cap(mut entries: Vec<ErrorHistoryEntry>) -> Vec<ErrorHistoryEntry> {
    if entries.len() <= MAX_ERROR_HISTORY {
        return entries;
    }
    let mut by_age: Vec<(usize, DateTime<Utc>)> = entries
        .iter()
        .enumerate()
        .map(|(idx, entry)| (idx, entry.first_seen))
        .collect();
    by_age.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut keep = vec![false; entries.len()];
    for (idx, _) in by_age.into_iter().take(MAX_ERROR_HISTORY) {
        keep[idx] = true;
    }
    let mut idx = 0;
    entries.retain(|_| {
        let kept = keep[idx];
        idx += 1;
        kept
    });
    entries
}

/// Drops entries whose `last_seen` is older than `threshold` relative to `now`.
pub fn evict_stale_errors(
    entries: Vec<ErrorHistoryEntry>,
    threshold: Duration,
    now: DateTime<Utc>,
) -> Vec<ErrorHistoryEntry> {
    let cutoff = now - threshold;
    entries
        .into_iter()
        .filter(|entry| entry.last_seen >= cutoff)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fingerprint: &str, first_seen: DateTime<Utc>, last_seen: DateTime<Utc>) -> ErrorHistoryEntry {
        ErrorHistoryEntry {
            fingerprint: fingerprint.to_string(),
            first_seen,
            last_seen,
            count: 1,
            resolved: false,
        }
    }

    #[test]
    fn cap_drops_oldest_by_first_seen() {
        let base = Utc::now() - Duration::days(10);
        let entries: Vec<_> = (0..501)
            .map(|i| {
                let seen = base + Duration::seconds(i);
                entry(&format!("fp-{i}"), seen, seen)
            })
            .collect();
        let capped = enforce_error_history_cap(entries);
        assert_eq!(capped.len(), 500);
        assert!(capped.iter().all(|e| e.fingerprint != "fp-0"));
        assert_eq!(capped[0].fingerprint, "fp-1");
    }

    #[test]
    fn cap_leaves_short_history_alone() {
        let now = Utc::now();
        let entries = vec![entry("a", now, now), entry("b", now, now)];
        assert_eq!(enforce_error_history_cap(entries.clone()), entries);
    }

    #[test]
    fn stale_entries_are_evicted_by_last_seen() {
        let now = Utc::now();
        let ancient = now - Duration::days(90);
        let entries = vec![
            entry("recent", ancient, now - Duration::hours(1)),
            entry("stale", ancient, now - Duration::days(31)),
            entry("also-recent", ancient, now - Duration::hours(1)),
        ];
        let kept = evict_stale_errors(entries, stale_error_threshold(), now);
        let names: Vec<_> = kept.iter().map(|e| e.fingerprint.as_str()).collect();
        assert_eq!(names, vec!["recent", "also-recent"]);
    }
}
