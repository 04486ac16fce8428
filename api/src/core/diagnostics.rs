//! Bounded in-memory record of recent webhook deliveries.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct WebhookRecord {
    pub received_at: DateTime<Utc>,
    /// `None` when no adapter accepted the delivery.
    pub provider: Option<String>,
    pub event_type: String,
    /// Headers with credentials and signatures removed.
    pub headers: BTreeMap<String, String>,
    pub outcome: String,
}

/// Oldest records are dropped once `capacity` is reached.
#[derive(Debug)]
pub struct WebhookDiagnostics {
    capacity: usize,
    records: Mutex<VecDeque<WebhookRecord>>,
}

impl WebhookDiagnostics {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn record(&self, record: WebhookRecord) {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<WebhookRecord> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.iter().rev().cloned().collect()
    }
}

impl Default for WebhookDiagnostics {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(outcome: &str) -> WebhookRecord {
        WebhookRecord {
            received_at: Utc::now(),
            provider: Some("gitlab".into()),
            event_type: "note".into(),
            headers: BTreeMap::new(),
            outcome: outcome.into(),
        }
    }

    #[test]
    fn ring_keeps_newest_records() {
        let d = WebhookDiagnostics::new(2);
        d.record(rec("a"));
        d.record(rec("b"));
        d.record(rec("c"));

        let recent: Vec<String> = d.recent().into_iter().map(|r| r.outcome).collect();
        assert_eq!(recent, vec!["c", "b"]);
    }
}
